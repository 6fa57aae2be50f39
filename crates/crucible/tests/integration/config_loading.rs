use std::io::Write;

use crucible::{Backend, Config, EXAMPLE_CONFIG, Outcome};

use super::SAMPLE_LANGUAGES;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn load_example_config_from_file() {
    let file = write_config(EXAMPLE_CONFIG);
    let config = Config::from_file(file.path()).expect("example config should load");

    assert_eq!(config.backend, Backend::Docker);
    for id in ["sample", "sample-checked", "cpp", "python", "java", "javascript"] {
        assert!(config.languages.contains_key(id), "missing {id}");
    }
    assert_eq!(config.default_limits.time_limit, Some(2.0));
    assert!(config.get_language("cpp").unwrap().is_compiled());
    assert!(!config.get_language("python").unwrap().is_compiled());
}

#[test]
fn load_minimal_process_config() {
    let file = write_config(&format!("backend = \"process\"\n{SAMPLE_LANGUAGES}"));
    let config = Config::from_file(file.path()).unwrap();

    assert_eq!(config.backend, Backend::Process);
    assert_eq!(config.workers, 4);
    assert_eq!(config.queue_capacity, 64);
    assert_eq!(config.languages.len(), 2);
}

#[test]
fn docker_backend_requires_recipes() {
    let file = write_config(
        r#"
backend = "docker"

[languages.bare]
name = "Bare"
source_name = "main.sh"

[languages.bare.run]
command = ["/bin/sh", "{source}"]
"#,
    );
    let err = Config::from_file(file.path()).unwrap_err();
    assert!(err.to_string().contains("recipe"));
}

#[test]
fn process_backend_allows_missing_recipes() {
    let config = Config::parse_toml(
        r#"
backend = "process"

[languages.bare]
name = "Bare"
source_name = "main.sh"

[languages.bare.run]
command = ["/bin/sh", "{source}"]
"#,
    )
    .unwrap();
    assert!(config.languages["bare"].recipe.is_none());
}

#[test]
fn invalid_configs_are_rejected() {
    let cases = [
        "workers = 0",
        "queue_capacity = 0",
        "capture_limit = 0",
        "image_build_timeout = -1.0",
        "backend = \"vm\"",
        r#"
[languages.x]
name = ""
source_name = "main.sh"
[languages.x.run]
command = ["sh"]
"#,
        r#"
[languages.x]
name = "X"
source_name = "../escape.sh"
[languages.x.run]
command = ["sh"]
"#,
        r#"
[languages.x]
name = "X"
source_name = "main.sh"
[languages.x.run]
command = []
"#,
        r#"
[languages.x]
name = "X"
source_name = "main.sh"
[languages.x.run]
command = ["sh"]
[languages.x.recipe]
base = "alpine"
file = "Dockerfile.x"
"#,
    ];
    for case in cases {
        let toml = format!("backend = \"process\"\n{case}");
        assert!(Config::parse_toml(&toml).is_err(), "accepted: {case}");
    }
}

#[test]
fn override_limits_are_clamped_to_ceiling() {
    let config = Config::default();
    let python = config.get_language("python").unwrap();

    let overrides = crucible::ResourceLimits::unset()
        .with_time_limit(1000.0)
        .with_memory_limit(16 * 1024);
    let limits = config.run_limits(python, Some(&overrides));

    assert_eq!(limits.time_limit, config.max_limits.time_limit);
    assert_eq!(limits.memory_limit, Some(16 * 1024));
    assert_eq!(limits.wall_time_limit, config.default_limits.wall_time_limit);
}

#[test]
fn outcome_names_are_stable() {
    let names: Vec<_> = [
        Outcome::Success,
        Outcome::CompileError,
        Outcome::RuntimeError,
        Outcome::Timeout,
        Outcome::ResourceLimitExceeded,
        Outcome::InfrastructureError,
    ]
    .iter()
    .map(|outcome| serde_json::to_string(outcome).unwrap())
    .collect();
    assert_eq!(
        names,
        [
            "\"success\"",
            "\"compile_error\"",
            "\"runtime_error\"",
            "\"timeout\"",
            "\"resource_limit_exceeded\"",
            "\"infrastructure_error\"",
        ]
    );
}
