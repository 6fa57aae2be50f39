//! A library for running untrusted code in isolated execution units.
//!
//! Crucible turns a (language, source, stdin) submission into a time-bounded,
//! resource-bounded, isolated run and a classified result. Submissions flow
//! through a bounded queue to a fixed pool of workers; each worker stages a
//! workspace, resolves the language's image, runs the compile and run steps in
//! a fresh execution unit and tears everything down again.
//!
//! # Features
//!
//! - **Pluggable isolation**: Docker containers, IOI Isolate boxes, or plain host processes for development.
//! - **Data-driven languages**: Languages and their image recipes are TOML configuration.
//! - **Image caching**: Images are built once per recipe fingerprint, with concurrent builds deduplicated.
//! - **Resource limits**: CPU time, wall time, memory, processes and output, with caller overrides clamped to a ceiling.
//! - **Backpressure**: A full queue rejects submissions immediately.
//! - **Guaranteed teardown**: Failed teardowns are retried by a background reaper.
//!
//! # Example
//!
//! ```no_run
//! use crucible::{Config, Scheduler, Submission};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let scheduler = Scheduler::from_config(Config::from_file("crucible.toml")?)?;
//! let result = scheduler
//!     .run(Submission::new("python", "print('hello')"))
//!     .await?;
//! println!("{}", serde_json::to_string(&result.to_payload())?);
//! # Ok(())
//! # }
//! ```

pub use classify::{Signals, StepReport, classify};
pub use config::{
    Backend, Config, ConfigError, EXAMPLE_CONFIG, Language, Recipe, ServerConfig,
};
pub use controller::{ControllerError, ExecutionController, ReapTarget, Reaper, RunRequest};
pub use image::{ImageBuilder, ImageError, ImageHandle, ImageProvider};
pub use isolation::{Isolation, IsolationError, prepare_cgroup};
pub use retry::RetryConfig;
pub use scheduler::{
    PipelineError, Scheduler, SchedulerError, SubmissionError, SubmissionHandle,
};
pub use submission::{Submission, SubmissionRequest};
pub use types::{
    CapturedOutput, ExecutionResult, LimitExceeded, MountConfig, Outcome, ResourceLimits,
    ResultPayload,
};
pub use workspace::{StagingError, Workspace, WorkspaceStager};

pub mod classify;
pub mod config;
pub mod controller;
pub mod image;
pub mod isolation;
pub mod retry;
pub mod scheduler;
pub mod submission;
pub mod types;
pub mod workspace;
