use serde::Deserialize;
use uuid::Uuid;

use crate::types::ResourceLimits;

/// A unit of work: one source file to run for one language
#[derive(Debug, Clone)]
pub struct Submission {
    pub id: Uuid,

    /// Language ID, a key of [`Config::languages`](crate::Config::languages)
    pub language: String,

    pub source: Vec<u8>,

    /// Data piped to the program's stdin
    pub stdin: Option<Vec<u8>>,

    /// Caller limit overrides, clamped to the configured ceiling
    pub limits: Option<ResourceLimits>,
}

impl Submission {
    pub fn new(language: impl Into<String>, source: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            language: language.into(),
            source: source.into(),
            stdin: None,
            limits: None,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = Some(limits);
        self
    }
}

/// Submission as accepted on the wire: `{language, source, stdin?, limits?}`.
///
/// `code` and `input` are accepted in place of `source` and `stdin`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionRequest {
    pub language: String,
    #[serde(alias = "code")]
    pub source: String,
    #[serde(default, alias = "input")]
    pub stdin: Option<String>,
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
}

impl From<SubmissionRequest> for Submission {
    fn from(request: SubmissionRequest) -> Self {
        Submission {
            id: Uuid::new_v4(),
            language: request.language,
            source: request.source.into_bytes(),
            stdin: request.stdin.map(String::into_bytes),
            limits: request.limits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submissions_get_distinct_ids() {
        let a = Submission::new("sample", "echo hello");
        let b = Submission::new("sample", "echo hello");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn request_with_optional_fields_omitted() {
        let request: SubmissionRequest =
            serde_json::from_str(r#"{"language": "python", "source": "print(1)"}"#).unwrap();
        let submission = Submission::from(request);
        assert_eq!(submission.language, "python");
        assert_eq!(submission.source, b"print(1)");
        assert!(submission.stdin.is_none());
        assert!(submission.limits.is_none());
    }

    #[test]
    fn request_with_partial_limits() {
        let request: SubmissionRequest = serde_json::from_str(
            r#"{
                "language": "cpp",
                "source": "int main() {}",
                "stdin": "1 2\n",
                "limits": {"time_limit": 1.5}
            }"#,
        )
        .unwrap();
        let submission = Submission::from(request);
        assert_eq!(submission.stdin.as_deref(), Some(&b"1 2\n"[..]));
        let limits = submission.limits.unwrap();
        assert_eq!(limits.time_limit, Some(1.5));
        assert_eq!(limits.memory_limit, None);
    }

    #[test]
    fn request_accepts_code_and_input() {
        let request: SubmissionRequest = serde_json::from_str(
            r#"{"language": "sample", "code": "read x; echo $x", "input": "7\n"}"#,
        )
        .unwrap();
        assert_eq!(request.source, "read x; echo $x");
        assert_eq!(request.stdin.as_deref(), Some("7\n"));
    }
}
