use thiserror::Error;

/// Errors from acquiring or refreshing credentials.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("issuer discovery failed: {0}")]
    Discovery(String),

    #[error("token request failed: {0}")]
    Grant(String),

    #[error("invalid access token: {0}")]
    InvalidToken(String),

    #[error("could not acquire credentials after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

/// Errors from bundling a handler entry file.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("bundling {entry} failed:\n{}", .diagnostics.join("\n"))]
    Failed {
        entry: String,
        diagnostics: Vec<String>,
    },

    #[error("failed to run bundler for {entry}: {reason}")]
    Spawn { entry: String, reason: String },

    #[error("bundler produced invalid output for {entry}: {reason}")]
    InvalidOutput { entry: String, reason: String },
}

/// Errors on the supervisor <-> worker channel.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("worker channel closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_error_display_lists_diagnostics() {
        let err = BuildError::Failed {
            entry: "app/a/external_task.ts".to_string(),
            diagnostics: vec!["error one".to_string(), "error two".to_string()],
        };
        let text = err.to_string();
        assert!(text.contains("app/a/external_task.ts"));
        assert!(text.contains("error one"));
        assert!(text.contains("error two"));
    }

    #[test]
    fn test_credential_error_display() {
        let err = CredentialError::Exhausted {
            attempts: 5,
            last_error: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "could not acquire credentials after 5 attempts: connection refused"
        );
    }
}
