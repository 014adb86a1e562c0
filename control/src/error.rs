use thiserror::Error;

/// lbsync controller errors
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Rules error: {0}")]
    Rules(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error("Cloud API error calling {action}: [{code}] {message}")]
    Cloud {
        action: String,
        code: String,
        message: String,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cancelled")]
    Cancelled,
}

impl SyncError {
    /// Cloud-side failure for `action`
    pub fn cloud(
        action: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Cloud {
            action: action.into(),
            code: code.into(),
            message: message.into(),
        }
    }
}
