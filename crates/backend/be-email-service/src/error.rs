#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Notification transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Notification provider rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Notification configuration error: {0}")]
    Config(String),
}

impl NotifyError {
    /// Transport failures, rate limiting and provider-side errors may clear
    /// up on their own. Anything else will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        match self {
            NotifyError::Transport(_) => true,
            NotifyError::Rejected { status, .. } => *status == 429 || *status >= 500,
            NotifyError::Config(_) => false,
        }
    }
}
