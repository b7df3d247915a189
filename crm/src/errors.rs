use crate::types::UpstreamBody;
use reqwest::StatusCode;

#[derive(thiserror::Error, Debug)]
pub enum CrmError {
    /// Connection failures and timeouts alike.
    #[error("could not reach the CRM: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("CRM responded with status {status}")]
    Status {
        status: StatusCode,
        body: UpstreamBody,
    },

    #[error("unexpected CRM response shape: {reason}")]
    UnexpectedShape {
        status: StatusCode,
        body: UpstreamBody,
        reason: String,
    },

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl CrmError {
    /// The upstream HTTP status, if a response was received at all.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            CrmError::Status { status, .. } | CrmError::UnexpectedShape { status, .. } => {
                Some(*status)
            }
            CrmError::Transport(e) => e.status(),
            CrmError::InvalidUrl(_) => None,
        }
    }

    pub fn body(&self) -> Option<&UpstreamBody> {
        match self {
            CrmError::Status { body, .. } | CrmError::UnexpectedShape { body, .. } => Some(body),
            CrmError::Transport(_) | CrmError::InvalidUrl(_) => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CrmError::Transport(e) if e.is_timeout())
    }
}
