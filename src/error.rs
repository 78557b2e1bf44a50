use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::htm::TrixelId;

/// Errors raised by the TLS client. Transient errors are retried on the next
/// tick; critical errors (bad credentials, TMS deactivated upstream) must stop
/// the service.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("TLS request failed: {0}")]
    Transient(String),
    #[error("critical TLS failure: {0}")]
    Critical(String),
}

impl TlsError {
    pub fn is_critical(&self) -> bool {
        matches!(self, TlsError::Critical(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TmsError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("trixel {0} is not delegated to this TMS")]
    NotDelegated(TrixelId),
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error(transparent)]
    Tls(#[from] TlsError),
}

impl IntoResponse for TmsError {
    fn into_response(self) -> Response {
        let status = match &self {
            TmsError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            TmsError::NotDelegated(_) => StatusCode::MISDIRECTED_REQUEST,
            TmsError::Store(_) | TmsError::Tls(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
