use std::{error::Error, fmt};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::compute::Detail;

/// Ways forwarding a request to the compute host can fail.
#[derive(Debug)]
pub enum GatewayError {
    /// The compute host answered with a non-success status.
    UpstreamHttp { status: u16, body: String },
    /// The compute host couldn't be reached or didn't answer in time.
    UpstreamUnavailable(reqwest::Error),
    /// Anything else, e.g. an answer that isn't JSON.
    InternalProxy(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UpstreamHttp { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::InternalProxy(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpstreamHttp { body, .. } => write!(f, "Compute server error: {body}"),
            Self::UpstreamUnavailable(e) => {
                write!(f, "Could not connect to compute server: {e}")
            }
            Self::InternalProxy(msg) => write!(f, "Internal proxy error: {msg}"),
        }
    }
}

impl Error for GatewayError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::UpstreamUnavailable(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            Self::InternalProxy(e.to_string())
        } else {
            Self::UpstreamUnavailable(e)
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(Detail {
            detail: self.to_string(),
        });
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_status_is_passed_through() {
        let err = GatewayError::UpstreamHttp {
            status: 404,
            body: "missing".into(),
        };
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.to_string(), "Compute server error: missing");

        let err = GatewayError::InternalProxy("bad json".into());
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
