use std::error::Error as StdError;

use graft_tokens::InspectError;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use crate::config::ConfigError;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// An error from an API client
#[derive(Debug, Error)]
pub enum Error {
    /// The client could not be constructed
    #[error("invalid client configuration")]
    Config(#[from] ConfigError),

    /// The request could not be formed; nothing was sent
    #[error("unable to construct request")]
    InvalidRequest(#[source] BoxError),

    /// The request could not be sent, or its response could not be read
    #[error("error sending request")]
    Transport(#[source] reqwest_middleware::Error),

    /// The API rejected the request with a structured error
    #[error("API returned {status}: {code}: {message}")]
    Remote {
        /// The HTTP status of the response
        status: StatusCode,
        /// The service's error code
        code: String,
        /// The service's error message
        message: String,
    },

    /// The API rejected the request without a structured error
    #[error("API returned {status}: {body}")]
    Status {
        /// The HTTP status of the response
        status: StatusCode,
        /// The raw response body
        body: String,
    },

    /// A successful response body was not the expected JSON
    #[error("unable to decode response body")]
    Decode(#[source] serde_json::Error),

    /// The access token cannot be read and there is no way to replace it
    #[error("access token cannot be inspected and no refresh token is available")]
    Unrefreshable(#[source] InspectError),

    /// A refresh was required, but the authority did not issue new credentials
    #[error("unable to refresh access token")]
    RefreshFailed(#[source] BoxError),

    /// The credentials are no longer accepted and cannot be renewed
    #[error("authorization expired: {reason}")]
    AuthExpired {
        /// Why the credentials are considered expired
        reason: &'static str,
        /// The rejection that led to this conclusion, if any
        #[source]
        source: Option<Box<Error>>,
    },
}

impl Error {
    /// The HTTP status that produced this error, if any
    ///
    /// For [`AuthExpired`][Error::AuthExpired], this is the status of the
    /// rejection it wraps.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Remote { status, .. } | Self::Status { status, .. } => Some(*status),
            Self::Transport(err) => err.status(),
            Self::AuthExpired {
                source: Some(source),
                ..
            } => source.status(),
            _ => None,
        }
    }

    /// Whether the API answered `401 Unauthorized`
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            Self::Remote { status, .. } | Self::Status { status, .. }
                if *status == StatusCode::UNAUTHORIZED
        )
    }

    /// Whether the caller must obtain new credentials before trying again
    pub fn requires_new_credentials(&self) -> bool {
        matches!(
            self,
            Self::AuthExpired { .. } | Self::RefreshFailed(_) | Self::Unrefreshable(_)
        )
    }

    /// Builds the error for a non-success response
    ///
    /// Bodies shaped like `{"error": {"code": ..., "message": ...}}` become
    /// [`Remote`][Error::Remote]; anything else is kept verbatim as
    /// [`Status`][Error::Status].
    pub(crate) fn from_response(status: StatusCode, body: &[u8]) -> Self {
        match serde_json::from_slice::<ApiErrorBody>(body) {
            Ok(ApiErrorBody { error }) => Self::Remote {
                status,
                code: error.code,
                message: error.message,
            },
            Err(_) => Self::Status {
                status,
                body: String::from_utf8_lossy(body).into_owned(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}
