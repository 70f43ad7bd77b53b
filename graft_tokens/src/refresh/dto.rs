//! DTOs for interacting with the token issuing authority

use serde::{Deserialize, Serialize, Serializer};

use crate::{AccessToken, ClientIdRef, DurationSecs, RefreshToken, RefreshTokenRef};

/// The form body of a `refresh_token` grant
#[derive(Debug)]
pub(crate) struct RefreshTokenGrant<'a> {
    pub refresh_token: &'a RefreshTokenRef,
    pub scope: &'a str,
    pub client_id: Option<&'a ClientIdRef>,
}

impl Serialize for RefreshTokenGrant<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut ser = serializer.serialize_struct("RefreshTokenGrant", 4)?;
        ser.serialize_field("grant_type", "refresh_token")?;
        ser.serialize_field("refresh_token", self.refresh_token)?;
        ser.serialize_field("scope", self.scope)?;
        if let Some(client_id) = self.client_id {
            ser.serialize_field("client_id", client_id)?;
        } else {
            ser.skip_field("client_id")?;
        }
        ser.end()
    }
}

/// A successful response from the token endpoint
///
/// `access_token` is optional here so that its absence can be reported as a
/// malformed response rather than a generic decoding error.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<AccessToken>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<DurationSecs>,
    #[serde(default)]
    pub refresh_token: Option<RefreshToken>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// The error body returned by an authority
///
/// Token endpoints answer with the OAuth2 `{error, error_description}` shape,
/// while API gateways in front of them may answer with `{error: {code, message}}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum ErrorBody {
    Nested {
        error: ErrorDetail,
    },
    OAuth2 {
        error: String,
        #[serde(default)]
        error_description: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorDetail {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl ErrorBody {
    pub fn into_code_and_message(self) -> (String, String) {
        match self {
            Self::Nested { error } => (error.code, error.message),
            Self::OAuth2 {
                error,
                error_description,
            } => (error, error_description.unwrap_or_default()),
        }
    }
}
