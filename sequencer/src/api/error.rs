// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chain_core::MessageError;
use serde::Serialize;
use thiserror::Error;

use crate::sequencer_core::SequencerError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Malformed(String),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("block is missing a signature")]
    MissingSignature,
    #[error("message expired")]
    MessageExpired,
    #[error("unknown expiry condition '{0}'")]
    UnknownExpiryCondition(u8),
    #[error("only the primary may sequence transactions")]
    NotAuthorized,
    #[error("{0}")]
    ChainMismatch(String),
    #[error("{0}")]
    InternalError(String),
    #[error("{0}")]
    Overloaded(String),
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    ok: bool,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError(message.into())
    }

    pub fn overloaded(message: impl Into<String>) -> Self {
        Self::Overloaded(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_)
            | Self::Malformed(_)
            | Self::InvalidSignature
            | Self::MissingSignature
            | Self::MessageExpired
            | Self::UnknownExpiryCondition(_) => StatusCode::BAD_REQUEST,
            Self::NotAuthorized => StatusCode::FORBIDDEN,
            Self::ChainMismatch(_) => StatusCode::CONFLICT,
            Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Overloaded(_) => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Malformed(_) => "MALFORMED",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::MissingSignature => "MISSING_SIGNATURE",
            Self::MessageExpired => "MESSAGE_EXPIRED",
            Self::UnknownExpiryCondition(_) => "UNKNOWN_EXPIRY_CONDITION",
            Self::NotAuthorized => "NOT_AUTHORIZED",
            Self::ChainMismatch(_) => "CHAIN_MISMATCH",
            Self::InternalError(_) => "INTERNAL_ERROR",
            Self::Overloaded(_) => "OVERLOADED",
        }
    }
}

impl From<MessageError> for ApiError {
    fn from(value: MessageError) -> Self {
        match value {
            MessageError::Malformed(message) => Self::Malformed(message),
            MessageError::InvalidSignature => Self::InvalidSignature,
            MessageError::MessageExpired => Self::MessageExpired,
            MessageError::UnknownExpiryCondition(kind) => Self::UnknownExpiryCondition(kind),
            MessageError::MissingSignature => Self::MissingSignature,
        }
    }
}

impl From<SequencerError> for ApiError {
    fn from(value: SequencerError) -> Self {
        match value {
            SequencerError::Message(err) => Self::from(err),
            SequencerError::NotAuthorized => Self::NotAuthorized,
            err @ SequencerError::ChainMismatch { .. } => Self::ChainMismatch(err.to_string()),
            err @ (SequencerError::Storage(_)
            | SequencerError::Signing(_)
            | SequencerError::Unavailable) => Self::InternalError(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            ok: false,
            code: self.code(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::ApiError;
    use crate::sequencer_core::SequencerError;
    use axum::http::StatusCode;
    use chain_core::MessageError;

    #[test]
    fn message_errors_map_to_client_errors_with_stable_codes() {
        let cases = [
            (MessageError::malformed("bad"), "MALFORMED"),
            (MessageError::InvalidSignature, "INVALID_SIGNATURE"),
            (MessageError::MessageExpired, "MESSAGE_EXPIRED"),
            (
                MessageError::UnknownExpiryCondition(7),
                "UNKNOWN_EXPIRY_CONDITION",
            ),
        ];
        for (err, code) in cases {
            let api = ApiError::from(SequencerError::from(err));
            assert_eq!(api.status(), StatusCode::BAD_REQUEST);
            assert_eq!(api.code(), code);
        }
    }

    #[test]
    fn role_and_internal_errors_map_to_their_statuses() {
        let not_authorized = ApiError::from(SequencerError::NotAuthorized);
        assert_eq!(not_authorized.status(), StatusCode::FORBIDDEN);
        assert_eq!(not_authorized.code(), "NOT_AUTHORIZED");

        let storage = ApiError::from(SequencerError::storage("disk full"));
        assert_eq!(storage.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(storage.to_string().contains("disk full"));

        let overloaded = ApiError::overloaded("queue full");
        assert_eq!(overloaded.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(overloaded.code(), "OVERLOADED");
    }
}
