use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde::Serialize;

use crate::engine::EngineError;

/// Wire shape of every error response.
#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("missing or invalid bearer token")]
    Unauthorized,

    #[error("not allowed for this user")]
    Forbidden,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "VALIDATION",
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::Forbidden => "FORBIDDEN",
            ApiError::Engine(e) => match e {
                EngineError::NotFound(_) => "NOT_FOUND",
                EngineError::AlreadyExists(_) => "ALREADY_EXISTS",
                EngineError::SlotUnavailable { .. } => "SLOT_UNAVAILABLE",
                EngineError::NoSlotsAvailable(_) => "NO_SLOTS_AVAILABLE",
                EngineError::LotClosed(_) => "LOT_CLOSED",
                EngineError::WrongLot { .. } | EngineError::InvalidState(_) => "VALIDATION",
                EngineError::DuplicateSlotNumber(_) => "ALREADY_EXISTS",
                EngineError::LimitExceeded(_) => "LIMIT_EXCEEDED",
                EngineError::WalError(_) => "INTERNAL",
            },
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::Engine(e) => match e {
                EngineError::NotFound(_) => StatusCode::NOT_FOUND,
                EngineError::AlreadyExists(_) | EngineError::DuplicateSlotNumber(_) => {
                    StatusCode::CONFLICT
                }
                EngineError::SlotUnavailable { .. }
                | EngineError::NoSlotsAvailable(_)
                | EngineError::LotClosed(_) => StatusCode::CONFLICT,
                EngineError::WrongLot { .. } | EngineError::InvalidState(_) => {
                    StatusCode::BAD_REQUEST
                }
                EngineError::LimitExceeded(_) => StatusCode::UNPROCESSABLE_ENTITY,
                EngineError::WalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn error_response(&self) -> HttpResponse {
        // Storage details stay out of client-facing messages.
        let message = match self {
            ApiError::Engine(EngineError::WalError(e)) => {
                tracing::error!("storage error: {e}");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        HttpResponse::build(self.status_code()).json(ErrorBody {
            code: self.code(),
            message,
        })
    }
}
