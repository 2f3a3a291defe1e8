//! Gateway error taxonomy
//! ======================
//!
//! Every handler returns `Result<_, GatewayError>`. The `IntoResponse` impl
//! maps each variant to a stable wire `type` tag and status code:
//!
//! | variant | `type` | status |
//! |---|---|---|
//! | `ParseError` | `parse_error` | 400 |
//! | `InvalidRequest` | `invalid_request` | 400 |
//! | `NotFound` | `not_found` | 404 |
//! | `ModelNotLoaded` | `model_not_loaded` | 409 |
//! | `UnsupportedOperation` | `unsupported_operation` | 409 |
//! | `BackendCrashed` | `backend_crashed` | 502 |
//! | `BackendFailed` | `backend_failed` | 503 |
//! | `Download` | `download_error` (+`resumable`) | 500 |
//! | `Internal` | `internal_error` | 500 |

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use lemonade_models::ModelsError;
use lemonade_router::RouterError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    ParseError(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("no model is loaded")]
    ModelNotLoaded,

    #[error("operation '{op}' is not supported by recipe '{recipe}'")]
    UnsupportedOperation { op: String, recipe: String },

    #[error("backend failed: {0}")]
    BackendFailed(String),

    #[error("backend crashed mid-request")]
    BackendCrashed,

    #[error("{message}")]
    Download { message: String, resumable: bool },

    #[error("{0}")]
    Internal(String),
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    fn wire_type(&self) -> &'static str {
        match self {
            GatewayError::ParseError(_) => "parse_error",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::ModelNotLoaded => "model_not_loaded",
            GatewayError::UnsupportedOperation { .. } => "unsupported_operation",
            GatewayError::BackendFailed(_) => "backend_failed",
            GatewayError::BackendCrashed => "backend_crashed",
            GatewayError::Download { .. } => "download_error",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            GatewayError::ParseError(_) | GatewayError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::ModelNotLoaded | GatewayError::UnsupportedOperation { .. } => {
                StatusCode::CONFLICT
            }
            GatewayError::BackendCrashed => StatusCode::BAD_GATEWAY,
            GatewayError::BackendFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Download { .. } | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// The wire body, also used for SSE `error` events.
    pub fn to_body(&self) -> serde_json::Value {
        let mut error = json!({
            "message": self.to_string(),
            "type": self.wire_type(),
        });
        if let GatewayError::Download { resumable, .. } = self {
            error["resumable"] = json!(resumable);
        }
        json!({ "error": error })
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.to_body())).into_response()
    }
}

impl From<RouterError> for GatewayError {
    fn from(e: RouterError) -> Self {
        match e {
            RouterError::ModelNotLoaded => GatewayError::ModelNotLoaded,
            RouterError::UnsupportedOperation { op, recipe } => {
                GatewayError::UnsupportedOperation {
                    op: op.to_string(),
                    recipe: recipe.to_string(),
                }
            }
            RouterError::BackendCrashed => GatewayError::BackendCrashed,
            err @ (RouterError::BackendFailed(_)
            | RouterError::BackendStartTimeout { .. }
            | RouterError::LoadCancelled) => GatewayError::BackendFailed(err.to_string()),
            RouterError::Models(models) => models.into(),
            other => GatewayError::Internal(other.to_string()),
        }
    }
}

impl From<ModelsError> for GatewayError {
    fn from(e: ModelsError) -> Self {
        match e {
            ModelsError::UnknownModel { name } => {
                GatewayError::NotFound(format!("unknown model '{name}'"))
            }
            err @ (ModelsError::DuplicateModel { .. } | ModelsError::Entry(_)) => {
                GatewayError::InvalidRequest(err.to_string())
            }
            // Registry fetch failures are download errors; anything without
            // a partial file on disk is simply not resumable.
            ModelsError::Fetch(fetch) => {
                let resumable = fetch.resumable().unwrap_or(false);
                GatewayError::Download {
                    message: fetch.to_string(),
                    resumable,
                }
            }
            other => GatewayError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_types_and_statuses() {
        let cases: Vec<(GatewayError, &str, StatusCode)> = vec![
            (
                GatewayError::ParseError("bad json".into()),
                "parse_error",
                StatusCode::BAD_REQUEST,
            ),
            (
                GatewayError::ModelNotLoaded,
                "model_not_loaded",
                StatusCode::CONFLICT,
            ),
            (
                GatewayError::UnsupportedOperation {
                    op: "embeddings".into(),
                    recipe: "flm".into(),
                },
                "unsupported_operation",
                StatusCode::CONFLICT,
            ),
            (
                GatewayError::BackendFailed("timeout".into()),
                "backend_failed",
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                GatewayError::BackendCrashed,
                "backend_crashed",
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (err, wire_type, status) in cases {
            assert_eq!(err.wire_type(), wire_type);
            assert_eq!(err.status(), status);
            let body = err.to_body();
            assert_eq!(body["error"]["type"], wire_type);
        }
    }

    #[test]
    fn download_errors_carry_resumable() {
        let err = GatewayError::Download {
            message: "gave up".into(),
            resumable: true,
        };
        assert_eq!(err.to_body()["error"]["resumable"], json!(true));
    }

    #[test]
    fn router_errors_map_to_taxonomy() {
        assert!(matches!(
            GatewayError::from(RouterError::ModelNotLoaded),
            GatewayError::ModelNotLoaded
        ));
        assert!(matches!(
            GatewayError::from(RouterError::BackendCrashed),
            GatewayError::BackendCrashed
        ));
        assert!(matches!(
            GatewayError::from(RouterError::BackendStartTimeout {
                elapsed: std::time::Duration::from_secs(120)
            }),
            GatewayError::BackendFailed(_)
        ));
    }
}
