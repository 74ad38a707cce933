use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Error taxonomy for the API.
///
/// Validation and authorization errors are detected before any write and
/// returned immediately; a failed primary write aborts the operation and
/// surfaces as `Database`. Audit-log write failures are deliberately absent
/// here: they are swallowed inside `historial::registrar_cambio` and never
/// reach a handler.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{entidad} con id={id} no encontrado")]
    NotFound { entidad: &'static str, id: String },

    #[error("No se proporcionaron credenciales válidas.")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    #[error("Error de base de datos: {0}")]
    Database(#[from] sqlx::Error),
}

impl ApiError {
    pub fn not_found(entidad: &'static str, id: impl ToString) -> Self {
        ApiError::NotFound {
            entidad,
            id: id.to_string(),
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "mensaje": self.to_string() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_the_taxonomy() {
        assert_eq!(
            ApiError::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::not_found("Reporte", 7).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(ApiError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::Forbidden("no".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::Database(sqlx::Error::RowNotFound).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn not_found_names_the_offending_id() {
        let err = ApiError::not_found("Reporte", 42);
        assert_eq!(err.to_string(), "Reporte con id=42 no encontrado");
    }
}
