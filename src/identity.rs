use std::future::{ready, Ready};

use actix_web::{dev::Payload, http::header::HeaderMap, FromRequest, HttpRequest};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::ApiError;

/// Role resolved by the authentication gateway in front of this service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Rol {
    Usuario,
    Tecnico,
    Administrador,
}

impl Rol {
    fn parse(valor: &str) -> Option<Rol> {
        match valor {
            "usuario" => Some(Rol::Usuario),
            "tecnico" => Some(Rol::Tecnico),
            "administrador" => Some(Rol::Administrador),
            _ => None,
        }
    }

    /// Technicians and administrators see every report; plain users only
    /// their own.
    pub fn es_privilegiado(self) -> bool {
        matches!(self, Rol::Tecnico | Rol::Administrador)
    }

    pub fn es_administrador(self) -> bool {
        self == Rol::Administrador
    }
}

/// Caller identity, passed explicitly on every request by the gateway as the
/// `x-user-id` and `x-user-role` headers. There is no process-wide session
/// state: a request without both headers is rejected with 401.
#[derive(Debug, Clone, Copy)]
pub struct Identity {
    pub usuario_id: i32,
    pub rol: Rol,
}

impl Identity {
    fn from_headers(headers: &HeaderMap) -> Result<Identity, ApiError> {
        let usuario_id = headers
            .get("x-user-id")
            .and_then(|valor| valor.to_str().ok())
            .and_then(|valor| valor.parse::<i32>().ok())
            .filter(|id| *id > 0)
            .ok_or(ApiError::Unauthorized)?;

        let rol = headers
            .get("x-user-role")
            .and_then(|valor| valor.to_str().ok())
            .and_then(Rol::parse)
            .ok_or(ApiError::Unauthorized)?;

        Ok(Identity { usuario_id, rol })
    }

    /// Row-level rule for reports: the creator, any technician, or an
    /// administrator.
    pub fn puede_tocar_reporte(&self, duenio_id: i32) -> bool {
        self.rol.es_privilegiado() || self.usuario_id == duenio_id
    }
}

impl FromRequest for Identity {
    type Error = ApiError;
    type Future = Ready<Result<Identity, ApiError>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(Identity::from_headers(req.headers()))
    }
}

#[cfg(test)]
mod tests {
    use actix_web::test::TestRequest;

    use super::*;

    #[actix_web::test]
    async fn extracts_identity_from_headers() {
        let req = TestRequest::default()
            .insert_header(("x-user-id", "7"))
            .insert_header(("x-user-role", "tecnico"))
            .to_http_request();

        let identity = Identity::extract(&req).await.unwrap();
        assert_eq!(identity.usuario_id, 7);
        assert_eq!(identity.rol, Rol::Tecnico);
    }

    #[actix_web::test]
    async fn missing_headers_are_unauthorized() {
        let req = TestRequest::default().to_http_request();
        assert!(Identity::extract(&req).await.is_err());

        let req = TestRequest::default()
            .insert_header(("x-user-id", "7"))
            .to_http_request();
        assert!(Identity::extract(&req).await.is_err());
    }

    #[actix_web::test]
    async fn rejects_unknown_role_and_bad_id() {
        let req = TestRequest::default()
            .insert_header(("x-user-id", "7"))
            .insert_header(("x-user-role", "root"))
            .to_http_request();
        assert!(Identity::extract(&req).await.is_err());

        let req = TestRequest::default()
            .insert_header(("x-user-id", "0"))
            .insert_header(("x-user-role", "usuario"))
            .to_http_request();
        assert!(Identity::extract(&req).await.is_err());
    }

    #[test]
    fn report_access_is_row_restricted_for_plain_users() {
        let duenio = Identity {
            usuario_id: 1,
            rol: Rol::Usuario,
        };
        let otro = Identity {
            usuario_id: 2,
            rol: Rol::Usuario,
        };
        let tecnico = Identity {
            usuario_id: 3,
            rol: Rol::Tecnico,
        };
        let admin = Identity {
            usuario_id: 4,
            rol: Rol::Administrador,
        };

        assert!(duenio.puede_tocar_reporte(1));
        assert!(!otro.puede_tocar_reporte(1));
        assert!(tecnico.puede_tocar_reporte(1));
        assert!(admin.puede_tocar_reporte(1));
    }
}
