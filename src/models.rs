use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Pool, Postgres, Type};
use time::PrimitiveDateTime;
use utoipa::ToSchema;

#[derive(Clone)]
pub struct AppState {
    pub database: Pool<Postgres>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type, ToSchema)]
#[sqlx(type_name = "prioridad", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Prioridad {
    Baja,
    Media,
    Alta,
    Urgente,
}

impl std::fmt::Display for Prioridad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let nombre = match self {
            Prioridad::Baja => "baja",
            Prioridad::Media => "media",
            Prioridad::Alta => "alta",
            Prioridad::Urgente => "urgente",
        };
        f.write_str(nombre)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type, ToSchema)]
#[sqlx(type_name = "estado_reporte", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EstadoReporte {
    Pendiente,
    EnProgreso,
    Resuelto,
    Cerrado,
}

impl std::fmt::Display for EstadoReporte {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let nombre = match self {
            EstadoReporte::Pendiente => "pendiente",
            EstadoReporte::EnProgreso => "en_progreso",
            EstadoReporte::Resuelto => "resuelto",
            EstadoReporte::Cerrado => "cerrado",
        };
        f.write_str(nombre)
    }
}

/// Entity kinds tracked by the change history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type, ToSchema)]
#[sqlx(type_name = "entidad_historial")]
pub enum Entidad {
    Usuario,
    Computadora,
    Aula,
    Reporte,
    Repuesto,
    Otro,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type, ToSchema)]
#[sqlx(type_name = "accion_historial", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Accion {
    Crear,
    Actualizar,
    Eliminar,
    CambiarEstado,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type, ToSchema)]
#[sqlx(type_name = "estado_repuesto", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EstadoRepuesto {
    Disponible,
    Bajo,
    Agotado,
}

impl EstadoRepuesto {
    /// Stock status is never stored independently: it is recomputed from
    /// quantity and minimum threshold on every save.
    pub fn derivar(cantidad: i32, minimo: i32) -> EstadoRepuesto {
        if cantidad <= 0 {
            EstadoRepuesto::Agotado
        } else if cantidad <= minimo {
            EstadoRepuesto::Bajo
        } else {
            EstadoRepuesto::Disponible
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Reporte {
    pub id: i32,
    pub titulo: String,
    pub descripcion: String,
    pub prioridad: Prioridad,
    pub estado_actual: EstadoReporte,
    pub usuario_id: i32,
    pub computadora_id: i32,
    pub tecnico_asignado_id: Option<i32>,
    pub created_at: PrimitiveDateTime,
    pub updated_at: PrimitiveDateTime,
}

/// One immutable snapshot in a report's history.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct EstadoReporteEntrada {
    pub id: i32,
    pub estado: EstadoReporte,
    pub comentario: Option<String>,
    pub reporte_id: i32,
    pub usuario_id: i32,
    pub created_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Repuesto {
    pub id: i32,
    pub codigo: String,
    pub nombre: String,
    pub descripcion: Option<String>,
    pub categoria: String,
    pub cantidad: i32,
    pub minimo: i32,
    pub precio: Decimal,
    pub estado: EstadoRepuesto,
    pub created_at: PrimitiveDateTime,
    pub updated_at: PrimitiveDateTime,
}

/// Public projection of a user, for joins into reports and the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UsuarioResumen {
    pub id: i32,
    pub nombre: String,
    pub apellido: Option<String>,
    pub email: String,
}

/// `ceil(total / por_pagina)`, with an empty set giving zero pages.
pub fn total_paginas(total: i64, por_pagina: i64) -> i64 {
    (total + por_pagina - 1) / por_pagina
}

/// Normalizes `pagina`/`porPagina` query values (defaults 1 and 10, never
/// below 1) and returns `(pagina, por_pagina, offset)`.
pub fn normalizar_paginacion(pagina: Option<i64>, por_pagina: Option<i64>) -> (i64, i64, i64) {
    let pagina = pagina.unwrap_or(1).max(1);
    let por_pagina = por_pagina.unwrap_or(10).max(1);
    (pagina, por_pagina, (pagina - 1) * por_pagina)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stock_status_is_derived_from_quantity_and_minimum() {
        assert_eq!(EstadoRepuesto::derivar(0, 5), EstadoRepuesto::Agotado);
        assert_eq!(EstadoRepuesto::derivar(3, 5), EstadoRepuesto::Bajo);
        assert_eq!(EstadoRepuesto::derivar(5, 5), EstadoRepuesto::Bajo);
        assert_eq!(EstadoRepuesto::derivar(10, 5), EstadoRepuesto::Disponible);
        assert_eq!(EstadoRepuesto::derivar(-1, 5), EstadoRepuesto::Agotado);
    }

    #[test]
    fn enums_serialize_with_wire_names() {
        assert_eq!(
            serde_json::to_string(&EstadoReporte::EnProgreso).unwrap(),
            "\"en_progreso\""
        );
        assert_eq!(
            serde_json::to_string(&Accion::CambiarEstado).unwrap(),
            "\"cambiar_estado\""
        );
        assert_eq!(
            serde_json::to_string(&Entidad::Repuesto).unwrap(),
            "\"Repuesto\""
        );
        assert_eq!(
            serde_json::to_string(&Prioridad::Urgente).unwrap(),
            "\"urgente\""
        );
    }

    #[test]
    fn estado_reporte_displays_wire_name() {
        assert_eq!(EstadoReporte::EnProgreso.to_string(), "en_progreso");
        assert_eq!(EstadoReporte::Cerrado.to_string(), "cerrado");
    }

    #[test]
    fn page_count_rounds_up() {
        assert_eq!(total_paginas(15, 10), 2);
        assert_eq!(total_paginas(10, 10), 1);
        assert_eq!(total_paginas(0, 10), 0);
        assert_eq!(total_paginas(1, 10), 1);
    }

    #[test]
    fn pagination_defaults_and_clamps() {
        assert_eq!(normalizar_paginacion(None, None), (1, 10, 0));
        assert_eq!(normalizar_paginacion(Some(3), Some(25)), (3, 25, 50));
        assert_eq!(normalizar_paginacion(Some(0), Some(0)), (1, 1, 0));
    }
}
