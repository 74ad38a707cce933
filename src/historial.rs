use actix_web::{
    get,
    web::{Data, Path, Query},
    HttpResponse,
};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sqlx::{Executor, FromRow, Postgres, QueryBuilder};
use time::{macros::time, Date, PrimitiveDateTime};
use utoipa::{IntoParams, ToSchema};

use crate::error::ApiError;
use crate::identity::Identity;
use crate::models::{
    normalizar_paginacion, total_paginas, Accion, AppState, Entidad, UsuarioResumen,
};

/// Fields skipped when diffing entity snapshots.
const CAMPOS_VOLATILES: &[&str] = &["created_at", "updated_at", "deleted_at"];

/// One pending audit log line.
pub struct NuevoCambio<'a> {
    pub entidad: Entidad,
    pub entidad_id: i32,
    pub accion: Accion,
    pub detalles: String,
    pub cambios: Option<&'a Value>,
    pub usuario_id: i32,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Appends one record to the change history.
///
/// Best-effort by contract: a failed insert is logged and reported as `None`
/// so that audit logging can never fail or roll back the primary operation.
/// Callers that run inside a transaction pass the transaction as the
/// executor; the swallow happens here either way.
pub async fn registrar_cambio<'e, E>(ejecutor: E, cambio: NuevoCambio<'_>) -> Option<i32>
where
    E: Executor<'e, Database = Postgres>,
{
    let cambios_texto = cambio.cambios.map(|valor| valor.to_string());

    let resultado = sqlx::query_scalar::<_, i32>(
        r#"
        INSERT INTO historial_cambios
            (entidad, entidad_id, accion, detalles, cambios, usuario_id, ip, user_agent)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING id
        "#,
    )
    .bind(cambio.entidad)
    .bind(cambio.entidad_id)
    .bind(cambio.accion)
    .bind(&cambio.detalles)
    .bind(cambios_texto)
    .bind(cambio.usuario_id)
    .bind(cambio.ip)
    .bind(cambio.user_agent)
    .fetch_one(ejecutor)
    .await;

    match resultado {
        Ok(id) => Some(id),
        Err(err) => {
            warn!("no se pudo registrar el cambio en el historial: {err}");
            None
        }
    }
}

/// Field-level delta between two serialized snapshots of the same entity,
/// as a mapping of field name to `{anterior, nuevo}`. Timestamp fields are
/// excluded. Non-object snapshots produce an empty delta.
pub fn diferencias(anterior: &Value, nuevo: &Value) -> Map<String, Value> {
    let mut cambios = Map::new();
    let (Some(antes), Some(despues)) = (anterior.as_object(), nuevo.as_object()) else {
        return cambios;
    };

    for (campo, valor_nuevo) in despues {
        if CAMPOS_VOLATILES.contains(&campo.as_str()) {
            continue;
        }
        let valor_anterior = antes.get(campo).cloned().unwrap_or(Value::Null);
        if &valor_anterior != valor_nuevo {
            cambios.insert(
                campo.clone(),
                json!({ "anterior": valor_anterior, "nuevo": valor_nuevo }),
            );
        }
    }

    cambios
}

/// `cambios` is stored as serialized text; malformed content degrades to an
/// empty object rather than an error.
pub fn parsear_cambios(texto: Option<&str>) -> Value {
    match texto {
        None => Value::Null,
        Some(texto) => serde_json::from_str(texto).unwrap_or_else(|_| Value::Object(Map::new())),
    }
}

/// The `fechaHasta` bound is inclusive of the whole day.
fn fin_de_dia(fecha: Date) -> PrimitiveDateTime {
    fecha.with_time(time!(23:59:59.999999))
}

fn limites_de_fecha(
    desde: Option<Date>,
    hasta: Option<Date>,
) -> (Option<PrimitiveDateTime>, Option<PrimitiveDateTime>) {
    (desde.map(|fecha| fecha.midnight()), hasta.map(fin_de_dia))
}

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct FiltrosHistorial {
    pub pagina: Option<i64>,
    #[serde(rename = "porPagina")]
    pub por_pagina: Option<i64>,
    pub entidad: Option<Entidad>,
    #[serde(rename = "entidadId")]
    pub entidad_id: Option<i32>,
    pub accion: Option<Accion>,
    #[serde(rename = "usuarioId")]
    pub usuario_id: Option<i32>,
    #[serde(rename = "fechaDesde")]
    pub fecha_desde: Option<Date>,
    #[serde(rename = "fechaHasta")]
    pub fecha_hasta: Option<Date>,
    pub busqueda: Option<String>,
}

#[derive(FromRow)]
struct HistorialRow {
    id: i32,
    entidad: Entidad,
    entidad_id: i32,
    accion: Accion,
    detalles: Option<String>,
    cambios: Option<String>,
    usuario_id: i32,
    ip: Option<String>,
    user_agent: Option<String>,
    created_at: PrimitiveDateTime,
    usuario_nombre: Option<String>,
    usuario_apellido: Option<String>,
    usuario_email: Option<String>,
}

/// One change-history record as served to clients, with `cambios` parsed
/// back into structure and the acting user joined in when still present.
#[derive(Debug, Serialize, ToSchema)]
pub struct HistorialCambio {
    pub id: i32,
    pub entidad: Entidad,
    pub entidad_id: i32,
    pub accion: Accion,
    pub detalles: Option<String>,
    #[schema(value_type = Object)]
    pub cambios: Value,
    pub usuario_id: i32,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: PrimitiveDateTime,
    pub usuario: Option<UsuarioResumen>,
}

impl From<HistorialRow> for HistorialCambio {
    fn from(row: HistorialRow) -> HistorialCambio {
        let usuario = match (row.usuario_nombre, row.usuario_email) {
            (Some(nombre), Some(email)) => Some(UsuarioResumen {
                id: row.usuario_id,
                nombre,
                apellido: row.usuario_apellido,
                email,
            }),
            _ => None,
        };

        HistorialCambio {
            id: row.id,
            entidad: row.entidad,
            entidad_id: row.entidad_id,
            accion: row.accion,
            detalles: row.detalles,
            cambios: parsear_cambios(row.cambios.as_deref()),
            usuario_id: row.usuario_id,
            ip: row.ip,
            user_agent: row.user_agent,
            created_at: row.created_at,
            usuario,
        }
    }
}

/// Pagination envelope for history listings.
#[derive(Debug, Serialize, ToSchema)]
pub struct PaginaHistorial {
    pub total: i64,
    pub paginas: i64,
    #[serde(rename = "paginaActual")]
    pub pagina_actual: i64,
    #[serde(rename = "porPagina")]
    pub por_pagina: i64,
    pub datos: Vec<HistorialCambio>,
}

const HISTORIAL_FROM: &str = r#"
    FROM historial_cambios h
    LEFT JOIN usuarios u ON u.id = h.usuario_id
"#;

/// Pushes all provided filters conjunctively; `busqueda` is an OR across
/// details and the actor's name/email, ANDed with the rest.
fn empujar_filtros(consulta: &mut QueryBuilder<'_, Postgres>, filtros: &FiltrosHistorial) {
    consulta.push(" WHERE 1=1");

    if let Some(entidad) = filtros.entidad {
        consulta.push(" AND h.entidad = ").push_bind(entidad);
    }
    if let Some(entidad_id) = filtros.entidad_id {
        consulta.push(" AND h.entidad_id = ").push_bind(entidad_id);
    }
    if let Some(accion) = filtros.accion {
        consulta.push(" AND h.accion = ").push_bind(accion);
    }
    if let Some(usuario_id) = filtros.usuario_id {
        consulta.push(" AND h.usuario_id = ").push_bind(usuario_id);
    }

    let (desde, hasta) = limites_de_fecha(filtros.fecha_desde, filtros.fecha_hasta);
    if let Some(desde) = desde {
        consulta.push(" AND h.created_at >= ").push_bind(desde);
    }
    if let Some(hasta) = hasta {
        consulta.push(" AND h.created_at <= ").push_bind(hasta);
    }

    if let Some(busqueda) = filtros.busqueda.as_deref().filter(|b| !b.is_empty()) {
        let patron = format!("%{busqueda}%");
        consulta
            .push(" AND (h.detalles ILIKE ")
            .push_bind(patron.clone())
            .push(" OR u.nombre ILIKE ")
            .push_bind(patron.clone())
            .push(" OR u.email ILIKE ")
            .push_bind(patron)
            .push(")");
    }
}

#[derive(FromRow)]
struct ConteoTotal {
    total: i64,
}

async fn pagina_de_historial(
    data: &AppState,
    filtros: &FiltrosHistorial,
) -> Result<PaginaHistorial, ApiError> {
    let (pagina, por_pagina, offset) = normalizar_paginacion(filtros.pagina, filtros.por_pagina);

    let mut conteo = QueryBuilder::new(format!("SELECT COUNT(*) AS total {HISTORIAL_FROM}"));
    empujar_filtros(&mut conteo, filtros);
    let total = conteo
        .build_query_as::<ConteoTotal>()
        .fetch_one(&data.database)
        .await?
        .total;

    let mut registros = QueryBuilder::new(format!(
        r#"
        SELECT
            h.id, h.entidad, h.entidad_id, h.accion, h.detalles, h.cambios,
            h.usuario_id, h.ip, h.user_agent, h.created_at,
            u.nombre AS usuario_nombre,
            u.apellido AS usuario_apellido,
            u.email AS usuario_email
        {HISTORIAL_FROM}
        "#
    ));
    empujar_filtros(&mut registros, filtros);
    registros
        .push(" ORDER BY h.created_at DESC, h.id DESC LIMIT ")
        .push_bind(por_pagina)
        .push(" OFFSET ")
        .push_bind(offset);

    let datos = registros
        .build_query_as::<HistorialRow>()
        .fetch_all(&data.database)
        .await?
        .into_iter()
        .map(HistorialCambio::from)
        .collect();

    Ok(PaginaHistorial {
        total,
        paginas: total_paginas(total, por_pagina),
        pagina_actual: pagina,
        por_pagina,
        datos,
    })
}

#[utoipa::path(
    context_path = "/api/historial-cambios",
    params(FiltrosHistorial),
    responses(
        (status = 200, description = "Page of change-history records, newest first", body = PaginaHistorial),
        (status = 401, description = "Missing or invalid credentials"),
        (status = 500, description = "An internal server error occurred")
    )
)]
#[get("")]
pub async fn obtener_historial(
    data: Data<AppState>,
    _identity: Identity,
    filtros: Query<FiltrosHistorial>,
) -> Result<HttpResponse, ApiError> {
    let pagina = pagina_de_historial(&data, &filtros).await?;
    Ok(HttpResponse::Ok().json(pagina))
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct RangoFechas {
    #[serde(rename = "fechaDesde")]
    pub fecha_desde: Option<Date>,
    #[serde(rename = "fechaHasta")]
    pub fecha_hasta: Option<Date>,
}

#[derive(Debug, Serialize, FromRow, ToSchema)]
pub struct ConteoPorEntidad {
    pub entidad: Entidad,
    pub total: i64,
}

#[derive(Debug, Serialize, FromRow, ToSchema)]
pub struct ConteoPorAccion {
    pub accion: Accion,
    pub total: i64,
}

#[derive(Debug, Serialize, FromRow, ToSchema)]
pub struct ActividadDeUsuario {
    #[serde(rename = "usuarioId")]
    pub usuario_id: i32,
    #[serde(rename = "usuarioNombre")]
    pub usuario_nombre: String,
    #[serde(rename = "usuarioEmail")]
    pub usuario_email: String,
    pub total: i64,
}

#[derive(Debug, Serialize, FromRow, ToSchema)]
pub struct ActividadDiaria {
    pub fecha: Date,
    pub total: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct EstadisticasActividad {
    #[serde(rename = "actividadPorEntidad")]
    pub actividad_por_entidad: Vec<ConteoPorEntidad>,
    #[serde(rename = "actividadPorAccion")]
    pub actividad_por_accion: Vec<ConteoPorAccion>,
    #[serde(rename = "actividadPorUsuario")]
    pub actividad_por_usuario: Vec<ActividadDeUsuario>,
    #[serde(rename = "actividadPorDia")]
    pub actividad_por_dia: Vec<ActividadDiaria>,
}

#[utoipa::path(
    context_path = "/api/historial-cambios",
    params(RangoFechas),
    responses(
        (status = 200, description = "Aggregate activity breakdowns over the (optionally date-bounded) record set", body = EstadisticasActividad),
        (status = 401, description = "Missing or invalid credentials"),
        (status = 500, description = "An internal server error occurred")
    )
)]
#[get("/estadisticas")]
pub async fn obtener_estadisticas(
    data: Data<AppState>,
    _identity: Identity,
    rango: Query<RangoFechas>,
) -> Result<HttpResponse, ApiError> {
    let (desde, hasta) = limites_de_fecha(rango.fecha_desde, rango.fecha_hasta);

    // Each aggregate runs independently over the same filtered set; they are
    // not one multi-dimensional cube and need not reconcile when records lack
    // a join target.
    let actividad_por_entidad = sqlx::query_as::<_, ConteoPorEntidad>(
        r#"
        SELECT entidad, COUNT(*) AS total
        FROM historial_cambios
        WHERE ($1::timestamp IS NULL OR created_at >= $1)
          AND ($2::timestamp IS NULL OR created_at <= $2)
        GROUP BY entidad
        ORDER BY total DESC
        "#,
    )
    .bind(desde)
    .bind(hasta)
    .fetch_all(&data.database)
    .await?;

    let actividad_por_accion = sqlx::query_as::<_, ConteoPorAccion>(
        r#"
        SELECT accion, COUNT(*) AS total
        FROM historial_cambios
        WHERE ($1::timestamp IS NULL OR created_at >= $1)
          AND ($2::timestamp IS NULL OR created_at <= $2)
        GROUP BY accion
        ORDER BY total DESC
        "#,
    )
    .bind(desde)
    .bind(hasta)
    .fetch_all(&data.database)
    .await?;

    // Inner join: records whose acting user was since deleted are excluded
    // from this breakdown only.
    let actividad_por_usuario = sqlx::query_as::<_, ActividadDeUsuario>(
        r#"
        SELECT
            u.id AS usuario_id,
            u.nombre AS usuario_nombre,
            u.email AS usuario_email,
            COUNT(*) AS total
        FROM historial_cambios h
        JOIN usuarios u ON u.id = h.usuario_id
        WHERE ($1::timestamp IS NULL OR h.created_at >= $1)
          AND ($2::timestamp IS NULL OR h.created_at <= $2)
        GROUP BY u.id, u.nombre, u.email
        ORDER BY total DESC
        LIMIT 10
        "#,
    )
    .bind(desde)
    .bind(hasta)
    .fetch_all(&data.database)
    .await?;

    let actividad_por_dia = sqlx::query_as::<_, ActividadDiaria>(
        r#"
        SELECT created_at::date AS fecha, COUNT(*) AS total
        FROM historial_cambios
        WHERE ($1::timestamp IS NULL OR created_at >= $1)
          AND ($2::timestamp IS NULL OR created_at <= $2)
        GROUP BY created_at::date
        ORDER BY fecha DESC
        LIMIT 30
        "#,
    )
    .bind(desde)
    .bind(hasta)
    .fetch_all(&data.database)
    .await?;

    Ok(HttpResponse::Ok().json(EstadisticasActividad {
        actividad_por_entidad,
        actividad_por_accion,
        actividad_por_usuario,
        actividad_por_dia,
    }))
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct PaginacionSimple {
    pub pagina: Option<i64>,
    #[serde(rename = "porPagina")]
    pub por_pagina: Option<i64>,
}

#[utoipa::path(
    context_path = "/api/historial-cambios",
    params(
        ("entidad" = Entidad, Path, description = "Tracked entity kind"),
        ("id" = i32, Path, description = "Entity id"),
        PaginacionSimple
    ),
    responses(
        (status = 200, description = "Change history of a single entity, newest first", body = PaginaHistorial),
        (status = 401, description = "Missing or invalid credentials"),
        (status = 500, description = "An internal server error occurred")
    )
)]
#[get("/{entidad}/{id}")]
pub async fn obtener_historial_entidad(
    data: Data<AppState>,
    _identity: Identity,
    path: Path<(Entidad, i32)>,
    paginacion: Query<PaginacionSimple>,
) -> Result<HttpResponse, ApiError> {
    let (entidad, entidad_id) = path.into_inner();

    let filtros = FiltrosHistorial {
        pagina: paginacion.pagina,
        por_pagina: paginacion.por_pagina,
        entidad: Some(entidad),
        entidad_id: Some(entidad_id),
        ..FiltrosHistorial::default()
    };

    let pagina = pagina_de_historial(&data, &filtros).await?;
    Ok(HttpResponse::Ok().json(pagina))
}

pub fn configurar(cfg: &mut actix_web::web::ServiceConfig) {
    cfg.service(obtener_historial)
        .service(obtener_estadisticas)
        .service(obtener_historial_entidad);
}

#[cfg(test)]
mod tests {
    use time::macros::date;

    use super::*;

    #[test]
    fn diff_reports_previous_and_new_values() {
        let anterior = json!({ "cantidad": 10, "nombre": "SSD 480GB" });
        let nuevo = json!({ "cantidad": 4, "nombre": "SSD 480GB" });

        let cambios = diferencias(&anterior, &nuevo);
        assert_eq!(cambios.len(), 1);
        assert_eq!(cambios["cantidad"], json!({ "anterior": 10, "nuevo": 4 }));
    }

    #[test]
    fn diff_excludes_timestamp_fields() {
        let anterior = json!({ "cantidad": 1, "updated_at": "2024-01-01T00:00:00" });
        let nuevo = json!({ "cantidad": 1, "updated_at": "2024-06-01T00:00:00" });

        assert!(diferencias(&anterior, &nuevo).is_empty());
    }

    #[test]
    fn diff_treats_added_fields_as_changes_from_null() {
        let anterior = json!({});
        let nuevo = json!({ "descripcion": "nuevo campo" });

        let cambios = diferencias(&anterior, &nuevo);
        assert_eq!(
            cambios["descripcion"],
            json!({ "anterior": null, "nuevo": "nuevo campo" })
        );
    }

    #[test]
    fn diff_of_non_objects_is_empty() {
        assert!(diferencias(&json!(1), &json!(2)).is_empty());
    }

    #[test]
    fn malformed_stored_changes_degrade_to_empty_object() {
        assert_eq!(parsear_cambios(Some("{not json")), json!({}));
        assert_eq!(
            parsear_cambios(Some(r#"{"campo":{"anterior":1,"nuevo":2}}"#)),
            json!({ "campo": { "anterior": 1, "nuevo": 2 } })
        );
        assert_eq!(parsear_cambios(None), Value::Null);
    }

    #[test]
    fn date_upper_bound_extends_to_end_of_day() {
        let hasta = fin_de_dia(date!(2024 - 03 - 15));
        assert_eq!(hasta.date(), date!(2024 - 03 - 15));
        assert_eq!(hasta.hour(), 23);
        assert_eq!(hasta.minute(), 59);
        assert_eq!(hasta.second(), 59);
    }

    #[test]
    fn date_lower_bound_starts_at_midnight() {
        let (desde, hasta) = limites_de_fecha(Some(date!(2024 - 03 - 15)), None);
        assert_eq!(desde.unwrap().hour(), 0);
        assert!(hasta.is_none());
    }
}
