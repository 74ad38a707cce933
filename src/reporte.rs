use actix_web::{
    delete, get, post, put,
    web::{Data, Json, Path, Query},
    HttpResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{FromRow, Pool, Postgres, QueryBuilder, Transaction};
use time::PrimitiveDateTime;
use utoipa::{IntoParams, ToSchema};

use crate::error::ApiError;
use crate::identity::Identity;
use crate::models::{AppState, EstadoReporte, EstadoReporteEntrada, Prioridad, Reporte, UsuarioResumen};

/// Triage rank of a priority: lower sorts first in listings.
fn rango_prioridad(prioridad: Prioridad) -> i32 {
    match prioridad {
        Prioridad::Urgente => 1,
        Prioridad::Alta => 2,
        Prioridad::Media => 3,
        Prioridad::Baja => 4,
    }
}

/// Triage ordering for listings: urgent first, ties broken by newest.
fn orden_triaje() -> String {
    let ramas = [
        Prioridad::Urgente,
        Prioridad::Alta,
        Prioridad::Media,
        Prioridad::Baja,
    ]
    .into_iter()
    .map(|prioridad| format!("WHEN '{prioridad}' THEN {}", rango_prioridad(prioridad)))
    .collect::<Vec<_>>()
    .join(" ");

    format!(" ORDER BY CASE r.prioridad {ramas} END, r.created_at DESC")
}

pub async fn es_computadora_existente(
    database: &Pool<Postgres>,
    computadora_id: i32,
) -> Result<bool, sqlx::Error> {
    let fila = sqlx::query_scalar::<_, i32>("SELECT id FROM computadoras WHERE id = $1")
        .bind(computadora_id)
        .fetch_optional(database)
        .await?;
    Ok(fila.is_some())
}

/// Comment recorded when a transition carries no explicit comment.
fn comentario_de_transicion(estado: EstadoReporte) -> String {
    format!("Estado cambiado a {estado}")
}

/// Whether moving from `actual` to `nuevo` is a real transition. A same-state
/// request is not: it must write no history entry and bump no `updated_at`.
/// Every pair of distinct states is a valid transition.
fn es_transicion(actual: EstadoReporte, nuevo: EstadoReporte) -> bool {
    nuevo != actual
}

/// Single write path for a report's state. Appends the history entry and
/// updates the materialized `estado_actual` column together, so the column
/// can never drift from the newest history row. A same-state call is a
/// no-op and writes nothing.
///
/// Any transition between the four states is permitted; the history keeps
/// every intermediate state, so completeness of the trail is favored over
/// workflow enforcement.
async fn cambiar_estado(
    tx: &mut Transaction<'_, Postgres>,
    reporte: &Reporte,
    nuevo_estado: EstadoReporte,
    comentario: Option<&str>,
    usuario_id: i32,
) -> Result<bool, sqlx::Error> {
    if !es_transicion(reporte.estado_actual, nuevo_estado) {
        return Ok(false);
    }

    let comentario = comentario
        .map(str::to_owned)
        .unwrap_or_else(|| comentario_de_transicion(nuevo_estado));

    sqlx::query(
        "INSERT INTO estados_reporte (estado, comentario, reporte_id, usuario_id) VALUES ($1, $2, $3, $4)",
    )
    .bind(nuevo_estado)
    .bind(comentario)
    .bind(reporte.id)
    .bind(usuario_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query("UPDATE reportes SET estado_actual = $1, updated_at = now() WHERE id = $2")
        .bind(nuevo_estado)
        .bind(reporte.id)
        .execute(&mut *tx)
        .await?;

    Ok(true)
}

async fn buscar_reporte(
    database: &Pool<Postgres>,
    id: i32,
) -> Result<Reporte, ApiError> {
    sqlx::query_as::<_, Reporte>("SELECT * FROM reportes WHERE id = $1")
        .bind(id)
        .fetch_optional(database)
        .await?
        .ok_or_else(|| ApiError::not_found("Reporte", id))
}

#[derive(FromRow)]
struct ReporteListadoRow {
    id: i32,
    titulo: String,
    descripcion: String,
    prioridad: Prioridad,
    estado_actual: EstadoReporte,
    usuario_id: i32,
    computadora_id: i32,
    tecnico_asignado_id: Option<i32>,
    created_at: PrimitiveDateTime,
    updated_at: PrimitiveDateTime,
    usuario_nombre: Option<String>,
    usuario_apellido: Option<String>,
    usuario_email: Option<String>,
    tecnico_nombre: Option<String>,
    tecnico_apellido: Option<String>,
    tecnico_email: Option<String>,
}

/// A report with its reporting user and assigned technician joined in.
#[derive(Debug, Serialize, ToSchema)]
pub struct ReporteConUsuarios {
    #[serde(flatten)]
    pub reporte: Reporte,
    pub usuario: Option<UsuarioResumen>,
    pub tecnico: Option<UsuarioResumen>,
}

impl From<ReporteListadoRow> for ReporteConUsuarios {
    fn from(row: ReporteListadoRow) -> ReporteConUsuarios {
        let usuario = match (row.usuario_nombre, row.usuario_email) {
            (Some(nombre), Some(email)) => Some(UsuarioResumen {
                id: row.usuario_id,
                nombre,
                apellido: row.usuario_apellido,
                email,
            }),
            _ => None,
        };
        let tecnico = match (row.tecnico_asignado_id, row.tecnico_nombre, row.tecnico_email) {
            (Some(id), Some(nombre), Some(email)) => Some(UsuarioResumen {
                id,
                nombre,
                apellido: row.tecnico_apellido,
                email,
            }),
            _ => None,
        };

        ReporteConUsuarios {
            reporte: Reporte {
                id: row.id,
                titulo: row.titulo,
                descripcion: row.descripcion,
                prioridad: row.prioridad,
                estado_actual: row.estado_actual,
                usuario_id: row.usuario_id,
                computadora_id: row.computadora_id,
                tecnico_asignado_id: row.tecnico_asignado_id,
                created_at: row.created_at,
                updated_at: row.updated_at,
            },
            usuario,
            tecnico,
        }
    }
}

const REPORTE_LISTADO_SELECT: &str = r#"
    SELECT
        r.id, r.titulo, r.descripcion, r.prioridad, r.estado_actual,
        r.usuario_id, r.computadora_id, r.tecnico_asignado_id,
        r.created_at, r.updated_at,
        u.nombre AS usuario_nombre,
        u.apellido AS usuario_apellido,
        u.email AS usuario_email,
        t.nombre AS tecnico_nombre,
        t.apellido AS tecnico_apellido,
        t.email AS tecnico_email
    FROM reportes r
    LEFT JOIN usuarios u ON u.id = r.usuario_id
    LEFT JOIN usuarios t ON t.id = r.tecnico_asignado_id
"#;

#[derive(Debug, Deserialize, IntoParams)]
pub struct FiltrosReporte {
    pub estado: Option<EstadoReporte>,
    pub prioridad: Option<Prioridad>,
    pub usuario_id: Option<i32>,
    pub computadora_id: Option<i32>,
    pub tecnico_id: Option<i32>,
}

#[utoipa::path(
    context_path = "/api/reportes",
    params(FiltrosReporte),
    responses(
        (status = 200, description = "Reports visible to the caller, in triage order", body = Vec<ReporteConUsuarios>),
        (status = 401, description = "Missing or invalid credentials"),
        (status = 500, description = "An internal server error occurred")
    )
)]
#[get("")]
pub async fn obtener_reportes(
    data: Data<AppState>,
    identity: Identity,
    filtros: Query<FiltrosReporte>,
) -> Result<HttpResponse, ApiError> {
    let mut consulta = QueryBuilder::new(format!("{REPORTE_LISTADO_SELECT} WHERE 1=1"));

    if let Some(estado) = filtros.estado {
        consulta.push(" AND r.estado_actual = ").push_bind(estado);
    }
    if let Some(prioridad) = filtros.prioridad {
        consulta.push(" AND r.prioridad = ").push_bind(prioridad);
    }
    if let Some(computadora_id) = filtros.computadora_id {
        consulta.push(" AND r.computadora_id = ").push_bind(computadora_id);
    }
    if let Some(tecnico_id) = filtros.tecnico_id {
        consulta.push(" AND r.tecnico_asignado_id = ").push_bind(tecnico_id);
    }

    // Row-level restriction: plain users only ever see their own reports,
    // whatever usuario_id they asked for.
    let usuario_id = if identity.rol.es_privilegiado() {
        filtros.usuario_id
    } else {
        Some(identity.usuario_id)
    };
    if let Some(usuario_id) = usuario_id {
        consulta.push(" AND r.usuario_id = ").push_bind(usuario_id);
    }

    consulta.push(orden_triaje());

    let reportes: Vec<ReporteConUsuarios> = consulta
        .build_query_as::<ReporteListadoRow>()
        .fetch_all(&data.database)
        .await?
        .into_iter()
        .map(ReporteConUsuarios::from)
        .collect();

    Ok(HttpResponse::Ok().json(reportes))
}

#[derive(FromRow)]
struct EstadoConUsuarioRow {
    id: i32,
    estado: EstadoReporte,
    comentario: Option<String>,
    reporte_id: i32,
    usuario_id: i32,
    created_at: PrimitiveDateTime,
    usuario_nombre: Option<String>,
    usuario_apellido: Option<String>,
    usuario_email: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct EstadoConUsuario {
    #[serde(flatten)]
    pub entrada: EstadoReporteEntrada,
    pub usuario: Option<UsuarioResumen>,
}

impl From<EstadoConUsuarioRow> for EstadoConUsuario {
    fn from(row: EstadoConUsuarioRow) -> EstadoConUsuario {
        let usuario = match (row.usuario_nombre, row.usuario_email) {
            (Some(nombre), Some(email)) => Some(UsuarioResumen {
                id: row.usuario_id,
                nombre,
                apellido: row.usuario_apellido,
                email,
            }),
            _ => None,
        };
        EstadoConUsuario {
            entrada: EstadoReporteEntrada {
                id: row.id,
                estado: row.estado,
                comentario: row.comentario,
                reporte_id: row.reporte_id,
                usuario_id: row.usuario_id,
                created_at: row.created_at,
            },
            usuario,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ReporteDetalle {
    #[serde(flatten)]
    pub reporte: ReporteConUsuarios,
    pub estados: Vec<EstadoConUsuario>,
}

#[utoipa::path(
    context_path = "/api/reportes",
    responses(
        (status = 200, description = "The requested report with its full state history, newest entry first", body = ReporteDetalle),
        (status = 403, description = "The caller may not view this report"),
        (status = 404, description = "The requested report was not found"),
        (status = 500, description = "An internal server error occurred")
    )
)]
#[get("/{id}")]
pub async fn obtener_reporte(
    data: Data<AppState>,
    identity: Identity,
    path: Path<i32>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();

    let row = sqlx::query_as::<_, ReporteListadoRow>(&format!(
        "{REPORTE_LISTADO_SELECT} WHERE r.id = $1"
    ))
    .bind(id)
    .fetch_optional(&data.database)
    .await?
    .ok_or_else(|| ApiError::not_found("Reporte", id))?;

    let reporte = ReporteConUsuarios::from(row);
    if !identity.puede_tocar_reporte(reporte.reporte.usuario_id) {
        return Err(ApiError::Forbidden(
            "No tienes permiso para ver este reporte.".into(),
        ));
    }

    let estados: Vec<EstadoConUsuario> = sqlx::query_as::<_, EstadoConUsuarioRow>(
        r#"
        SELECT
            e.id, e.estado, e.comentario, e.reporte_id, e.usuario_id, e.created_at,
            u.nombre AS usuario_nombre,
            u.apellido AS usuario_apellido,
            u.email AS usuario_email
        FROM estados_reporte e
        LEFT JOIN usuarios u ON u.id = e.usuario_id
        WHERE e.reporte_id = $1
        ORDER BY e.created_at DESC, e.id DESC
        "#,
    )
    .bind(id)
    .fetch_all(&data.database)
    .await?
    .into_iter()
    .map(EstadoConUsuario::from)
    .collect();

    Ok(HttpResponse::Ok().json(ReporteDetalle { reporte, estados }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct NuevoReporte {
    pub titulo: String,
    pub descripcion: String,
    pub computadora_id: i32,
    pub prioridad: Option<Prioridad>,
    pub tecnico_asignado_id: Option<i32>,
}

fn validar_nuevo_reporte(reporte: &NuevoReporte) -> Result<(), ApiError> {
    if reporte.titulo.trim().is_empty()
        || reporte.descripcion.trim().is_empty()
        || reporte.computadora_id <= 0
    {
        return Err(ApiError::Validation(
            "Título, descripción y computadora son campos requeridos!".into(),
        ));
    }
    Ok(())
}

#[utoipa::path(
    context_path = "/api/reportes",
    request_body = NuevoReporte,
    responses(
        (status = 201, description = "The report was created with its initial pending state entry", body = Reporte),
        (status = 400, description = "A required field is missing or empty"),
        (status = 404, description = "The referenced computer was not found"),
        (status = 500, description = "An internal server error occurred")
    )
)]
#[post("")]
pub async fn crear_reporte(
    data: Data<AppState>,
    identity: Identity,
    Json(nuevo): Json<NuevoReporte>,
) -> Result<HttpResponse, ApiError> {
    validar_nuevo_reporte(&nuevo)?;

    if !es_computadora_existente(&data.database, nuevo.computadora_id).await? {
        return Err(ApiError::not_found("Computadora", nuevo.computadora_id));
    }

    // Report and initial history entry land together: a report without at
    // least one state entry must never be observable.
    let mut tx = data.database.begin().await?;

    let reporte = sqlx::query_as::<_, Reporte>(
        r#"
        INSERT INTO reportes (titulo, descripcion, prioridad, usuario_id, computadora_id, tecnico_asignado_id)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING *
        "#,
    )
    .bind(&nuevo.titulo)
    .bind(&nuevo.descripcion)
    .bind(nuevo.prioridad.unwrap_or(Prioridad::Media))
    .bind(identity.usuario_id)
    .bind(nuevo.computadora_id)
    .bind(nuevo.tecnico_asignado_id)
    .fetch_one(&mut tx)
    .await?;

    sqlx::query(
        "INSERT INTO estados_reporte (estado, comentario, reporte_id, usuario_id) VALUES ($1, $2, $3, $4)",
    )
    .bind(EstadoReporte::Pendiente)
    .bind("Reporte creado")
    .bind(reporte.id)
    .bind(identity.usuario_id)
    .execute(&mut tx)
    .await?;

    tx.commit().await?;

    Ok(HttpResponse::Created().json(reporte))
}

/// Distinguishes an absent field from an explicit `null`. An absent
/// `tecnico_asignado_id` leaves the assignment alone; `null` clears it.
fn campo_anulable<'de, D>(deserializer: D) -> Result<Option<Option<i32>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<i32>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ActualizacionReporte {
    pub titulo: Option<String>,
    pub descripcion: Option<String>,
    pub prioridad: Option<Prioridad>,
    #[serde(default, deserialize_with = "campo_anulable")]
    #[schema(value_type = Option<i32>, nullable)]
    pub tecnico_asignado_id: Option<Option<i32>>,
    pub estado_actual: Option<EstadoReporte>,
    pub comentario: Option<String>,
}

impl ActualizacionReporte {
    /// An empty or whitespace-only string keeps the stored value, like an
    /// absent field.
    fn titulo_saneado(&self) -> Option<&str> {
        sanear(self.titulo.as_deref())
    }

    fn descripcion_saneada(&self) -> Option<&str> {
        sanear(self.descripcion.as_deref())
    }

    fn tiene_campos(&self) -> bool {
        self.titulo_saneado().is_some()
            || self.descripcion_saneada().is_some()
            || self.prioridad.is_some()
            || self.tecnico_asignado_id.is_some()
    }
}

fn sanear(valor: Option<&str>) -> Option<&str> {
    valor.map(str::trim).filter(|texto| !texto.is_empty())
}

#[utoipa::path(
    context_path = "/api/reportes",
    request_body = ActualizacionReporte,
    responses(
        (status = 200, description = "The updated report; a differing estado_actual also appends a history entry", body = Reporte),
        (status = 403, description = "The caller may not update this report"),
        (status = 404, description = "The requested report was not found"),
        (status = 500, description = "An internal server error occurred")
    )
)]
#[put("/{id}")]
pub async fn actualizar_reporte(
    data: Data<AppState>,
    identity: Identity,
    path: Path<i32>,
    Json(actualizacion): Json<ActualizacionReporte>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let reporte = buscar_reporte(&data.database, id).await?;

    if !identity.puede_tocar_reporte(reporte.usuario_id) {
        return Err(ApiError::Forbidden(
            "No tienes permiso para actualizar este reporte.".into(),
        ));
    }

    let mut tx = data.database.begin().await?;

    if actualizacion.tiene_campos() {
        sqlx::query(
            r#"
            UPDATE reportes SET
                titulo = COALESCE($1, titulo),
                descripcion = COALESCE($2, descripcion),
                prioridad = COALESCE($3, prioridad),
                tecnico_asignado_id = CASE WHEN $4 THEN $5 ELSE tecnico_asignado_id END,
                updated_at = now()
            WHERE id = $6
            "#,
        )
        .bind(actualizacion.titulo_saneado())
        .bind(actualizacion.descripcion_saneada())
        .bind(actualizacion.prioridad)
        .bind(actualizacion.tecnico_asignado_id.is_some())
        .bind(actualizacion.tecnico_asignado_id.flatten())
        .bind(id)
        .execute(&mut tx)
        .await?;
    }

    if let Some(nuevo_estado) = actualizacion.estado_actual {
        cambiar_estado(
            &mut tx,
            &reporte,
            nuevo_estado,
            actualizacion.comentario.as_deref(),
            identity.usuario_id,
        )
        .await?;
    }

    tx.commit().await?;

    let actualizado = buscar_reporte(&data.database, id).await?;
    Ok(HttpResponse::Ok().json(actualizado))
}

#[utoipa::path(
    context_path = "/api/reportes",
    responses(
        (status = 200, description = "The report and its state history were deleted"),
        (status = 403, description = "Only administrators may delete reports"),
        (status = 404, description = "The requested report was not found"),
        (status = 500, description = "An internal server error occurred")
    )
)]
#[delete("/{id}")]
pub async fn eliminar_reporte(
    data: Data<AppState>,
    identity: Identity,
    path: Path<i32>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();

    if !identity.rol.es_administrador() {
        return Err(ApiError::Forbidden(
            "No tienes permiso para eliminar este reporte.".into(),
        ));
    }

    buscar_reporte(&data.database, id).await?;

    // History rows go first; a report must never outlive-or-orphan its trail.
    let mut tx = data.database.begin().await?;
    sqlx::query("DELETE FROM estados_reporte WHERE reporte_id = $1")
        .bind(id)
        .execute(&mut tx)
        .await?;
    sqlx::query("DELETE FROM reportes WHERE id = $1")
        .bind(id)
        .execute(&mut tx)
        .await?;
    tx.commit().await?;

    Ok(HttpResponse::Ok().json(json!({ "mensaje": "Reporte eliminado exitosamente!" })))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct NuevoComentario {
    pub comentario: String,
}

#[utoipa::path(
    context_path = "/api/reportes",
    request_body = NuevoComentario,
    responses(
        (status = 201, description = "A comment-only entry at the report's current state", body = EstadoReporteEntrada),
        (status = 400, description = "The comment is empty"),
        (status = 403, description = "The caller may not comment on this report"),
        (status = 404, description = "The requested report was not found"),
        (status = 500, description = "An internal server error occurred")
    )
)]
#[post("/{id}/comentarios")]
pub async fn agregar_comentario(
    data: Data<AppState>,
    identity: Identity,
    path: Path<i32>,
    Json(nuevo): Json<NuevoComentario>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();

    if nuevo.comentario.trim().is_empty() {
        return Err(ApiError::Validation("El comentario es requerido!".into()));
    }

    let reporte = buscar_reporte(&data.database, id).await?;
    if !identity.puede_tocar_reporte(reporte.usuario_id) {
        return Err(ApiError::Forbidden(
            "No tienes permiso para comentar en este reporte.".into(),
        ));
    }

    // Comment-only entry: carries the current state, not a transition.
    let entrada = sqlx::query_as::<_, EstadoReporteEntrada>(
        r#"
        INSERT INTO estados_reporte (estado, comentario, reporte_id, usuario_id)
        VALUES ($1, $2, $3, $4)
        RETURNING *
        "#,
    )
    .bind(reporte.estado_actual)
    .bind(&nuevo.comentario)
    .bind(id)
    .bind(identity.usuario_id)
    .fetch_one(&data.database)
    .await?;

    Ok(HttpResponse::Created().json(entrada))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AsignacionTecnico {
    pub tecnico_id: i32,
}

#[derive(FromRow)]
struct TecnicoRow {
    nombre: String,
    apellido: String,
}

#[utoipa::path(
    context_path = "/api/reportes",
    request_body = AsignacionTecnico,
    responses(
        (status = 200, description = "The report with the technician assigned; assignment is logged as a same-state history entry", body = Reporte),
        (status = 403, description = "Only technicians and administrators may assign"),
        (status = 404, description = "The report or a valid technician was not found"),
        (status = 500, description = "An internal server error occurred")
    )
)]
#[post("/{id}/asignar-tecnico")]
pub async fn asignar_tecnico(
    data: Data<AppState>,
    identity: Identity,
    path: Path<i32>,
    Json(asignacion): Json<AsignacionTecnico>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();

    if !identity.rol.es_privilegiado() {
        return Err(ApiError::Forbidden(
            "Se requiere rol de técnico o administrador!".into(),
        ));
    }

    let reporte = buscar_reporte(&data.database, id).await?;

    let tecnico = sqlx::query_as::<_, TecnicoRow>(
        "SELECT nombre, apellido FROM usuarios WHERE id = $1 AND tipo = 'tecnico'",
    )
    .bind(asignacion.tecnico_id)
    .fetch_optional(&data.database)
    .await?
    .ok_or_else(|| ApiError::not_found("Técnico", asignacion.tecnico_id))?;

    let mut tx = data.database.begin().await?;

    sqlx::query("UPDATE reportes SET tecnico_asignado_id = $1, updated_at = now() WHERE id = $2")
        .bind(asignacion.tecnico_id)
        .bind(id)
        .execute(&mut tx)
        .await?;

    // Assignment does not change the state; it is logged as a same-state
    // entry naming the technician.
    sqlx::query(
        "INSERT INTO estados_reporte (estado, comentario, reporte_id, usuario_id) VALUES ($1, $2, $3, $4)",
    )
    .bind(reporte.estado_actual)
    .bind(format!(
        "Técnico asignado: {} {}",
        tecnico.nombre, tecnico.apellido
    ))
    .bind(id)
    .bind(identity.usuario_id)
    .execute(&mut tx)
    .await?;

    tx.commit().await?;

    let actualizado = buscar_reporte(&data.database, id).await?;
    Ok(HttpResponse::Ok().json(actualizado))
}

#[derive(Debug, Serialize, FromRow, ToSchema)]
pub struct ConteoPorEstado {
    pub estado: EstadoReporte,
    pub total: i64,
}

#[derive(Debug, Serialize, FromRow, ToSchema)]
pub struct ConteoPorPrioridad {
    pub prioridad: Prioridad,
    pub total: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct EstadisticasReportes {
    pub total: i64,
    pub pendientes: i64,
    #[serde(rename = "enProgreso")]
    pub en_progreso: i64,
    pub resueltos: i64,
    pub cerrados: i64,
    #[serde(rename = "porPrioridad")]
    pub por_prioridad: Vec<ConteoPorPrioridad>,
    #[serde(rename = "porEstado")]
    pub por_estado: Vec<ConteoPorEstado>,
    #[serde(rename = "ultimosReportes")]
    pub ultimos_reportes: Vec<ReporteConUsuarios>,
}

fn conteo_de_estado(conteos: &[ConteoPorEstado], estado: EstadoReporte) -> i64 {
    conteos
        .iter()
        .find(|conteo| conteo.estado == estado)
        .map(|conteo| conteo.total)
        .unwrap_or(0)
}

#[utoipa::path(
    context_path = "/api/reportes",
    responses(
        (status = 200, description = "Report totals by state and priority plus the five newest reports", body = EstadisticasReportes),
        (status = 401, description = "Missing or invalid credentials"),
        (status = 500, description = "An internal server error occurred")
    )
)]
#[get("/estadisticas")]
pub async fn estadisticas_reportes(
    data: Data<AppState>,
    _identity: Identity,
) -> Result<HttpResponse, ApiError> {
    let por_estado = sqlx::query_as::<_, ConteoPorEstado>(
        "SELECT estado_actual AS estado, COUNT(*) AS total FROM reportes GROUP BY estado_actual",
    )
    .fetch_all(&data.database)
    .await?;

    let por_prioridad = sqlx::query_as::<_, ConteoPorPrioridad>(
        "SELECT prioridad, COUNT(*) AS total FROM reportes GROUP BY prioridad",
    )
    .fetch_all(&data.database)
    .await?;

    let ultimos_reportes: Vec<ReporteConUsuarios> = sqlx::query_as::<_, ReporteListadoRow>(
        &format!("{REPORTE_LISTADO_SELECT} ORDER BY r.created_at DESC LIMIT 5"),
    )
    .fetch_all(&data.database)
    .await?
    .into_iter()
    .map(ReporteConUsuarios::from)
    .collect();

    let total = por_estado.iter().map(|conteo| conteo.total).sum();

    Ok(HttpResponse::Ok().json(EstadisticasReportes {
        total,
        pendientes: conteo_de_estado(&por_estado, EstadoReporte::Pendiente),
        en_progreso: conteo_de_estado(&por_estado, EstadoReporte::EnProgreso),
        resueltos: conteo_de_estado(&por_estado, EstadoReporte::Resuelto),
        cerrados: conteo_de_estado(&por_estado, EstadoReporte::Cerrado),
        por_prioridad,
        por_estado,
        ultimos_reportes,
    }))
}

pub fn configurar(cfg: &mut actix_web::web::ServiceConfig) {
    // "/estadisticas" must register before "/{id}".
    cfg.service(estadisticas_reportes)
        .service(obtener_reportes)
        .service(crear_reporte)
        .service(obtener_reporte)
        .service(actualizar_reporte)
        .service(eliminar_reporte)
        .service(agregar_comentario)
        .service(asignar_tecnico);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_transition_comment_names_the_new_state() {
        assert_eq!(
            comentario_de_transicion(EstadoReporte::EnProgreso),
            "Estado cambiado a en_progreso"
        );
        assert_eq!(
            comentario_de_transicion(EstadoReporte::Resuelto),
            "Estado cambiado a resuelto"
        );
    }

    #[test]
    fn new_report_requires_title_description_and_computer() {
        let valido = NuevoReporte {
            titulo: "Pantalla parpadea".into(),
            descripcion: "La pantalla parpadea al encender".into(),
            computadora_id: 42,
            prioridad: Some(Prioridad::Alta),
            tecnico_asignado_id: None,
        };
        assert!(validar_nuevo_reporte(&valido).is_ok());

        let sin_titulo = NuevoReporte {
            titulo: "   ".into(),
            ..valido_clone(&valido)
        };
        assert!(validar_nuevo_reporte(&sin_titulo).is_err());

        let sin_computadora = NuevoReporte {
            computadora_id: 0,
            ..valido_clone(&valido)
        };
        assert!(validar_nuevo_reporte(&sin_computadora).is_err());
    }

    fn valido_clone(reporte: &NuevoReporte) -> NuevoReporte {
        NuevoReporte {
            titulo: reporte.titulo.clone(),
            descripcion: reporte.descripcion.clone(),
            computadora_id: reporte.computadora_id,
            prioridad: reporte.prioridad,
            tecnico_asignado_id: reporte.tecnico_asignado_id,
        }
    }

    #[test]
    fn same_state_is_not_a_transition() {
        let estados = [
            EstadoReporte::Pendiente,
            EstadoReporte::EnProgreso,
            EstadoReporte::Resuelto,
            EstadoReporte::Cerrado,
        ];
        for estado in estados {
            assert!(!es_transicion(estado, estado));
        }
        for actual in estados {
            for nuevo in estados {
                if actual != nuevo {
                    assert!(es_transicion(actual, nuevo));
                }
            }
        }
    }

    #[test]
    fn triage_ranks_urgent_first_and_low_last() {
        assert!(rango_prioridad(Prioridad::Urgente) < rango_prioridad(Prioridad::Alta));
        assert!(rango_prioridad(Prioridad::Alta) < rango_prioridad(Prioridad::Media));
        assert!(rango_prioridad(Prioridad::Media) < rango_prioridad(Prioridad::Baja));
    }

    #[test]
    fn triage_order_ranks_every_priority() {
        let orden = orden_triaje();
        for prioridad in [
            Prioridad::Urgente,
            Prioridad::Alta,
            Prioridad::Media,
            Prioridad::Baja,
        ] {
            let rama = format!("WHEN '{prioridad}' THEN {}", rango_prioridad(prioridad));
            assert!(orden.contains(&rama), "falta {rama} en {orden}");
        }
        assert!(orden.contains("r.created_at DESC"));
    }

    #[test]
    fn update_with_only_state_touches_no_fields() {
        let solo_estado = ActualizacionReporte {
            titulo: None,
            descripcion: None,
            prioridad: None,
            tecnico_asignado_id: None,
            estado_actual: Some(EstadoReporte::Resuelto),
            comentario: None,
        };
        assert!(!solo_estado.tiene_campos());

        let con_titulo = ActualizacionReporte {
            titulo: Some("Nuevo título".into()),
            ..solo_estado
        };
        assert!(con_titulo.tiene_campos());
    }

    #[test]
    fn empty_strings_keep_the_stored_values() {
        let en_blanco = ActualizacionReporte {
            titulo: Some("   ".into()),
            descripcion: Some(String::new()),
            prioridad: None,
            tecnico_asignado_id: None,
            estado_actual: None,
            comentario: None,
        };
        assert_eq!(en_blanco.titulo_saneado(), None);
        assert_eq!(en_blanco.descripcion_saneada(), None);
        assert!(!en_blanco.tiene_campos());

        let con_texto = ActualizacionReporte {
            titulo: Some("  Teclado dañado  ".into()),
            ..en_blanco
        };
        assert_eq!(con_texto.titulo_saneado(), Some("Teclado dañado"));
    }

    #[test]
    fn explicit_null_unassigns_the_technician() {
        let ausente: ActualizacionReporte = serde_json::from_value(json!({})).unwrap();
        assert_eq!(ausente.tecnico_asignado_id, None);
        assert!(!ausente.tiene_campos());

        let nulo: ActualizacionReporte =
            serde_json::from_value(json!({ "tecnico_asignado_id": null })).unwrap();
        assert_eq!(nulo.tecnico_asignado_id, Some(None));
        assert!(nulo.tiene_campos());

        let asignado: ActualizacionReporte =
            serde_json::from_value(json!({ "tecnico_asignado_id": 7 })).unwrap();
        assert_eq!(asignado.tecnico_asignado_id, Some(Some(7)));
    }

    #[test]
    fn state_count_lookup_defaults_to_zero() {
        let conteos = vec![
            ConteoPorEstado {
                estado: EstadoReporte::Pendiente,
                total: 3,
            },
            ConteoPorEstado {
                estado: EstadoReporte::Cerrado,
                total: 1,
            },
        ];
        assert_eq!(conteo_de_estado(&conteos, EstadoReporte::Pendiente), 3);
        assert_eq!(conteo_de_estado(&conteos, EstadoReporte::EnProgreso), 0);
    }
}
