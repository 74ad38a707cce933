use actix_web::{
    delete, get, post, put,
    web::{Data, Json, Path, Query},
    HttpRequest, HttpResponse,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{FromRow, QueryBuilder};
use utoipa::{IntoParams, ToSchema};

use crate::error::ApiError;
use crate::historial::{diferencias, registrar_cambio, NuevoCambio};
use crate::identity::Identity;
use crate::models::{
    normalizar_paginacion, total_paginas, Accion, AppState, Entidad, EstadoRepuesto, Repuesto,
};

/// Pagination envelope for spare-part listings.
#[derive(Debug, Serialize, ToSchema)]
pub struct PaginaRepuestos {
    pub total: i64,
    pub paginas: i64,
    #[serde(rename = "paginaActual")]
    pub pagina_actual: i64,
    #[serde(rename = "porPagina")]
    pub por_pagina: i64,
    pub datos: Vec<Repuesto>,
}

pub const CATEGORIAS: &[&str] = &[
    "Almacenamiento",
    "Memoria",
    "Procesadores",
    "Tarjetas Madre",
    "Tarjetas de Video",
    "Fuentes de Poder",
    "Gabinetes",
    "Enfriamiento",
    "Periféricos",
    "Redes",
    "Pantallas",
    "Otros",
];

fn validar_codigo(codigo: &str) -> Result<(), ApiError> {
    if codigo.is_empty() || codigo.len() > 20 {
        return Err(ApiError::Validation(
            "El código debe tener entre 1 y 20 caracteres".into(),
        ));
    }
    Ok(())
}

fn validar_nombre(nombre: &str) -> Result<(), ApiError> {
    if nombre.chars().count() < 2 || nombre.chars().count() > 100 {
        return Err(ApiError::Validation(
            "El nombre debe tener entre 2 y 100 caracteres".into(),
        ));
    }
    Ok(())
}

fn validar_categoria(categoria: &str) -> Result<(), ApiError> {
    if !CATEGORIAS.contains(&categoria) {
        return Err(ApiError::Validation("Categoría no válida".into()));
    }
    Ok(())
}

fn validar_cantidades(cantidad: i32, minimo: i32, precio: Decimal) -> Result<(), ApiError> {
    if cantidad < 0 {
        return Err(ApiError::Validation(
            "La cantidad no puede ser negativa".into(),
        ));
    }
    if minimo < 1 {
        return Err(ApiError::Validation(
            "El stock mínimo debe ser al menos 1".into(),
        ));
    }
    if precio < Decimal::ZERO {
        return Err(ApiError::Validation("El precio no puede ser negativo".into()));
    }
    Ok(())
}

fn requerir_administrador(identity: &Identity) -> Result<(), ApiError> {
    if !identity.rol.es_administrador() {
        return Err(ApiError::Forbidden(
            "Se requiere rol de administrador!".into(),
        ));
    }
    Ok(())
}

fn contexto_cliente(req: &HttpRequest) -> (Option<String>, Option<String>) {
    let ip = req
        .connection_info()
        .realip_remote_addr()
        .map(str::to_owned);
    let user_agent = req
        .headers()
        .get(actix_web::http::header::USER_AGENT)
        .and_then(|valor| valor.to_str().ok())
        .map(str::to_owned);
    (ip, user_agent)
}

/// Serializes a spare part for the audit trail. The diff helper skips the
/// timestamp fields on its own.
fn instantanea(repuesto: &Repuesto) -> serde_json::Value {
    serde_json::to_value(repuesto).unwrap_or(serde_json::Value::Null)
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct FiltrosRepuesto {
    pub pagina: Option<i64>,
    #[serde(rename = "porPagina")]
    pub por_pagina: Option<i64>,
    pub busqueda: Option<String>,
    pub categoria: Option<String>,
}

#[derive(FromRow)]
struct ConteoTotal {
    total: i64,
}

fn empujar_filtros(consulta: &mut QueryBuilder<'_, sqlx::Postgres>, filtros: &FiltrosRepuesto) {
    consulta.push(" WHERE 1=1");

    if let Some(busqueda) = filtros.busqueda.as_deref().filter(|b| !b.is_empty()) {
        let patron = format!("%{busqueda}%");
        consulta
            .push(" AND (codigo ILIKE ")
            .push_bind(patron.clone())
            .push(" OR nombre ILIKE ")
            .push_bind(patron.clone())
            .push(" OR descripcion ILIKE ")
            .push_bind(patron)
            .push(")");
    }
    if let Some(categoria) = filtros.categoria.as_deref().filter(|c| !c.is_empty()) {
        consulta.push(" AND categoria = ").push_bind(categoria.to_owned());
    }
}

#[utoipa::path(
    context_path = "/api/repuestos",
    params(FiltrosRepuesto),
    responses(
        (status = 200, description = "Page of spare parts ordered by name", body = PaginaRepuestos),
        (status = 401, description = "Missing or invalid credentials"),
        (status = 500, description = "An internal server error occurred")
    )
)]
#[get("")]
pub async fn obtener_repuestos(
    data: Data<AppState>,
    _identity: Identity,
    filtros: Query<FiltrosRepuesto>,
) -> Result<HttpResponse, ApiError> {
    let (pagina, por_pagina, offset) = normalizar_paginacion(filtros.pagina, filtros.por_pagina);

    let mut conteo = QueryBuilder::new("SELECT COUNT(*) AS total FROM repuestos");
    empujar_filtros(&mut conteo, &filtros);
    let total = conteo
        .build_query_as::<ConteoTotal>()
        .fetch_one(&data.database)
        .await?
        .total;

    let mut consulta = QueryBuilder::new("SELECT * FROM repuestos");
    empujar_filtros(&mut consulta, &filtros);
    consulta
        .push(" ORDER BY nombre ASC LIMIT ")
        .push_bind(por_pagina)
        .push(" OFFSET ")
        .push_bind(offset);

    let datos = consulta
        .build_query_as::<Repuesto>()
        .fetch_all(&data.database)
        .await?;

    Ok(HttpResponse::Ok().json(PaginaRepuestos {
        total,
        paginas: total_paginas(total, por_pagina),
        pagina_actual: pagina,
        por_pagina,
        datos,
    }))
}

#[utoipa::path(
    context_path = "/api/repuestos",
    responses(
        (status = 200, description = "The requested spare part", body = Repuesto),
        (status = 404, description = "The requested spare part was not found"),
        (status = 500, description = "An internal server error occurred")
    )
)]
#[get("/{id}")]
pub async fn obtener_repuesto(
    data: Data<AppState>,
    _identity: Identity,
    path: Path<i32>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();

    let repuesto = sqlx::query_as::<_, Repuesto>("SELECT * FROM repuestos WHERE id = $1")
        .bind(id)
        .fetch_optional(&data.database)
        .await?
        .ok_or_else(|| ApiError::not_found("Repuesto", id))?;

    Ok(HttpResponse::Ok().json(repuesto))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct NuevoRepuesto {
    pub codigo: String,
    pub nombre: String,
    pub descripcion: Option<String>,
    pub categoria: String,
    pub cantidad: Option<i32>,
    pub minimo: Option<i32>,
    pub precio: Option<Decimal>,
}

#[utoipa::path(
    context_path = "/api/repuestos",
    request_body = NuevoRepuesto,
    responses(
        (status = 201, description = "The spare part was created and the creation audit-logged", body = Repuesto),
        (status = 400, description = "Invalid fields or duplicate code"),
        (status = 403, description = "Only administrators may create spare parts"),
        (status = 500, description = "An internal server error occurred")
    )
)]
#[post("")]
pub async fn crear_repuesto(
    data: Data<AppState>,
    identity: Identity,
    req: HttpRequest,
    Json(nuevo): Json<NuevoRepuesto>,
) -> Result<HttpResponse, ApiError> {
    requerir_administrador(&identity)?;
    validar_codigo(&nuevo.codigo)?;
    validar_nombre(&nuevo.nombre)?;
    validar_categoria(&nuevo.categoria)?;

    let cantidad = nuevo.cantidad.unwrap_or(0);
    let minimo = nuevo.minimo.unwrap_or(5);
    let precio = nuevo.precio.unwrap_or(Decimal::ZERO);
    validar_cantidades(cantidad, minimo, precio)?;

    let mut tx = data.database.begin().await?;

    let existente = sqlx::query_scalar::<_, i32>("SELECT id FROM repuestos WHERE codigo = $1")
        .bind(&nuevo.codigo)
        .fetch_optional(&mut tx)
        .await?;
    if existente.is_some() {
        return Err(ApiError::Validation(
            "Ya existe un repuesto con este código".into(),
        ));
    }

    let repuesto = sqlx::query_as::<_, Repuesto>(
        r#"
        INSERT INTO repuestos (codigo, nombre, descripcion, categoria, cantidad, minimo, precio, estado)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING *
        "#,
    )
    .bind(&nuevo.codigo)
    .bind(&nuevo.nombre)
    .bind(&nuevo.descripcion)
    .bind(&nuevo.categoria)
    .bind(cantidad)
    .bind(minimo)
    .bind(precio)
    .bind(EstadoRepuesto::derivar(cantidad, minimo))
    .fetch_one(&mut tx)
    .await?;

    let (ip, user_agent) = contexto_cliente(&req);
    registrar_cambio(
        &mut tx,
        NuevoCambio {
            entidad: Entidad::Repuesto,
            entidad_id: repuesto.id,
            accion: Accion::Crear,
            detalles: format!("Se creó el repuesto {} ({})", repuesto.nombre, repuesto.codigo),
            cambios: Some(&instantanea(&repuesto)),
            usuario_id: identity.usuario_id,
            ip,
            user_agent,
        },
    )
    .await;

    tx.commit().await?;

    Ok(HttpResponse::Created().json(repuesto))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ActualizacionRepuesto {
    pub codigo: Option<String>,
    pub nombre: Option<String>,
    pub descripcion: Option<String>,
    pub categoria: Option<String>,
    pub cantidad: Option<i32>,
    pub minimo: Option<i32>,
    pub precio: Option<Decimal>,
}

#[utoipa::path(
    context_path = "/api/repuestos",
    request_body = ActualizacionRepuesto,
    responses(
        (status = 200, description = "The updated spare part; a non-empty field diff is audit-logged", body = Repuesto),
        (status = 400, description = "Invalid fields or duplicate code"),
        (status = 403, description = "Only administrators may update spare parts"),
        (status = 404, description = "The requested spare part was not found"),
        (status = 500, description = "An internal server error occurred")
    )
)]
#[put("/{id}")]
pub async fn actualizar_repuesto(
    data: Data<AppState>,
    identity: Identity,
    req: HttpRequest,
    path: Path<i32>,
    Json(actualizacion): Json<ActualizacionRepuesto>,
) -> Result<HttpResponse, ApiError> {
    requerir_administrador(&identity)?;
    let id = path.into_inner();

    let mut tx = data.database.begin().await?;

    let anterior = sqlx::query_as::<_, Repuesto>("SELECT * FROM repuestos WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut tx)
        .await?
        .ok_or_else(|| ApiError::not_found("Repuesto", id))?;

    let codigo = actualizacion.codigo.unwrap_or_else(|| anterior.codigo.clone());
    let nombre = actualizacion.nombre.unwrap_or_else(|| anterior.nombre.clone());
    let descripcion = actualizacion.descripcion.or_else(|| anterior.descripcion.clone());
    let categoria = actualizacion
        .categoria
        .unwrap_or_else(|| anterior.categoria.clone());
    let cantidad = actualizacion.cantidad.unwrap_or(anterior.cantidad);
    let minimo = actualizacion.minimo.unwrap_or(anterior.minimo);
    let precio = actualizacion.precio.unwrap_or(anterior.precio);

    validar_codigo(&codigo)?;
    validar_nombre(&nombre)?;
    validar_categoria(&categoria)?;
    validar_cantidades(cantidad, minimo, precio)?;

    if codigo != anterior.codigo {
        let duplicado = sqlx::query_scalar::<_, i32>(
            "SELECT id FROM repuestos WHERE codigo = $1 AND id <> $2",
        )
        .bind(&codigo)
        .bind(id)
        .fetch_optional(&mut tx)
        .await?;
        if duplicado.is_some() {
            return Err(ApiError::Validation(
                "Ya existe otro repuesto con este código".into(),
            ));
        }
    }

    let actualizado = sqlx::query_as::<_, Repuesto>(
        r#"
        UPDATE repuestos SET
            codigo = $1, nombre = $2, descripcion = $3, categoria = $4,
            cantidad = $5, minimo = $6, precio = $7, estado = $8,
            updated_at = now()
        WHERE id = $9
        RETURNING *
        "#,
    )
    .bind(&codigo)
    .bind(&nombre)
    .bind(&descripcion)
    .bind(&categoria)
    .bind(cantidad)
    .bind(minimo)
    .bind(precio)
    .bind(EstadoRepuesto::derivar(cantidad, minimo))
    .bind(id)
    .fetch_one(&mut tx)
    .await?;

    let cambios = diferencias(&instantanea(&anterior), &instantanea(&actualizado));
    if !cambios.is_empty() {
        let (ip, user_agent) = contexto_cliente(&req);
        registrar_cambio(
            &mut tx,
            NuevoCambio {
                entidad: Entidad::Repuesto,
                entidad_id: actualizado.id,
                accion: Accion::Actualizar,
                detalles: format!(
                    "Se actualizó el repuesto {} ({})",
                    actualizado.nombre, actualizado.codigo
                ),
                cambios: Some(&serde_json::Value::Object(cambios)),
                usuario_id: identity.usuario_id,
                ip,
                user_agent,
            },
        )
        .await;
    }

    tx.commit().await?;

    Ok(HttpResponse::Ok().json(actualizado))
}

#[utoipa::path(
    context_path = "/api/repuestos",
    responses(
        (status = 200, description = "The spare part was deleted and the deletion audit-logged"),
        (status = 403, description = "Only administrators may delete spare parts"),
        (status = 404, description = "The requested spare part was not found"),
        (status = 500, description = "An internal server error occurred")
    )
)]
#[delete("/{id}")]
pub async fn eliminar_repuesto(
    data: Data<AppState>,
    identity: Identity,
    req: HttpRequest,
    path: Path<i32>,
) -> Result<HttpResponse, ApiError> {
    requerir_administrador(&identity)?;
    let id = path.into_inner();

    let mut tx = data.database.begin().await?;

    let repuesto = sqlx::query_as::<_, Repuesto>("SELECT * FROM repuestos WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut tx)
        .await?
        .ok_or_else(|| ApiError::not_found("Repuesto", id))?;

    sqlx::query("DELETE FROM repuestos WHERE id = $1")
        .bind(id)
        .execute(&mut tx)
        .await?;

    // The audit line keeps the last snapshot; audit history outlives the
    // entity itself.
    let (ip, user_agent) = contexto_cliente(&req);
    registrar_cambio(
        &mut tx,
        NuevoCambio {
            entidad: Entidad::Repuesto,
            entidad_id: repuesto.id,
            accion: Accion::Eliminar,
            detalles: format!(
                "Se eliminó el repuesto {} ({})",
                repuesto.nombre, repuesto.codigo
            ),
            cambios: Some(&instantanea(&repuesto)),
            usuario_id: identity.usuario_id,
            ip,
            user_agent,
        },
    )
    .await;

    tx.commit().await?;

    Ok(HttpResponse::Ok().json(json!({
        "mensaje": "Repuesto eliminado correctamente",
        "repuestoId": id
    })))
}

#[derive(Debug, Serialize, FromRow, ToSchema)]
pub struct InventarioPorCategoria {
    pub categoria: String,
    pub total: i64,
    #[serde(rename = "cantidadTotal")]
    pub cantidad_total: i64,
    #[serde(rename = "bajoStock")]
    pub bajo_stock: i64,
}

#[derive(Debug, Serialize, FromRow, ToSchema)]
pub struct InventarioPorEstado {
    pub estado: EstadoRepuesto,
    pub total: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct EstadisticasInventario {
    #[serde(rename = "repuestosPorCategoria")]
    pub repuestos_por_categoria: Vec<InventarioPorCategoria>,
    #[serde(rename = "repuestosPorEstado")]
    pub repuestos_por_estado: Vec<InventarioPorEstado>,
    #[serde(rename = "repuestosBajoStock")]
    pub repuestos_bajo_stock: Vec<Repuesto>,
}

#[utoipa::path(
    context_path = "/api/repuestos",
    responses(
        (status = 200, description = "Inventory breakdowns and the ten lowest-stock parts", body = EstadisticasInventario),
        (status = 401, description = "Missing or invalid credentials"),
        (status = 500, description = "An internal server error occurred")
    )
)]
#[get("/estadisticas/inventario")]
pub async fn estadisticas_inventario(
    data: Data<AppState>,
    _identity: Identity,
) -> Result<HttpResponse, ApiError> {
    let repuestos_por_categoria = sqlx::query_as::<_, InventarioPorCategoria>(
        r#"
        SELECT
            categoria,
            COUNT(*) AS total,
            COALESCE(SUM(cantidad), 0) AS cantidad_total,
            COUNT(*) FILTER (WHERE cantidad <= minimo) AS bajo_stock
        FROM repuestos
        GROUP BY categoria
        ORDER BY total DESC
        "#,
    )
    .fetch_all(&data.database)
    .await?;

    let repuestos_por_estado = sqlx::query_as::<_, InventarioPorEstado>(
        "SELECT estado, COUNT(*) AS total FROM repuestos GROUP BY estado",
    )
    .fetch_all(&data.database)
    .await?;

    let repuestos_bajo_stock = sqlx::query_as::<_, Repuesto>(
        "SELECT * FROM repuestos WHERE cantidad <= minimo ORDER BY cantidad ASC LIMIT 10",
    )
    .fetch_all(&data.database)
    .await?;

    Ok(HttpResponse::Ok().json(EstadisticasInventario {
        repuestos_por_categoria,
        repuestos_por_estado,
        repuestos_bajo_stock,
    }))
}

pub fn configurar(cfg: &mut actix_web::web::ServiceConfig) {
    cfg.service(estadisticas_inventario)
        .service(obtener_repuestos)
        .service(crear_repuesto)
        .service(obtener_repuesto)
        .service(actualizar_repuesto)
        .service(eliminar_repuesto);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_length_is_bounded() {
        assert!(validar_codigo("SSD-480").is_ok());
        assert!(validar_codigo("").is_err());
        assert!(validar_codigo(&"X".repeat(21)).is_err());
    }

    #[test]
    fn name_length_is_bounded() {
        assert!(validar_nombre("SSD Kingston 480GB").is_ok());
        assert!(validar_nombre("A").is_err());
    }

    #[test]
    fn category_must_be_known() {
        assert!(validar_categoria("Almacenamiento").is_ok());
        assert!(validar_categoria("Software").is_err());
    }

    #[test]
    fn quantities_and_price_are_validated() {
        assert!(validar_cantidades(0, 5, Decimal::ZERO).is_ok());
        assert!(validar_cantidades(-1, 5, Decimal::ZERO).is_err());
        assert!(validar_cantidades(0, 0, Decimal::ZERO).is_err());
        assert!(validar_cantidades(0, 5, Decimal::NEGATIVE_ONE).is_err());
    }
}
