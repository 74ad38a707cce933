use std::{env, io};

use actix_web::{
    web::{self, Data},
    App, HttpServer,
};
use log::{error, info, LevelFilter};
use sqlx::PgPool;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::models::AppState;

mod error;
mod historial;
mod identity;
mod models;
mod reporte;
mod repuesto;

#[derive(OpenApi)]
#[openapi(
    paths(
        reporte::obtener_reportes,
        reporte::obtener_reporte,
        reporte::crear_reporte,
        reporte::actualizar_reporte,
        reporte::eliminar_reporte,
        reporte::agregar_comentario,
        reporte::asignar_tecnico,
        reporte::estadisticas_reportes,
        historial::obtener_historial,
        historial::obtener_estadisticas,
        historial::obtener_historial_entidad,
        repuesto::obtener_repuestos,
        repuesto::obtener_repuesto,
        repuesto::crear_repuesto,
        repuesto::actualizar_repuesto,
        repuesto::eliminar_repuesto,
        repuesto::estadisticas_inventario,
    ),
    components(schemas(
        models::Prioridad,
        models::EstadoReporte,
        models::Entidad,
        models::Accion,
        models::EstadoRepuesto,
        models::Reporte,
        models::EstadoReporteEntrada,
        models::Repuesto,
        models::UsuarioResumen,
        reporte::ReporteConUsuarios,
        reporte::EstadoConUsuario,
        reporte::ReporteDetalle,
        reporte::NuevoReporte,
        reporte::ActualizacionReporte,
        reporte::NuevoComentario,
        reporte::AsignacionTecnico,
        reporte::ConteoPorEstado,
        reporte::ConteoPorPrioridad,
        reporte::EstadisticasReportes,
        historial::HistorialCambio,
        historial::PaginaHistorial,
        historial::ConteoPorEntidad,
        historial::ConteoPorAccion,
        historial::ActividadDeUsuario,
        historial::ActividadDiaria,
        historial::EstadisticasActividad,
        repuesto::PaginaRepuestos,
        repuesto::NuevoRepuesto,
        repuesto::ActualizacionRepuesto,
        repuesto::InventarioPorCategoria,
        repuesto::InventarioPorEstado,
        repuesto::EstadisticasInventario,
    ))
)]
struct ApiDoc;

fn initialize_syslog() {
    let log_level: LevelFilter = match env::var("LOG_LEVEL") {
        Err(_) => log::LevelFilter::Warn,
        Ok(value) => match value.to_uppercase().as_str() {
            "ERROR" => log::LevelFilter::Error,
            "WARNING" => log::LevelFilter::Warn,
            "INFO" => log::LevelFilter::Info,
            "DEBUG" => log::LevelFilter::Debug,
            "TRACE" => log::LevelFilter::Trace,
            "OFF" => log::LevelFilter::Off,
            _ => log::LevelFilter::Warn,
        },
    };
    let log_result = syslog::init(syslog::Facility::LOG_SYSLOG, log_level, None);
    if log_result.is_err() {
        eprintln!("WARNING! Failed to initialize logging system! Server logs will be unavaliable!");
    }
}

fn parse_database_url() -> String {
    match env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(err) => {
            let message = format!("ERROR: Unable to parse DATABASE_URL enviroment variable: {err}");
            error!("{message}");
            eprintln!("{message}");
            panic!("{err}");
        }
    }
}

fn parse_bind_address() -> String {
    env::var("BIND_ADDRESS").unwrap_or_else(|_| String::from("127.0.0.1:8080"))
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    initialize_syslog();

    let database_url = parse_database_url();

    let pool = match PgPool::connect_lazy(database_url.as_str()) {
        Ok(pool) => {
            info!("Connected to the database");
            pool
        }
        Err(err) => {
            let message = format!("ERROR: Failed to connect to the database: {err}");
            error!("{message}");
            eprintln!("{message}");
            panic!("{err}");
        }
    };

    if let Err(err) = sqlx::migrate!().run(&pool).await {
        let message = format!("ERROR: Failed to run database migrations: {err}");
        error!("{message}");
        eprintln!("{message}");
        panic!("{err}");
    }

    let openapi = ApiDoc::openapi();

    HttpServer::new(move || {
        App::new()
            .app_data(Data::new(AppState {
                database: pool.clone(),
            }))
            .service(web::scope("/api/reportes").configure(reporte::configurar))
            .service(web::scope("/api/historial-cambios").configure(historial::configurar))
            .service(web::scope("/api/repuestos").configure(repuesto::configurar))
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}").url("/api-docs/openapi.json", openapi.clone()),
            )
    })
    .bind(parse_bind_address())?
    .run()
    .await
}
