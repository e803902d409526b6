// Módulos de la aplicación
mod api;
mod app_state;
mod config;
mod csv_export;
mod error;
mod ingest;
mod models;
mod sioma_client;
mod validator;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::HeaderValue;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::{app_state::AppState, sioma_client::SiomaClient};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 2. Cargar configuración
    let cfg = config::AppConfig::from_env().context("Error al cargar la configuración")?;

    // 3. Cliente de Sioma (fincas, lotes y envío de spots)
    let sioma = Arc::new(
        SiomaClient::from_config(&cfg).context("Error creando el cliente de Sioma")?,
    );
    info!("Cliente de Sioma apuntando a {}", cfg.sioma_api_base_url);

    // 4. Crear estado compartido de la aplicación
    let app_state = AppState {
        config: cfg.clone(),
        reference: sioma.clone(),
        submission: sioma,
    };

    // 5. Configurar el router de la API
    let app = api::create_router(app_state)
        .layer(cors_layer(&cfg.cors_origins))
        .layer(TraceLayer::new_for_http());

    // 6. Iniciar el servidor
    let listener = tokio::net::TcpListener::bind(&cfg.server_addr)
        .await
        .with_context(|| format!("No se pudo abrir {}", cfg.server_addr))?;
    info!("🚀 Servidor escuchando en http://{}", cfg.server_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("No se pudo escuchar la señal de apagado: {e}");
            }
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await?;

    info!("✅ Servidor cerrado correctamente.");
    Ok(())
}

/// CORS restringido a los orígenes configurados; `*` abre a cualquiera.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);

    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Origen CORS inválido ignorado: {origin}");
                None
            }
        })
        .collect();

    layer.allow_origin(allowed)
}
