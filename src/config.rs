//! Carga y gestión de configuración de la aplicación (servidor + Sioma).

use std::env;

use anyhow::{anyhow, Context, Result};
use url::Url;

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub sioma_api_base_url: Url,
    pub sioma_api_token: String,
    pub sioma_submit_path: String,
    pub sioma_timeout_secs: u64,

    pub server_addr: String,
    pub cors_origins: Vec<String>,
    pub max_upload_bytes: usize,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Igual que `from_env`, pero leyendo de una función arbitraria.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let sioma_api_token = lookup("SIOMA_API_TOKEN")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| anyhow!("Falta SIOMA_API_TOKEN en el entorno"))?;

        let base_url_str = var("SIOMA_API_BASE_URL", "https://api.sioma.dev");
        let sioma_api_base_url = Url::parse(&base_url_str)
            .with_context(|| format!("SIOMA_API_BASE_URL no es una URL válida: {base_url_str}"))?;

        let sioma_submit_path = var("SIOMA_SUBMIT_PATH", "/api/v1/spots/upload");

        let sioma_timeout_secs = var("SIOMA_TIMEOUT_SECS", "30")
            .parse::<u64>()
            .context("SIOMA_TIMEOUT_SECS debe ser un entero positivo")?;

        let server_addr = var("SERVER_ADDR", "127.0.0.1:5000");

        let cors_origins = var("CORS_ORIGINS", "http://localhost:3000")
            .split(',')
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect();

        let max_upload_mb = var("MAX_UPLOAD_MB", "10")
            .parse::<usize>()
            .context("MAX_UPLOAD_MB debe ser un entero positivo")?;

        Ok(Self {
            sioma_api_base_url,
            sioma_api_token,
            sioma_submit_path,
            sioma_timeout_secs,
            server_addr,
            cors_origins,
            max_upload_bytes: max_upload_mb * 1024 * 1024,
        })
    }
}
