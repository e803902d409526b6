//! Colaboradores externos: lectura de fincas/lotes y envío de spots a Sioma.
//!
//! El pipeline sólo conoce los traits `ReferenceSource` y `SubmissionSink`;
//! `SiomaClient` es la implementación HTTP real que se inyecta en `AppState`.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{multipart, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};
use url::Url;

use crate::{
    config::AppConfig,
    csv_export,
    error::ClientError,
    models::{ExternalRecord, Farm, PlotReference},
};

/// Valor de la cabecera `tipo-sujetos` para pedir fincas.
const TIPO_FINCAS: &str = "[1]";
/// Valor de la cabecera `tipo-sujetos` para pedir lotes.
const TIPO_LOTES: &str = "[3]";
const SUJETOS_PATH: &str = "/4/usuarios/sujetos";

/// Fuente de datos de referencia (fincas y lotes de todas las fincas).
#[async_trait]
pub trait ReferenceSource: Send + Sync {
    async fn list_farms(&self) -> Result<Vec<Farm>, ClientError>;
    async fn list_plots(&self) -> Result<Vec<PlotReference>, ClientError>;
}

/// Destino de los registros ya validados.
#[async_trait]
pub trait SubmissionSink: Send + Sync {
    /// Devuelve el acuse de recibo de la plataforma.
    async fn submit(&self, records: &[ExternalRecord]) -> Result<Value, ClientError>;
}

/// Sujeto tal como lo devuelve `GET /4/usuarios/sujetos`.
#[derive(Debug, Deserialize)]
struct Sujeto {
    key_value: i64,
    nombre: String,
    #[serde(default)]
    finca_id: Option<i64>,
}

/// Cliente HTTP de Sioma.
#[derive(Debug, Clone)]
pub struct SiomaClient {
    http: reqwest::Client,
    base_url: Url,
    token: String,
    submit_path: String,
}

impl SiomaClient {
    /// Construye el cliente a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.sioma_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: cfg.sioma_api_base_url.clone(),
            token: cfg.sioma_api_token.clone(),
            submit_path: cfg.sioma_submit_path.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn fetch_sujetos(&self, tipo: &str) -> Result<Vec<Sujeto>, ClientError> {
        let url = self.endpoint(SUJETOS_PATH);
        info!("Consultando sujetos {tipo} en {url}...");

        let unavailable = |e: reqwest::Error| ClientError::ReferenceDataUnavailable(e.to_string());

        let response = self
            .http
            .get(&url)
            .header("Authorization", self.token.as_str())
            .header("tipo-sujetos", tipo)
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::ReferenceDataUnavailable(format!(
                "HTTP {status}: {body}"
            )));
        }

        response.json::<Vec<Sujeto>>().await.map_err(unavailable)
    }
}

#[async_trait]
impl ReferenceSource for SiomaClient {
    async fn list_farms(&self) -> Result<Vec<Farm>, ClientError> {
        let sujetos = self.fetch_sujetos(TIPO_FINCAS).await?;
        Ok(farms_from_sujetos(sujetos))
    }

    async fn list_plots(&self) -> Result<Vec<PlotReference>, ClientError> {
        let sujetos = self.fetch_sujetos(TIPO_LOTES).await?;
        Ok(plots_from_sujetos(sujetos))
    }
}

#[async_trait]
impl SubmissionSink for SiomaClient {
    async fn submit(&self, records: &[ExternalRecord]) -> Result<Value, ClientError> {
        let csv = csv_export::submission_csv(records)
            .map_err(|e| ClientError::SubmissionFailed(e.to_string()))?;

        let file_name = submission_file_name();
        let part = multipart::Part::text(csv)
            .file_name(file_name)
            .mime_str("text/csv")
            .map_err(|e| ClientError::SubmissionFailed(e.to_string()))?;
        let form = multipart::Form::new().part("file", part);

        let url = self.endpoint(&self.submit_path);
        info!("Enviando {} spots a {url}...", records.len());

        let response = self
            .http
            .post(&url)
            .header("Authorization", self.token.as_str())
            .multipart(form)
            .send()
            .await
            .map_err(|e| ClientError::SubmissionFailed(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ClientError::SubmissionFailed(e.to_string()))?;

        interpret_submission_response(status, &body)
    }
}

/// Nombre del fichero adjunto en el envío: `spots_AAAAMMDD_HHMMSS.csv` (UTC).
fn submission_file_name() -> String {
    format!("spots_{}.csv", Utc::now().format("%Y%m%d_%H%M%S"))
}

fn farms_from_sujetos(sujetos: Vec<Sujeto>) -> Vec<Farm> {
    sujetos
        .into_iter()
        .map(|s| Farm {
            id: s.key_value,
            nombre: s.nombre.trim().to_string(),
        })
        .collect()
}

fn plots_from_sujetos(sujetos: Vec<Sujeto>) -> Vec<PlotReference> {
    sujetos
        .into_iter()
        .filter_map(|s| match s.finca_id {
            Some(finca_id) => Some(PlotReference {
                id: s.key_value,
                nombre: s.nombre.trim().to_string(),
                finca_id,
            }),
            None => {
                warn!("Lote {} ('{}') sin finca_id; se ignora.", s.key_value, s.nombre);
                None
            }
        })
        .collect()
}

/// Un 200 no implica éxito: Sioma puede devolver el error dentro del cuerpo.
fn interpret_submission_response(status: StatusCode, body: &str) -> Result<Value, ClientError> {
    if !status.is_success() {
        return Err(ClientError::SubmissionFailed(format!("HTTP {status}: {body}")));
    }

    let value: Value = serde_json::from_str(body).map_err(|e| {
        ClientError::SubmissionFailed(format!("respuesta no válida de Sioma ({e}): {body}"))
    })?;

    match value.get("error") {
        None | Some(Value::Null) | Some(Value::Bool(false)) => {}
        Some(Value::String(msg)) => return Err(ClientError::SubmissionFailed(msg.clone())),
        Some(other) => return Err(ClientError::SubmissionFailed(other.to_string())),
    }

    if let Some(state) = value.get("status") {
        if state.as_str() != Some("success") {
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("estado '{state}'"));
            return Err(ClientError::SubmissionFailed(message));
        }
    }

    Ok(value)
}
