use std::collections::BTreeMap;

use axum::{
    extract::{DefaultBodyLimit, Json, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    app_state::AppState,
    csv_export,
    error::IngestError,
    ingest,
    models::{ExternalRecord, Farm, PlotReference, ValidationError, ValidationOutcome},
    validator,
};

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

// --- Payloads ---

#[derive(Deserialize)]
pub struct ErrorReportPayload {
    errors: Vec<ValidationError>,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    let upload_limit = app_state.config.max_upload_bytes;

    Router::new()
        .route("/api/v1/health", get(health_handler))
        .route("/api/v1/fincas", get(list_farms_handler))
        .route("/api/v1/fincas/:finca_id/lotes", get(list_plots_handler))
        .route("/api/v1/validate-file", post(validate_file_handler))
        .route("/api/v1/submit-validated-data", post(submit_handler))
        .route("/api/v1/error-report", post(error_report_handler))
        .layer(DefaultBodyLimit::max(upload_limit))
        .with_state(app_state)
}

// --- Handlers ---

#[axum::debug_handler]
async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[axum::debug_handler]
async fn list_farms_handler(State(state): State<AppState>) -> Result<Json<Vec<Farm>>, ApiError> {
    state.reference.list_farms().await.map(Json).map_err(|e| {
        error!("Error en /fincas: {e}");
        api_error(StatusCode::BAD_GATEWAY, e.to_string())
    })
}

#[axum::debug_handler]
async fn list_plots_handler(
    State(state): State<AppState>,
    Path(finca_id): Path<i64>,
) -> Result<Json<Vec<PlotReference>>, ApiError> {
    let plots = state.reference.list_plots().await.map_err(|e| {
        error!("Error en /fincas/{finca_id}/lotes: {e}");
        api_error(StatusCode::BAD_GATEWAY, e.to_string())
    })?;

    Ok(Json(
        plots
            .into_iter()
            .filter(|plot| plot.finca_id == finca_id)
            .collect(),
    ))
}

/// Recibe el fichero (`file`) y la finca (`finca_id`) como multipart, trae
/// los lotes de Sioma y ejecuta ingesta + validación + transformación.
#[axum::debug_handler]
async fn validate_file_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut upload: Option<(String, Vec<u8>)> = None;
    let mut finca_id_raw: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        api_error(StatusCode::BAD_REQUEST, format!("Petición multipart inválida: {e}"))
    })? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let bytes = field.bytes().await.map_err(|e| {
                    api_error(StatusCode::BAD_REQUEST, format!("No se pudo leer el archivo: {e}"))
                })?;
                upload = Some((file_name, bytes.to_vec()));
            }
            "finca_id" => {
                let text = field.text().await.map_err(|e| {
                    api_error(StatusCode::BAD_REQUEST, format!("finca_id inválida: {e}"))
                })?;
                finca_id_raw = Some(text);
            }
            _ => {}
        }
    }

    let (file_name, bytes) = upload
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "No se encontró el archivo"))?;
    let finca_id: i64 = finca_id_raw
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "No se especificó la finca_id"))?
        .trim()
        .parse()
        .map_err(|_| api_error(StatusCode::BAD_REQUEST, "La finca_id debe ser un número entero"))?;

    let request_id = Uuid::new_v4();
    info!(%request_id, finca_id, "Validando '{}' ({} bytes)...", file_name, bytes.len());

    let plots = state.reference.list_plots().await.map_err(|e| {
        error!(%request_id, "Lotes de Sioma no disponibles: {e}");
        api_error(StatusCode::BAD_GATEWAY, e.to_string())
    })?;

    let outcome = tokio::task::spawn_blocking(move || -> Result<ValidationOutcome, IngestError> {
        let records = ingest::normalize(&bytes, &file_name)?;
        Ok(validator::validate_and_transform(&records, finca_id, &plots))
    })
    .await
    .map_err(|e| {
        error!(%request_id, "La tarea de validación falló: {e}");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Error interno al validar el archivo")
    })?
    .map_err(|e| {
        warn!(%request_id, "Archivo rechazado: {e}");
        api_error(StatusCode::BAD_REQUEST, e.to_string())
    })?;

    match outcome {
        ValidationOutcome::Error { errors } => {
            info!(%request_id, "Validación con {} tipos de error.", errors.len());
            let resumen = summarize(&errors);
            Ok((
                StatusCode::BAD_REQUEST,
                Json(json!({ "status": "error", "errors": errors, "resumen": resumen })),
            )
                .into_response())
        }
        success @ ValidationOutcome::Success { .. } => {
            info!(%request_id, "Validación correcta.");
            Ok((StatusCode::OK, Json(success)).into_response())
        }
    }
}

#[axum::debug_handler]
async fn submit_handler(
    State(state): State<AppState>,
    Json(records): Json<Vec<ExternalRecord>>,
) -> Result<Json<Value>, ApiError> {
    if records.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "No se recibieron datos"));
    }

    match state.submission.submit(&records).await {
        Ok(response_sioma) => {
            info!("{} spots enviados a Sioma.", records.len());
            Ok(Json(json!({
                "status": "enviado",
                "message": "Datos enviados exitosamente a Sioma.",
                "response_sioma": response_sioma,
            })))
        }
        Err(e) => {
            error!("Error en /submit-validated-data: {e}");
            Err(api_error(StatusCode::BAD_GATEWAY, e.to_string()))
        }
    }
}

#[axum::debug_handler]
async fn error_report_handler(
    Json(payload): Json<ErrorReportPayload>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.errors.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "No hay errores que reportar"));
    }

    let csv = csv_export::error_report_csv(&payload.errors).map_err(|e| {
        error!("No se pudo generar el informe de errores: {e}");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"reporte_errores.csv\"",
            ),
        ],
        csv,
    ))
}

/// Número de filas afectadas por cada tipo de error.
fn summarize(errors: &[ValidationError]) -> BTreeMap<&'static str, usize> {
    errors
        .iter()
        .map(|e| (e.kind.as_str(), e.affected_rows.len()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::{
        config::AppConfig,
        error::ClientError,
        sioma_client::{ReferenceSource, SubmissionSink},
    };

    const BOUNDARY: &str = "----spotsboundary";
    const HEADER: &str = "Latitud,Longitud,Línea palma,Posición palma,Lote";

    struct FakeReference {
        fail: bool,
    }

    #[async_trait]
    impl ReferenceSource for FakeReference {
        async fn list_farms(&self) -> Result<Vec<Farm>, ClientError> {
            if self.fail {
                return Err(ClientError::ReferenceDataUnavailable("sin red".to_string()));
            }
            Ok(vec![Farm {
                id: 9,
                nombre: "La Esperanza".to_string(),
            }])
        }

        async fn list_plots(&self) -> Result<Vec<PlotReference>, ClientError> {
            if self.fail {
                return Err(ClientError::ReferenceDataUnavailable("sin red".to_string()));
            }
            Ok(vec![
                PlotReference {
                    id: 12,
                    nombre: "A".to_string(),
                    finca_id: 9,
                },
                PlotReference {
                    id: 13,
                    nombre: "B".to_string(),
                    finca_id: 9,
                },
                PlotReference {
                    id: 40,
                    nombre: "A".to_string(),
                    finca_id: 4,
                },
            ])
        }
    }

    #[derive(Default)]
    struct FakeSink {
        fail: bool,
        received: Mutex<Vec<ExternalRecord>>,
    }

    #[async_trait]
    impl SubmissionSink for FakeSink {
        async fn submit(&self, records: &[ExternalRecord]) -> Result<Value, ClientError> {
            if self.fail {
                return Err(ClientError::SubmissionFailed("HTTP 500".to_string()));
            }
            self.received.lock().unwrap().extend_from_slice(records);
            Ok(json!({ "status": "success" }))
        }
    }

    fn app_with(reference_fails: bool, sink: Arc<FakeSink>) -> Router {
        let config = AppConfig::from_lookup(|key| {
            (key == "SIOMA_API_TOKEN").then(|| "token-de-prueba".to_string())
        })
        .unwrap();

        create_router(AppState {
            config,
            reference: Arc::new(FakeReference {
                fail: reference_fails,
            }),
            submission: sink,
        })
    }

    fn app() -> Router {
        app_with(false, Arc::new(FakeSink::default()))
    }

    fn upload_request(file_name: &str, content: &str, finca_id: Option<&str>) -> Request<Body> {
        let mut body = String::new();
        if let Some(id) = finca_id {
            body.push_str(&format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"finca_id\"\r\n\r\n{id}\r\n"
            ));
        }
        body.push_str(&format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n\
             Content-Type: text/csv\r\n\r\n\
             {content}\r\n--{BOUNDARY}--\r\n"
        ));

        Request::builder()
            .method("POST")
            .uri("/api/v1/validate-file")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn json_request(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn valid_file_returns_map_and_submission_records() {
        let content = format!("{HEADER}\n7.1,-76.6,3,7,A\n7.2,-76.7,1,1,B\n");
        let response = app()
            .oneshot(upload_request("spots.csv", &content, Some("9")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["datos_mapa"][1]["fila_original"], 3);
        assert_eq!(body["datos_envio"][0]["nombre_planta"], "L12L3P7");
        assert_eq!(body["datos_envio"][0]["nombre_spot"], "L12L3P7");
        assert_eq!(body["datos_envio"][1]["lote_id"], 13);
        assert_eq!(body["datos_envio"][1]["finca_id"], 9);
    }

    #[tokio::test]
    async fn validation_errors_return_400_with_summary() {
        let content = format!("{HEADER}\n1.0,2.0,1,1,A\n1.0,2.0,1,2,A\n");
        let response = app()
            .oneshot(upload_request("spots.csv", &content, Some("9")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["errors"].as_array().unwrap().len(), 1);
        assert_eq!(body["errors"][0]["kind"], "COORDENADA_DUPLICADA");
        assert_eq!(body["errors"][0]["affected_rows"], json!([2, 3]));
        assert_eq!(body["resumen"]["COORDENADA_DUPLICADA"], 2);
        assert!(body.get("datos_envio").is_none());
    }

    #[tokio::test]
    async fn farm_without_plots_is_a_config_error() {
        let content = format!("{HEADER}\n1.0,2.0,1,1,Z\n");
        let response = app()
            .oneshot(upload_request("spots.csv", &content, Some("77")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["errors"][0]["kind"], "CONFIG_ERROR");
        assert_eq!(body["errors"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_finca_id_is_rejected() {
        let content = format!("{HEADER}\n1.0,2.0,1,1,A\n");
        let response = app()
            .oneshot(upload_request("spots.csv", &content, None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "No se especificó la finca_id");
    }

    #[tokio::test]
    async fn non_numeric_finca_id_is_rejected() {
        let content = format!("{HEADER}\n1.0,2.0,1,1,A\n");
        let response = app()
            .oneshot(upload_request("spots.csv", &content, Some("nueve")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unsupported_format_is_rejected() {
        let response = app()
            .oneshot(upload_request("spots.txt", "hola", Some("9")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("spots.txt"));
    }

    #[tokio::test]
    async fn missing_columns_are_reported_together() {
        let response = app()
            .oneshot(upload_request("spots.csv", "Latitud,Longitud\n1,2\n", Some("9")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        let message = body["error"].as_str().unwrap();
        assert!(message.contains("Línea palma"));
        assert!(message.contains("Lote"));
    }

    #[tokio::test]
    async fn unavailable_reference_data_is_a_bad_gateway() {
        let content = format!("{HEADER}\n1.0,2.0,1,1,A\n");
        let response = app_with(true, Arc::new(FakeSink::default()))
            .oneshot(upload_request("spots.csv", &content, Some("9")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn lists_farms_and_plots_of_one_farm() {
        let response = app()
            .oneshot(Request::get("/api/v1/fincas").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await[0]["nombre"], "La Esperanza");

        let response = app()
            .oneshot(Request::get("/api/v1/fincas/9/lotes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        let ids: Vec<i64> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![12, 13]);
    }

    #[tokio::test]
    async fn submit_forwards_records_to_the_sink() {
        let sink = Arc::new(FakeSink::default());
        let payload = json!([{
            "nombre_spot": "L12L3P7", "lat": 7.1, "lng": -76.6, "lote_id": 12,
            "linea": 3.0, "posicion": 7.0, "nombre_planta": "L12L3P7", "finca_id": 9
        }]);

        let response = app_with(false, sink.clone())
            .oneshot(json_request("/api/v1/submit-validated-data", payload))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "enviado");
        assert_eq!(body["response_sioma"]["status"], "success");

        let received = sink.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].nombre_planta, "L12L3P7");
    }

    #[tokio::test]
    async fn empty_submission_is_rejected() {
        let response = app()
            .oneshot(json_request("/api/v1/submit-validated-data", json!([])))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn failed_submission_is_a_bad_gateway() {
        let sink = Arc::new(FakeSink {
            fail: true,
            ..FakeSink::default()
        });
        let payload = json!([{
            "nombre_spot": "L12L3P7", "lat": 7.1, "lng": -76.6, "lote_id": 12,
            "linea": 3.0, "posicion": 7.0, "nombre_planta": "L12L3P7", "finca_id": 9
        }]);

        let response = app_with(false, sink)
            .oneshot(json_request("/api/v1/submit-validated-data", payload))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(body_json(response).await["error"]
            .as_str()
            .unwrap()
            .contains("HTTP 500"));
    }

    #[tokio::test]
    async fn error_report_is_served_as_csv() {
        let payload = json!({ "errors": [{
            "kind": "COORDENADA_NULA",
            "message": "sin coordenadas",
            "affected_rows": [4]
        }]});

        let response = app()
            .oneshot(json_request("/api/v1/error-report", payload))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/csv; charset=utf-8"
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let csv = String::from_utf8(bytes.to_vec()).unwrap();
        assert_eq!(csv, "Fila,Tipo,Mensaje\n4,COORDENADA_NULA,sin coordenadas\n");
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let response = app()
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await["status"], "ok");
    }
}
