//! Errores tipados del dominio: fallos de ingesta del fichero y fallos de
//! los colaboradores externos (Sioma).

use thiserror::Error;

/// Fallos que abortan la ingesta completa de un fichero.
///
/// Los valores de celda inválidos NO producen este error: se degradan a
/// `None` y se reportan más tarde como errores de validación por fila.
#[derive(Debug, Error, PartialEq)]
pub enum IngestError {
    #[error("Formato de archivo no soportado: '{0}'. Use CSV o Excel (.csv, .xls, .xlsx).")]
    UnsupportedFormat(String),

    #[error("Faltan columnas requeridas: {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    #[error("Error al leer el archivo: {0}")]
    Parse(String),
}

/// Fallos de comunicación con la plataforma externa.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Datos de referencia no disponibles: {0}")]
    ReferenceDataUnavailable(String),

    #[error("Error al enviar datos a Sioma: {0}")]
    SubmissionFailed(String),
}
