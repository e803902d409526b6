//! Serialización a CSV: el fichero de spots que se envía a Sioma y el
//! informe de errores descargable.

use anyhow::{Context, Result};

use crate::models::{ExternalRecord, ValidationError};

/// Cabecera exacta que espera Sioma en el fichero de envío.
pub const SUBMISSION_HEADER: [&str; 8] = [
    "nombre_spot",
    "lat",
    "lng",
    "lote_id",
    "linea",
    "posicion",
    "nombre_planta",
    "finca_id",
];

/// Genera el CSV de envío. La cabecera sale del orden de campos de
/// `ExternalRecord`; con cero registros se escribe sólo la cabecera.
pub fn submission_csv(records: &[ExternalRecord]) -> Result<String> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());

    writer.write_record(SUBMISSION_HEADER)?;
    for record in records {
        writer.serialize(record)?;
    }

    into_string(writer)
}

/// Informe `Fila,Tipo,Mensaje` con una línea por cada fila afectada de cada
/// error, ordenado por fila y después por tipo. Los errores sin filas
/// (p. ej. de configuración) salen con la fila vacía.
pub fn error_report_csv(errors: &[ValidationError]) -> Result<String> {
    let mut lines: Vec<(Option<usize>, &ValidationError)> = errors
        .iter()
        .flat_map(|error| {
            let rows: Vec<Option<usize>> = if error.affected_rows.is_empty() {
                vec![None]
            } else {
                error.affected_rows.iter().copied().map(Some).collect()
            };
            rows.into_iter().map(move |row| (row, error))
        })
        .collect();

    lines.sort_by_key(|(row, error)| (*row, error.kind));

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["Fila", "Tipo", "Mensaje"])?;
    for (row, error) in lines {
        let row = row.map(|r| r.to_string()).unwrap_or_default();
        writer.write_record([row.as_str(), error.kind.as_str(), error.message.as_str()])?;
    }

    into_string(writer)
}

fn into_string(writer: csv::Writer<Vec<u8>>) -> Result<String> {
    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("No se pudo volcar el CSV: {}", e.error()))?;
    String::from_utf8(bytes).context("El CSV generado no es UTF-8 válido")
}
