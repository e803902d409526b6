//! Ingesta del fichero de spots subido por el usuario (CSV o Excel) y
//! normalización al esquema interno `NormalizedRecord`.
//!
//! Los dos formatos se leen primero a una `Table` común de celdas; la
//! normalización (columnas requeridas, renombrado, coerción y número de
//! fila) es la misma para ambos.

use std::{collections::HashMap, ffi::OsStr, io::Cursor, path::Path};

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use tracing::{debug, info};

use crate::{error::IngestError, models::NormalizedRecord};

pub const COL_LATITUD: &str = "Latitud";
pub const COL_LONGITUD: &str = "Longitud";
pub const COL_LINEA: &str = "Línea palma";
pub const COL_POSICION: &str = "Posición palma";
pub const COL_LOTE: &str = "Lote";

/// Columnas obligatorias, en el orden en que se reportan si faltan.
pub const REQUIRED_COLUMNS: [&str; 5] = [
    COL_LATITUD,
    COL_LONGITUD,
    COL_LINEA,
    COL_POSICION,
    COL_LOTE,
];

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Celda tal como sale del parser, antes de la coerción.
#[derive(Debug, Clone, PartialEq)]
enum Cell {
    Text(String),
    Number(f64),
    Empty,
}

impl Cell {
    fn from_text(raw: &str) -> Self {
        if raw.trim().is_empty() {
            Cell::Empty
        } else {
            Cell::Text(raw.to_string())
        }
    }

    fn is_empty(&self) -> bool {
        matches!(self, Cell::Empty)
    }

    fn to_number(&self) -> Option<f64> {
        let value = match self {
            Cell::Number(v) => *v,
            Cell::Text(s) => s.trim().parse::<f64>().ok()?,
            Cell::Empty => return None,
        };
        value.is_finite().then_some(value)
    }

    fn to_trimmed_text(&self) -> String {
        match self {
            Cell::Text(s) => s.trim().to_string(),
            Cell::Number(v) => v.to_string(),
            Cell::Empty => String::new(),
        }
    }
}

/// Fila de datos con su número de fila (la cabecera es la 1).
#[derive(Debug)]
struct Row {
    fila: usize,
    cells: Vec<Cell>,
}

/// Tabla ya parseada: cabecera y filas de datos. Las filas en blanco se
/// descartan, pero las demás conservan su posición física.
#[derive(Debug, Default)]
struct Table {
    headers: Vec<String>,
    rows: Vec<Row>,
}

/// Parsea el fichero completo y devuelve los registros normalizados.
///
/// El formato se elige por la extensión de `file_name`. Un fichero mal
/// formado aborta con error; una celda inválida sólo se convierte en `None`.
pub fn normalize(
    file_bytes: &[u8],
    file_name: &str,
) -> Result<Vec<NormalizedRecord>, IngestError> {
    let extension = Path::new(file_name)
        .extension()
        .and_then(OsStr::to_str)
        .unwrap_or("")
        .to_lowercase();

    let table = match extension.as_str() {
        "csv" => read_csv(file_bytes)?,
        "xls" | "xlsx" => read_spreadsheet(file_bytes)?,
        _ => return Err(IngestError::UnsupportedFormat(file_name.to_string())),
    };

    debug!(
        "Fichero '{}' parseado: {} columnas, {} filas",
        file_name,
        table.headers.len(),
        table.rows.len()
    );

    let records = normalize_table(table)?;
    info!("Fichero '{}' normalizado con {} registros.", file_name, records.len());
    Ok(records)
}

fn read_csv(bytes: &[u8]) -> Result<Table, IngestError> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);
    let mut records = reader.records();

    let header_record = records
        .next()
        .ok_or_else(|| IngestError::Parse("el archivo está vacío".to_string()))?
        .map_err(|e| IngestError::Parse(e.to_string()))?;

    let headers: Vec<String> = header_record
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    if headers.iter().all(|h| h.is_empty()) {
        return Err(IngestError::Parse("el archivo está vacío".to_string()));
    }

    // Un registro con todas las celdas vacías (`,,,,`) ocupa su fila aunque
    // se descarte; las líneas totalmente vacías no son registros.
    let mut rows = Vec::new();
    for (offset, result) in records.enumerate() {
        let record = result.map_err(|e| IngestError::Parse(e.to_string()))?;
        let cells: Vec<Cell> = record.iter().map(Cell::from_text).collect();
        if cells.iter().all(Cell::is_empty) {
            continue;
        }
        rows.push(Row {
            fila: offset + 2,
            cells,
        });
    }

    Ok(Table { headers, rows })
}

fn read_spreadsheet(bytes: &[u8]) -> Result<Table, IngestError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))
        .map_err(|e| IngestError::Parse(e.to_string()))?;

    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| IngestError::Parse("el libro no contiene hojas".to_string()))?
        .map_err(|e| IngestError::Parse(e.to_string()))?;

    let mut sheet_rows = range.rows();
    let headers: Vec<String> = sheet_rows
        .next()
        .ok_or_else(|| IngestError::Parse("la hoja está vacía".to_string()))?
        .iter()
        .map(|cell| cell.to_string().trim().to_string())
        .collect();

    // El rango empieza en la cabecera; las filas vacías intermedias siguen
    // dentro del rango y cuentan para la numeración.
    let rows = sheet_rows
        .enumerate()
        .map(|(offset, row)| Row {
            fila: offset + 2,
            cells: row.iter().map(cell_from_data).collect(),
        })
        .filter(|row| !row.cells.iter().all(Cell::is_empty))
        .collect();

    Ok(Table { headers, rows })
}

fn cell_from_data(data: &Data) -> Cell {
    match data {
        Data::Empty => Cell::Empty,
        Data::Int(v) => Cell::Number(*v as f64),
        Data::Float(v) => Cell::Number(*v),
        Data::String(s) => Cell::from_text(s),
        other => Cell::from_text(&other.to_string()),
    }
}

fn normalize_table(table: Table) -> Result<Vec<NormalizedRecord>, IngestError> {
    // Con cabeceras repetidas gana la primera aparición.
    let mut positions: HashMap<&str, usize> = HashMap::new();
    for (idx, header) in table.headers.iter().enumerate() {
        positions.entry(header.as_str()).or_insert(idx);
    }

    let missing: Vec<String> = REQUIRED_COLUMNS
        .iter()
        .filter(|col| !positions.contains_key(*col))
        .map(|col| col.to_string())
        .collect();

    let found: Vec<usize> = REQUIRED_COLUMNS
        .iter()
        .filter_map(|col| positions.get(col).copied())
        .collect();

    let [lat, lon, linea, posicion, lote]: [usize; 5] = found
        .try_into()
        .map_err(|_| IngestError::MissingColumns(missing))?;

    let empty = Cell::Empty;
    let records = table
        .rows
        .iter()
        .map(|row| {
            let cell = |idx: usize| row.cells.get(idx).unwrap_or(&empty);
            NormalizedRecord {
                lat: cell(lat).to_number(),
                lon: cell(lon).to_number(),
                linea: cell(linea).to_number(),
                posicion: cell(posicion).to_number(),
                lote_nombre: cell(lote).to_trimmed_text(),
                fila_original: row.fila,
            }
        })
        .collect();

    Ok(records)
}
