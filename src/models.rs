//! Modelos de dominio: registros normalizados del fichero de spots, datos
//! de referencia de Sioma y el esquema de envío.

use serde::{Deserialize, Serialize, Serializer};

/// Una fila del fichero del usuario tras la ingesta.
///
/// Los campos numéricos son `None` cuando la celda estaba vacía o no era
/// numérica; la validación se encarga de reportarlo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub linea: Option<f64>,
    pub posicion: Option<f64>,
    pub lote_nombre: String,
    /// Número de fila en el fichero original (la primera fila de datos es la 2).
    pub fila_original: usize,
}

/// Finca tal como la lista Sioma.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Farm {
    pub id: i64,
    pub nombre: String,
}

/// Lote de referencia. Sioma entrega los lotes de todas las fincas; el
/// validador filtra por `finca_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotReference {
    pub id: i64,
    pub nombre: String,
    pub finca_id: i64,
}

/// Registro listo para enviar a Sioma. El orden de los campos es el orden
/// de columnas del CSV de envío.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalRecord {
    pub nombre_spot: String,
    pub lat: f64,
    pub lng: f64,
    pub lote_id: i64,
    #[serde(serialize_with = "serialize_index")]
    pub linea: Option<f64>,
    #[serde(serialize_with = "serialize_index")]
    pub posicion: Option<f64>,
    pub nombre_planta: String,
    pub finca_id: i64,
}

/// Tipos de error de validación, en el orden en que se reportan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationKind {
    LoteInvalido,
    CoordenadaDuplicada,
    SpotDuplicado,
    CoordenadaNula,
    ConfigError,
}

impl ValidationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoteInvalido => "LOTE_INVALIDO",
            Self::CoordenadaDuplicada => "COORDENADA_DUPLICADA",
            Self::SpotDuplicado => "SPOT_DUPLICADO",
            Self::CoordenadaNula => "COORDENADA_NULA",
            Self::ConfigError => "CONFIG_ERROR",
        }
    }
}

/// Un error agregado: un único registro por tipo, con todas las filas
/// afectadas (ordenadas y sin repetir).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub kind: ValidationKind,
    pub message: String,
    pub affected_rows: Vec<usize>,
}

/// Resultado de `validate_and_transform`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ValidationOutcome {
    Error {
        errors: Vec<ValidationError>,
    },
    Success {
        /// Registros originales, para pintar el mapa de previsualización.
        datos_mapa: Vec<NormalizedRecord>,
        /// Registros transformados, listos para el envío.
        datos_envio: Vec<ExternalRecord>,
    },
}

/// Línea y posición enteras salen sin decimales (`3`, no `3.0`), igual que
/// en `nombre_planta`.
fn serialize_index<S: Serializer>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
    match *value {
        Some(v) if v.fract() == 0.0 && v.abs() < i64::MAX as f64 => {
            serializer.serialize_i64(v as i64)
        }
        Some(v) => serializer.serialize_f64(v),
        None => serializer.serialize_none(),
    }
}
