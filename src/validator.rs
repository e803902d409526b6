//! Validación de los registros normalizados contra los lotes de referencia
//! de una finca y transformación al esquema de envío de Sioma.
//!
//! Flujo:
//!   1. Se filtran los lotes de referencia a la finca pedida. Si no queda
//!      ninguno es un error de configuración y no se revisa ninguna fila.
//!   2. Se ejecutan las cuatro comprobaciones sobre todos los registros; cada
//!      una produce como mucho un error con todas las filas afectadas.
//!   3. Sólo si no hay errores se construyen los registros de envío.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{error, info, warn};

use crate::models::{
    ExternalRecord, NormalizedRecord, PlotReference, ValidationError, ValidationKind,
    ValidationOutcome,
};

/// Valida los registros y, si todo es correcto, los transforma.
pub fn validate_and_transform(
    records: &[NormalizedRecord],
    farm_id: i64,
    all_plot_references: &[PlotReference],
) -> ValidationOutcome {
    let scoped: Vec<&PlotReference> = all_plot_references
        .iter()
        .filter(|plot| plot.finca_id == farm_id)
        .collect();

    if scoped.is_empty() {
        warn!("La finca {farm_id} no tiene lotes asociados en Sioma.");
        return ValidationOutcome::Error {
            errors: vec![ValidationError {
                kind: ValidationKind::ConfigError,
                message: format!("La finca {farm_id} no tiene lotes asociados."),
                affected_rows: Vec::new(),
            }],
        };
    }

    let plot_ids: HashMap<&str, i64> = scoped
        .iter()
        .map(|plot| (plot.nombre.trim(), plot.id))
        .collect();

    let errors: Vec<ValidationError> = [
        check_invalid_plots(records, &plot_ids),
        check_duplicate_coordinates(records),
        check_duplicate_spots(records),
        check_null_coordinates(records),
    ]
    .into_iter()
    .flatten()
    .collect();

    if !errors.is_empty() {
        info!(
            "Validación de {} registros para la finca {farm_id}: {} tipos de error.",
            records.len(),
            errors.len()
        );
        return ValidationOutcome::Error { errors };
    }

    let datos_envio = match records
        .iter()
        .map(|record| transform(record, farm_id, &plot_ids))
        .collect::<Result<Vec<_>, _>>()
    {
        Ok(datos_envio) => datos_envio,
        Err(err) => {
            error!(
                "Registro sin resolver tras una validación correcta (filas {:?}): {}",
                err.affected_rows, err.message
            );
            return ValidationOutcome::Error { errors: vec![err] };
        }
    };

    info!(
        "Validación de {} registros para la finca {farm_id} correcta.",
        records.len()
    );

    ValidationOutcome::Success {
        datos_mapa: records.to_vec(),
        datos_envio,
    }
}

/// Nombre compuesto del spot: `L{lote_id}L{linea}P{posicion}`.
pub fn plant_name(lote_id: i64, linea: Option<f64>, posicion: Option<f64>) -> String {
    format!(
        "L{}L{}P{}",
        lote_id,
        format_component(linea),
        format_component(posicion)
    )
}

fn format_component(value: Option<f64>) -> String {
    // `Display` de f64 ya omite la parte decimal de los enteros (3.0 -> "3").
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Construye el registro de envío. Tras las comprobaciones lote y
/// coordenadas siempre están resueltos; si no, el registro no se descarta
/// en silencio sino que se devuelve como error de esa fila.
fn transform(
    record: &NormalizedRecord,
    farm_id: i64,
    plot_ids: &HashMap<&str, i64>,
) -> Result<ExternalRecord, ValidationError> {
    let lote_id = *plot_ids
        .get(record.lote_nombre.as_str())
        .ok_or_else(|| ValidationError {
            kind: ValidationKind::LoteInvalido,
            message: format!(
                "El lote '{}' no existe en la finca seleccionada.",
                record.lote_nombre
            ),
            affected_rows: vec![record.fila_original],
        })?;

    let (Some(lat), Some(lng)) = (record.lat, record.lon) else {
        return Err(ValidationError {
            kind: ValidationKind::CoordenadaNula,
            message: "Registro sin latitud o longitud válida.".to_string(),
            affected_rows: vec![record.fila_original],
        });
    };

    let nombre = plant_name(lote_id, record.linea, record.posicion);

    Ok(ExternalRecord {
        nombre_spot: nombre.clone(),
        lat,
        lng,
        lote_id,
        linea: record.linea,
        posicion: record.posicion,
        nombre_planta: nombre,
        finca_id: farm_id,
    })
}

fn check_invalid_plots(
    records: &[NormalizedRecord],
    plot_ids: &HashMap<&str, i64>,
) -> Option<ValidationError> {
    let mut names: Vec<&str> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut rows = BTreeSet::new();

    for record in records {
        let name = record.lote_nombre.as_str();
        if plot_ids.contains_key(name) {
            continue;
        }
        rows.insert(record.fila_original);
        if seen.insert(name) {
            names.push(name);
        }
    }

    if rows.is_empty() {
        return None;
    }

    let listed: Vec<String> = names.iter().map(|n| format!("'{n}'")).collect();
    Some(ValidationError {
        kind: ValidationKind::LoteInvalido,
        message: format!(
            "Los siguientes lotes no existen en la finca seleccionada: {}.",
            listed.join(", ")
        ),
        affected_rows: rows.into_iter().collect(),
    })
}

fn check_duplicate_coordinates(records: &[NormalizedRecord]) -> Option<ValidationError> {
    let rows = duplicated_rows(records, |record| {
        Some((float_key(record.lat?), float_key(record.lon?)))
    });

    (!rows.is_empty()).then(|| ValidationError {
        kind: ValidationKind::CoordenadaDuplicada,
        message: format!(
            "Se encontraron {} registros con coordenadas (latitud, longitud) repetidas.",
            rows.len()
        ),
        affected_rows: rows,
    })
}

fn check_duplicate_spots(records: &[NormalizedRecord]) -> Option<ValidationError> {
    let rows = duplicated_rows(records, |record| {
        Some((
            record.lote_nombre.as_str(),
            float_key(record.linea?),
            float_key(record.posicion?),
        ))
    });

    (!rows.is_empty()).then(|| ValidationError {
        kind: ValidationKind::SpotDuplicado,
        message: format!(
            "Se encontraron {} registros con la misma combinación de lote, línea y posición.",
            rows.len()
        ),
        affected_rows: rows,
    })
}

fn check_null_coordinates(records: &[NormalizedRecord]) -> Option<ValidationError> {
    let rows: BTreeSet<usize> = records
        .iter()
        .filter(|record| record.lat.is_none() || record.lon.is_none())
        .map(|record| record.fila_original)
        .collect();

    (!rows.is_empty()).then(|| ValidationError {
        kind: ValidationKind::CoordenadaNula,
        message: format!(
            "Se encontraron {} registros sin latitud o longitud válida.",
            rows.len()
        ),
        affected_rows: rows.into_iter().collect(),
    })
}

/// Filas de todos los miembros de los grupos con dos o más registros.
/// Los registros para los que `key` devuelve `None` no forman grupo.
fn duplicated_rows<'a, K, F>(records: &'a [NormalizedRecord], key: F) -> Vec<usize>
where
    K: std::hash::Hash + Eq,
    F: Fn(&'a NormalizedRecord) -> Option<K>,
{
    let mut groups: HashMap<K, Vec<usize>> = HashMap::new();
    for record in records {
        if let Some(k) = key(record) {
            groups.entry(k).or_default().push(record.fila_original);
        }
    }

    groups
        .into_values()
        .filter(|rows| rows.len() > 1)
        .flatten()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Clave hashable para un f64 finito; -0.0 y 0.0 son la misma clave.
fn float_key(value: f64) -> u64 {
    if value == 0.0 {
        0.0_f64.to_bits()
    } else {
        value.to_bits()
    }
}
