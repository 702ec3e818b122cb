//! Parsing of the backend's `GET /api/reportes/consolidado` body.
//!
//! The backend is loose about JSON types: ids and scores arrive as numbers
//! or numeric strings, and ungraded periods as `0`, `null`, `""` or `"-"`.
//! Everything here normalizes to strings and `Option<f64>`; turning a wire
//! zero into "not graded" happens later in `PeriodScore::from_wire`.

use anyhow::{anyhow, Context};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;

use crate::calc::{Band, BandScheme, Period, PeriodScore};

fn de_id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::String(s) => Ok(s.trim().to_string()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(D::Error::custom(format!("expected id, got {}", other))),
    }
}

fn de_opt_text<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) => {
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
        serde_json::Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(D::Error::custom(format!("expected text, got {}", other))),
    }
}

fn de_opt_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Number(n) => Ok(n.as_f64()),
        serde_json::Value::String(s) => {
            let t = s.trim();
            if t.is_empty() || t == "-" {
                return Ok(None);
            }
            match t.parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(Some(v)),
                _ => Err(D::Error::custom(format!("expected number, got {:?}", t))),
            }
        }
        other => Err(D::Error::custom(format!("expected number, got {}", other))),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireScore {
    #[serde(default, alias = "qualitative", deserialize_with = "de_opt_text")]
    pub cualitativa: Option<String>,
    #[serde(default, alias = "quantitative", deserialize_with = "de_opt_number")]
    pub cuantitativa: Option<f64>,
}

impl WireScore {
    pub fn to_period_score(&self, scheme: &BandScheme) -> PeriodScore {
        PeriodScore::from_wire(self.cualitativa.as_deref(), self.cuantitativa, scheme)
    }

    /// The backend's own label, if it sent one (`-` counts as none).
    pub fn label(&self) -> Option<Band> {
        self.cualitativa.as_deref().and_then(Band::parse)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireSubjectGrades {
    #[serde(default)]
    pub bimestre_1: Option<WireScore>,
    #[serde(default)]
    pub bimestre_2: Option<WireScore>,
    #[serde(default)]
    pub bimestre_3: Option<WireScore>,
    #[serde(default)]
    pub bimestre_4: Option<WireScore>,
    #[serde(default)]
    pub semestre_1: Option<WireScore>,
    #[serde(default)]
    pub semestre_2: Option<WireScore>,
}

impl WireSubjectGrades {
    /// Periods present in the payload, in period order.
    pub fn periods(&self) -> Vec<(Period, &WireScore)> {
        [
            (Period::Bimestre1, &self.bimestre_1),
            (Period::Bimestre2, &self.bimestre_2),
            (Period::Bimestre3, &self.bimestre_3),
            (Period::Bimestre4, &self.bimestre_4),
            (Period::Semestre1, &self.semestre_1),
            (Period::Semestre2, &self.semestre_2),
        ]
        .into_iter()
        .filter_map(|(p, s)| s.as_ref().map(|s| (p, s)))
        .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireStudent {
    #[serde(deserialize_with = "de_id")]
    pub id_estudiante: String,
    pub nombre_completo: String,
    #[serde(default, deserialize_with = "de_opt_text")]
    pub codigo_mined: Option<String>,
    #[serde(default, deserialize_with = "de_opt_text")]
    pub genero: Option<String>,
    #[serde(default)]
    pub calificaciones: BTreeMap<String, WireSubjectGrades>,
    #[serde(default)]
    pub promedio: Option<WireScore>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireSubject {
    #[serde(deserialize_with = "de_id")]
    pub id_materia: String,
    pub nombre: String,
    #[serde(default)]
    pub orden: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireEnvelope {
    #[serde(alias = "data")]
    estudiantes: Vec<WireStudent>,
    #[serde(default)]
    materias: Option<Vec<WireSubject>>,
}

#[derive(Debug, Clone)]
pub struct Consolidado {
    pub students: Vec<WireStudent>,
    pub subjects: Vec<WireSubject>,
}

/// Accepts either the bare student array or an object with `estudiantes`
/// (alias `data`) and an optional `materias` catalog. Without a catalog the
/// subjects are the `calificaciones` keys, named after their ids.
pub fn parse_consolidado(payload: &serde_json::Value) -> anyhow::Result<Consolidado> {
    let (students, subjects) = match payload {
        serde_json::Value::Array(_) => {
            let students: Vec<WireStudent> = serde_json::from_value(payload.clone())
                .context("consolidado rows are malformed")?;
            (students, None)
        }
        serde_json::Value::Object(_) => {
            let env: WireEnvelope = serde_json::from_value(payload.clone())
                .context("consolidado envelope is malformed")?;
            (env.estudiantes, env.materias)
        }
        _ => return Err(anyhow!("consolidado payload must be an array or an object")),
    };

    let mut subjects = match subjects {
        Some(v) => v,
        None => {
            let mut ids: Vec<&String> = students
                .iter()
                .flat_map(|s| s.calificaciones.keys())
                .collect();
            ids.sort();
            ids.dedup();
            ids.into_iter()
                .map(|id| WireSubject {
                    id_materia: id.clone(),
                    nombre: id.clone(),
                    orden: None,
                })
                .collect()
        }
    };
    subjects.sort_by_key(|s| s.orden.unwrap_or(i64::MAX));

    let mut seen = std::collections::HashSet::new();
    for s in &students {
        if s.id_estudiante.is_empty() {
            return Err(anyhow!("student with empty id_estudiante"));
        }
        if !seen.insert(s.id_estudiante.as_str()) {
            return Err(anyhow!("duplicate id_estudiante {}", s.id_estudiante));
        }
    }

    Ok(Consolidado { students, subjects })
}
