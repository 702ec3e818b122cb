use crate::calc::{BandScheme, PeriodScore};
use crate::db;
use crate::ipc::helpers::{optional_f64, required_f64, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::report::{self, BANDS_SETTING_KEY};
use serde_json::json;

/// The workspace scheme when one is open, otherwise the canonical one.
fn active_scheme(state: &AppState) -> Result<BandScheme, HandlerErr> {
    match state.db.as_ref() {
        Some(conn) => Ok(report::load_band_scheme(conn)?),
        None => Ok(BandScheme::CANONICAL),
    }
}

fn wire_score(
    raw: Option<&serde_json::Value>,
    key: &str,
    scheme: &BandScheme,
) -> Result<Option<PeriodScore>, HandlerErr> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    if raw.is_null() {
        return Ok(None);
    }
    if let Some(n) = raw.as_f64() {
        return Ok(Some(PeriodScore::from_wire(None, Some(n), scheme)));
    }
    let Some(obj) = raw.as_object() else {
        return Err(HandlerErr::new(
            "bad_params",
            format!("{} must be a number, an object or null", key),
        ));
    };
    let quantitative = optional_f64(obj.get("quantitative"), key)?;
    let qualitative = obj.get("qualitative").and_then(|v| v.as_str());
    Ok(Some(PeriodScore::from_wire(qualitative, quantitative, scheme)))
}

fn number_list(req: &Request, key: &str) -> Result<Vec<Option<f64>>, HandlerErr> {
    let Some(items) = req.params.get(key).and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", format!("missing {} array", key)));
    };
    items
        .iter()
        .map(|v| optional_f64(Some(v), key))
        .collect()
}

fn handle_band(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let scheme = active_scheme(state)?;
    let q = required_f64(req, "quantitative")?;
    let band = scheme.band(q);
    Ok(json!({
        "qualitative": band,
        "description": band.description(),
    }))
}

fn handle_final_from_semesters(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let scheme = active_scheme(state)?;
    let s1 = wire_score(req.params.get("semestre1"), "semestre1", &scheme)?;
    let s2 = wire_score(req.params.get("semestre2"), "semestre2", &scheme)?;
    Ok(json!({ "final": scheme.final_from_semesters(s1, s2) }))
}

fn handle_final_from_bimesters(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let scheme = active_scheme(state)?;
    let values = number_list(req, "bimesters")?;
    if values.len() != 4 {
        return Err(HandlerErr::new("bad_params", "bimesters must have exactly 4 entries")
            .with_details(json!({ "got": values.len() })));
    }
    let rollup = scheme.final_from_bimesters([values[0], values[1], values[2], values[3]]);
    Ok(json!({
        "final": rollup,
        "display": rollup.display(),
    }))
}

fn handle_class_average(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let scheme = active_scheme(state)?;
    let values: Vec<f64> = number_list(req, "subjectAverages")?
        .into_iter()
        .map(|v| v.unwrap_or(0.0))
        .collect();
    let rollup = scheme.class_average(&values);
    Ok(json!({
        "average": rollup,
        "display": rollup.display(),
    }))
}

fn handle_config_get(state: &mut AppState, _req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let scheme = active_scheme(state)?;
    Ok(json!({
        "bands": scheme,
        "canonical": scheme == BandScheme::CANONICAL,
    }))
}

fn handle_config_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let Some(conn) = state.db.as_ref() else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    let current = report::load_band_scheme(conn)?;
    let Some(bands) = req.params.get("bands").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::new("bad_params", "missing bands object"));
    };

    let pick = |key: &str, fallback: f64| -> Result<f64, HandlerErr> {
        Ok(optional_f64(bands.get(key), key)?.unwrap_or(fallback))
    };
    let next = BandScheme {
        aa_min: pick("aaMin", current.aa_min)?,
        as_min: pick("asMin", current.as_min)?,
        af_min: pick("afMin", current.af_min)?,
    };
    next.validate()?;

    db::settings_set_json(conn, BANDS_SETTING_KEY, &json!(next))
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    if next != BandScheme::CANONICAL {
        tracing::warn!(?next, "band thresholds differ from the canonical scheme");
    }
    Ok(json!({
        "bands": next,
        "canonical": next == BandScheme::CANONICAL,
    }))
}

fn handle_config_reset(state: &mut AppState, _req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let Some(conn) = state.db.as_ref() else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    db::settings_delete(conn, BANDS_SETTING_KEY)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "bands": BandScheme::CANONICAL, "canonical": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "calc.band" => handle_band(state, req),
        "calc.finalFromSemesters" => handle_final_from_semesters(state, req),
        "calc.finalFromBimesters" => handle_final_from_bimesters(state, req),
        "calc.classAverage" => handle_class_average(state, req),
        "calc.config.get" => handle_config_get(state, req),
        "calc.config.update" => handle_config_update(state, req),
        "calc.config.reset" => handle_config_reset(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
