use crate::calc::BandScheme;
use crate::ipc::helpers::{db_conn, required_str, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::report::{self, Roster, RosterFilters};
use rusqlite::Connection;
use serde_json::json;
use std::path::PathBuf;

fn load_roster_for(
    conn: &Connection,
    req: &Request,
) -> Result<(Roster, RosterFilters, BandScheme), HandlerErr> {
    let section_id = required_str(req, "sectionId")?;
    let filters = report::parse_roster_filters(req.params.get("filters"))?;
    let scheme = report::load_band_scheme(conn)?;
    let roster = report::load_roster(conn, &section_id, &filters, &scheme)?;
    Ok((roster, filters, scheme))
}

fn write_text_file(path: &str, contents: &str) -> Result<(), HandlerErr> {
    let out = PathBuf::from(path);
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            HandlerErr::new("export_failed", e.to_string()).with_details(json!({ "path": path }))
        })?;
    }
    std::fs::write(&out, contents).map_err(|e| {
        HandlerErr::new("export_failed", e.to_string()).with_details(json!({ "path": path }))
    })?;
    Ok(())
}

fn handle_sabana_model(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let (roster, filters, scheme) = load_roster_for(conn, req)?;
    let model = report::build_sabana(&roster, &filters, &scheme);
    Ok(json!(model))
}

fn handle_certificate_model(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let student_id = required_str(req, "studentId")?;
    let (roster, _, scheme) = load_roster_for(conn, req)?;
    let model = report::build_certificate(&roster, &student_id, &scheme)?;
    Ok(json!(model))
}

fn handle_export_sabana_csv(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let out_path = required_str(req, "outPath")?;
    let (roster, filters, scheme) = load_roster_for(conn, req)?;
    let model = report::build_sabana(&roster, &filters, &scheme);
    let csv = report::sabana_csv(&model);
    write_text_file(&out_path, &csv)?;
    tracing::info!(path = %out_path, rows = model.rows.len(), "exported sabana csv");
    Ok(json!({
        "path": out_path,
        "rowsExported": model.rows.len(),
    }))
}

fn handle_export_certificate_csv(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let out_path = required_str(req, "outPath")?;
    let student_id = required_str(req, "studentId")?;
    let (roster, _, scheme) = load_roster_for(conn, req)?;
    let model = report::build_certificate(&roster, &student_id, &scheme)?;
    write_text_file(&out_path, &report::certificate_csv(&model))?;
    tracing::info!(path = %out_path, student_id = %student_id, "exported certificate csv");
    Ok(json!({
        "path": out_path,
        "subjectsExported": model.subjects.len(),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "reports.sabanaModel" => handle_sabana_model(state, req),
        "reports.certificateModel" => handle_certificate_model(state, req),
        "reports.exportSabanaCsv" => handle_export_sabana_csv(state, req),
        "reports.exportCertificateCsv" => handle_export_certificate_csv(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
