use crate::backup;
use crate::ipc::handlers::core::open_workspace;
use crate::ipc::helpers::{required_str, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn target_workspace(state: &AppState, req: &Request) -> Result<PathBuf, HandlerErr> {
    req.params
        .get("workspacePath")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone())
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

fn handle_backup_export(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let out_path = required_str(req, "outPath")?;
    let workspace_path = target_workspace(state, req)?;

    if let Some(conn) = state.db.as_ref() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
    }

    let export = backup::export_workspace_bundle(&workspace_path, &PathBuf::from(&out_path))
        .map_err(|e| {
            HandlerErr::new("io_failed", format!("{e:#}")).with_details(json!({ "path": out_path }))
        })?;

    Ok(json!({
        "path": out_path,
        "bundleFormat": export.bundle_format,
        "entryCount": export.entry_count,
        "dbSha256": export.db_sha256,
    }))
}

fn handle_backup_import(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let in_path = required_str(req, "inPath")?;
    let workspace_path = target_workspace(state, req)?;

    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return Err(HandlerErr::new("not_found", "bundle file not found")
            .with_details(json!({ "path": in_path })));
    }

    // Drop open handle before replacing file.
    state.db = None;

    let outcome = backup::import_workspace_bundle(&src, &workspace_path);
    // Reopen whatever is on disk, restored or untouched.
    open_workspace(state, &workspace_path)
        .map_err(|e| HandlerErr::new("db_open_failed", format!("{e:#}")))?;
    let import = outcome.map_err(|e| {
        HandlerErr::new("io_failed", format!("{e:#}")).with_details(json!({ "path": in_path }))
    })?;

    Ok(json!({
        "workspacePath": workspace_path.to_string_lossy(),
        "bundleFormatDetected": import.bundle_format_detected,
        "checksumVerified": import.checksum_verified,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "backup.exportWorkspaceBundle" => handle_backup_export(state, req),
        "backup.importWorkspaceBundle" => handle_backup_import(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
