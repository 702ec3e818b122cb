use crate::db;
use crate::ipc::helpers::{respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::{Path, PathBuf};

/// Opens (creating if needed) the workspace database and makes it current.
pub fn open_workspace(state: &mut AppState, path: &Path) -> anyhow::Result<()> {
    let conn = db::open_db(path)?;
    // Drop the previous connection before swapping so only one handle is live.
    state.db = None;
    state.db = Some(conn);
    state.workspace = Some(path.to_path_buf());
    tracing::info!(workspace = %path.to_string_lossy(), "workspace opened");
    Ok(())
}

fn handle_health(state: &mut AppState, _req: &Request) -> Result<serde_json::Value, HandlerErr> {
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
    }))
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let path = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .ok_or_else(|| HandlerErr::new("bad_params", "missing params.path"))?;

    open_workspace(state, &path)
        .map_err(|e| HandlerErr::new("db_open_failed", format!("{e:#}")))?;
    Ok(json!({ "workspacePath": path.to_string_lossy() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(respond(req, handle_health(state, req))),
        "workspace.select" => Some(respond(req, handle_workspace_select(state, req))),
        _ => None,
    }
}
