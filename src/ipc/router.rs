use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Some(resp) = handlers::core::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::sections::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::students::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::grades::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::import_consolidado::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::calc::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::reports::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::backup_exchange::try_handle(state, req) {
        return resp;
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    tracing::debug!(id = %req.id, method = %req.method, "request");
    let resp = dispatch(state, &req);
    if resp.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = resp
            .pointer("/error/code")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let message = resp
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        tracing::warn!(id = %req.id, method = %req.method, code, message, "request failed");
    }
    resp
}
