use clap::Parser;
use notasd::ipc;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Grade rollup sidecar: line-delimited JSON requests on stdin, one JSON
/// response per line on stdout.
#[derive(Parser, Debug)]
#[command(name = "notasd")]
#[command(version)]
struct Args {
    /// Workspace directory to open at start-up
    #[arg(long, env = "NOTASD_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Log filter directive, e.g. "info" or "notasd=debug"
    #[arg(long, env = "NOTASD_LOG", default_value = "info")]
    log: String,
}

fn init_tracing(directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries the protocol.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();
}

fn main() {
    let args = Args::parse();
    init_tracing(&args.log);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "notasd starting");

    let mut state = ipc::AppState::default();
    if let Some(path) = args.workspace.as_deref() {
        if let Err(e) = ipc::open_workspace(&mut state, path) {
            tracing::error!(workspace = %path.to_string_lossy(), "failed to open workspace: {e:#}");
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("stdin read failed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                tracing::warn!("unparseable request: {}", e);
                let reply = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", reply);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
    tracing::info!("stdin closed, exiting");
}
