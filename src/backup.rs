use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Seek, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::db::DB_FILE;

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/notas.sqlite3";
const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";

pub const BUNDLE_FORMAT: &str = "notas-workspace-v1";
/// Reported when the restored file was a plain database, not a bundle.
pub const BARE_SQLITE_FORMAT: &str = "sqlite3";

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
    pub db_sha256: String,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
    pub checksum_verified: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    format: String,
    #[serde(default)]
    version: u32,
    #[serde(default)]
    app_version: Option<String>,
    #[serde(default)]
    exported_at: Option<String>,
    #[serde(default)]
    db_sha256: Option<String>,
}

/// Error context naming the file an operation failed on.
fn at<'a>(action: &'a str, path: &'a Path) -> impl FnOnce() -> String + 'a {
    move || format!("{} {}", action, path.to_string_lossy())
}

fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(DB_FILE);
    if !db_path.is_file() {
        bail!("workspace database not found: {}", db_path.to_string_lossy());
    }
    let db_bytes = std::fs::read(&db_path).with_context(at("failed to read database", &db_path))?;
    let db_sha256 = sha256_hex(&db_bytes);
    let manifest = Manifest {
        format: BUNDLE_FORMAT.to_string(),
        version: 1,
        app_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        exported_at: Some(chrono::Utc::now().to_rfc3339()),
        db_sha256: Some(db_sha256.clone()),
    };

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent).with_context(at("failed to create directory", parent))?;
    }
    let out_file = File::create(out_path).with_context(at("failed to create bundle", out_path))?;
    write_bundle(out_file, &manifest, &db_bytes)?;

    tracing::info!(
        out = %out_path.to_string_lossy(),
        sha256 = %db_sha256,
        "exported workspace bundle"
    );
    Ok(ExportSummary {
        bundle_format: manifest.format,
        entry_count: 2,
        db_sha256,
    })
}

fn write_bundle<W: Write + Seek>(out: W, manifest: &Manifest, db_bytes: &[u8]) -> anyhow::Result<()> {
    let manifest_json = serde_json::to_vec_pretty(manifest).context("failed to serialize manifest")?;
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(out);
    for (name, bytes) in [(MANIFEST_ENTRY, manifest_json.as_slice()), (DB_ENTRY, db_bytes)] {
        zip.start_file(name, opts)
            .with_context(|| format!("failed to start entry {}", name))?;
        zip.write_all(bytes)
            .with_context(|| format!("failed to write entry {}", name))?;
    }
    zip.finish().context("failed to finalize bundle")?;
    Ok(())
}

/// Restores `in_path` into the workspace. Accepts a bundle or a bare SQLite
/// file. A bundle whose checksum does not match leaves the workspace as is.
pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    std::fs::create_dir_all(workspace_path)
        .with_context(at("failed to create workspace", workspace_path))?;

    if !has_zip_magic(in_path)? {
        let db_bytes = std::fs::read(in_path).with_context(at("failed to read backup", in_path))?;
        replace_db(workspace_path, &db_bytes)?;
        return Ok(ImportSummary {
            bundle_format_detected: BARE_SQLITE_FORMAT.to_string(),
            checksum_verified: false,
        });
    }

    let (manifest, db_bytes) = read_bundle(in_path)?;
    let checksum_verified = match manifest.db_sha256.as_deref() {
        Some(expected) => {
            let actual = sha256_hex(&db_bytes);
            if !actual.eq_ignore_ascii_case(expected) {
                bail!(
                    "database checksum mismatch: manifest {} but bundle holds {}",
                    expected,
                    actual
                );
            }
            true
        }
        None => false,
    };
    replace_db(workspace_path, &db_bytes)?;

    tracing::info!(
        workspace = %workspace_path.to_string_lossy(),
        checksum_verified,
        "imported workspace bundle"
    );
    Ok(ImportSummary {
        bundle_format_detected: manifest.format,
        checksum_verified,
    })
}

fn read_bundle(path: &Path) -> anyhow::Result<(Manifest, Vec<u8>)> {
    let file = File::open(path).with_context(at("failed to open bundle", path))?;
    let mut archive = ZipArchive::new(file).context("invalid zip archive")?;
    let manifest: Manifest = serde_json::from_slice(&read_entry(&mut archive, MANIFEST_ENTRY)?)
        .context("manifest.json is invalid")?;
    if manifest.format != BUNDLE_FORMAT {
        bail!("unsupported bundle format: {}", manifest.format);
    }
    let db_bytes = read_entry(&mut archive, DB_ENTRY)?;
    Ok((manifest, db_bytes))
}

fn read_entry(archive: &mut ZipArchive<File>, name: &str) -> anyhow::Result<Vec<u8>> {
    let mut entry = archive
        .by_name(name)
        .with_context(|| format!("bundle missing {}", name))?;
    let mut bytes = Vec::new();
    entry
        .read_to_end(&mut bytes)
        .with_context(|| format!("failed to read {}", name))?;
    Ok(bytes)
}

/// Stages the new database next to the live one, then renames it over.
fn replace_db(workspace_path: &Path, db_bytes: &[u8]) -> anyhow::Result<()> {
    let live = workspace_path.join(DB_FILE);
    let staged = workspace_path.join(format!("{}.importing", DB_FILE));
    std::fs::write(&staged, db_bytes).with_context(at("failed to stage database", &staged))?;
    std::fs::rename(&staged, &live).with_context(at("failed to replace database", &live))?;
    Ok(())
}

fn has_zip_magic(path: &Path) -> anyhow::Result<bool> {
    let mut file = File::open(path).with_context(at("failed to open", path))?;
    let mut head = [0u8; 4];
    match file.read_exact(&mut head) {
        Ok(()) => Ok(head == ZIP_MAGIC),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e).with_context(at("failed to read", path)),
    }
}
