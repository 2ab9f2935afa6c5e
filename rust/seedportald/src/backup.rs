use anyhow::{anyhow, Context};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::db::DB_FILE_NAME;

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/portal.sqlite3";
const FILES_PREFIX: &str = "files/";
pub const BUNDLE_FORMAT: &str = "seedportal-workspace-v1";

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
    pub db_sha256: String,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format: String,
    pub files_restored: usize,
}

pub fn sha256_file(path: &Path) -> anyhow::Result<String> {
    let mut f = File::open(path)
        .with_context(|| format!("failed to open {}", path.to_string_lossy()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf).context("failed to read file for hashing")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Uploaded documents under `<workspace>/files`, as paths relative to it.
fn collect_files(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !root.is_dir() {
        return Ok(out);
    }
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("failed to list {}", dir.to_string_lossy()))?
        {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_path_buf());
            }
        }
    }
    out.sort();
    Ok(out)
}

fn zip_name(rel: &Path) -> String {
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    format!("{}{}", FILES_PREFIX, parts.join("/"))
}

/// Writes the database, the uploaded files and a manifest carrying the
/// database digest into one zip.
pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(DB_FILE_NAME);
    if !db_path.is_file() {
        return Err(anyhow!(
            "workspace database not found: {}",
            db_path.to_string_lossy()
        ));
    }
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }

    let db_sha256 = sha256_file(&db_path)?;
    let files_root = workspace_path.join("files");
    let files = collect_files(&files_root)?;

    let out_file = File::create(out_path)
        .with_context(|| format!("failed to create output file {}", out_path.to_string_lossy()))?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = json!({
        "format": BUNDLE_FORMAT,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": crate::db::now_rfc3339(),
        "dbSha256": db_sha256,
        "fileCount": files.len(),
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(serde_json::to_string_pretty(&manifest)?.as_bytes())
        .context("failed to write manifest entry")?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    let mut db_file = File::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.to_string_lossy()))?;
    std::io::copy(&mut db_file, &mut zip).context("failed to write database entry")?;

    for rel in &files {
        zip.start_file(zip_name(rel), opts)
            .with_context(|| format!("failed to start entry for {}", rel.to_string_lossy()))?;
        let mut f = File::open(files_root.join(rel))?;
        std::io::copy(&mut f, &mut zip)
            .with_context(|| format!("failed to write {}", rel.to_string_lossy()))?;
    }

    zip.finish().context("failed to finalize zip bundle")?;
    log::info!(
        "exported workspace bundle {} ({} files)",
        out_path.to_string_lossy(),
        files.len()
    );

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT.to_string(),
        entry_count: 2 + files.len(),
        db_sha256,
    })
}

/// Restores a bundle into `workspace_path`. The database is extracted to a
/// temporary file and only swapped in once its digest matches the manifest.
pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    std::fs::create_dir_all(workspace_path).with_context(|| {
        format!("failed to create workspace {}", workspace_path.to_string_lossy())
    })?;

    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest_text).context("manifest.json is invalid JSON")?;
    let format = manifest.get("format").and_then(|v| v.as_str()).unwrap_or("");
    if format != BUNDLE_FORMAT {
        return Err(anyhow!("unsupported bundle format: {}", format));
    }
    let expected_sha = manifest
        .get("dbSha256")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("manifest missing dbSha256"))?
        .to_string();

    let tmp_dst = workspace_path.join(format!("{}.importing", DB_FILE_NAME));
    if tmp_dst.exists() {
        let _ = std::fs::remove_file(&tmp_dst);
    }
    {
        let mut db_out = File::create(&tmp_dst).with_context(|| {
            format!("failed to create temp database {}", tmp_dst.to_string_lossy())
        })?;
        let mut db_entry = archive
            .by_name(DB_ENTRY)
            .context("bundle missing db/portal.sqlite3")?;
        std::io::copy(&mut db_entry, &mut db_out).context("failed to extract database entry")?;
        db_out.flush().context("failed to flush extracted database")?;
    }

    let actual_sha = sha256_file(&tmp_dst)?;
    if actual_sha != expected_sha {
        let _ = std::fs::remove_file(&tmp_dst);
        return Err(anyhow!(
            "database digest mismatch: manifest {}, bundle {}",
            expected_sha,
            actual_sha
        ));
    }

    let dst = workspace_path.join(DB_FILE_NAME);
    if dst.exists() {
        std::fs::remove_file(&dst).with_context(|| {
            format!("failed to remove existing database {}", dst.to_string_lossy())
        })?;
    }
    std::fs::rename(&tmp_dst, &dst)
        .with_context(|| format!("failed to move extracted database to {}", dst.to_string_lossy()))?;

    let mut files_restored = 0;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(rel) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            continue;
        };
        let Ok(rel) = rel.strip_prefix(FILES_PREFIX.trim_end_matches('/')) else {
            continue;
        };
        if entry.is_dir() {
            continue;
        }
        let target = workspace_path.join("files").join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)
            .with_context(|| format!("failed to create {}", target.to_string_lossy()))?;
        std::io::copy(&mut entry, &mut out)?;
        files_restored += 1;
    }

    log::info!(
        "imported workspace bundle into {} ({} files)",
        workspace_path.to_string_lossy(),
        files_restored
    );
    Ok(ImportSummary {
        bundle_format: BUNDLE_FORMAT.to_string(),
        files_restored,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(prefix: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&p).expect("temp dir");
        p
    }

    #[test]
    fn export_then_import_restores_db_and_files() {
        let src = temp_dir("seedportal-bundle-src");
        crate::db::open_db(&src).expect("open");
        std::fs::create_dir_all(src.join("files").join("ab")).expect("mkdir");
        std::fs::write(src.join("files").join("ab").join("sow.pdf"), b"pdf").expect("write");

        let bundle = src.join("out").join("ws.zip");
        let exported = export_workspace_bundle(&src, &bundle).expect("export");
        assert_eq!(exported.entry_count, 3);

        let dst = temp_dir("seedportal-bundle-dst");
        let imported = import_workspace_bundle(&bundle, &dst).expect("import");
        assert_eq!(imported.files_restored, 1);
        assert_eq!(
            sha256_file(&dst.join(DB_FILE_NAME)).expect("hash"),
            exported.db_sha256
        );
        assert!(dst.join("files").join("ab").join("sow.pdf").is_file());
    }

    #[test]
    fn rejects_tampered_digest() {
        let src = temp_dir("seedportal-bundle-tamper");
        crate::db::open_db(&src).expect("open");
        let bundle = src.join("bad.zip");
        {
            let f = File::create(&bundle).expect("create");
            let mut zip = ZipWriter::new(f);
            let opts = FileOptions::default();
            zip.start_file(MANIFEST_ENTRY, opts).expect("start");
            zip.write_all(
                json!({ "format": BUNDLE_FORMAT, "dbSha256": "00" })
                    .to_string()
                    .as_bytes(),
            )
            .expect("manifest");
            zip.start_file(DB_ENTRY, opts).expect("start");
            zip.write_all(b"not a database").expect("db");
            zip.finish().expect("finish");
        }
        let dst = temp_dir("seedportal-bundle-tamper-dst");
        let e = import_workspace_bundle(&bundle, &dst).unwrap_err();
        assert!(e.to_string().contains("digest mismatch"));
        assert!(!dst.join(DB_FILE_NAME).exists());
    }
}
