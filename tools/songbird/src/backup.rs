use crate::errors::SongbirdError;
use crate::logging::append_run_log;
use crate::runtime::{format_compact, format_rfc3339, Clock, Terminal};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const MANIFEST_FILE: &str = "MANIFEST.sha256";
pub const METADATA_FILE: &str = "backup.json";
pub const AUDIT_LOG_FILE: &str = "backup-audit.log";
const PRE_RESTORE_SUFFIX: &str = "-pre-restore";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub name: String,
    pub timestamp: String,
    pub sequence: u32,
    pub path: PathBuf,
    pub source_path: PathBuf,
    pub size_bytes: u64,
    pub file_count: usize,
    pub created_at: String,
    pub checksums: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackupNameStats {
    pub count: usize,
    pub size_bytes: u64,
    pub newest: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackupStats {
    pub total_backups: usize,
    pub total_bytes: u64,
    pub by_name: BTreeMap<String, BackupNameStats>,
}

/// Timestamped, verified snapshots of a directory tree under one backup root.
pub struct BackupManager {
    root: PathBuf,
    retention: usize,
    checksums: bool,
    clock: Arc<dyn Clock>,
}

impl BackupManager {
    pub fn new(
        root: impl Into<PathBuf>,
        retention: usize,
        checksums: bool,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            root: root.into(),
            retention,
            checksums,
            clock,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.root.join(AUDIT_LOG_FILE)
    }

    /// Copies `source_dir` into a new `{name}_{timestamp}` snapshot, verifies it, then
    /// prunes old snapshots of `name`. Returns `None` when there is nothing to protect.
    pub fn create_backup(
        &self,
        source_dir: &Path,
        name: &str,
    ) -> Result<Option<BackupRecord>, SongbirdError> {
        if !source_dir.is_dir() || dir_is_empty(source_dir)? {
            append_run_log(
                "info",
                "backup.skipped_empty",
                json!({ "source": source_dir.display().to_string(), "name": name }),
            );
            return Ok(None);
        }

        let now = self.clock.now();
        let timestamp = format_compact(now);
        fs::create_dir_all(&self.root).map_err(|e| backup_io(&self.root, e))?;
        let (dest, sequence) = self.unique_destination(name, &timestamp);

        let files = collect_files(source_dir, Some(&self.root))?;
        let result = self.copy_and_verify(source_dir, &dest, &files);
        let (size_bytes, manifest) = match result {
            Ok(done) => done,
            Err(err) => {
                let _ = fs::remove_dir_all(&dest);
                self.audit("CREATE_FAILED", name, &dest, &err.to_string())?;
                append_run_log(
                    "error",
                    "backup.create.failed",
                    json!({ "name": name, "error": err.to_string() }),
                );
                return Err(err);
            }
        };

        let record = BackupRecord {
            name: name.to_string(),
            timestamp,
            sequence,
            path: dest.clone(),
            source_path: source_dir.to_path_buf(),
            size_bytes,
            file_count: files.len(),
            created_at: format_rfc3339(now),
            checksums: manifest.is_some(),
        };
        let metadata = serde_json::to_string_pretty(&record)
            .map_err(|e| SongbirdError::Backup(e.to_string()))?;
        fs::write(dest.join(METADATA_FILE), metadata).map_err(|e| backup_io(&dest, e))?;

        self.audit(
            "CREATE",
            name,
            &dest,
            &format!("files={} bytes={}", record.file_count, record.size_bytes),
        )?;
        append_run_log(
            "info",
            "backup.created",
            json!({
                "name": name,
                "path": dest.display().to_string(),
                "files": record.file_count,
                "bytes": record.size_bytes,
            }),
        );

        self.prune(name)?;
        Ok(Some(record))
    }

    fn unique_destination(&self, name: &str, timestamp: &str) -> (PathBuf, u32) {
        let base = format!("{name}_{timestamp}");
        let mut candidate = self.root.join(&base);
        let mut sequence = 0;
        while candidate.exists() {
            sequence += 1;
            candidate = self.root.join(format!("{base}-{sequence}"));
        }
        (candidate, sequence)
    }

    fn copy_and_verify(
        &self,
        source_dir: &Path,
        dest: &Path,
        files: &[PathBuf],
    ) -> Result<(u64, Option<String>), SongbirdError> {
        let mut size_bytes = 0;
        let mut manifest = String::new();
        for rel in files {
            let from = source_dir.join(rel);
            let to = dest.join(rel);
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent).map_err(|e| backup_io(parent, e))?;
            }
            size_bytes += fs::copy(&from, &to).map_err(|e| backup_io(&from, e))?;
            if self.checksums {
                manifest.push_str(&format!("{}  {}\n", sha256_file(&from)?, manifest_path(rel)));
            }
        }

        if self.checksums {
            let manifest_file = dest.join(MANIFEST_FILE);
            fs::write(&manifest_file, &manifest).map_err(|e| backup_io(&manifest_file, e))?;
            verify_manifest(dest)?;
            return Ok((size_bytes, Some(manifest)));
        }

        for rel in files {
            let expected = fs::metadata(source_dir.join(rel))
                .map_err(|e| backup_io(rel, e))?
                .len();
            let actual = fs::metadata(dest.join(rel))
                .map_err(|e| backup_io(rel, e))?
                .len();
            if expected != actual {
                return Err(SongbirdError::Backup(format!(
                    "size mismatch for {}: {expected} != {actual}",
                    rel.display()
                )));
            }
        }
        Ok((size_bytes, None))
    }

    /// Snapshots for `name` (or every name), oldest first.
    pub fn list_backups(&self, name: Option<&str>) -> Result<Vec<BackupRecord>, SongbirdError> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(|e| backup_io(&self.root, e))? {
            let entry = entry.map_err(|e| backup_io(&self.root, e))?;
            let metadata_path = entry.path().join(METADATA_FILE);
            if !metadata_path.is_file() {
                continue;
            }
            let raw = fs::read_to_string(&metadata_path).map_err(|e| backup_io(&metadata_path, e))?;
            let Ok(record) = serde_json::from_str::<BackupRecord>(&raw) else {
                append_run_log(
                    "warn",
                    "backup.metadata.unreadable",
                    json!({ "path": metadata_path.display().to_string() }),
                );
                continue;
            };
            if name.map_or(true, |name| record.name == name) {
                records.push(record);
            }
        }
        records.sort_by(|a, b| {
            (&a.timestamp, a.sequence, &a.name).cmp(&(&b.timestamp, b.sequence, &b.name))
        });
        Ok(records)
    }

    /// Deletes the oldest snapshots of `name` beyond the retention count.
    pub fn prune(&self, name: &str) -> Result<Vec<PathBuf>, SongbirdError> {
        let records = self.list_backups(Some(name))?;
        let excess = records.len().saturating_sub(self.retention);
        let mut removed = Vec::new();
        for record in records.into_iter().take(excess) {
            fs::remove_dir_all(&record.path).map_err(|e| backup_io(&record.path, e))?;
            self.audit("PRUNE", name, &record.path, "retention")?;
            removed.push(record.path);
        }
        if !removed.is_empty() {
            append_run_log(
                "info",
                "backup.pruned",
                json!({ "name": name, "removed": removed.len(), "retention": self.retention }),
            );
        }
        Ok(removed)
    }

    pub fn stats(&self) -> Result<BackupStats, SongbirdError> {
        let mut stats = BackupStats::default();
        for record in self.list_backups(None)? {
            stats.total_backups += 1;
            stats.total_bytes += record.size_bytes;
            let entry = stats.by_name.entry(record.name.clone()).or_default();
            entry.count += 1;
            entry.size_bytes += record.size_bytes;
            entry.newest = Some(record.created_at.clone());
        }
        Ok(stats)
    }

    /// Replaces `target_dir` with the newest snapshot of `name`. The current contents are
    /// snapshotted first under `{name}-pre-restore`.
    pub fn restore_backup(
        &self,
        name: &str,
        target_dir: &Path,
        force: bool,
        terminal: &dyn Terminal,
    ) -> Result<BackupRecord, SongbirdError> {
        let record = self
            .list_backups(Some(name))?
            .pop()
            .ok_or_else(|| SongbirdError::Backup(format!("no backups named {name}")))?;
        if record.path.join(MANIFEST_FILE).is_file() {
            verify_manifest(&record.path)?;
        }

        if !force {
            if !terminal.stdin_is_tty() {
                return Err(SongbirdError::Backup(
                    "restore needs confirmation; rerun with --force in non-interactive use"
                        .to_string(),
                ));
            }
            let prompt = format!(
                "Replace {} with backup {} ({} files)?",
                target_dir.display(),
                record.path.display(),
                record.file_count
            );
            if !terminal.confirm(&prompt)? {
                return Err(SongbirdError::Backup("restore declined".to_string()));
            }
        }

        self.create_backup(target_dir, &format!("{name}{PRE_RESTORE_SUFFIX}"))?;

        if target_dir.exists() {
            fs::remove_dir_all(target_dir).map_err(|e| backup_io(target_dir, e))?;
        }
        fs::create_dir_all(target_dir).map_err(|e| backup_io(target_dir, e))?;
        for rel in collect_files(&record.path, None)? {
            if is_backup_bookkeeping(&rel) {
                continue;
            }
            let to = target_dir.join(&rel);
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent).map_err(|e| backup_io(parent, e))?;
            }
            fs::copy(record.path.join(&rel), &to).map_err(|e| backup_io(&to, e))?;
        }

        self.audit(
            "RESTORE",
            name,
            &record.path,
            &format!("target={}", target_dir.display()),
        )?;
        append_run_log(
            "info",
            "backup.restored",
            json!({
                "name": name,
                "from": record.path.display().to_string(),
                "target": target_dir.display().to_string(),
            }),
        );
        Ok(record)
    }

    fn audit(&self, action: &str, name: &str, path: &Path, detail: &str) -> Result<(), SongbirdError> {
        fs::create_dir_all(&self.root).map_err(|e| backup_io(&self.root, e))?;
        let log_path = self.audit_log_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| backup_io(&log_path, e))?;
        writeln!(
            file,
            "{} {action} {name} {} {detail}",
            format_rfc3339(self.clock.now()),
            path.display()
        )
        .map_err(|e| backup_io(&log_path, e))
    }
}

fn is_backup_bookkeeping(rel: &Path) -> bool {
    rel == Path::new(MANIFEST_FILE) || rel == Path::new(METADATA_FILE)
}

/// Recomputes every checksum in the snapshot's manifest.
pub fn verify_manifest(snapshot: &Path) -> Result<(), SongbirdError> {
    let manifest_path = snapshot.join(MANIFEST_FILE);
    let manifest = fs::read_to_string(&manifest_path).map_err(|e| backup_io(&manifest_path, e))?;
    for line in manifest.lines().filter(|line| !line.trim().is_empty()) {
        let Some((expected, rel)) = line.split_once("  ") else {
            return Err(SongbirdError::Backup(format!("malformed manifest line: {line}")));
        };
        let actual = sha256_file(&snapshot.join(rel))?;
        if actual != expected {
            return Err(SongbirdError::Backup(format!(
                "checksum mismatch for {rel} in {}",
                snapshot.display()
            )));
        }
    }
    Ok(())
}

pub fn sha256_file(path: &Path) -> Result<String, SongbirdError> {
    let mut file = fs::File::open(path).map_err(|e| backup_io(path, e))?;
    let mut digest = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|e| backup_io(path, e))?;
        if read == 0 {
            break;
        }
        digest.update(&buffer[..read]);
    }
    Ok(digest
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect())
}

fn dir_is_empty(dir: &Path) -> Result<bool, SongbirdError> {
    Ok(fs::read_dir(dir)
        .map_err(|e| backup_io(dir, e))?
        .next()
        .is_none())
}

/// Relative paths of every regular file below `dir`, sorted. Anything under `skip` is ignored.
fn collect_files(dir: &Path, skip: Option<&Path>) -> Result<Vec<PathBuf>, SongbirdError> {
    let mut out = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current).map_err(|e| backup_io(&current, e))? {
            let path = entry.map_err(|e| backup_io(&current, e))?.path();
            if skip.is_some_and(|skip| path.starts_with(skip)) {
                continue;
            }
            if path.is_dir() {
                pending.push(path);
            } else if let Ok(rel) = path.strip_prefix(dir) {
                out.push(rel.to_path_buf());
            }
        }
    }
    out.sort();
    Ok(out)
}

fn manifest_path(rel: &Path) -> String {
    rel.components()
        .map(|part| part.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn backup_io(path: &Path, err: std::io::Error) -> SongbirdError {
    SongbirdError::Backup(format!("{}: {err}", path.display()))
}
