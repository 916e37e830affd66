//! Per-module single-slot backup/restore of files, service states, and databases.
//!
//! All operations are keyed by module name and serialized by the orchestrator's
//! global run lock; this type does no internal locking of its own. Service control
//! and database dump/restore are behind small traits (`ServiceController`,
//! `DatabaseBackend`) so the fixed files→services→databases ordering and the
//! single-slot invariant can be exercised in tests without `systemctl`, `pg_dump`, or
//! `mysqldump` actually being present.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::error::state_manager::{BackupError, RestoreError, RestoreStep};
use crate::module_registry::{DatabaseDeclaration, DatabaseEngine};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub unit: String,
    pub enabled: bool,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupInfo {
    pub module: String,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub files: Vec<PathBuf>,
    pub services: Vec<ServiceSnapshot>,
    pub databases: Vec<DatabaseDeclaration>,
    pub checksum: String,
}

pub trait ServiceController: Send + Sync {
    fn is_enabled(&self, unit: &str) -> Result<bool, BackupError>;
    fn is_active(&self, unit: &str) -> Result<bool, BackupError>;
    fn set_enabled(&self, unit: &str, enabled: bool) -> Result<(), RestoreError>;
    fn set_active(&self, unit: &str, active: bool) -> Result<(), RestoreError>;
}

pub struct SystemctlController;

impl ServiceController for SystemctlController {
    fn is_enabled(&self, unit: &str) -> Result<bool, BackupError> {
        Ok(run_ok("systemctl", &["is-enabled", "--quiet", unit]))
    }

    fn is_active(&self, unit: &str) -> Result<bool, BackupError> {
        Ok(run_ok("systemctl", &["is-active", "--quiet", unit]))
    }

    fn set_enabled(&self, unit: &str, enabled: bool) -> Result<(), RestoreError> {
        let verb = if enabled { "enable" } else { "disable" };
        require_ok("systemctl", &[verb, unit])
    }

    fn set_active(&self, unit: &str, active: bool) -> Result<(), RestoreError> {
        let verb = if active { "start" } else { "stop" };
        require_ok("systemctl", &[verb, unit])
    }
}

fn run_ok(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn require_ok(program: &str, args: &[&str]) -> Result<(), RestoreError> {
    let status = Command::new(program).args(args).status();
    match status {
        Ok(s) if s.success() => Ok(()),
        Ok(s) => Err(RestoreError::Step {
            module: String::new(),
            step: RestoreStep::Services,
            reason: format!("`{program} {}` exited with {s:?}", args.join(" ")),
        }),
        Err(err) => Err(RestoreError::Step {
            module: String::new(),
            step: RestoreStep::Services,
            reason: err.to_string(),
        }),
    }
}

pub trait DatabaseBackend: Send + Sync {
    fn dump(&self, decl: &DatabaseDeclaration, dest: &Path) -> Result<(), BackupError>;
    fn restore(&self, decl: &DatabaseDeclaration, dump: &Path) -> Result<(), RestoreError>;
}

/// Shells out to `pg_dump`/`pg_restore` for relational-A (PostgreSQL) and
/// `mysqldump`/`mysql` for relational-B (MySQL/MariaDB), through the same
/// subprocess contract the rest of the crate uses.
pub struct ShellDatabaseBackend;

impl DatabaseBackend for ShellDatabaseBackend {
    fn dump(&self, decl: &DatabaseDeclaration, dest: &Path) -> Result<(), BackupError> {
        let status = match decl.engine {
            DatabaseEngine::RelationalA => Command::new("pg_dump")
                .args(["--format=custom", "--file", &dest.to_string_lossy(), &decl.name])
                .status(),
            DatabaseEngine::RelationalB => {
                let file = fs::File::create(dest).map_err(|source| BackupError::DatabaseDump {
                    module: String::new(),
                    database: decl.name.clone(),
                    reason: source.to_string(),
                })?;
                Command::new("mysqldump")
                    .arg(&decl.name)
                    .stdout(file)
                    .status()
            }
        };
        match status {
            Ok(s) if s.success() => Ok(()),
            Ok(s) => Err(BackupError::DatabaseDump {
                module: String::new(),
                database: decl.name.clone(),
                reason: format!("dump exited with {s:?}"),
            }),
            Err(err) => Err(BackupError::DatabaseDump {
                module: String::new(),
                database: decl.name.clone(),
                reason: err.to_string(),
            }),
        }
    }

    fn restore(&self, decl: &DatabaseDeclaration, dump: &Path) -> Result<(), RestoreError> {
        let status = match decl.engine {
            DatabaseEngine::RelationalA => Command::new("pg_restore")
                .args(["--clean", "--dbname", &decl.name, &dump.to_string_lossy()])
                .status(),
            DatabaseEngine::RelationalB => {
                let file = fs::File::open(dump)?;
                Command::new("mysql").arg(&decl.name).stdin(file).status()
            }
        };
        match status {
            Ok(s) if s.success() => Ok(()),
            Ok(s) => Err(RestoreError::Step {
                module: String::new(),
                step: RestoreStep::Databases,
                reason: format!("restore of `{}` exited with {s:?}", decl.name),
            }),
            Err(err) => Err(RestoreError::Step {
                module: String::new(),
                step: RestoreStep::Databases,
                reason: err.to_string(),
            }),
        }
    }
}

pub struct StateManager {
    backups_root: PathBuf,
    services: Box<dyn ServiceController>,
    databases: Box<dyn DatabaseBackend>,
}

impl StateManager {
    pub fn new(backups_root: &Path) -> Self {
        Self::with_backends(
            backups_root,
            Box::new(SystemctlController),
            Box::new(ShellDatabaseBackend),
        )
    }

    pub fn with_backends(
        backups_root: &Path,
        services: Box<dyn ServiceController>,
        databases: Box<dyn DatabaseBackend>,
    ) -> Self {
        Self {
            backups_root: backups_root.to_path_buf(),
            services,
            databases,
        }
    }

    fn slot_dir(&self, module: &str) -> PathBuf {
        self.backups_root.join(format!("{module}_backup"))
    }

    fn index_path(&self) -> PathBuf {
        self.backups_root.join("module_backups.json")
    }

    pub fn backup(
        &self,
        module: &str,
        description: &str,
        files: &[PathBuf],
        services: &[String],
        databases: &[DatabaseDeclaration],
    ) -> Result<(), BackupError> {
        let slot = self.slot_dir(module);

        if slot.exists() {
            fs::remove_dir_all(&slot)?;
        }

        let result = self.write_slot(module, &slot, description, files, services, databases);
        if result.is_err() {
            let _ = fs::remove_dir_all(&slot);
        }
        result
    }

    fn write_slot(
        &self,
        module: &str,
        slot: &Path,
        description: &str,
        files: &[PathBuf],
        services: &[String],
        databases: &[DatabaseDeclaration],
    ) -> Result<(), BackupError> {
        let files_root = slot.join("files");
        fs::create_dir_all(&files_root)?;

        for path in files {
            copy_into_shadow(path, &files_root).map_err(|source| BackupError::CopyFile {
                module: module.to_string(),
                path: path.clone(),
                source,
            })?;
        }

        let mut service_snapshots = Vec::with_capacity(services.len());
        for unit in services {
            let enabled = self.services.is_enabled(unit).map_err(|_| BackupError::ServiceSnapshot {
                module: module.to_string(),
                unit: unit.clone(),
                source: std::io::Error::other("systemctl is-enabled failed"),
            })?;
            let active = self.services.is_active(unit).map_err(|_| BackupError::ServiceSnapshot {
                module: module.to_string(),
                unit: unit.clone(),
                source: std::io::Error::other("systemctl is-active failed"),
            })?;
            service_snapshots.push(ServiceSnapshot {
                unit: unit.clone(),
                enabled,
                active,
            });
        }
        let services_json = slot.join("services.json");
        fs::write(&services_json, serde_json::to_string_pretty(&service_snapshots).unwrap())?;

        let databases_root = slot.join("databases");
        fs::create_dir_all(&databases_root)?;
        for (i, decl) in databases.iter().enumerate() {
            let ext = match decl.engine {
                DatabaseEngine::RelationalA => "dump",
                DatabaseEngine::RelationalB => "sql",
            };
            let dest = databases_root.join(format!("db_{i}.{ext}"));
            self.databases.dump(decl, &dest).map_err(|err| match err {
                BackupError::DatabaseDump { database, reason, .. } => BackupError::DatabaseDump {
                    module: module.to_string(),
                    database,
                    reason,
                },
                other => other,
            })?;
        }

        let checksum = checksum_payload(slot)?;

        let info = BackupInfo {
            module: module.to_string(),
            timestamp: Utc::now(),
            description: description.to_string(),
            files: files.to_vec(),
            services: service_snapshots,
            databases: databases.to_vec(),
            checksum,
        };

        let info_path = slot.join("info.json");
        fs::write(&info_path, serde_json::to_string_pretty(&info).unwrap()).map_err(|source| {
            BackupError::WriteManifest {
                module: module.to_string(),
                source,
            }
        })?;

        self.update_index(&info)?;

        Ok(())
    }

    fn update_index(&self, info: &BackupInfo) -> Result<(), BackupError> {
        let mut index = self.read_index();
        index.insert(info.module.clone(), info.clone());
        self.write_index(&index)
    }

    fn read_index(&self) -> BTreeMap<String, BackupInfo> {
        fs::read_to_string(self.index_path())
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn write_index(&self, index: &BTreeMap<String, BackupInfo>) -> Result<(), BackupError> {
        fs::create_dir_all(&self.backups_root)?;
        let mut tmp = NamedTempFile::new_in(&self.backups_root)?;
        serde_json::to_writer_pretty(&mut tmp, index).map_err(std::io::Error::from)?;
        tmp.persist(self.index_path()).map_err(|err| err.error)?;
        Ok(())
    }

    pub fn restore(&self, module: &str) -> Result<(), RestoreError> {
        let slot = self.slot_dir(module);
        if !slot.exists() {
            return Err(RestoreError::NotFound {
                module: module.to_string(),
            });
        }

        let info: BackupInfo = serde_json::from_str(&fs::read_to_string(slot.join("info.json"))?)
            .map_err(|_| RestoreError::NotFound {
                module: module.to_string(),
            })?;

        let actual = checksum_payload(&slot)?;
        if actual != info.checksum {
            return Err(RestoreError::ChecksumMismatch {
                module: module.to_string(),
                expected: info.checksum,
                actual,
            });
        }

        self.restore_files(module, &slot, &info)?;
        self.restore_services(module, &info)?;
        self.restore_databases(module, &slot, &info)?;

        Ok(())
    }

    fn restore_files(&self, module: &str, slot: &Path, info: &BackupInfo) -> Result<(), RestoreError> {
        let files_root = slot.join("files");
        for path in &info.files {
            restore_from_shadow(path, &files_root).map_err(|source| RestoreError::Step {
                module: module.to_string(),
                step: RestoreStep::Files,
                reason: source.to_string(),
            })?;
        }
        Ok(())
    }

    fn restore_services(&self, module: &str, info: &BackupInfo) -> Result<(), RestoreError> {
        for snapshot in &info.services {
            self.services
                .set_enabled(&snapshot.unit, snapshot.enabled)
                .map_err(|err| retag_step(err, module, RestoreStep::Services))?;
            self.services
                .set_active(&snapshot.unit, snapshot.active)
                .map_err(|err| retag_step(err, module, RestoreStep::Services))?;
        }
        Ok(())
    }

    fn restore_databases(&self, module: &str, slot: &Path, info: &BackupInfo) -> Result<(), RestoreError> {
        let databases_root = slot.join("databases");
        for (i, decl) in info.databases.iter().enumerate() {
            let ext = match decl.engine {
                DatabaseEngine::RelationalA => "dump",
                DatabaseEngine::RelationalB => "sql",
            };
            let dump = databases_root.join(format!("db_{i}.{ext}"));
            self.databases
                .restore(decl, &dump)
                .map_err(|err| retag_step(err, module, RestoreStep::Databases))?;
        }
        Ok(())
    }

    pub fn has_backup(&self, module: &str) -> bool {
        self.slot_dir(module).exists()
    }

    pub fn get_info(&self, module: &str) -> Option<BackupInfo> {
        let slot = self.slot_dir(module);
        let raw = fs::read_to_string(slot.join("info.json")).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn list(&self) -> BTreeMap<String, BackupInfo> {
        self.read_index()
    }

    pub fn purge(&self, module: &str) -> bool {
        let slot = self.slot_dir(module);
        if !slot.exists() {
            return false;
        }
        if fs::remove_dir_all(&slot).is_err() {
            return false;
        }
        let mut index = self.read_index();
        index.remove(module);
        let _ = self.write_index(&index);
        true
    }
}

fn retag_step(err: RestoreError, module: &str, step: RestoreStep) -> RestoreError {
    match err {
        RestoreError::Step { reason, .. } => RestoreError::Step {
            module: module.to_string(),
            step,
            reason,
        },
        other => other,
    }
}

fn copy_into_shadow(path: &Path, files_root: &Path) -> std::io::Result<()> {
    let rel = path.strip_prefix("/").unwrap_or(path);
    if path.is_dir() {
        for entry in walkdir::WalkDir::new(path) {
            let entry = entry.map_err(std::io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let entry_rel = entry.path().strip_prefix("/").unwrap_or(entry.path());
            let dest = files_root.join(entry_rel);
            fs::create_dir_all(dest.parent().expect("dest has a parent"))?;
            fs::copy(entry.path(), &dest)?;
        }
    } else {
        let dest = files_root.join(rel);
        fs::create_dir_all(dest.parent().expect("dest has a parent"))?;
        fs::copy(path, &dest)?;
    }
    Ok(())
}

fn restore_from_shadow(path: &Path, files_root: &Path) -> std::io::Result<()> {
    let rel = path.strip_prefix("/").unwrap_or(path);
    let shadow = files_root.join(rel);
    if shadow.is_dir() {
        for entry in walkdir::WalkDir::new(&shadow) {
            let entry = entry.map_err(std::io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let entry_rel = entry.path().strip_prefix(&shadow).expect("entry under shadow");
            let dest = path.join(entry_rel);
            fs::create_dir_all(dest.parent().expect("dest has a parent"))?;
            fs::copy(entry.path(), &dest)?;
        }
    } else {
        fs::create_dir_all(path.parent().expect("path has a parent"))?;
        fs::copy(&shadow, path)?;
    }
    Ok(())
}

/// A deterministic hash over every regular file under `slot/files` and
/// `slot/databases`, keyed by path so shadow-tree ordering never affects the result.
fn checksum_payload(slot: &Path) -> std::io::Result<String> {
    let mut entries = Vec::new();
    for subdir in ["files", "databases"] {
        let root = slot.join(subdir);
        if !root.exists() {
            continue;
        }
        for entry in walkdir::WalkDir::new(&root) {
            let entry = entry.map_err(std::io::Error::other)?;
            if entry.file_type().is_file() {
                entries.push(entry.path().to_path_buf());
            }
        }
    }
    entries.sort();

    let mut hasher = Sha256::new();
    for path in entries {
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update(fs::read(&path)?);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeServices {
        state: Mutex<BTreeMap<String, (bool, bool)>>,
    }

    impl FakeServices {
        fn new(initial: &[(&str, bool, bool)]) -> Self {
            let mut state = BTreeMap::new();
            for (unit, enabled, active) in initial {
                state.insert(unit.to_string(), (*enabled, *active));
            }
            Self { state: Mutex::new(state) }
        }
    }

    impl ServiceController for FakeServices {
        fn is_enabled(&self, unit: &str) -> Result<bool, BackupError> {
            Ok(self.state.lock().unwrap().get(unit).map(|s| s.0).unwrap_or(false))
        }
        fn is_active(&self, unit: &str) -> Result<bool, BackupError> {
            Ok(self.state.lock().unwrap().get(unit).map(|s| s.1).unwrap_or(false))
        }
        fn set_enabled(&self, unit: &str, enabled: bool) -> Result<(), RestoreError> {
            self.state.lock().unwrap().entry(unit.to_string()).or_insert((false, false)).0 = enabled;
            Ok(())
        }
        fn set_active(&self, unit: &str, active: bool) -> Result<(), RestoreError> {
            self.state.lock().unwrap().entry(unit.to_string()).or_insert((false, false)).1 = active;
            Ok(())
        }
    }

    struct NoDatabases;
    impl DatabaseBackend for NoDatabases {
        fn dump(&self, _decl: &DatabaseDeclaration, dest: &Path) -> Result<(), BackupError> {
            fs::write(dest, b"dump").map_err(|source| BackupError::DatabaseDump {
                module: String::new(),
                database: String::new(),
                reason: source.to_string(),
            })
        }
        fn restore(&self, _decl: &DatabaseDeclaration, _dump: &Path) -> Result<(), RestoreError> {
            Ok(())
        }
    }

    #[test]
    fn backup_then_restore_round_trips_file_bytes() {
        let root = tempfile::tempdir().unwrap();
        let backups_root = root.path().join("backups");
        let target = root.path().join("target.conf");
        fs::write(&target, "original").unwrap();

        let manager = StateManager::with_backends(
            &backups_root,
            Box::new(FakeServices::new(&[("nginx", true, true)])),
            Box::new(NoDatabases),
        );

        manager
            .backup("mod_a", "pre-update", &[target.clone()], &["nginx".to_string()], &[])
            .unwrap();

        fs::write(&target, "modified by the module").unwrap();

        manager.restore("mod_a").unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), "original");
        assert!(manager.has_backup("mod_a"));
    }

    #[test]
    fn single_slot_invariant_new_backup_clobbers_previous() {
        let root = tempfile::tempdir().unwrap();
        let backups_root = root.path().join("backups");
        let file_a = root.path().join("a.txt");
        let file_b = root.path().join("b.txt");
        fs::write(&file_a, "a").unwrap();
        fs::write(&file_b, "b").unwrap();

        let manager = StateManager::with_backends(&backups_root, Box::new(FakeServices::new(&[])), Box::new(NoDatabases));
        manager.backup("mod_a", "first", &[file_a.clone()], &[], &[]).unwrap();
        manager.backup("mod_a", "second", &[file_b.clone()], &[], &[]).unwrap();

        let info = manager.get_info("mod_a").unwrap();
        assert_eq!(info.description, "second");
        assert_eq!(info.files, vec![file_b]);
    }

    #[test]
    fn restore_without_backup_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let manager = StateManager::with_backends(
            &root.path().join("backups"),
            Box::new(FakeServices::new(&[])),
            Box::new(NoDatabases),
        );
        let result = manager.restore("never_backed_up");
        assert!(matches!(result, Err(RestoreError::NotFound { .. })));
    }

    #[test]
    fn restore_detects_tampered_shadow_payload() {
        let root = tempfile::tempdir().unwrap();
        let backups_root = root.path().join("backups");
        let target = root.path().join("target.conf");
        fs::write(&target, "original").unwrap();

        let manager = StateManager::with_backends(&backups_root, Box::new(FakeServices::new(&[])), Box::new(NoDatabases));
        manager.backup("mod_a", "pre-update", &[target.clone()], &[], &[]).unwrap();

        let shadow_path = backups_root
            .join("mod_a_backup")
            .join("files")
            .join(target.strip_prefix("/").unwrap_or(&target));
        fs::write(&shadow_path, "tampered").unwrap();

        let result = manager.restore("mod_a");
        assert!(matches!(result, Err(RestoreError::ChecksumMismatch { .. })));
    }

    #[test]
    fn purge_removes_slot_and_index_entry() {
        let root = tempfile::tempdir().unwrap();
        let backups_root = root.path().join("backups");
        let target = root.path().join("target.conf");
        fs::write(&target, "original").unwrap();

        let manager = StateManager::with_backends(&backups_root, Box::new(FakeServices::new(&[])), Box::new(NoDatabases));
        manager.backup("mod_a", "pre-update", &[target], &[], &[]).unwrap();
        assert!(manager.purge("mod_a"));
        assert!(!manager.has_backup("mod_a"));
        assert!(!manager.list().contains_key("mod_a"));
    }
}
