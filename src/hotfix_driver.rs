//! Pool-based atomic file replacement with per-pool closure validation and
//! rollback, also a specially-named module. Configuration lives in a standalone
//! `hotfixes.json` alongside the module, for the same reason the migration catalog
//! is standalone: operator-appended lifecycle, independent of schema refresh.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::error::hotfix::HotfixError;
use crate::state_manager::StateManager;

pub const HOTFIX_MODULE_NAME: &str = "_hotfixes";
pub const HOTFIX_CONFIG_FILE_NAME: &str = "hotfixes.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotfixOperation {
    pub source: PathBuf,
    pub destination: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotfixPool {
    pub id: String,
    pub description: String,
    pub operations: Vec<HotfixOperation>,
    pub closure: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HotfixConfig {
    pub pools: Vec<HotfixPool>,
    #[serde(rename = "finalClosure", default)]
    pub final_closure: Vec<String>,
}

impl HotfixConfig {
    pub fn load(path: &Path) -> Result<Self, HotfixError> {
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|source| HotfixError::MalformedConfig {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PoolOutcome {
    pub pool_id: String,
    pub succeeded: bool,
}

pub struct HotfixDriver<'a> {
    state_manager: &'a StateManager,
}

impl<'a> HotfixDriver<'a> {
    pub fn new(state_manager: &'a StateManager) -> Self {
        Self { state_manager }
    }

    pub fn synthetic_module_name(pool_id: &str) -> String {
        format!("hotfix_pool_{pool_id}")
    }

    /// Runs every pool in manifest order, then `final_closure` iff every pool
    /// succeeded. A pool's failure never stops later pools from being attempted.
    pub fn run(&self, module_src: &Path, config: &HotfixConfig) -> Vec<PoolOutcome> {
        let mut outcomes = Vec::with_capacity(config.pools.len());
        let mut all_succeeded = true;

        for pool in &config.pools {
            let succeeded = self.run_pool(module_src, pool);
            all_succeeded &= succeeded;
            outcomes.push(PoolOutcome {
                pool_id: pool.id.clone(),
                succeeded,
            });
        }

        if all_succeeded {
            for command in &config.final_closure {
                if !run_shell(command) {
                    tracing::error!(command, "finalClosure command failed");
                }
            }
        }

        outcomes
    }

    fn run_pool(&self, module_src: &Path, pool: &HotfixPool) -> bool {
        let synthetic = Self::synthetic_module_name(&pool.id);
        let destinations: Vec<PathBuf> = pool.operations.iter().map(|op| op.destination.clone()).collect();

        if let Err(err) = self.state_manager.backup(&synthetic, &pool.description, &destinations, &[], &[]) {
            tracing::error!(pool = pool.id, error = %err, "failed to back up pool before applying");
            return false;
        }

        if let Err(err) = self.apply_operations(module_src, pool) {
            tracing::error!(pool = pool.id, error = %err, "failed to apply pool operations");
            self.rollback(&synthetic, pool);
            return false;
        }

        if !pool.closure.iter().all(|command| run_shell(command)) {
            tracing::error!(pool = pool.id, "pool closure failed, rolling back");
            self.rollback(&synthetic, pool);
            return false;
        }

        true
    }

    fn apply_operations(&self, module_src: &Path, pool: &HotfixPool) -> Result<(), HotfixError> {
        for op in &pool.operations {
            let source = module_src.join(&op.source);
            let existing_mode = fs::metadata(&op.destination).ok().map(|m| {
                use std::os::unix::fs::PermissionsExt;
                m.permissions().mode()
            });

            fs::copy(&source, &op.destination).map_err(|source_err| HotfixError::CopyOperation {
                pool: pool.id.clone(),
                source_path: source.clone(),
                destination: op.destination.clone(),
                source: source_err,
            })?;

            if let Some(mode) = existing_mode {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(&op.destination, fs::Permissions::from_mode(mode));
            }
        }
        Ok(())
    }

    /// Restores the pool's destinations to their pre-run bytes, then re-runs the
    /// closure on the restored state so the host ends up coherent rather than merely
    /// reverted.
    fn rollback(&self, synthetic: &str, pool: &HotfixPool) {
        if let Err(err) = self.state_manager.restore(synthetic) {
            tracing::error!(pool = pool.id, error = %err, "rollback restore failed; pool left inconsistent");
            return;
        }
        for command in &pool.closure {
            run_shell(command);
        }
    }
}

fn run_shell(command: &str) -> bool {
    Command::new("sh")
        .arg("-c")
        .arg(command)
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_manager::{DatabaseBackend, ServiceController};
    use std::path::Path;

    struct NoServices;
    impl ServiceController for NoServices {
        fn is_enabled(&self, _unit: &str) -> Result<bool, crate::error::state_manager::BackupError> {
            Ok(false)
        }
        fn is_active(&self, _unit: &str) -> Result<bool, crate::error::state_manager::BackupError> {
            Ok(false)
        }
        fn set_enabled(&self, _unit: &str, _enabled: bool) -> Result<(), crate::error::state_manager::RestoreError> {
            Ok(())
        }
        fn set_active(&self, _unit: &str, _active: bool) -> Result<(), crate::error::state_manager::RestoreError> {
            Ok(())
        }
    }
    struct NoDatabases;
    impl DatabaseBackend for NoDatabases {
        fn dump(
            &self,
            _decl: &crate::module_registry::DatabaseDeclaration,
            _dest: &Path,
        ) -> Result<(), crate::error::state_manager::BackupError> {
            Ok(())
        }
        fn restore(
            &self,
            _decl: &crate::module_registry::DatabaseDeclaration,
            _dump: &Path,
        ) -> Result<(), crate::error::state_manager::RestoreError> {
            Ok(())
        }
    }

    #[test]
    fn successful_pool_leaves_new_content_in_place() {
        let root = tempfile::tempdir().unwrap();
        let module_src = root.path().join("src");
        fs::create_dir_all(&module_src).unwrap();
        fs::write(module_src.join("nginx.conf"), "new config").unwrap();

        let destination = root.path().join("etc_nginx.conf");
        fs::write(&destination, "old config").unwrap();

        let sm = StateManager::with_backends(
            &root.path().join("backups"),
            Box::new(NoServices),
            Box::new(NoDatabases),
        );
        let driver = HotfixDriver::new(&sm);

        let config = HotfixConfig {
            pools: vec![HotfixPool {
                id: "website_security".into(),
                description: "patch".into(),
                operations: vec![HotfixOperation {
                    source: PathBuf::from("nginx.conf"),
                    destination: destination.clone(),
                }],
                closure: vec!["true".to_string()],
            }],
            final_closure: vec![],
        };

        let outcomes = driver.run(&module_src, &config);
        assert!(outcomes[0].succeeded);
        assert_eq!(fs::read_to_string(&destination).unwrap(), "new config");
    }

    #[test]
    fn failing_closure_rolls_back_to_pre_run_bytes() {
        let root = tempfile::tempdir().unwrap();
        let module_src = root.path().join("src");
        fs::create_dir_all(&module_src).unwrap();
        fs::write(module_src.join("nginx.conf"), "new config").unwrap();

        let destination = root.path().join("etc_nginx.conf");
        fs::write(&destination, "old config").unwrap();

        let sm = StateManager::with_backends(
            &root.path().join("backups"),
            Box::new(NoServices),
            Box::new(NoDatabases),
        );
        let driver = HotfixDriver::new(&sm);

        let config = HotfixConfig {
            pools: vec![HotfixPool {
                id: "website_security".into(),
                description: "patch".into(),
                operations: vec![HotfixOperation {
                    source: PathBuf::from("nginx.conf"),
                    destination: destination.clone(),
                }],
                closure: vec!["false".to_string()],
            }],
            final_closure: vec![],
        };

        let outcomes = driver.run(&module_src, &config);
        assert!(!outcomes[0].succeeded);
        assert_eq!(fs::read_to_string(&destination).unwrap(), "old config");
    }

    #[test]
    fn one_failed_pool_does_not_block_the_next_pool() {
        let root = tempfile::tempdir().unwrap();
        let module_src = root.path().join("src");
        fs::create_dir_all(&module_src).unwrap();
        fs::write(module_src.join("a.conf"), "a new").unwrap();
        fs::write(module_src.join("b.conf"), "b new").unwrap();

        let dest_a = root.path().join("a_dest.conf");
        let dest_b = root.path().join("b_dest.conf");
        fs::write(&dest_a, "a old").unwrap();
        fs::write(&dest_b, "b old").unwrap();

        let sm = StateManager::with_backends(
            &root.path().join("backups"),
            Box::new(NoServices),
            Box::new(NoDatabases),
        );
        let driver = HotfixDriver::new(&sm);

        let config = HotfixConfig {
            pools: vec![
                HotfixPool {
                    id: "website_security".into(),
                    description: "fails".into(),
                    operations: vec![HotfixOperation { source: "a.conf".into(), destination: dest_a.clone() }],
                    closure: vec!["false".to_string()],
                },
                HotfixPool {
                    id: "backend_config_fix".into(),
                    description: "succeeds".into(),
                    operations: vec![HotfixOperation { source: "b.conf".into(), destination: dest_b.clone() }],
                    closure: vec!["true".to_string()],
                },
            ],
            final_closure: vec![],
        };

        let outcomes = driver.run(&module_src, &config);
        assert!(!outcomes[0].succeeded);
        assert!(outcomes[1].succeeded);
        assert_eq!(fs::read_to_string(&dest_a).unwrap(), "a old");
        assert_eq!(fs::read_to_string(&dest_b).unwrap(), "b new");
    }
}
