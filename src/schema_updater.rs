//! Detects modules whose on-disk `schema_version` lags the staging tree and
//! atomically refreshes their code.
//!
//! Atomicity is rename-aside / rename-in / remove-old, reverting on a failed
//! rename-in, per the design. `content_version` is never read or written here — it's
//! the module's own business during execution.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::schema::SchemaUpdaterError;
use crate::module_registry::ModuleDir;
use crate::state_manager::StateManager;

/// The orchestrator's own reserved module name; a refresh of this module sets
/// [`RefreshRecord::requires_self_restart`].
pub const ORCHESTRATOR_MODULE_NAME: &str = "_orchestrator";

pub struct RefreshRecord {
    pub module: String,
    pub from_version: crate::version::Version,
    pub to_version: crate::version::Version,
    pub requires_self_restart: bool,
}

pub struct SchemaUpdater<'a> {
    state_manager: &'a StateManager,
}

impl<'a> SchemaUpdater<'a> {
    pub fn new(state_manager: &'a StateManager) -> Self {
        Self { state_manager }
    }

    /// Returns the modules that would be refreshed without touching disk, for
    /// `--check` mode.
    pub fn plan<'m>(&self, installed: &'m [ModuleDir], staging: &'m [ModuleDir]) -> Vec<(&'m ModuleDir, &'m ModuleDir)> {
        installed
            .iter()
            .filter_map(|installed_module| {
                let staging_module = staging
                    .iter()
                    .find(|m| m.manifest.name() == installed_module.manifest.name())?;
                if staging_module.manifest.metadata.schema_version
                    > installed_module.manifest.metadata.schema_version
                {
                    Some((installed_module, staging_module))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Applies every pending refresh from [`Self::plan`], each one backed up and
    /// atomically swapped independently so a failure on one module never affects
    /// another.
    pub fn apply(
        &self,
        installed: &[ModuleDir],
        staging: &[ModuleDir],
    ) -> Vec<Result<RefreshRecord, SchemaUpdaterError>> {
        self.plan(installed, staging)
            .into_iter()
            .map(|(installed_module, staging_module)| {
                self.refresh_one(installed_module, staging_module)
            })
            .collect()
    }

    fn refresh_one(
        &self,
        installed_module: &ModuleDir,
        staging_module: &ModuleDir,
    ) -> Result<RefreshRecord, SchemaUpdaterError> {
        let name = installed_module.manifest.name().to_string();
        let installed_path = installed_module.path.clone();
        let staging_path = staging_module.path.clone();

        self.state_manager
            .backup(
                &name,
                "pre-schema-refresh",
                &[installed_path.clone()],
                &[],
                &[],
            )
            .map_err(SchemaUpdaterError::Backup)?;

        let aside = aside_path(&installed_path);

        fs::rename(&installed_path, &aside).map_err(|source| SchemaUpdaterError::RenameAside {
            module: name.clone(),
            source,
        })?;

        match fs::rename(&staging_path, &installed_path) {
            Ok(()) => {}
            Err(source) => {
                // Revert: put the original back where it was.
                let _ = fs::rename(&aside, &installed_path);
                return Err(SchemaUpdaterError::RenameIn {
                    module: name.clone(),
                    source,
                });
            }
        }

        if aside.exists() {
            fs::remove_dir_all(&aside).map_err(|_| SchemaUpdaterError::RemoveStale {
                module: name.clone(),
                path: aside.clone(),
            })?;
        }

        Ok(RefreshRecord {
            requires_self_restart: name == ORCHESTRATOR_MODULE_NAME,
            module: name,
            from_version: installed_module.manifest.metadata.schema_version,
            to_version: staging_module.manifest.metadata.schema_version,
        })
    }
}

fn aside_path(installed_path: &Path) -> PathBuf {
    let mut os_string = installed_path.as_os_str().to_os_string();
    os_string.push(".aside");
    PathBuf::from(os_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module_registry::{Manifest, ManifestMetadata};
    use crate::state_manager::{DatabaseBackend, ServiceController};
    use crate::version::Version;
    use std::fs;

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

    fn module(root: &Path, name: &str, version: &str) -> ModuleDir {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("marker.txt"), name).unwrap();
        ModuleDir {
            manifest: Manifest {
                metadata: ManifestMetadata {
                    schema_version: version.parse::<Version>().unwrap(),
                    content_version: None,
                    name: name.to_string(),
                    description: String::new(),
                    enabled: true,
                    priority: None,
                    components: Default::default(),
                    backup: Default::default(),
                },
                config: serde_json::Value::Null,
            },
            path: dir,
        }
    }

    #[test]
    fn plan_selects_only_modules_with_a_higher_staging_schema_version() {
        let root = tempfile::tempdir().unwrap();
        let installed = vec![module(&root.path().join("installed"), "a", "1.0.0")];
        let staging = vec![module(&root.path().join("staging"), "a", "1.1.0")];

        let sm = StateManager::with_backends(
            &root.path().join("backups"),
            Box::new(NoServices),
            Box::new(NoDatabases),
        );
        let updater = SchemaUpdater::new(&sm);
        let plan = updater.plan(&installed, &staging);
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn apply_swaps_installed_directory_contents_with_staging() {
        let root = tempfile::tempdir().unwrap();
        let installed = vec![module(&root.path().join("installed"), "a", "1.0.0")];
        let staging = vec![module(&root.path().join("staging"), "a", "1.1.0")];
        fs::write(staging[0].path.join("marker.txt"), "new content").unwrap();

        let sm = StateManager::with_backends(
            &root.path().join("backups"),
            Box::new(NoServices),
            Box::new(NoDatabases),
        );
        let updater = SchemaUpdater::new(&sm);
        let results = updater.apply(&installed, &staging);

        assert_eq!(results.len(), 1);
        let record = results.into_iter().next().unwrap().unwrap();
        assert_eq!(record.module, "a");
        assert!(!record.requires_self_restart);

        let contents = fs::read_to_string(installed[0].path.join("marker.txt")).unwrap();
        assert_eq!(contents, "new content");
    }

    #[test]
    fn orchestrator_module_name_sets_requires_self_restart() {
        let root = tempfile::tempdir().unwrap();
        let installed = vec![module(&root.path().join("installed"), ORCHESTRATOR_MODULE_NAME, "1.0.0")];
        let staging = vec![module(&root.path().join("staging"), ORCHESTRATOR_MODULE_NAME, "2.0.0")];

        let sm = StateManager::with_backends(
            &root.path().join("backups"),
            Box::new(NoServices),
            Box::new(NoDatabases),
        );
        let updater = SchemaUpdater::new(&sm);
        let record = updater.apply(&installed, &staging).remove(0).unwrap();
        assert!(record.requires_self_restart);
    }
}
