//! Loads module manifests from the installed and staging module trees and exposes
//! enablement, ordering, and atomic manifest edits.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;

use crate::error::registry::{ManifestError, RegistryError};
use crate::version::Version;

pub const MANIFEST_FILE_NAME: &str = "index.json";

/// Databases declared in a module's backup set are dumped/restored through the
/// subprocess contract for the engine they declare, never through a bespoke code
/// path.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatabaseEngine {
    RelationalA,
    RelationalB,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DatabaseDeclaration {
    pub name: String,
    #[serde(rename = "type")]
    pub engine: DatabaseEngine,
}

/// The set of files/services/databases the orchestrator hands to
/// `StateManager::backup` before running this module.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackupDeclaration {
    #[serde(default)]
    pub files: Vec<PathBuf>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub databases: Vec<DatabaseDeclaration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ManifestMetadata {
    pub schema_version: Version,
    #[serde(default)]
    pub content_version: Option<Version>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub components: BTreeMap<String, bool>,
    #[serde(default)]
    pub backup: BackupDeclaration,
}

impl ManifestMetadata {
    pub fn effective_priority(&self) -> i64 {
        self.priority.unwrap_or(100)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub metadata: ManifestMetadata,
    #[serde(default)]
    pub config: Value,
}

impl Manifest {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let raw = fs::read_to_string(path).map_err(|_| ManifestError::Missing {
            path: path.to_path_buf(),
        })?;
        serde_json::from_str(&raw).map_err(|source| ManifestError::Malformed {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// One module directory under a modules root: `<root>/<name>/index.json` plus an
/// executable entry point and optional `src/`.
#[derive(Debug, Clone)]
pub struct ModuleDir {
    pub manifest: Manifest,
    pub path: PathBuf,
}

impl ModuleDir {
    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(MANIFEST_FILE_NAME)
    }

    /// Finds `index.<ext>` in the module directory (any extension); a module with no
    /// entry point is ignored by the registry, per the design's module-side CLI
    /// contract.
    pub fn entry_point(&self) -> Option<PathBuf> {
        fs::read_dir(&self.path)
            .ok()?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .find(|p| {
                p.file_stem().and_then(|s| s.to_str()) == Some("index")
                    && p.extension().and_then(|e| e.to_str()) != Some("json")
            })
    }
}

fn load_modules_root(root: &Path) -> Result<Vec<ModuleDir>, ManifestError> {
    let mut modules = Vec::new();
    let mut seen = std::collections::BTreeSet::new();

    if !root.exists() {
        return Ok(modules);
    }

    let mut entries: Vec<_> = fs::read_dir(root)?
        .filter_map(Result::ok)
        .filter(|e| e.path().is_dir())
        .collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let dir_path = entry.path();
        let dir_name = entry.file_name().to_string_lossy().into_owned();
        let manifest_path = dir_path.join(MANIFEST_FILE_NAME);

        if !manifest_path.exists() {
            // No manifest: silently excluded, per the spec's "parse errors disable
            // the module" rule extended to absence.
            continue;
        }

        let manifest = match Manifest::load(&manifest_path) {
            Ok(manifest) => manifest,
            Err(_) => continue,
        };

        if manifest.metadata.name != dir_name {
            tracing::warn!(
                dir_name,
                name = manifest.metadata.name,
                "manifest name does not match its directory; module excluded from this run"
            );
            continue;
        }

        if !seen.insert(manifest.metadata.name.clone()) {
            tracing::warn!(
                name = manifest.metadata.name,
                "duplicate module name; module excluded from this run"
            );
            continue;
        }

        modules.push(ModuleDir {
            manifest,
            path: dir_path,
        });
    }

    Ok(modules)
}

pub struct ModuleRegistry {
    installed_root: PathBuf,
    staging_root: PathBuf,
    installed: Vec<ModuleDir>,
    staging: Vec<ModuleDir>,
}

impl ModuleRegistry {
    pub fn load(installed_root: &Path, staging_root: &Path) -> Result<Self, RegistryError> {
        let installed = load_modules_root(installed_root)?;
        let staging = load_modules_root(staging_root)?;
        Ok(Self {
            installed_root: installed_root.to_path_buf(),
            staging_root: staging_root.to_path_buf(),
            installed,
            staging,
        })
    }

    pub fn list_installed(&self) -> &[ModuleDir] {
        &self.installed
    }

    pub fn list_upstream(&self) -> &[ModuleDir] {
        &self.staging
    }

    pub fn get(&self, name: &str) -> Option<&ModuleDir> {
        self.installed.iter().find(|m| m.manifest.name() == name)
    }

    /// Ordered by `priority` ascending then `name` ascending; disabled modules
    /// excluded.
    pub fn enabled_modules(&self) -> Vec<&ModuleDir> {
        self.installed
            .iter()
            .filter(|m| m.manifest.metadata.enabled)
            .sorted_by(|a, b| {
                a.manifest
                    .metadata
                    .effective_priority()
                    .cmp(&b.manifest.metadata.effective_priority())
                    .then_with(|| a.manifest.name().cmp(b.manifest.name()))
            })
            .collect()
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<(), RegistryError> {
        self.rewrite(name, |value| {
            value["metadata"]["enabled"] = Value::Bool(enabled);
        })?;
        self.reload_installed()
    }

    pub fn set_component_enabled(
        &mut self,
        name: &str,
        component: &str,
        enabled: bool,
    ) -> Result<(), RegistryError> {
        let module = self
            .get(name)
            .ok_or_else(|| RegistryError::UnknownModule(name.to_string()))?;
        if !module.manifest.metadata.components.contains_key(component) {
            return Err(RegistryError::UnknownComponent {
                module: name.to_string(),
                component: component.to_string(),
            });
        }

        self.rewrite(name, |value| {
            value["metadata"]["components"][component] = Value::Bool(enabled);
        })?;
        self.reload_installed()
    }

    /// Atomically rewrites the manifest via write-to-temp + rename, mutating raw
    /// JSON rather than round-tripping the typed struct so unknown fields survive.
    fn rewrite(
        &self,
        name: &str,
        edit: impl FnOnce(&mut Value),
    ) -> Result<(), RegistryError> {
        let module = self
            .get(name)
            .ok_or_else(|| RegistryError::UnknownModule(name.to_string()))?;
        let manifest_path = module.manifest_path();

        let raw = fs::read_to_string(&manifest_path).map_err(|_| {
            RegistryError::Manifest(ManifestError::Missing {
                path: manifest_path.clone(),
            })
        })?;
        let mut value: Value =
            serde_json::from_str(&raw).map_err(|source| {
                RegistryError::Manifest(ManifestError::Malformed {
                    path: manifest_path.clone(),
                    source,
                })
            })?;

        edit(&mut value);

        let dir = manifest_path.parent().expect("manifest has a parent dir");
        let mut tmp = NamedTempFile::new_in(dir).map_err(|source| RegistryError::Rewrite {
            path: manifest_path.clone(),
            source,
        })?;
        serde_json::to_writer_pretty(&mut tmp, &value).map_err(|source| {
            RegistryError::Manifest(ManifestError::Malformed {
                path: manifest_path.clone(),
                source,
            })
        })?;
        tmp.persist(&manifest_path)
            .map_err(|err| RegistryError::Rewrite {
                path: manifest_path.clone(),
                source: err.error,
            })?;

        Ok(())
    }

    fn reload_installed(&mut self) -> Result<(), RegistryError> {
        self.installed = load_modules_root(&self.installed_root)?;
        Ok(())
    }

    pub fn reload(&mut self) -> Result<(), RegistryError> {
        self.installed = load_modules_root(&self.installed_root)?;
        self.staging = load_modules_root(&self.staging_root)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_manifest(root: &Path, name: &str, priority: i64, enabled: bool) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        let manifest = serde_json::json!({
            "metadata": {
                "schema_version": "1.0.0",
                "name": name,
                "description": "test module",
                "enabled": enabled,
                "priority": priority,
                "components": {"feature_a": true},
            },
            "config": {},
        });
        fs::write(
            dir.join(MANIFEST_FILE_NAME),
            serde_json::to_string_pretty(&manifest).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn enabled_modules_ordered_by_priority_then_name() {
        let root = tempfile::tempdir().unwrap();
        write_manifest(root.path(), "zeta", 10, true);
        write_manifest(root.path(), "alpha", 10, true);
        write_manifest(root.path(), "beta", 5, true);
        write_manifest(root.path(), "disabled", 1, false);

        let staging = tempfile::tempdir().unwrap();
        let registry = ModuleRegistry::load(root.path(), staging.path()).unwrap();
        let names: Vec<_> = registry
            .enabled_modules()
            .iter()
            .map(|m| m.manifest.name())
            .collect();

        assert_eq!(names, vec!["beta", "alpha", "zeta"]);
    }

    #[test]
    fn set_enabled_preserves_unknown_fields() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("mod_a");
        fs::create_dir_all(&dir).unwrap();
        let manifest = serde_json::json!({
            "metadata": {
                "schema_version": "1.0.0",
                "name": "mod_a",
                "enabled": false,
                "components": {},
            },
            "config": {"custom_field": "kept"},
            "extra_top_level": "also kept",
        });
        fs::write(
            dir.join(MANIFEST_FILE_NAME),
            serde_json::to_string_pretty(&manifest).unwrap(),
        )
        .unwrap();

        let staging = tempfile::tempdir().unwrap();
        let mut registry = ModuleRegistry::load(root.path(), staging.path()).unwrap();
        registry.set_enabled("mod_a", true).unwrap();

        let raw = fs::read_to_string(dir.join(MANIFEST_FILE_NAME)).unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["metadata"]["enabled"], Value::Bool(true));
        assert_eq!(value["config"]["custom_field"], "kept");
        assert_eq!(value["extra_top_level"], "also kept");
    }

    #[test]
    fn name_mismatch_between_directory_and_manifest_excludes_only_that_module() {
        let root = tempfile::tempdir().unwrap();
        let mismatched = root.path().join("dir_name");
        fs::create_dir_all(&mismatched).unwrap();
        let manifest = serde_json::json!({
            "metadata": {
                "schema_version": "1.0.0",
                "name": "different_name",
                "enabled": true,
            },
        });
        fs::write(
            mismatched.join(MANIFEST_FILE_NAME),
            serde_json::to_string_pretty(&manifest).unwrap(),
        )
        .unwrap();
        write_manifest(root.path(), "good_module", 100, true);

        let staging = tempfile::tempdir().unwrap();
        let registry = ModuleRegistry::load(root.path(), staging.path()).unwrap();

        assert!(registry.get("different_name").is_none());
        assert!(registry.get("good_module").is_some());
    }

    #[test]
    fn set_component_enabled_rejects_unknown_component() {
        let root = tempfile::tempdir().unwrap();
        write_manifest(root.path(), "mod_a", 100, true);
        let staging = tempfile::tempdir().unwrap();
        let mut registry = ModuleRegistry::load(root.path(), staging.path()).unwrap();

        let result = registry.set_component_enabled("mod_a", "does_not_exist", true);
        assert!(matches!(result, Err(RegistryError::UnknownComponent { .. })));
    }
}
