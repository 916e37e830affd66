//! Sequential, idempotent, at-least-once execution of numbered migration scripts.
//!
//! Runs as a specially-named module (see [`MIGRATION_MODULE_NAME`]). The catalog is
//! a standalone document in the module's directory (`migrations.json`), kept
//! separate from the module's own `index.json` manifest since its lifecycle —
//! appended to by operators shipping new migrations, rewritten by this driver after
//! every run — is independent of schema-version-driven code refresh.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use wait_timeout::ChildExt;

use crate::error::migration::MigrationError;

pub const MIGRATION_MODULE_NAME: &str = "_migrations";
pub const CATALOG_FILE_NAME: &str = "migrations.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationEntry {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub has_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MigrationCatalog {
    pub migrations: Vec<MigrationEntry>,
}

impl MigrationCatalog {
    pub fn load(path: &Path) -> Result<Self, MigrationError> {
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|source| MigrationError::MalformedCatalog {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    pub id: String,
    pub succeeded: bool,
}

pub struct MigrationDriver {
    default_timeout: Duration,
}

impl MigrationDriver {
    pub fn new(default_timeout_secs: u64) -> Self {
        Self {
            default_timeout: Duration::from_secs(default_timeout_secs),
        }
    }

    /// Sorts the catalog by `id` so execution order is never at the mercy of how the
    /// catalog file happened to list entries, then for each entry whose `has_run` is
    /// false: run the script, and on exit 0 mark it run and persist immediately so a
    /// later failure in this same call doesn't lose already-confirmed progress. On
    /// non-zero exit, stop — later migrations are not attempted this run, consistent
    /// with strict ascending order.
    pub fn run_pending(
        &self,
        module_dir: &Path,
        catalog_path: &Path,
    ) -> Result<Vec<MigrationOutcome>, MigrationError> {
        let mut catalog = MigrationCatalog::load(catalog_path)?;
        catalog.migrations.sort_by(|a, b| a.id.cmp(&b.id));
        let mut outcomes = Vec::new();

        for index in 0..catalog.migrations.len() {
            if catalog.migrations[index].has_run {
                continue;
            }
            let id = catalog.migrations[index].id.clone();
            let script_path = module_dir.join("src").join(&id);
            if !script_path.exists() {
                return Err(MigrationError::ScriptMissing {
                    id,
                    path: script_path,
                });
            }

            let succeeded = self.run_script(&id, &script_path)?;
            outcomes.push(MigrationOutcome {
                id: id.clone(),
                succeeded,
            });

            if succeeded {
                catalog.migrations[index].has_run = true;
                write_catalog(catalog_path, &catalog)?;
            } else {
                // Retried on the next orchestrator run; do not attempt later
                // migrations in this run.
                break;
            }
        }

        Ok(outcomes)
    }

    fn run_script(&self, id: &str, script_path: &Path) -> Result<bool, MigrationError> {
        let mut child = Command::new(script_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let status = match child.wait_timeout(self.default_timeout)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(MigrationError::TimedOut {
                    id: id.to_string(),
                    timeout_secs: self.default_timeout.as_secs(),
                });
            }
        };

        if !status.success() {
            if let Some(mut stdout) = child.stdout.take() {
                let mut buf = String::new();
                use std::io::Read;
                let _ = stdout.read_to_string(&mut buf);
                tracing::error!(migration = id, "stdout: {buf}");
            }
            if let Some(mut stderr) = child.stderr.take() {
                let mut buf = String::new();
                use std::io::Read;
                let _ = stderr.read_to_string(&mut buf);
                tracing::error!(migration = id, "stderr: {buf}");
            }
            return Ok(false);
        }

        Ok(true)
    }
}

fn write_catalog(path: &Path, catalog: &MigrationCatalog) -> Result<(), MigrationError> {
    let dir = path.parent().expect("catalog path has a parent");
    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, catalog).map_err(std::io::Error::from)?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

pub fn script_id(n: u32) -> String {
    format!("{n:08}")
}
