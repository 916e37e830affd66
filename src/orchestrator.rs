//! The top-level state machine: `Start` → `Sync` → `SchemaPhase` → `ExecutePhase` →
//! `SelfUpdatePhase` → `End`, plus the migration and hotfix drivers. See the design's
//! Orchestrator section for the per-state contract this mirrors step for step.

use std::path::PathBuf;
use std::process::Command;

use uuid::Uuid;

use crate::config::RuntimeContext;
use crate::error::runner::RunnerError;
use crate::error::Error;
use crate::hotfix_driver::{HotfixConfig, HotfixDriver, HOTFIX_CONFIG_FILE_NAME, HOTFIX_MODULE_NAME};
use crate::lock::RunLock;
use crate::migration_driver::{MigrationDriver, CATALOG_FILE_NAME, MIGRATION_MODULE_NAME};
use crate::module_registry::ModuleRegistry;
use crate::module_runner::{InvokeMode, ModuleRunner};
use crate::repo_sync::RepoSync;
use crate::schema_updater::SchemaUpdater;
use crate::state_manager::StateManager;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ModuleOutcome {
    Ok,
    NoChange,
    FailedRestored,
    FailedRestoreFailed,
    Skipped,
    TimedOut,
}

impl ModuleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleOutcome::Ok => "ok",
            ModuleOutcome::NoChange => "no-change",
            ModuleOutcome::FailedRestored => "failed (restored)",
            ModuleOutcome::FailedRestoreFailed => "failed (restore failed)",
            ModuleOutcome::Skipped => "skipped",
            ModuleOutcome::TimedOut => "timed-out",
        }
    }

    /// The exit code reflects whether any of these four occurred.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ModuleOutcome::FailedRestored
                | ModuleOutcome::FailedRestoreFailed
                | ModuleOutcome::Skipped
                | ModuleOutcome::TimedOut
        )
    }
}

#[derive(Debug)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub outcomes: Vec<(String, ModuleOutcome)>,
    pub migrations_run: usize,
    pub hotfix_pools_run: usize,
    pub pending_restart: bool,
    pub orchestrator_version_legacy_marker: bool,
}

impl RunRecord {
    pub fn any_module_failed(&self) -> bool {
        self.outcomes.iter().any(|(_, outcome)| outcome.is_failure())
    }
}

pub struct Orchestrator {
    ctx: RuntimeContext,
}

impl Orchestrator {
    pub fn new(ctx: RuntimeContext) -> Self {
        Self { ctx }
    }

    /// `resume_after_schema` is set on the second invocation of a self-update
    /// handoff and skips Sync/SchemaPhase. `legacy` only sets a marker on the run
    /// record; behaviourally it is a synonym of a default run.
    pub fn run(
        &self,
        check_only: bool,
        resume_after_schema: bool,
        legacy: bool,
    ) -> Result<RunRecord, Error> {
        self.ctx.require_root()?;

        let lock = RunLock::acquire(&self.ctx.paths().lockfile)?;
        let run_id = Uuid::new_v4();
        tracing::info!(run_id = %run_id, check_only, "run starting");

        let mut registry = self.sync_and_load_registry(resume_after_schema)?;

        let state_manager = StateManager::new(&self.ctx.paths().backups_root);
        let mut pending_restart = false;

        if !resume_after_schema {
            pending_restart = self.run_schema_phase(&mut registry, &state_manager, check_only)?;
        }

        let outcomes = self.run_execute_phase(&registry, &state_manager, check_only, &mut pending_restart);

        let (migrations_run, hotfix_pools_run) = if check_only {
            (0, 0)
        } else {
            (
                self.run_migrations(&registry),
                self.run_hotfixes(&registry, &state_manager),
            )
        };

        if pending_restart && !resume_after_schema && !check_only {
            self.self_update_handoff();
        }

        drop(lock);

        Ok(RunRecord {
            run_id,
            outcomes,
            migrations_run,
            hotfix_pools_run,
            pending_restart,
            orchestrator_version_legacy_marker: legacy,
        })
    }

    fn sync_and_load_registry(&self, resume_after_schema: bool) -> Result<ModuleRegistry, Error> {
        if !resume_after_schema {
            let repo_sync = RepoSync::new();
            match repo_sync.refresh(
                &self.ctx.repo().url,
                &self.ctx.repo().branch,
                &self.ctx.paths().staging_root,
            ) {
                Ok(outcome) => {
                    tracing::info!(updated = outcome.updated, head = outcome.head, "sync complete");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "sync failed, proceeding with the installed tree only");
                }
            }
        }

        Ok(ModuleRegistry::load(
            &self.ctx.paths().modules_root(),
            &self.ctx.paths().staging_modules_root(),
        )?)
    }

    /// Returns whether any refreshed module requires a self-restart. In check mode,
    /// this reports the plan without mutating anything.
    fn run_schema_phase(
        &self,
        registry: &mut ModuleRegistry,
        state_manager: &StateManager,
        check_only: bool,
    ) -> Result<bool, Error> {
        let updater = SchemaUpdater::new(state_manager);

        if check_only {
            for (installed, staging) in updater.plan(registry.list_installed(), registry.list_upstream()) {
                tracing::info!(
                    module = installed.manifest.name(),
                    from = %installed.manifest.metadata.schema_version,
                    to = %staging.manifest.metadata.schema_version,
                    "would refresh (check mode)"
                );
            }
            return Ok(false);
        }

        let mut pending_restart = false;
        for result in updater.apply(registry.list_installed(), registry.list_upstream()) {
            match result {
                Ok(record) => {
                    tracing::info!(
                        module = record.module,
                        from = %record.from_version,
                        to = %record.to_version,
                        "refreshed module code"
                    );
                    pending_restart |= record.requires_self_restart;
                }
                Err(err) => tracing::error!(error = %err, "schema refresh failed"),
            }
        }
        registry.reload()?;
        Ok(pending_restart)
    }

    fn run_execute_phase(
        &self,
        registry: &ModuleRegistry,
        state_manager: &StateManager,
        check_only: bool,
        pending_restart: &mut bool,
    ) -> Vec<(String, ModuleOutcome)> {
        let runner = ModuleRunner::new(self.ctx.runner().module_timeout_secs);
        let mut outcomes = Vec::new();

        for module in registry.enabled_modules() {
            let name = module.manifest.name().to_string();

            let Some(entry_point) = module.entry_point() else {
                outcomes.push((name, ModuleOutcome::Skipped));
                continue;
            };

            if check_only {
                // Check mode never backs up or restores anything, so a failed check
                // is reported as Skipped rather than claiming a restore happened.
                let outcome = match runner.invoke(&name, &module.path, &entry_point, InvokeMode::Check, None) {
                    Ok(envelope) if envelope.updated.unwrap_or(false) => ModuleOutcome::Ok,
                    Ok(_) => ModuleOutcome::NoChange,
                    Err(RunnerError::TimedOut { .. }) => ModuleOutcome::TimedOut,
                    Err(_) => ModuleOutcome::Skipped,
                };
                outcomes.push((name, outcome));
                continue;
            }

            let decl = &module.manifest.metadata.backup;
            let has_declared_state = !decl.files.is_empty() || !decl.services.is_empty() || !decl.databases.is_empty();

            if has_declared_state {
                if let Err(err) =
                    state_manager.backup(&name, "pre-update", &decl.files, &decl.services, &decl.databases)
                {
                    tracing::error!(module = name, error = %err, "backup failed; skipping module");
                    outcomes.push((name, ModuleOutcome::Skipped));
                    continue;
                }
            }

            let timeout_override = module
                .manifest
                .config
                .get("timeout_seconds")
                .and_then(|v| v.as_u64());

            let result = runner.invoke(&name, &module.path, &entry_point, InvokeMode::Update, timeout_override);

            match result {
                Ok(envelope) => {
                    *pending_restart |= envelope.restart_required();
                    let outcome = if envelope.updated.unwrap_or(false) {
                        ModuleOutcome::Ok
                    } else {
                        ModuleOutcome::NoChange
                    };
                    outcomes.push((name, outcome));
                }
                Err(err) => {
                    let base_outcome = match &err {
                        RunnerError::TimedOut { .. } => ModuleOutcome::TimedOut,
                        _ => ModuleOutcome::FailedRestored,
                    };
                    tracing::error!(module = name, error = %err, "module run failed");

                    if has_declared_state {
                        match state_manager.restore(&name) {
                            Ok(()) => outcomes.push((name, base_outcome)),
                            Err(restore_err) => {
                                tracing::error!(module = name, error = %restore_err, "restore failed");
                                outcomes.push((name, ModuleOutcome::FailedRestoreFailed));
                            }
                        }
                    } else {
                        outcomes.push((name, base_outcome));
                    }
                }
            }
        }

        outcomes
    }

    fn run_migrations(&self, registry: &ModuleRegistry) -> usize {
        let Some(module) = registry.get(MIGRATION_MODULE_NAME) else {
            return 0;
        };
        let catalog_path = module.path.join(CATALOG_FILE_NAME);
        if !catalog_path.exists() {
            return 0;
        }

        let driver = MigrationDriver::new(self.ctx.runner().migration_timeout_secs);
        match driver.run_pending(&module.path, &catalog_path) {
            Ok(outcomes) => {
                for outcome in &outcomes {
                    tracing::info!(migration = outcome.id, succeeded = outcome.succeeded, "migration ran");
                }
                outcomes.len()
            }
            Err(err) => {
                tracing::error!(error = %err, "migration driver failed");
                0
            }
        }
    }

    fn run_hotfixes(&self, registry: &ModuleRegistry, state_manager: &StateManager) -> usize {
        let Some(module) = registry.get(HOTFIX_MODULE_NAME) else {
            return 0;
        };
        let config_path = module.path.join(HOTFIX_CONFIG_FILE_NAME);
        if !config_path.exists() {
            return 0;
        }

        let config = match HotfixConfig::load(&config_path) {
            Ok(config) => config,
            Err(err) => {
                tracing::error!(error = %err, "hotfix config malformed");
                return 0;
            }
        };

        let driver = HotfixDriver::new(state_manager);
        let outcomes = driver.run(&module.path.join("src"), &config);
        for outcome in &outcomes {
            tracing::info!(pool = outcome.pool_id, succeeded = outcome.succeeded, "hotfix pool ran");
        }
        outcomes.len()
    }

    /// Re-execs the orchestrator binary with `--resume-after-schema`, exactly once
    /// per run.
    fn self_update_handoff(&self) {
        let exe: Result<PathBuf, _> = std::env::current_exe();
        let Ok(exe) = exe else {
            tracing::error!("self-update handoff requested but current_exe() failed");
            return;
        };
        tracing::info!(exe = %exe.display(), "re-execing after self-update schema refresh");
        match Command::new(exe).arg("--resume-after-schema").status() {
            Ok(status) => tracing::info!(?status, "resumed invocation finished"),
            Err(err) => tracing::error!(error = %err, "failed to spawn resumed invocation"),
        }
    }
}
