use std::process::ExitCode;

use clap::Parser;

use fleetd::cli::{FleetCli, FleetCommand};
use fleetd::config::{AppConfig, RuntimeContext};
use fleetd::error::Error;
use fleetd::logging;
use fleetd::module_registry::ModuleRegistry;
use fleetd::orchestrator::Orchestrator;
use fleetd::state_manager::StateManager;
use fleetd::summary::{list_modules_table, run_summary_table, status_table};

fn main() -> ExitCode {
    let cli = FleetCli::parse();
    let environment = cli.environment();

    let config = match AppConfig::new(&environment) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            return ExitCode::from(2);
        }
    };

    // Only a default or `--legacy` run truncates the log; `--check` and the
    // management subcommands append, and a self-update resume appends onto the run
    // it's continuing rather than wiping it.
    let truncate = matches!(cli.command, None | Some(FleetCommand::Legacy)) && !cli.resume_after_schema;

    if let Err(err) = logging::init(&config.paths.log_file, truncate) {
        eprintln!("failed to initialize logging: {err}");
        return ExitCode::from(2);
    }

    let ctx = RuntimeContext::new(config, environment);

    match run(ctx, cli) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "run failed");
            ExitCode::from(2)
        }
    }
}

fn run(ctx: RuntimeContext, cli: FleetCli) -> Result<ExitCode, Error> {
    match cli.command {
        None => run_orchestrator(&ctx, false, cli.resume_after_schema, false),
        Some(FleetCommand::Check) => run_orchestrator(&ctx, true, cli.resume_after_schema, false),
        Some(FleetCommand::Legacy) => run_orchestrator(&ctx, false, cli.resume_after_schema, true),
        Some(FleetCommand::Enable { module }) => {
            let mut registry = load_registry(&ctx)?;
            registry.set_enabled(&module, true)?;
            println!("enabled module `{module}`");
            Ok(ExitCode::SUCCESS)
        }
        Some(FleetCommand::Disable { module }) => {
            let mut registry = load_registry(&ctx)?;
            registry.set_enabled(&module, false)?;
            println!("disabled module `{module}`");
            Ok(ExitCode::SUCCESS)
        }
        Some(FleetCommand::EnableComponent { module, component }) => {
            let mut registry = load_registry(&ctx)?;
            registry.set_component_enabled(&module, &component, true)?;
            println!("enabled component `{component}` of module `{module}`");
            Ok(ExitCode::SUCCESS)
        }
        Some(FleetCommand::DisableComponent { module, component }) => {
            let mut registry = load_registry(&ctx)?;
            registry.set_component_enabled(&module, &component, false)?;
            println!("disabled component `{component}` of module `{module}`");
            Ok(ExitCode::SUCCESS)
        }
        Some(FleetCommand::ListModules) => {
            let registry = load_registry(&ctx)?;
            let modules: Vec<_> = registry.list_installed().iter().collect();
            println!("{}", list_modules_table(&modules));
            Ok(ExitCode::SUCCESS)
        }
        Some(FleetCommand::Status { module }) => {
            let registry = load_registry(&ctx)?;
            let modules: Vec<_> = match &module {
                Some(name) => registry.list_installed().iter().filter(|m| m.manifest.name() == name).collect(),
                None => registry.list_installed().iter().collect(),
            };
            if modules.is_empty() {
                if let Some(name) = &module {
                    println!("no installed module named `{name}`");
                    return Ok(ExitCode::FAILURE);
                }
            }
            let state_manager = StateManager::new(&ctx.paths().backups_root);
            println!("{}", status_table(&modules, &state_manager));
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_registry(ctx: &RuntimeContext) -> Result<ModuleRegistry, Error> {
    Ok(ModuleRegistry::load(
        &ctx.paths().modules_root(),
        &ctx.paths().staging_modules_root(),
    )?)
}

fn run_orchestrator(
    ctx: &RuntimeContext,
    check_only: bool,
    resume_after_schema: bool,
    legacy: bool,
) -> Result<ExitCode, Error> {
    let orchestrator = Orchestrator::new(ctx.clone());
    let record = orchestrator.run(check_only, resume_after_schema, legacy)?;

    println!("{}", run_summary_table(&record.outcomes));
    println!(
        "migrations run: {}, hotfix pools run: {}, pending restart: {}",
        record.migrations_run, record.hotfix_pools_run, record.pending_restart
    );

    if record.any_module_failed() {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}
