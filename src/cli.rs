//! Operator-facing CLI, mirroring the command table in the design's external
//! interfaces section one-to-one.

use clap::{Parser, Subcommand};

use crate::config::Environment;

#[derive(Debug, Parser)]
#[command(name = "fleetd", version, about = "Fleet-wide update orchestrator")]
pub struct FleetCli {
    /// Overrides the `FLEET_ENVIRONMENT` environment variable.
    #[arg(short, long)]
    pub environment: Option<String>,

    /// Internal: set by the orchestrator's own self-update re-exec to skip Sync and
    /// SchemaPhase on the second invocation. Not part of the operator-facing
    /// contract.
    #[arg(long, hide = true)]
    pub resume_after_schema: bool,

    #[command(subcommand)]
    pub command: Option<FleetCommand>,
}

impl FleetCli {
    pub fn environment(&self) -> Environment {
        self.environment
            .as_deref()
            .map(|s| s.parse().expect("Environment::from_str is infallible"))
            .unwrap_or_else(Environment::from_env)
    }
}

#[derive(Debug, Subcommand)]
pub enum FleetCommand {
    /// Check mode: never mutates, reports what a full run would do.
    Check,

    /// Enable a module.
    Enable { module: String },

    /// Disable a module.
    Disable { module: String },

    /// Enable a component within a module.
    EnableComponent { module: String, component: String },

    /// Disable a component within a module.
    DisableComponent { module: String, component: String },

    /// Tabular listing of every module: name, enabled status, version, description.
    ListModules,

    /// Detailed status of one module, or every module if omitted.
    Status { module: Option<String> },

    /// Reserved for pre-schema operation; treated as a synonym of a default run with
    /// an orchestrator-version marker set on the run record.
    Legacy,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        FleetCli::command().debug_assert();
    }

    #[test]
    fn parses_enable_with_module_name() {
        let cli = FleetCli::parse_from(["fleetd", "enable", "backups"]);
        match cli.command {
            Some(FleetCommand::Enable { module }) => assert_eq!(module, "backups"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_status_without_module() {
        let cli = FleetCli::parse_from(["fleetd", "status"]);
        assert!(matches!(cli.command, Some(FleetCommand::Status { module: None })));
    }

    #[test]
    fn default_run_has_no_subcommand() {
        let cli = FleetCli::parse_from(["fleetd"]);
        assert!(cli.command.is_none());
    }
}
