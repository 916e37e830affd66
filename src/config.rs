//! Orchestrator configuration and the [`RuntimeContext`] built from it.
//!
//! Per the redesign away from the source's cyclic module/orchestrator global state,
//! every component is constructed with an explicit [`RuntimeContext`] rather than
//! reaching for a process-wide singleton.

use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use config::{Case, Config};
use serde_derive::{Deserialize, Serialize};
use validator::Validate;

use crate::error::config::ConfigError;

pub(crate) const ENV_VAR_PREFIX: &str = "FLEET";
pub(crate) const ENV_VAR_SEPARATOR: &str = "__";

/// Which layered config file (`config/<environment>.toml`) to load on top of
/// `config/default.toml`. Mirrors the teacher's `Environment`, minus the `cli`
/// feature gate this crate doesn't need.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum Environment {
    Development,
    Test,
    Production,
    #[serde(untagged)]
    Custom(String),
}

const DEVELOPMENT: &str = "development";
const TEST: &str = "test";
const PRODUCTION: &str = "production";

impl Environment {
    pub fn from_env() -> Self {
        std::env::var("FLEET_ENVIRONMENT")
            .map(|s| Self::from_str(&s).unwrap_or(Environment::Development))
            .unwrap_or(Environment::Development)
    }
}

impl Display for Environment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Development => write!(f, "{DEVELOPMENT}"),
            Environment::Test => write!(f, "{TEST}"),
            Environment::Production => write!(f, "{PRODUCTION}"),
            Environment::Custom(custom) => write!(f, "{custom}"),
        }
    }
}

impl FromStr for Environment {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            DEVELOPMENT | "dev" => Environment::Development,
            TEST => Environment::Test,
            PRODUCTION | "prod" => Environment::Production,
            other => Environment::Custom(other.to_string()),
        })
    }
}

/// The upstream source-of-truth repository that RepoSync keeps the staging tree
/// mirrored against.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case")]
pub struct RepoConfig {
    #[validate(url)]
    pub url: String,
    #[validate(length(min = 1))]
    pub branch: String,
}

/// On-disk layout, all rooted at `install_root` unless given as an absolute path.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case")]
pub struct PathsConfig {
    pub install_root: PathBuf,
    #[serde(default = "PathsConfig::default_staging_root")]
    pub staging_root: PathBuf,
    #[serde(default = "PathsConfig::default_backups_root")]
    pub backups_root: PathBuf,
    #[serde(default = "PathsConfig::default_log_file")]
    pub log_file: PathBuf,
    #[serde(default = "PathsConfig::default_lockfile")]
    pub lockfile: PathBuf,
}

impl PathsConfig {
    fn default_staging_root() -> PathBuf {
        PathBuf::from("/var/lib/fleetd/staging")
    }

    fn default_backups_root() -> PathBuf {
        PathBuf::from("/var/lib/fleetd/backups")
    }

    fn default_log_file() -> PathBuf {
        PathBuf::from("/var/log/fleetd.log")
    }

    fn default_lockfile() -> PathBuf {
        PathBuf::from("/var/run/fleetd.lock")
    }

    pub fn modules_root(&self) -> PathBuf {
        self.install_root.join("modules")
    }

    pub fn staging_modules_root(&self) -> PathBuf {
        self.staging_root.join("modules")
    }

    pub fn backups_index(&self) -> PathBuf {
        self.backups_root.join("module_backups.json")
    }
}

/// Defaults applied to the runner and the migration/hotfix drivers unless a module
/// overrides them in its own manifest `config` subtree.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case")]
pub struct RunnerConfig {
    #[validate(range(min = 1))]
    #[serde(default = "RunnerConfig::default_module_timeout_secs")]
    pub module_timeout_secs: u64,
    #[validate(range(min = 1))]
    #[serde(default = "RunnerConfig::default_migration_timeout_secs")]
    pub migration_timeout_secs: u64,
    #[serde(default = "RunnerConfig::default_require_root")]
    pub require_root: bool,
}

impl RunnerConfig {
    fn default_module_timeout_secs() -> u64 {
        600
    }

    fn default_migration_timeout_secs() -> u64 {
        600
    }

    fn default_require_root() -> bool {
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfig {
    #[validate(nested)]
    pub repo: RepoConfig,
    #[validate(nested)]
    pub paths: PathsConfig,
    #[validate(nested)]
    pub runner: RunnerConfig,
}

impl AppConfig {
    /// Layers `config/default.toml` → `config/<environment>.toml` → `FLEET__`-prefixed
    /// environment variables, same three-source shape as the teacher's `AppConfig::new`.
    pub fn new(environment: &Environment) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let config: AppConfig = Config::builder()
            .add_source(config::File::with_name("config/default.toml").required(false))
            .add_source(
                config::File::with_name(&format!("config/{environment}.toml")).required(false),
            )
            .add_source(
                config::Environment::default()
                    .prefix(ENV_VAR_PREFIX)
                    .convert_case(Case::Kebab)
                    .separator(ENV_VAR_SEPARATOR),
            )
            .build()
            .map_err(ConfigError::Config)?
            .try_deserialize()
            .map_err(ConfigError::Config)?;

        config.validate().map_err(ConfigError::Validation)?;

        Ok(config)
    }
}

/// Passed explicitly to every component constructor instead of being read from a
/// process-wide singleton.
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    pub config: AppConfig,
    pub environment: Environment,
}

impl RuntimeContext {
    pub fn new(config: AppConfig, environment: Environment) -> Self {
        Self { config, environment }
    }

    pub fn paths(&self) -> &PathsConfig {
        &self.config.paths
    }

    pub fn runner(&self) -> &RunnerConfig {
        &self.config.runner
    }

    pub fn repo(&self) -> &RepoConfig {
        &self.config.repo
    }

    /// Refuses to proceed as a non-root user when `runner.require-root` is set
    /// (the default), matching the spec's unconditional "orchestrator refuses to run
    /// as non-root".
    pub fn require_root(&self) -> Result<(), ConfigError> {
        if !self.config.runner.require_root {
            return Ok(());
        }
        if nix::unistd::Uid::effective().is_root() {
            Ok(())
        } else {
            Err(ConfigError::NotRoot)
        }
    }
}

pub fn normalize_path(root: &Path, maybe_relative: &Path) -> PathBuf {
    if maybe_relative.is_absolute() {
        maybe_relative.to_path_buf()
    } else {
        root.join(maybe_relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(DEVELOPMENT, Environment::Development)]
    #[case("dev", Environment::Development)]
    #[case(TEST, Environment::Test)]
    #[case(PRODUCTION, Environment::Production)]
    #[case("prod", Environment::Production)]
    #[case("PROD", Environment::Production)]
    #[case("canary", Environment::Custom("canary".to_string()))]
    fn environment_from_str(#[case] input: &str, #[case] expected: Environment) {
        assert_eq!(Environment::from_str(input).unwrap(), expected);
    }

    #[test]
    fn environment_display_round_trips_through_from_str() {
        for env in [
            Environment::Development,
            Environment::Test,
            Environment::Production,
            Environment::Custom("canary".to_string()),
        ] {
            let s = env.to_string();
            assert_eq!(Environment::from_str(&s).unwrap(), env);
        }
    }

    #[test]
    fn modules_root_is_install_root_joined_with_modules() {
        let paths = PathsConfig {
            install_root: PathBuf::from("/opt/fleet"),
            staging_root: PathsConfig::default_staging_root(),
            backups_root: PathsConfig::default_backups_root(),
            log_file: PathsConfig::default_log_file(),
            lockfile: PathsConfig::default_lockfile(),
        };
        assert_eq!(paths.modules_root(), PathBuf::from("/opt/fleet/modules"));
    }

    #[test]
    fn validate_rejects_non_url_repo() {
        let repo = RepoConfig {
            url: "not a url".to_string(),
            branch: "main".to_string(),
        };
        assert!(repo.validate().is_err());
    }

    #[test]
    fn normalize_path_joins_relative_but_keeps_absolute() {
        let root = Path::new("/opt/fleet");
        assert_eq!(
            normalize_path(root, Path::new("staging")),
            PathBuf::from("/opt/fleet/staging")
        );
        assert_eq!(
            normalize_path(root, Path::new("/var/lib/elsewhere")),
            PathBuf::from("/var/lib/elsewhere")
        );
    }
}
