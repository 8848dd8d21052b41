use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::api::CacheSettings;
use crate::visitor::SyncBudget;

/// Configuration for the agent-relay-server.
#[derive(Parser, Debug, Clone)]
#[command(name = "agent-relay-server")]
#[command(about = "gRPC relay streaming agent configuration and GitOps manifests")]
pub struct Config {
    /// TCP host to bind to
    #[arg(long, default_value = "0.0.0.0", env = "GRPC_HOST")]
    pub host: String,

    /// TCP port to bind to
    #[arg(long, default_value = "50061", env = "GRPC_PORT")]
    pub port: u16,

    /// Base URL of the repository-hosting backend's API
    #[arg(long, default_value = "http://localhost:8080", env = "GITLAB_URL")]
    pub gitlab_url: String,

    /// Directory holding repository snapshots
    #[arg(long, env = "SNAPSHOT_ROOT")]
    pub snapshot_root: PathBuf,

    /// How often the agent configuration is polled for changes
    #[arg(long, default_value = "20", env = "AGENT_CONFIG_POLL_PERIOD_SECS")]
    pub agent_config_poll_period_secs: u64,

    /// How often manifest projects are polled for changes
    #[arg(long, default_value = "20", env = "GITOPS_POLL_PERIOD_SECS")]
    pub gitops_poll_period_secs: u64,

    /// Agent info cache TTL (0 disables caching)
    #[arg(long, default_value = "300", env = "AGENT_INFO_CACHE_TTL_SECS")]
    pub agent_info_cache_ttl_secs: u64,

    /// Agent info cache TTL for failed lookups
    #[arg(long, default_value = "60", env = "AGENT_INFO_CACHE_ERROR_TTL_SECS")]
    pub agent_info_cache_error_ttl_secs: u64,

    /// Project info cache TTL (0 disables caching)
    #[arg(long, default_value = "300", env = "PROJECT_INFO_CACHE_TTL_SECS")]
    pub project_info_cache_ttl_secs: u64,

    /// Project info cache TTL for failed lookups
    #[arg(long, default_value = "60", env = "PROJECT_INFO_CACHE_ERROR_TTL_SECS")]
    pub project_info_cache_error_ttl_secs: u64,

    /// Maximum age of a streaming connection before it is closed
    #[arg(long, default_value = "1800", env = "MAX_CONNECTION_AGE_SECS")]
    pub max_connection_age_secs: u64,

    /// Maximum size of an agent configuration file in bytes
    #[arg(long, default_value = "131072", env = "MAX_CONFIGURATION_FILE_SIZE")]
    pub max_configuration_file_size: i64,

    /// Maximum size of a single manifest file in bytes
    #[arg(long, default_value = "1048576", env = "MAX_MANIFEST_FILE_SIZE")]
    pub max_manifest_file_size: i64,

    /// Maximum size of all manifest files of one project in bytes
    #[arg(long, default_value = "2097152", env = "MAX_TOTAL_MANIFEST_FILE_SIZE")]
    pub max_total_manifest_file_size: i64,

    /// Maximum number of paths per manifest project
    #[arg(long, default_value = "100", env = "MAX_NUMBER_OF_PATHS")]
    pub max_number_of_paths: u32,

    /// Maximum number of files visited per manifest project
    #[arg(long, default_value = "1000", env = "MAX_NUMBER_OF_FILES")]
    pub max_number_of_files: u32,

    /// How often usage data is reported (0 disables reporting)
    #[arg(long, default_value = "60", env = "USAGE_REPORTING_PERIOD_SECS")]
    pub usage_reporting_period_secs: u64,
}

impl Config {
    pub fn agent_info_cache(&self) -> CacheSettings {
        CacheSettings {
            ttl: Duration::from_secs(self.agent_info_cache_ttl_secs),
            error_ttl: Duration::from_secs(self.agent_info_cache_error_ttl_secs),
        }
    }

    pub fn project_info_cache(&self) -> CacheSettings {
        CacheSettings {
            ttl: Duration::from_secs(self.project_info_cache_ttl_secs),
            error_ttl: Duration::from_secs(self.project_info_cache_error_ttl_secs),
        }
    }

    pub fn usage_reporting_period(&self) -> Duration {
        Duration::from_secs(self.usage_reporting_period_secs)
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            agent_config_poll_period: Duration::from_secs(self.agent_config_poll_period_secs),
            gitops_poll_period: Duration::from_secs(self.gitops_poll_period_secs),
            max_connection_age: Duration::from_secs(self.max_connection_age_secs),
            max_configuration_file_size: self.max_configuration_file_size,
            max_number_of_paths: self.max_number_of_paths,
            sync_budget: SyncBudget {
                max_total_file_size: self.max_total_manifest_file_size,
                max_file_size: self.max_manifest_file_size,
                max_number_of_files: self.max_number_of_files,
            },
        }
    }
}

/// Limits and periods shared by every stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySettings {
    pub agent_config_poll_period: Duration,
    pub gitops_poll_period: Duration,
    pub max_connection_age: Duration,
    pub max_configuration_file_size: i64,
    pub max_number_of_paths: u32,
    pub sync_budget: SyncBudget,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            agent_config_poll_period: Duration::from_secs(20),
            gitops_poll_period: Duration::from_secs(20),
            max_connection_age: Duration::from_secs(30 * 60),
            max_configuration_file_size: 128 * 1024,
            max_number_of_paths: 100,
            sync_budget: SyncBudget {
                max_total_file_size: 2 * 1024 * 1024,
                max_file_size: 1024 * 1024,
                max_number_of_files: 1000,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_settings_defaults() {
        let config = Config::parse_from(["agent-relay-server", "--snapshot-root", "/srv/snapshots"]);

        assert_eq!(config.relay_settings(), RelaySettings::default());
        assert_eq!(config.agent_info_cache().ttl, Duration::from_secs(300));
        assert_eq!(config.project_info_cache().error_ttl, Duration::from_secs(60));
        assert_eq!(config.usage_reporting_period(), Duration::from_secs(60));
        assert_eq!(config.port, 50061);
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = Config::parse_from([
            "agent-relay-server",
            "--snapshot-root",
            "/srv/snapshots",
            "--max-number-of-files",
            "5",
            "--gitops-poll-period-secs",
            "3",
        ]);

        let settings = config.relay_settings();
        assert_eq!(settings.sync_budget.max_number_of_files, 5);
        assert_eq!(settings.gitops_poll_period, Duration::from_secs(3));
    }
}
