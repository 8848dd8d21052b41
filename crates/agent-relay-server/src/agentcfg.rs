//! Agent configuration file: parsing, validation and defaults.

use serde::Deserialize;

use crate::api::ProcessingError;
use crate::proto::{AgentConfiguration, GitopsCf, LoggingCf, ManifestProjectCf, ObservabilityCf, PathCf};

/// Directory holding one sub-directory per agent.
pub const AGENT_CONFIG_DIR: &str = ".gitlab/agents";
pub const AGENT_CONFIG_FILE_NAME: &str = "config.yaml";

pub const DEFAULT_MANIFEST_NAMESPACE: &str = "default";
pub const DEFAULT_MANIFEST_GLOB: &str = "**/*.{yaml,yml,json}";

const LOG_LEVELS: &[&str] = &["debug", "info", "warn", "error"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse agent configuration file: {0}")]
    Parse(String),

    #[error("invalid agent configuration: {0}")]
    Invalid(String),
}

impl ProcessingError for ConfigError {
    fn is_user_error(&self) -> bool {
        true
    }
}

/// Repository path of the configuration file of `agent_name`.
pub fn agent_config_path(agent_name: &str) -> String {
    format!("{}/{}/{}", AGENT_CONFIG_DIR, agent_name, AGENT_CONFIG_FILE_NAME)
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigurationFile {
    #[serde(default)]
    gitops: Option<GitopsFile>,
    #[serde(default)]
    observability: Option<ObservabilityFile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct GitopsFile {
    #[serde(default)]
    manifest_projects: Vec<ManifestProjectFile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestProjectFile {
    #[serde(default)]
    id: String,
    #[serde(default)]
    default_namespace: String,
    #[serde(default)]
    paths: Vec<PathFile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PathFile {
    #[serde(default)]
    glob: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ObservabilityFile {
    #[serde(default)]
    logging: Option<LoggingFile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LoggingFile {
    #[serde(default)]
    level: String,
}

/// Parse a configuration file, validate it and fill in defaults.
///
/// An empty document, or one holding only comments, is a valid file with
/// every setting at its default.
pub fn parse_configuration(data: &[u8]) -> Result<AgentConfiguration, ConfigError> {
    let text = std::str::from_utf8(data).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let file = if is_blank_document(text) {
        ConfigurationFile::default()
    } else {
        let value: serde_yaml::Value =
            serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        if value.is_null() {
            ConfigurationFile::default()
        } else {
            serde_yaml::from_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?
        }
    };
    validate(&file)?;
    Ok(into_agent_configuration(file))
}

fn is_blank_document(text: &str) -> bool {
    text.lines()
        .map(str::trim)
        .all(|line| line.is_empty() || line.starts_with('#') || line == "---" || line == "...")
}

fn validate(file: &ConfigurationFile) -> Result<(), ConfigError> {
    if let Some(gitops) = &file.gitops {
        for (i, project) in gitops.manifest_projects.iter().enumerate() {
            if project.id.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "gitops.manifest_projects[{}].id: value length must be at least 1 runes",
                    i
                )));
            }
        }
    }
    if let Some(level) = file
        .observability
        .as_ref()
        .and_then(|o| o.logging.as_ref())
        .map(|l| l.level.as_str())
    {
        if !level.is_empty() && !LOG_LEVELS.contains(&level) {
            return Err(ConfigError::Invalid(format!(
                "observability.logging.level: unknown level {:?}",
                level
            )));
        }
    }
    Ok(())
}

fn into_agent_configuration(file: ConfigurationFile) -> AgentConfiguration {
    let manifest_projects = file
        .gitops
        .unwrap_or_default()
        .manifest_projects
        .into_iter()
        .map(into_manifest_project)
        .collect();

    AgentConfiguration {
        gitops: Some(GitopsCf { manifest_projects }),
        observability: file.observability.map(|o| ObservabilityCf {
            logging: o.logging.map(|l| LoggingCf { level: l.level }),
        }),
    }
}

fn into_manifest_project(project: ManifestProjectFile) -> ManifestProjectCf {
    let default_namespace = if project.default_namespace.is_empty() {
        DEFAULT_MANIFEST_NAMESPACE.to_string()
    } else {
        project.default_namespace
    };
    let mut paths: Vec<PathCf> = project
        .paths
        .into_iter()
        .map(|p| PathCf { glob: p.glob })
        .collect();
    if paths.is_empty() {
        paths.push(PathCf {
            glob: DEFAULT_MANIFEST_GLOB.to_string(),
        });
    }
    ManifestProjectCf {
        id: project.id,
        default_namespace,
        paths,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path() {
        assert_eq!(agent_config_path("my-agent"), ".gitlab/agents/my-agent/config.yaml");
    }

    #[test]
    fn test_empty_file_means_defaults() {
        for data in ["", "# nothing here\n", "---\n"] {
            let config = parse_configuration(data.as_bytes()).unwrap();
            assert_eq!(
                config,
                AgentConfiguration {
                    gitops: Some(GitopsCf::default()),
                    observability: None,
                },
                "input {:?}",
                data
            );
        }
    }

    #[test]
    fn test_defaults_are_applied() {
        let data = br#"
gitops:
  manifest_projects:
  - id: group/manifests
  - id: group/other
    default_namespace: apps
    paths:
    - glob: /deploy/**/*.yaml
observability:
  logging:
    level: debug
"#;
        let config = parse_configuration(data).unwrap();
        let projects = config.gitops.unwrap().manifest_projects;

        assert_eq!(
            projects[0],
            ManifestProjectCf {
                id: "group/manifests".to_string(),
                default_namespace: DEFAULT_MANIFEST_NAMESPACE.to_string(),
                paths: vec![PathCf {
                    glob: DEFAULT_MANIFEST_GLOB.to_string()
                }],
            }
        );
        assert_eq!(projects[1].default_namespace, "apps");
        assert_eq!(projects[1].paths[0].glob, "/deploy/**/*.yaml");
        assert_eq!(
            config.observability.unwrap().logging.unwrap().level,
            "debug"
        );
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let err = parse_configuration(b"gitops:\n  manifest_project: []\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.is_user_error());
    }

    #[test]
    fn test_malformed_yaml_is_rejected() {
        let err = parse_configuration(b"gitops: [unclosed").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_empty_project_id_is_invalid() {
        let err = parse_configuration(b"gitops:\n  manifest_projects:\n  - paths: []\n").unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid(
                "gitops.manifest_projects[0].id: value length must be at least 1 runes".to_string()
            )
        );
    }

    #[test]
    fn test_unknown_log_level_is_invalid() {
        let err = parse_configuration(b"observability:\n  logging:\n    level: loud\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
