use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};

pub const DEFAULT_CONFIG_FILENAME: &str = "config.yml";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Per-case settings kept in `config.yml` at the root of a replication repository.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ProjectConfig {
    #[serde(default, deserialize_with = "scalar_as_string")]
    pub openicpsr: Option<String>,
    #[serde(default, deserialize_with = "scalar_as_string")]
    pub zenodo: Option<String>,
    #[serde(default, deserialize_with = "scalar_as_string")]
    pub dataverse: Option<String>,
    #[serde(default, deserialize_with = "scalar_as_string")]
    pub osf: Option<String>,
    #[serde(default, deserialize_with = "scalar_as_string")]
    pub jiraticket: Option<String>,
}

impl ProjectConfig {
    /// Load the first YAML document of `path`. Returns default if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let first = serde_yaml::Deserializer::from_str(&content)
            .next()
            .ok_or_else(|| anyhow::anyhow!("no YAML document in {}", path.display()))?;
        let parsed = Self::deserialize(first)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(parsed)
    }

    /// Folder that holds the deposit: openicpsr > zenodo > dataverse > osf.
    pub fn repository_folder(&self) -> Option<String> {
        [&self.openicpsr, &self.zenodo, &self.dataverse, &self.osf]
            .into_iter()
            .filter_map(|value| value.as_deref())
            .map(str::trim)
            .find(|value| !value.is_empty())
            .map(ToString::to_string)
    }

    pub fn openicpsr_project(&self) -> Option<String> {
        non_empty(self.openicpsr.as_deref())
    }

    pub fn jira_ticket(&self) -> Option<String> {
        non_empty(self.jiraticket.as_deref())
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

fn scalar_as_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_yaml::Value::String(text)) => Some(text),
        Some(serde_yaml::Value::Number(number)) => Some(number.to_string()),
        Some(serde_yaml::Value::Bool(flag)) => Some(flag.to_string()),
        _ => None,
    })
}

pub fn env_value(key: &str, default: &str) -> String {
    env_non_empty(key).unwrap_or_else(|| default.to_string())
}

pub fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

pub fn env_value_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

pub fn env_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Pipelines export `CI`; interactive sessions usually don't.
pub fn is_ci() -> bool {
    env::var_os("CI").is_some_and(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_returns_default_for_missing_file() {
        let config = ProjectConfig::load(Path::new("/nonexistent/config.yml")).expect("load");
        assert_eq!(config, ProjectConfig::default());
    }

    #[test]
    fn load_accepts_numeric_and_string_scalars() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("config.yml");
        fs::write(
            &path,
            "openicpsr: 123456\nzenodo: \"\"\njiraticket: AEAREP-8885\nprecheck: true\n",
        )
        .expect("write config");

        let config = ProjectConfig::load(&path).expect("load");
        assert_eq!(config.openicpsr.as_deref(), Some("123456"));
        assert_eq!(config.openicpsr_project().as_deref(), Some("123456"));
        assert_eq!(config.jira_ticket().as_deref(), Some("AEAREP-8885"));
        assert!(config.zenodo.as_deref().is_some_and(str::is_empty));
    }

    #[test]
    fn load_reads_only_first_document() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("config.yml");
        fs::write(&path, "dataverse: ABC123\n---\ndataverse: XYZ999\n").expect("write config");

        let config = ProjectConfig::load(&path).expect("load");
        assert_eq!(config.dataverse.as_deref(), Some("ABC123"));
    }

    #[test]
    fn load_reports_invalid_yaml() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("config.yml");
        fs::write(&path, "openicpsr: [unclosed\n").expect("write config");
        let error = ProjectConfig::load(&path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn repository_folder_follows_precedence_and_skips_blanks() {
        let config = ProjectConfig {
            openicpsr: Some("  ".to_string()),
            zenodo: Some("zenodo-42".to_string()),
            dataverse: Some("DVN".to_string()),
            ..Default::default()
        };
        assert_eq!(config.repository_folder().as_deref(), Some("zenodo-42"));
        assert_eq!(ProjectConfig::default().repository_folder(), None);
    }
}
