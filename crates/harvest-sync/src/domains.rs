use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEntry {
    pub name: String,
    pub sources: Vec<String>,
}

/// Fixed domain → sources association. Order is significant: domains run in
/// listed order during a full sync, sources in listed order within a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainTable {
    pub domains: Vec<DomainEntry>,
}

impl Default for DomainTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl DomainTable {
    pub fn builtin() -> Self {
        let entry = |name: &str, sources: &[&str]| DomainEntry {
            name: name.to_string(),
            sources: sources.iter().map(|s| s.to_string()).collect(),
        };
        Self {
            domains: vec![
                entry("research", &["openalex", "nih_reporter"]),
                entry("economic", &["fred", "worldbank"]),
                entry("contracts", &["usaspending", "sam_gov"]),
            ],
        }
    }

    pub fn from_yaml_str(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let table: DomainTable = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        table.validate()?;
        Ok(table)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text, path)
    }

    /// The file when present, otherwise the built-in table.
    pub fn load_or_builtin(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!(path = %path.display(), "no domain table file, using built-in domains");
            Ok(Self::builtin())
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for domain in &self.domains {
            if domain.name.trim().is_empty() {
                return Err(ConfigError::Invalid("domain with empty name".into()));
            }
            if !seen.insert(domain.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate domain {}", domain.name)));
            }
        }
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.domains.iter().map(|d| d.name.as_str())
    }

    pub fn sources_for(&self, domain: &str) -> Option<&[String]> {
        self.domains
            .iter()
            .find(|d| d.name == domain)
            .map(|d| d.sources.as_slice())
    }

    /// First domain listing `source`.
    pub fn domain_of(&self, source: &str) -> Option<&str> {
        self.domains
            .iter()
            .find(|d| d.sources.iter().any(|s| s == source))
            .map(|d| d.name.as_str())
    }
}
