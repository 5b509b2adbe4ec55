use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub archive: ArchiveConfig,
    pub db: DbConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveConfig {
    /// Root of the research-report tree.
    pub research_root: PathBuf,
    /// Root of the captured-page tree.
    pub url_content_root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// Sibling JSON file holding the last-scan watermark. Defaults to
    /// `<db path>.state.json` so a corrupted index never takes the
    /// watermark down with it.
    #[serde(default)]
    pub state_path: Option<PathBuf>,
}

impl DbConfig {
    pub fn state_path(&self) -> PathBuf {
        self.state_path.clone().unwrap_or_else(|| {
            let mut name = self.path.as_os_str().to_os_string();
            name.push(".state.json");
            PathBuf::from(name)
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexerConfig {
    /// Quiet period before a burst of file events triggers one run.
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,
    /// Optional recurring schedule: `min hour * * *` with `*`, `*/n`, or a
    /// fixed value in the first two fields.
    #[serde(default)]
    pub schedule: Option<String>,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            debounce_secs: default_debounce_secs(),
            schedule: None,
        }
    }
}

fn default_debounce_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_limit")]
    pub default_limit: i64,
    #[serde(default = "default_max_limit")]
    pub max_limit: i64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_limit: default_max_limit(),
        }
    }
}

fn default_limit() -> i64 {
    10
}

fn default_max_limit() -> i64 {
    50
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.search.default_limit < 1 {
        anyhow::bail!("search.default_limit must be >= 1");
    }

    if config.search.max_limit < config.search.default_limit {
        anyhow::bail!("search.max_limit must be >= search.default_limit");
    }

    if config.indexer.debounce_secs == 0 {
        anyhow::bail!("indexer.debounce_secs must be > 0");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("cdx.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_load_minimal() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(
            tmp.path(),
            r#"
[archive]
research_root = "/tmp/research"
url_content_root = "/tmp/url-content"

[db]
path = "/tmp/cdx.sqlite"
"#,
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.indexer.debounce_secs, 5);
        assert_eq!(config.search.default_limit, 10);
        assert!(config.indexer.schedule.is_none());
    }

    #[test]
    fn test_state_path_defaults_next_to_db() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(
            tmp.path(),
            r#"
[archive]
research_root = "/tmp/research"
url_content_root = "/tmp/url-content"

[db]
path = "/tmp/cdx.sqlite"
"#,
        );
        let config = load_config(&path).unwrap();
        assert_eq!(
            config.db.state_path(),
            PathBuf::from("/tmp/cdx.sqlite.state.json")
        );
    }

    #[test]
    fn test_rejects_zero_debounce() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(
            tmp.path(),
            r#"
[archive]
research_root = "/tmp/research"
url_content_root = "/tmp/url-content"

[db]
path = "/tmp/cdx.sqlite"

[indexer]
debounce_secs = 0
"#,
        );
        assert!(load_config(&path).is_err());
    }
}
