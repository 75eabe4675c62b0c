use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::db::DuplicatePolicy;
use crate::fetcher::FetchOptions;

/// Runtime settings: defaults, then an optional TOML file, then `JPNEWS_*`
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub db_path: PathBuf,
    pub concurrency: usize,
    pub fetch_timeout_secs: u64,
    pub user_agent: String,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub text_selector: String,
    pub excluded_pos: Vec<String>,
    pub duplicate_policy: DuplicatePolicy,
    pub stale_run_secs: u64,
    pub default_pos: String,
    pub lexicon_path: Option<PathBuf>,
    /// Extra label → gloss entries on top of the builtin table.
    pub pos_glosses: HashMap<String, String>,
    pub sources: Vec<String>,
    pub link_pattern: Option<String>,
    pub progress: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/japan_news.sqlite"),
            concurrency: 8,
            fetch_timeout_secs: 20,
            user_agent: concat!("jp_news_pipeline/", env!("CARGO_PKG_VERSION")).to_string(),
            max_retries: 3,
            base_backoff_ms: 2000,
            text_selector: "p".to_string(),
            excluded_pos: vec!["記号".into(), "補助記号".into(), "空白".into()],
            duplicate_policy: DuplicatePolicy::Skip,
            stale_run_secs: 3600,
            default_pos: "名詞".to_string(),
            lexicon_path: None,
            pos_glosses: HashMap::new(),
            sources: Vec::new(),
            link_pattern: None,
            progress: true,
        }
    }
}

impl Settings {
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::from(path).required(true));
        }
        let settings: Settings = builder
            .add_source(
                Environment::with_prefix("JPNEWS")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("excluded_pos")
                    .with_list_parse_key("sources"),
            )
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;
        Ok(settings)
    }

    pub fn excluded_pos_set(&self) -> HashSet<String> {
        self.excluded_pos.iter().map(|p| p.trim().to_string()).collect()
    }

    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            timeout: Duration::from_secs(self.fetch_timeout_secs),
            user_agent: self.user_agent.clone(),
            max_retries: self.max_retries,
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            text_selector: self.text_selector.clone(),
        }
    }
}
