use std::collections::HashMap;
use std::path::Path;

use crate::error::{PipelineError, Result};

/// Assigns one part-of-speech label per token.
pub trait PosTagger: Send + Sync {
    fn tag(&self, token: &str) -> String;

    /// One label per token, same order. Implementations that batch must keep
    /// that contract; the extraction stage checks it.
    fn tag_all(&self, tokens: &[String]) -> Vec<String> {
        tokens.iter().map(|t| self.tag(t)).collect()
    }
}

/// Dictionary lookup with a fallback label for unknown compounds.
#[derive(Debug, Clone)]
pub struct LexiconTagger {
    entries: HashMap<String, String>,
    default_pos: String,
}

impl LexiconTagger {
    pub fn new(entries: HashMap<String, String>, default_pos: impl Into<String>) -> Self {
        Self {
            entries,
            default_pos: default_pos.into(),
        }
    }

    /// Load a JSON object of `{"compound": "label"}`.
    pub fn from_json_file(path: &Path, default_pos: impl Into<String>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("lexicon {}: {}", path.display(), e)))?;
        let entries: HashMap<String, String> = serde_json::from_str(&raw)
            .map_err(|e| PipelineError::Config(format!("lexicon {}: {}", path.display(), e)))?;
        Ok(Self::new(entries, default_pos))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PosTagger for LexiconTagger {
    fn tag(&self, token: &str) -> String {
        self.entries
            .get(token)
            .cloned()
            .unwrap_or_else(|| self.default_pos.clone())
    }
}
