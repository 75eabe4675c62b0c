use thiserror::Error;

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A single URL could not be fetched. Absorbed by the extraction stage.
    #[error("failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    /// The parallel extraction outputs disagree in length. Fatal for the batch.
    #[error("extraction outputs are misaligned: \
             {kanji} kanji, {pos} pos tags, {pos_translated} translations")]
    Alignment {
        kanji: usize,
        pos: usize,
        pos_translated: usize,
    },

    #[error("no English gloss for part-of-speech label {0:?}")]
    UntranslatedPos(String),

    #[error("url already recorded by another run: {0}")]
    DuplicateUrl(String),

    /// The run's ledger rows were released while it was still extracting.
    #[error("ledger rows of {run_id} released before load: expected {expected}, found {found}")]
    LedgerReleased {
        run_id: String,
        expected: usize,
        found: usize,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn fetch(url: &str, reason: impl ToString) -> Self {
        PipelineError::Fetch {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Per-item failures the stage boundary absorbs instead of aborting the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::Fetch { .. } | PipelineError::DuplicateUrl(_)
        )
    }
}
