//! Fixed ingestion sequence:
//!
//!   normalize → dedup (fetch known, filter, record) → extract → transform → load
//!
//! Each stage takes the previous stage's output as its only input. The
//! orchestrator owns the storage connection and lends it to the two stages
//! that touch storage; each of those runs in its own transaction and nothing
//! is held open while articles are being fetched.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use rusqlite::Connection;
use tracing::{error, info, info_span, warn, Instrument};

use crate::db::{self, DuplicatePolicy, RunCommit};
use crate::error::Result;
use crate::extract::tagger::PosTagger;
use crate::extract::tokenizer::Tokenizer;
use crate::extract::translate::PosTranslator;
use crate::extract::{self, TokenColumns};
use crate::fetcher::{self, Fetcher, SkippedUrl};
use crate::normalize;
use crate::transform::{self, TokenRecord};

/// One unit of work with declared input and output. A scheduler may wrap a
/// stage with its own retry policy; the return value is the whole contract.
#[async_trait(?Send)]
pub trait Stage {
    type Input;
    type Output;

    fn name(&self) -> &'static str;

    async fn run(&self, input: Self::Input) -> Result<Self::Output>;
}

/// Run a stage inside its span, logging duration and failure.
pub async fn run_stage<S: Stage>(stage: &S, run_id: &str, input: S::Input) -> Result<S::Output> {
    let span = info_span!("stage", name = stage.name(), run_id);
    async {
        let t0 = Instant::now();
        let out = stage.run(input).await;
        match &out {
            Ok(_) => info!(elapsed_ms = t0.elapsed().as_millis() as u64, "stage done"),
            Err(e) => error!(error = %e, "stage failed"),
        }
        out
    }
    .instrument(span)
    .await
}

// ── Stages ──

pub struct NormalizeStage;

#[async_trait(?Send)]
impl Stage for NormalizeStage {
    type Input = Vec<String>;
    type Output = Vec<String>;

    fn name(&self) -> &'static str {
        "normalize"
    }

    async fn run(&self, input: Vec<String>) -> Result<Vec<String>> {
        let out = normalize::normalize(&input);
        info!("{} candidates → {} distinct urls", input.len(), out.len());
        Ok(out)
    }
}

#[derive(Debug, Default)]
pub struct NewUrlBatch {
    pub urls: Vec<String>,
    pub already_known: usize,
    /// Recorded by a concurrent writer between our read and insert.
    pub raced: Vec<String>,
}

/// Release stale uncommitted rows, read the ledger, keep unseen URLs and
/// record them, all in one write transaction.
pub struct DedupStage<'c> {
    pub conn: &'c Connection,
    pub run_id: &'c str,
    pub policy: DuplicatePolicy,
    pub stale_after_secs: u64,
}

#[async_trait(?Send)]
impl<'c> Stage for DedupStage<'c> {
    type Input = Vec<String>;
    type Output = NewUrlBatch;

    fn name(&self) -> &'static str {
        "dedup"
    }

    async fn run(&self, candidates: Vec<String>) -> Result<NewUrlBatch> {
        let tx = db::begin_immediate(self.conn)?;
        db::release_stale(&tx, self.stale_after_secs)?;
        let known = db::fetch_known_urls(&tx)?;
        let fresh = db::filter_new(&known, &candidates);
        let outcome = db::record_new(&tx, self.run_id, &fresh, self.policy)?;
        tx.commit()?;

        let batch = NewUrlBatch {
            already_known: candidates.len() - fresh.len(),
            urls: outcome.recorded,
            raced: outcome.duplicates,
        };
        info!(
            "{} new urls ({} already known, {} raced)",
            batch.urls.len(),
            batch.already_known,
            batch.raced.len()
        );
        Ok(batch)
    }
}

#[derive(Debug, Default)]
pub struct Extraction {
    pub columns: TokenColumns,
    pub skipped: Vec<SkippedUrl>,
}

pub struct ExtractStage {
    pub fetcher: Arc<dyn Fetcher>,
    pub tokenizer: Arc<dyn Tokenizer>,
    pub tagger: Arc<dyn PosTagger>,
    pub translator: Arc<dyn PosTranslator>,
    pub concurrency: usize,
    pub progress: bool,
}

#[async_trait(?Send)]
impl Stage for ExtractStage {
    type Input = Vec<String>;
    type Output = Extraction;

    fn name(&self) -> &'static str {
        "extract"
    }

    async fn run(&self, urls: Vec<String>) -> Result<Extraction> {
        let pb = fetcher::progress_bar(urls.len(), self.progress);
        let report =
            fetcher::extract_text(self.fetcher.as_ref(), &urls, self.concurrency, &pb).await?;
        let columns = extract::extract_columns(
            self.tokenizer.as_ref(),
            self.tagger.as_ref(),
            self.translator.as_ref(),
            &report.texts,
        )?;
        info!(
            "{} tokens from {} articles",
            columns.len(),
            report.fetched.len()
        );
        Ok(Extraction {
            columns,
            skipped: report.skipped,
        })
    }
}

#[derive(Debug, Default)]
pub struct LoadBatch {
    pub records: Vec<TokenRecord>,
    pub skipped: Vec<SkippedUrl>,
}

pub struct TransformStage<'a> {
    pub excluded_pos: &'a HashSet<String>,
}

#[async_trait(?Send)]
impl<'a> Stage for TransformStage<'a> {
    type Input = Extraction;
    type Output = LoadBatch;

    fn name(&self) -> &'static str {
        "transform"
    }

    async fn run(&self, input: Extraction) -> Result<LoadBatch> {
        let TokenColumns {
            kanji,
            pos,
            pos_translated,
        } = input.columns;
        let built = transform::build_records(kanji, pos, pos_translated)?;
        let total = built.len();
        let records = transform::filter_non_japanese(built);
        let japanese = records.len();
        let records = transform::filter_excluded_pos(records, self.excluded_pos);
        info!(
            "{} rows → {} kept ({} non-japanese, {} excluded pos)",
            total,
            records.len(),
            total - japanese,
            japanese - records.len()
        );
        Ok(LoadBatch {
            records,
            skipped: input.skipped,
        })
    }
}

/// Appends the batch, releases unfetched URLs and marks the run committed,
/// in a single transaction.
pub struct LoadStage<'c> {
    pub conn: &'c Connection,
    pub run_id: &'c str,
    pub url_count: usize,
}

#[async_trait(?Send)]
impl<'c> Stage for LoadStage<'c> {
    type Input = LoadBatch;
    type Output = LoadBatch;

    fn name(&self) -> &'static str {
        "load"
    }

    async fn run(&self, batch: LoadBatch) -> Result<LoadBatch> {
        let skipped_urls: Vec<String> = batch.skipped.iter().map(|s| s.url.clone()).collect();
        let rows = db::commit_run(
            self.conn,
            &RunCommit {
                run_id: self.run_id,
                url_count: self.url_count,
                skipped_urls: &skipped_urls,
                records: &batch.records,
            },
        )?;
        info!("Appended {} rows to japan_news", rows);
        Ok(batch)
    }
}

// ── Orchestrator ──

pub struct PipelineOptions {
    pub concurrency: usize,
    pub excluded_pos: HashSet<String>,
    pub duplicate_policy: DuplicatePolicy,
    /// Age after which an uncommitted run is presumed crashed.
    pub stale_after_secs: u64,
    pub progress: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            concurrency: 8,
            excluded_pos: ["記号", "補助記号", "空白"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            duplicate_policy: DuplicatePolicy::Skip,
            stale_after_secs: 3600,
            progress: false,
        }
    }
}

pub struct Pipeline {
    pub fetcher: Arc<dyn Fetcher>,
    pub tokenizer: Arc<dyn Tokenizer>,
    pub tagger: Arc<dyn PosTagger>,
    pub translator: Arc<dyn PosTranslator>,
    pub options: PipelineOptions,
}

#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub candidates: usize,
    pub already_known: usize,
    pub new_urls: Vec<String>,
    pub raced: Vec<String>,
    pub skipped: Vec<SkippedUrl>,
    /// Exactly the rows appended to `japan_news` by this run.
    pub records: Vec<TokenRecord>,
}

pub fn new_run_id() -> String {
    let now = chrono::Utc::now();
    format!("run-{}", now.format("%Y%m%dT%H%M%S%.9fZ"))
}

impl Pipeline {
    pub async fn run(&self, initial_urls: &[String], storage: &Path) -> Result<RunReport> {
        let run_id = new_run_id();
        info!(run_id = %run_id, storage = %storage.display(), "Starting ingestion run");

        let candidates = run_stage(&NormalizeStage, &run_id, initial_urls.to_vec()).await?;

        let conn = db::connect(storage)?;
        db::init_schema(&conn)?;

        let dedup = DedupStage {
            conn: &conn,
            run_id: &run_id,
            policy: self.options.duplicate_policy,
            stale_after_secs: self.options.stale_after_secs,
        };
        let batch = run_stage(&dedup, &run_id, candidates.clone()).await?;

        match self.ingest(&conn, &run_id, &batch.urls).await {
            Ok(loaded) => Ok(RunReport {
                run_id,
                candidates: candidates.len(),
                already_known: batch.already_known,
                new_urls: batch.urls,
                raced: batch.raced,
                skipped: loaded.skipped,
                records: loaded.records,
            }),
            Err(e) => {
                // Give the URLs back so a later run can retry them.
                match db::release_run(&conn, &run_id) {
                    Ok(n) => {
                        warn!(run_id = %run_id, released = n, "run failed, ledger rows released")
                    }
                    Err(release_err) => {
                        error!(run_id = %run_id, error = %release_err, "ledger rows not released")
                    }
                }
                Err(e)
            }
        }
    }

    async fn ingest(&self, conn: &Connection, run_id: &str, urls: &[String]) -> Result<LoadBatch> {
        let extract = ExtractStage {
            fetcher: Arc::clone(&self.fetcher),
            tokenizer: Arc::clone(&self.tokenizer),
            tagger: Arc::clone(&self.tagger),
            translator: Arc::clone(&self.translator),
            concurrency: self.options.concurrency,
            progress: self.options.progress,
        };
        let extraction = run_stage(&extract, run_id, urls.to_vec()).await?;

        let transform = TransformStage {
            excluded_pos: &self.options.excluded_pos,
        };
        let batch = run_stage(&transform, run_id, extraction).await?;

        let load = LoadStage {
            conn,
            run_id,
            url_count: urls.len(),
        };
        run_stage(&load, run_id, batch).await
    }
}

/// Release ledger rows of every run that never committed, however recent.
/// Only safe while no other run is in flight.
pub fn reconcile(storage: &Path) -> Result<usize> {
    let conn = db::connect(storage)?;
    db::init_schema(&conn)?;
    db::release_uncommitted(&conn)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::error::PipelineError;
    use crate::extract::tagger::LexiconTagger;
    use crate::extract::tokenizer::KanjiTokenizer;
    use crate::extract::translate::PosTable;

    struct FakeFetcher {
        pages: HashMap<String, String>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeFetcher {
        fn new(pages: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                pages: pages
                    .iter()
                    .map(|(u, t)| (u.to_string(), t.to_string()))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Fetcher for FakeFetcher {
        async fn fetch(&self, url: &str) -> Result<String> {
            self.calls.lock().unwrap().push(url.to_string());
            self.pages
                .get(url)
                .cloned()
                .ok_or_else(|| PipelineError::fetch(url, "HTTP 404 Not Found"))
        }
    }

    /// Returns one label too few, like a tagger out of sync with the tokenizer.
    struct DroppingTagger;

    impl PosTagger for DroppingTagger {
        fn tag(&self, _token: &str) -> String {
            "名詞".into()
        }

        fn tag_all(&self, tokens: &[String]) -> Vec<String> {
            tokens.iter().skip(1).map(|t| self.tag(t)).collect()
        }
    }

    /// A verb and a symbol from the lexicon; every other compound is a noun.
    fn tagger() -> Arc<dyn PosTagger> {
        Arc::new(LexiconTagger::new(
            HashMap::from([
                ("走".to_string(), "動詞".to_string()),
                ("※".to_string(), "記号".to_string()),
            ]),
            "名詞",
        ))
    }

    fn pipeline(fetcher: Arc<FakeFetcher>, tagger: Arc<dyn PosTagger>) -> Pipeline {
        Pipeline {
            fetcher,
            tokenizer: Arc::new(KanjiTokenizer),
            tagger,
            translator: Arc::new(PosTable::builtin()),
            options: PipelineOptions {
                concurrency: 2,
                ..PipelineOptions::default()
            },
        }
    }

    fn urls(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|s| s.to_string()).collect()
    }

    fn counts(path: &Path) -> (usize, usize) {
        let conn = db::connect(path).unwrap();
        db::init_schema(&conn).unwrap();
        let s = db::get_stats(&conn).unwrap();
        (s.ledger_urls, s.token_rows)
    }

    /// Ledger rows of a run that recorded URLs and then died.
    fn seed_uncommitted(path: &Path, run_id: &str, xs: &[&str]) {
        let conn = db::connect(path).unwrap();
        db::init_schema(&conn).unwrap();
        db::record_new(&conn, run_id, &urls(xs), DuplicatePolicy::Skip).unwrap();
    }

    fn pages() -> Vec<(&'static str, &'static str)> {
        vec![
            ("http://a.test/1", "東京都で新しい政策が発表された。"),
            ("http://a.test/2", "大阪の経済は回復傾向にある。"),
        ]
    }

    #[tokio::test]
    async fn first_run_records_both_urls() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("news.sqlite");
        let p = pipeline(FakeFetcher::new(&pages()), tagger());

        let report = p
            .run(&urls(&["http://a.test/1", "http://a.test/1", "http://a.test/2"]), &db_path)
            .await
            .unwrap();

        assert_eq!(report.candidates, 2);
        assert_eq!(report.new_urls, urls(&["http://a.test/1", "http://a.test/2"]));
        let kanji: Vec<&str> = report.records.iter().map(|r| r.kanji.as_str()).collect();
        assert_eq!(
            kanji,
            vec!["東京都", "新", "政策", "発表", "大阪", "経済", "回復傾向"]
        );

        let conn = db::connect(&db_path).unwrap();
        let known = db::fetch_known_urls(&conn).unwrap();
        assert_eq!(known.len(), 2);
        assert!(known.contains("http://a.test/1") && known.contains("http://a.test/2"));
        assert_eq!(db::get_stats(&conn).unwrap().token_rows, report.records.len());
    }

    #[tokio::test]
    async fn second_run_ingests_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("news.sqlite");
        let input = urls(&["http://a.test/1", "http://a.test/2"]);

        let fetcher = FakeFetcher::new(&pages());
        let p = pipeline(Arc::clone(&fetcher), tagger());
        let first = p.run(&input, &db_path).await.unwrap();
        let after_first = counts(&db_path);

        let second = p.run(&input, &db_path).await.unwrap();
        assert!(second.new_urls.is_empty());
        assert_eq!(second.already_known, 2);
        assert!(second.records.is_empty());
        assert_eq!(counts(&db_path), after_first);
        // no refetch of known urls
        assert_eq!(fetcher.calls().len(), first.new_urls.len());
    }

    #[tokio::test]
    async fn misaligned_extraction_leaves_storage_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("news.sqlite");

        let seed = pipeline(FakeFetcher::new(&pages()), tagger());
        seed.run(&urls(&["http://a.test/1"]), &db_path).await.unwrap();
        let before = counts(&db_path);

        let broken = pipeline(
            FakeFetcher::new(&[("http://a.test/3", "東京、大阪、京都、札幌、福岡")]),
            Arc::new(DroppingTagger),
        );
        let err = broken.run(&urls(&["http://a.test/3"]), &db_path).await.unwrap_err();
        assert!(matches!(err, PipelineError::Alignment { kanji: 5, pos: 4, pos_translated: 4 }));
        assert_eq!(counts(&db_path), before);

        // the url was given back and is picked up again by a healthy run
        let healthy = pipeline(
            FakeFetcher::new(&[("http://a.test/3", "東京、大阪、京都、札幌、福岡")]),
            tagger(),
        );
        let report = healthy.run(&urls(&["http://a.test/3"]), &db_path).await.unwrap();
        assert_eq!(report.new_urls, urls(&["http://a.test/3"]));
        assert_eq!(report.records.len(), 5);
    }

    #[tokio::test]
    async fn known_url_gives_empty_load() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("news.sqlite");
        let p = pipeline(FakeFetcher::new(&pages()), tagger());
        p.run(&urls(&["http://a.test/1"]), &db_path).await.unwrap();

        let report = p.run(&urls(&["http://a.test/1#comments"]), &db_path).await.unwrap();
        assert!(report.new_urls.is_empty());
        assert!(report.records.is_empty());
    }

    #[tokio::test]
    async fn failed_fetch_is_skipped_and_retried_later() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("news.sqlite");
        let input = urls(&["http://a.test/1", "http://a.test/missing"]);

        let p = pipeline(FakeFetcher::new(&pages()), tagger());
        let report = p.run(&input, &db_path).await.unwrap();
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].url, "http://a.test/missing");
        assert!(!report.records.is_empty());

        let conn = db::connect(&db_path).unwrap();
        let known = db::fetch_known_urls(&conn).unwrap();
        assert!(!known.contains("http://a.test/missing"));

        let retry_fetcher = FakeFetcher::new(&[("http://a.test/missing", "再取得成功")]);
        let retry = pipeline(Arc::clone(&retry_fetcher), tagger());
        let report = retry.run(&input, &db_path).await.unwrap();
        assert_eq!(report.new_urls, urls(&["http://a.test/missing"]));
        assert_eq!(retry_fetcher.calls(), urls(&["http://a.test/missing"]));
    }

    #[tokio::test]
    async fn loaded_rows_satisfy_filters() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("news.sqlite");
        let p = pipeline(
            FakeFetcher::new(&[("http://a.test/1", "※注意。東京を走る。")]),
            tagger(),
        );
        let report = p.run(&urls(&["http://a.test/1"]), &db_path).await.unwrap();
        let excluded = PipelineOptions::default().excluded_pos;
        assert!(!report.records.is_empty());
        for r in &report.records {
            assert!(r.kanji.chars().any(transform::is_japanese_char));
            assert!(!excluded.contains(&r.pos));
        }
    }

    #[tokio::test]
    async fn token_rows_never_decrease() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("news.sqlite");
        let p = pipeline(FakeFetcher::new(&pages()), tagger());

        let mut last = 0;
        for batch in [vec!["http://a.test/1"], vec!["http://a.test/1", "http://a.test/2"], vec![]] {
            p.run(&urls(&batch), &db_path).await.unwrap();
            let (_, rows) = counts(&db_path);
            assert!(rows >= last);
            last = rows;
        }
    }

    #[tokio::test]
    async fn crashed_run_is_reconciled() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("news.sqlite");
        seed_uncommitted(&db_path, "run-crashed", &["http://a.test/1"]);
        assert_eq!(reconcile(&db_path).unwrap(), 1);

        let p = pipeline(FakeFetcher::new(&pages()), tagger());
        let report = p.run(&urls(&["http://a.test/1"]), &db_path).await.unwrap();
        assert_eq!(report.new_urls, urls(&["http://a.test/1"]));
    }

    #[tokio::test]
    async fn stale_crashed_run_is_healed_by_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("news.sqlite");
        seed_uncommitted(&db_path, "run-crashed", &["http://a.test/1"]);

        let mut p = pipeline(FakeFetcher::new(&pages()), tagger());
        p.options.stale_after_secs = 0;
        let report = p.run(&urls(&["http://a.test/1"]), &db_path).await.unwrap();
        assert_eq!(report.new_urls, urls(&["http://a.test/1"]));
        assert!(!report.records.is_empty());

        let conn = db::connect(&db_path).unwrap();
        let s = db::get_stats(&conn).unwrap();
        assert_eq!((s.ledger_urls, s.pending_urls, s.runs), (1, 0, 1));
    }

    #[tokio::test]
    async fn recent_uncommitted_run_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("news.sqlite");
        seed_uncommitted(&db_path, "run-in-flight", &["http://a.test/1"]);

        let p = pipeline(FakeFetcher::new(&pages()), tagger());
        let report = p.run(&urls(&["http://a.test/1"]), &db_path).await.unwrap();
        assert!(report.new_urls.is_empty());
        assert_eq!(report.already_known, 1);
    }

    #[tokio::test]
    async fn empty_input_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("news.sqlite");
        let p = pipeline(FakeFetcher::new(&[]), tagger());
        let report = p.run(&[], &db_path).await.unwrap();
        assert!(report.records.is_empty());
        assert_eq!(counts(&db_path), (0, 0));
        let conn = db::connect(&db_path).unwrap();
        assert_eq!(db::get_stats(&conn).unwrap().runs, 0);
    }
}
