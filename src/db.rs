use std::collections::HashSet;
use std::path::Path;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::transform::TokenRecord;

pub fn connect(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
    Ok(conn)
}

/// Create every table and guard trigger. Safe to call on each run.
pub fn init_schema(conn: &Connection) -> Result<()> {
    ensure_schema(conn)?;
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS japan_news (
            id             INTEGER PRIMARY KEY,
            kanji          TEXT NOT NULL,
            pos            TEXT NOT NULL,
            pos_translated TEXT NOT NULL,
            run_id         TEXT NOT NULL,
            loaded_at      TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_japan_news_run ON japan_news(run_id);

        CREATE TRIGGER IF NOT EXISTS japan_news_no_update BEFORE UPDATE ON japan_news
        BEGIN SELECT RAISE(ABORT, 'japan_news is append-only'); END;
        CREATE TRIGGER IF NOT EXISTS japan_news_no_delete BEFORE DELETE ON japan_news
        BEGIN SELECT RAISE(ABORT, 'japan_news is append-only'); END;
        ",
    )?;
    Ok(())
}

/// URL ledger plus the run markers that commit it.
pub fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS news_urls (
            id          INTEGER PRIMARY KEY,
            url         TEXT UNIQUE NOT NULL,
            run_id      TEXT NOT NULL,
            recorded_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_news_urls_run ON news_urls(run_id);

        CREATE TABLE IF NOT EXISTS ingest_runs (
            run_id       TEXT PRIMARY KEY,
            url_count    INTEGER NOT NULL,
            token_rows   INTEGER NOT NULL,
            skipped_urls INTEGER NOT NULL,
            committed_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TRIGGER IF NOT EXISTS news_urls_no_update BEFORE UPDATE ON news_urls
        BEGIN SELECT RAISE(ABORT, 'news_urls is append-only'); END;
        CREATE TRIGGER IF NOT EXISTS news_urls_keep_committed BEFORE DELETE ON news_urls
        WHEN EXISTS (SELECT 1 FROM ingest_runs r WHERE r.run_id = OLD.run_id)
        BEGIN SELECT RAISE(ABORT, 'ledger rows of a committed run are permanent'); END;

        CREATE TRIGGER IF NOT EXISTS ingest_runs_no_update BEFORE UPDATE ON ingest_runs
        BEGIN SELECT RAISE(ABORT, 'ingest_runs is append-only'); END;
        CREATE TRIGGER IF NOT EXISTS ingest_runs_no_delete BEFORE DELETE ON ingest_runs
        BEGIN SELECT RAISE(ABORT, 'ingest_runs is append-only'); END;
        ",
    )?;
    Ok(())
}

/// Run `f` inside a transaction, or inside the caller's if one is open.
fn in_transaction<T>(conn: &Connection, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    if !conn.is_autocommit() {
        return f(conn);
    }
    let tx = conn.unchecked_transaction()?;
    let out = f(&*tx)?;
    tx.commit()?;
    Ok(out)
}

/// Write transaction for the check-and-record step. Taken up front so a
/// concurrent writer cannot slip between the read and the insert.
pub fn begin_immediate(conn: &Connection) -> Result<Transaction<'_>> {
    Ok(Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?)
}

// ── Ledger ──

pub fn fetch_known_urls(conn: &Connection) -> Result<HashSet<String>> {
    in_transaction(conn, |c| {
        let mut stmt = c.prepare("SELECT url FROM news_urls")?;
        let urls = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<HashSet<String>, _>>()?;
        Ok(urls)
    })
}

/// Candidates absent from `known`, first-seen order, no duplicates.
pub fn filter_new<S: AsRef<str>>(known: &HashSet<String>, candidates: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut fresh = Vec::new();
    for candidate in candidates {
        let url: &str = candidate.as_ref();
        if !known.contains(url) && seen.insert(url) {
            fresh.push(url.to_string());
        }
    }
    fresh
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Treat a URL another writer recorded first as already known.
    #[default]
    Skip,
    /// Abort the whole record step with `DuplicateUrl`.
    Fail,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecordOutcome {
    pub recorded: Vec<String>,
    pub duplicates: Vec<String>,
}

/// Insert new URLs for `run_id` in one transaction.
pub fn record_new(
    conn: &Connection,
    run_id: &str,
    new_urls: &[String],
    policy: DuplicatePolicy,
) -> Result<RecordOutcome> {
    in_transaction(conn, |c| {
        let mut outcome = RecordOutcome::default();
        let mut stmt = c.prepare("INSERT OR IGNORE INTO news_urls (url, run_id) VALUES (?1, ?2)")?;
        for url in new_urls {
            if stmt.execute(rusqlite::params![url, run_id])? == 1 {
                outcome.recorded.push(url.clone());
                continue;
            }
            match policy {
                DuplicatePolicy::Fail => return Err(PipelineError::DuplicateUrl(url.clone())),
                DuplicatePolicy::Skip => {
                    warn!(url = %url, "url recorded concurrently, treating as known");
                    outcome.duplicates.push(url.clone());
                }
            }
        }
        Ok(outcome)
    })
}

/// Drop the ledger rows of a run that never committed. Returns rows removed.
pub fn release_run(conn: &Connection, run_id: &str) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM news_urls
         WHERE run_id = ?1
           AND NOT EXISTS (SELECT 1 FROM ingest_runs r WHERE r.run_id = news_urls.run_id)",
        [run_id],
    )?;
    Ok(n)
}

/// Drop ledger rows left behind by any run that crashed before committing.
pub fn release_uncommitted(conn: &Connection) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM news_urls
         WHERE NOT EXISTS (SELECT 1 FROM ingest_runs r WHERE r.run_id = news_urls.run_id)",
        [],
    )?;
    if n > 0 {
        warn!(released = n, "released ledger rows of uncommitted runs");
    }
    Ok(n)
}

/// Like `release_uncommitted`, but only rows recorded at least
/// `max_age_secs` ago. A run still extracting keeps its ledger rows.
pub fn release_stale(conn: &Connection, max_age_secs: u64) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM news_urls
         WHERE recorded_at <= datetime('now', ?1)
           AND NOT EXISTS (SELECT 1 FROM ingest_runs r WHERE r.run_id = news_urls.run_id)",
        [format!("-{} seconds", max_age_secs)],
    )?;
    if n > 0 {
        warn!(released = n, max_age_secs, "released stale ledger rows of uncommitted runs");
    }
    Ok(n)
}

// ── Tokens ──

/// Append records to `japan_news` in one transaction. Empty input is a no-op.
pub fn append(conn: &Connection, run_id: &str, records: &[TokenRecord]) -> Result<usize> {
    if records.is_empty() {
        return Ok(0);
    }
    in_transaction(conn, |c| {
        let mut stmt = c.prepare(
            "INSERT INTO japan_news (kanji, pos, pos_translated, run_id) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for r in records {
            stmt.execute(rusqlite::params![r.kanji, r.pos, r.pos_translated, run_id])?;
        }
        Ok(records.len())
    })
}

pub struct RunCommit<'a> {
    pub run_id: &'a str,
    pub url_count: usize,
    pub skipped_urls: &'a [String],
    pub records: &'a [TokenRecord],
}

/// Single Load transaction: release unfetched URLs, check the run still owns
/// the rest, append tokens and mark the run committed. Nothing is visible
/// unless every step succeeds.
pub fn commit_run(conn: &Connection, run: &RunCommit<'_>) -> Result<usize> {
    in_transaction(conn, |c| {
        {
            let mut release =
                c.prepare("DELETE FROM news_urls WHERE run_id = ?1 AND url = ?2")?;
            for url in run.skipped_urls {
                release.execute(rusqlite::params![run.run_id, url])?;
            }
        }
        let expected = run.url_count.saturating_sub(run.skipped_urls.len());
        let found: usize = c.query_row(
            "SELECT COUNT(*) FROM news_urls WHERE run_id = ?1",
            [run.run_id],
            |r| r.get(0),
        )?;
        if found != expected {
            return Err(PipelineError::LedgerReleased {
                run_id: run.run_id.to_string(),
                expected,
                found,
            });
        }
        let rows = append(c, run.run_id, run.records)?;
        if run.url_count > 0 || rows > 0 {
            c.execute(
                "INSERT INTO ingest_runs (run_id, url_count, token_rows, skipped_urls)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    run.run_id,
                    run.url_count as i64,
                    rows as i64,
                    run.skipped_urls.len() as i64
                ],
            )?;
        }
        debug!(run_id = run.run_id, rows, "load committed");
        Ok(rows)
    })
}

// ── Stats ──

pub struct Stats {
    pub ledger_urls: usize,
    pub pending_urls: usize,
    pub token_rows: usize,
    pub runs: usize,
    pub last_commit: Option<String>,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let ledger_urls: usize = conn.query_row("SELECT COUNT(*) FROM news_urls", [], |r| r.get(0))?;
    let pending_urls: usize = conn.query_row(
        "SELECT COUNT(*) FROM news_urls u
         WHERE NOT EXISTS (SELECT 1 FROM ingest_runs r WHERE r.run_id = u.run_id)",
        [],
        |r| r.get(0),
    )?;
    let token_rows: usize = conn.query_row("SELECT COUNT(*) FROM japan_news", [], |r| r.get(0))?;
    let runs: usize = conn.query_row("SELECT COUNT(*) FROM ingest_runs", [], |r| r.get(0))?;
    let last_commit: Option<String> =
        conn.query_row("SELECT MAX(committed_at) FROM ingest_runs", [], |r| r.get(0))?;
    Ok(Stats {
        ledger_urls,
        pending_urls,
        token_rows,
        runs,
        last_commit,
    })
}
