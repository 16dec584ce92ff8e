//! Append-only play history (C9).
//!
//! Every finished play lands in two places: a per-day newline-delimited
//! JSON file (`play_log_YYYY_MM_DD.json`) and the global `playhistory`
//! sorted set keyed by end timestamp. The files are the durable record; the
//! sorted set is the fast range index and is re-imported from the files on
//! startup. The throwback recommendation strategy queries the files for
//! plays from the same day of week.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Local, NaiveDate, Weekday};
use rand::seq::SliceRandom;

use crate::error::{SongnestError, SongnestResult};
use crate::model::PlayRecord;
use crate::store::Store;

/// Global sorted-set key for the play index (deliberately not nest-scoped:
/// throwbacks draw from the whole system's history).
const PLAYHISTORY_KEY: &str = "playhistory";

/// A throwback candidate: a historical play reduced to its URI and the
/// identity that originally queued it.
#[derive(Debug, Clone, PartialEq)]
pub struct ThrowbackPlay {
    pub trackid: String,
    pub user: String,
}

/// Durable play-history store.
pub struct PlayHistory {
    store: Store,
    log_dir: PathBuf,
}

impl PlayHistory {
    /// Creates the history store, ensuring the log directory exists.
    pub fn new(store: Store, log_dir: PathBuf) -> SongnestResult<Self> {
        std::fs::create_dir_all(&log_dir)
            .map_err(|e| SongnestError::Internal(format!("cannot create log dir: {e}")))?;
        Ok(Self { store, log_dir })
    }

    fn log_file_for(&self, date: NaiveDate) -> PathBuf {
        self.log_dir.join(log_file_name(date))
    }

    /// Records a finished play: appends the JSON line to today's log file
    /// and mirrors it into the sorted set.
    pub async fn record(&self, record: &PlayRecord) -> SongnestResult<()> {
        let line = serde_json::to_string(record)
            .map_err(|e| SongnestError::Internal(format!("cannot serialize play: {e}")))?;
        let path = self.log_file_for(Local::now().date_naive());
        if let Err(e) = append_line(&path, &line) {
            // The sorted-set mirror still gets the play; losing a log line
            // only thins future throwbacks.
            log::error!("[History] Failed to append play to {}: {}", path.display(), e);
        }
        self.add_play(&line).await
    }

    /// Adds one serialized play to the sorted-set index, keyed by its end
    /// timestamp. Duplicate lines (already indexed) are skipped.
    pub async fn add_play(&self, line: &str) -> SongnestResult<()> {
        let Some(endtime) = play_endtime(line) else {
            log::warn!("[History] Skipping play without parsable endtime");
            return Ok(());
        };
        if self.store.zscore(PLAYHISTORY_KEY, line).await?.is_some() {
            return Ok(());
        }
        self.store.zadd(PLAYHISTORY_KEY, line, endtime).await?;
        Ok(())
    }

    /// Re-imports any play-log files into the sorted set. Called once at
    /// startup so the index survives store flushes.
    pub async fn init_from_logs(&self) -> SongnestResult<()> {
        let started = std::time::Instant::now();
        let mut imported = 0usize;
        for path in self.log_files()? {
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    log::warn!("[History] Cannot read {}: {}", path.display(), e);
                    continue;
                }
            };
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                if serde_json::from_str::<serde_json::Value>(line).is_err() {
                    log::warn!("[History] Skipping broken play line in {}", path.display());
                    continue;
                }
                self.add_play(line).await?;
                imported += 1;
            }
        }
        log::info!(
            "[History] Indexed {} plays in {:?}",
            imported,
            started.elapsed()
        );
        Ok(())
    }

    /// Number of indexed plays.
    pub async fn num_plays(&self) -> SongnestResult<u64> {
        Ok(self.store.zcard(PLAYHISTORY_KEY).await?)
    }

    /// The most recent `n` plays, oldest first.
    pub async fn recent_plays(&self, n: u64) -> SongnestResult<Vec<serde_json::Value>> {
        let total = self.num_plays().await?;
        let start = total.saturating_sub(n) as isize;
        let raw = self.store.zrange(PLAYHISTORY_KEY, start, -1).await?;
        Ok(raw
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    /// Throwback candidates: plays from log files whose date falls on
    /// `weekday`, deduplicated by URI, shuffled, capped at `limit`.
    pub fn throwback_candidates(
        &self,
        weekday: Weekday,
        limit: usize,
    ) -> SongnestResult<Vec<ThrowbackPlay>> {
        let mut plays = Vec::new();
        for path in self.log_files()? {
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            let Some(date) = parse_log_date(name) else {
                continue;
            };
            if date.weekday() != weekday {
                continue;
            }
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(_) => continue,
            };
            for line in content.lines() {
                if let Some(play) = parse_throwback_line(line) {
                    plays.push(play);
                }
            }
        }
        Ok(dedupe_shuffle_cap(plays, limit, &mut rand::thread_rng()))
    }

    fn log_files(&self) -> SongnestResult<Vec<PathBuf>> {
        let entries = std::fs::read_dir(&self.log_dir)
            .map_err(|e| SongnestError::Internal(format!("cannot read log dir: {e}")))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("play_log_") && n.ends_with(".json"))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

/// File name for one day's log: `play_log_2026_08_01.json`.
pub fn log_file_name(date: NaiveDate) -> String {
    date.format("play_log_%Y_%m_%d.json").to_string()
}

/// Parses the date back out of a log file name.
pub fn parse_log_date(file_name: &str) -> Option<NaiveDate> {
    let stem = file_name.strip_prefix("play_log_")?.strip_suffix(".json")?;
    NaiveDate::parse_from_str(stem, "%Y_%m_%d").ok()
}

/// Extracts the Unix-seconds end timestamp from a serialized play.
fn play_endtime(line: &str) -> Option<f64> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let endtime = value.get("endtime")?.as_str()?;
    let parsed = DateTime::parse_from_rfc3339(endtime).ok()?;
    Some(parsed.timestamp() as f64)
}

fn parse_throwback_line(line: &str) -> Option<ThrowbackPlay> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let trackid = value.get("trackid")?.as_str()?.to_string();
    if trackid.is_empty() {
        return None;
    }
    let user = value
        .get("user")
        .and_then(|u| u.as_str())
        .unwrap_or_default()
        .to_string();
    Some(ThrowbackPlay { trackid, user })
}

/// Deduplicates by URI (first occurrence wins), shuffles, caps at `limit`.
fn dedupe_shuffle_cap<R: rand::Rng>(
    plays: Vec<ThrowbackPlay>,
    limit: usize,
    rng: &mut R,
) -> Vec<ThrowbackPlay> {
    let mut seen = std::collections::HashSet::new();
    let mut unique: Vec<ThrowbackPlay> = plays
        .into_iter()
        .filter(|p| seen.insert(p.trackid.clone()))
        .collect();
    unique.shuffle(rng);
    unique.truncate(limit);
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn log_file_name_round_trips() {
        let date = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        let name = log_file_name(date);
        assert_eq!(name, "play_log_2026_08_01.json");
        assert_eq!(parse_log_date(&name), Some(date));
    }

    #[test]
    fn parse_log_date_rejects_foreign_files() {
        assert_eq!(parse_log_date("notes.txt"), None);
        assert_eq!(parse_log_date("play_log_garbage.json"), None);
        assert_eq!(parse_log_date("play_log_2026_13_40.json"), None);
    }

    #[test]
    fn play_endtime_reads_rfc3339() {
        let line = r#"{"trackid":"spotify:track:a","endtime":"1970-01-01T00:01:00+00:00"}"#;
        assert_eq!(play_endtime(line), Some(60.0));
    }

    #[test]
    fn play_endtime_rejects_missing_field() {
        assert_eq!(play_endtime(r#"{"trackid":"x"}"#), None);
        assert_eq!(play_endtime("not json"), None);
    }

    #[test]
    fn throwback_line_requires_trackid() {
        assert!(parse_throwback_line(r#"{"user":"bob@x"}"#).is_none());
        let play = parse_throwback_line(r#"{"trackid":"spotify:track:a","user":"bob@x"}"#).unwrap();
        assert_eq!(play.user, "bob@x");
    }

    #[test]
    fn dedupe_keeps_first_contributor() {
        let plays = vec![
            ThrowbackPlay {
                trackid: "t1".into(),
                user: "alice@x".into(),
            },
            ThrowbackPlay {
                trackid: "t1".into(),
                user: "bob@x".into(),
            },
            ThrowbackPlay {
                trackid: "t2".into(),
                user: "carol@x".into(),
            },
        ];
        let mut rng = StepRng::new(0, 1);
        let result = dedupe_shuffle_cap(plays, 10, &mut rng);
        assert_eq!(result.len(), 2);
        let t1 = result.iter().find(|p| p.trackid == "t1").unwrap();
        assert_eq!(t1.user, "alice@x");
    }

    #[test]
    fn cap_limits_candidate_count() {
        let plays: Vec<ThrowbackPlay> = (0..50)
            .map(|i| ThrowbackPlay {
                trackid: format!("t{i}"),
                user: "x@x".into(),
            })
            .collect();
        let mut rng = StepRng::new(0, 1);
        assert_eq!(dedupe_shuffle_cap(plays, 20, &mut rng).len(), 20);
    }

    #[tokio::test]
    async fn record_appends_one_line_per_play() {
        // File-side behavior only; the store mirror needs a live backend.
        let dir = tempfile::tempdir().unwrap();
        let date = Local::now().date_naive();
        let path = dir.path().join(log_file_name(date));
        append_line(&path, r#"{"trackid":"a"}"#).unwrap();
        append_line(&path, r#"{"trackid":"b"}"#).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
