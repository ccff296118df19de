//! Daily submission statistics.
//!
//! Submissions are counted per day, in Beijing time, split into small questions and essays, along
//! with the number of distinct client IPs. Records go to SQLite when a database path is
//! configured. Without one (or if the database cannot be opened) they are kept in memory and
//! mirrored to a JSON file, which is reloaded on startup.

use anyhow::Error;
use chrono::{NaiveDateTime, Utc};
use chrono_tz::Asia::Shanghai;
use clap::Args;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use strum::{Display, EnumString};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS submit_records (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        submit_time TEXT    NOT NULL,
        is_essay    INTEGER NOT NULL,
        client_ip   TEXT
    )
";

const SUMMARY_QUERY: &str = "
    SELECT
        substr(submit_time, 1, 10) AS date,
        SUM(CASE WHEN is_essay = 0 THEN 1 ELSE 0 END),
        SUM(CASE WHEN is_essay = 1 THEN 1 ELSE 0 END),
        COUNT(DISTINCT client_ip)
    FROM submit_records
    GROUP BY date
    ORDER BY date DESC
";

/// The kind of a submission, for statistics.
#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Hash)]
#[strum(serialize_all = "snake_case")]
pub enum SubmissionKind {
    /// One or more small questions.
    Small,
    /// The essay question.
    Essay,
}

/// Statistics storage options.
#[derive(Clone, Debug, Args)]
pub struct Options {
    /// SQLite database for submission statistics.
    ///
    /// If not given, statistics are kept in memory and mirrored to `--stats-json`.
    #[clap(long, env = "STATS_DB_PATH")]
    pub stats_db: Option<PathBuf>,

    /// JSON file mirroring in-memory statistics.
    #[clap(long, env = "STATS_JSON_PATH", default_value = "submit_stats.json")]
    pub stats_json: PathBuf,
}

impl Options {
    /// Open the configured statistics store.
    pub fn open(&self) -> Stats {
        Stats::open(
            self.stats_db.as_deref().filter(|path| !path.as_os_str().is_empty()),
            &self.stats_json,
        )
    }
}

/// Statistics for one day.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyStats {
    /// `YYYY-MM-DD`, Beijing time.
    pub date: String,
    /// Distinct client IPs.
    pub users: u64,
    pub small: u64,
    pub essay: u64,
}

/// All statistics, newest day first.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub by_date: Vec<DailyStats>,
    pub total_small: u64,
    pub total_essay: u64,
}

impl Summary {
    fn new(by_date: Vec<DailyStats>) -> Self {
        Self {
            total_small: by_date.iter().map(|day| day.small).sum(),
            total_essay: by_date.iter().map(|day| day.essay).sum(),
            by_date,
        }
    }
}

/// A submission statistics store.
pub struct Stats {
    backend: Mutex<Backend>,
}

enum Backend {
    Sqlite(Connection),
    Json {
        path: PathBuf,
        days: BTreeMap<String, Day>,
    },
}

/// The JSON statistics file.
#[derive(Serialize)]
struct JsonFile<'a> {
    by_date: &'a BTreeMap<String, Day>,
}

/// A day in the JSON file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Day {
    #[serde(default)]
    small: u64,
    #[serde(default)]
    essay: u64,
    #[serde(default)]
    ips: Vec<String>,
}

impl Stats {
    /// Open a statistics store.
    ///
    /// Uses the SQLite database at `db` if given. If there is no database, or it cannot be
    /// initialized, statistics are kept in memory and mirrored to `json`.
    pub fn open(db: Option<&Path>, json: &Path) -> Self {
        if let Some(db) = db {
            match open_sqlite(db) {
                Ok(conn) => {
                    tracing::info!("recording submission statistics in SQLite at {}", db.display());
                    return Self {
                        backend: Mutex::new(Backend::Sqlite(conn)),
                    };
                }
                Err(err) => {
                    tracing::error!(
                        "unable to open statistics database {}, falling back to JSON: {err:#}",
                        db.display()
                    );
                }
            }
        }
        tracing::info!(
            "recording submission statistics in memory, mirrored to {}",
            json.display()
        );
        Self {
            backend: Mutex::new(Backend::Json {
                days: load_json(json),
                path: json.into(),
            }),
        }
    }

    /// Record a submission made now.
    ///
    /// Failures are logged, never returned: statistics must not fail a grading request.
    pub fn record(&self, kind: SubmissionKind, ip: Option<&str>) {
        self.record_at(Utc::now().with_timezone(&Shanghai).naive_local(), kind, ip)
    }

    /// Record a submission made at `time`, Beijing time.
    pub fn record_at(&self, time: NaiveDateTime, kind: SubmissionKind, ip: Option<&str>) {
        let ip = ip.map(str::trim).filter(|ip| !ip.is_empty());
        let mut backend = self.backend.lock().unwrap_or_else(PoisonError::into_inner);
        match backend.record(time, kind, ip) {
            Ok(()) => tracing::info!(%kind, ?ip, %time, "recorded submission"),
            Err(err) => tracing::error!("unable to record submission: {err:#}"),
        }
    }

    /// Get all statistics. Returns an empty summary if the statistics cannot be read.
    pub fn summary(&self) -> Summary {
        let backend = self.backend.lock().unwrap_or_else(PoisonError::into_inner);
        backend.summary().unwrap_or_else(|err| {
            tracing::error!("unable to read submission statistics: {err:#}");
            Summary::default()
        })
    }
}

impl Backend {
    fn record(
        &mut self,
        time: NaiveDateTime,
        kind: SubmissionKind,
        ip: Option<&str>,
    ) -> Result<(), Error> {
        match self {
            Self::Sqlite(conn) => {
                conn.execute(
                    "INSERT INTO submit_records (submit_time, is_essay, client_ip) \
                     VALUES (?1, ?2, ?3)",
                    params![
                        time.format("%Y-%m-%dT%H:%M:%S").to_string(),
                        kind == SubmissionKind::Essay,
                        ip
                    ],
                )?;
            }
            Self::Json { path, days } => {
                let day = days.entry(time.format("%Y-%m-%d").to_string()).or_default();
                match kind {
                    SubmissionKind::Small => day.small += 1,
                    SubmissionKind::Essay => day.essay += 1,
                }
                if let Some(ip) = ip {
                    if !day.ips.iter().any(|known| known == ip) {
                        day.ips.push(ip.into());
                    }
                }
                let json = serde_json::to_string_pretty(&JsonFile { by_date: days })?;
                fs::write(&*path, json)?;
            }
        }
        Ok(())
    }

    fn summary(&self) -> Result<Summary, Error> {
        let by_date = match self {
            Self::Sqlite(conn) => {
                let mut stmt = conn.prepare(SUMMARY_QUERY)?;
                let rows = stmt.query_map([], |row| {
                    let count = |i: usize| -> rusqlite::Result<u64> {
                        Ok(row
                            .get::<_, Option<i64>>(i)?
                            .and_then(|n| n.try_into().ok())
                            .unwrap_or(0))
                    };
                    Ok(DailyStats {
                        date: row.get(0)?,
                        small: count(1)?,
                        essay: count(2)?,
                        users: count(3)?,
                    })
                })?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            Self::Json { days, .. } => days
                .iter()
                .rev()
                .map(|(date, day)| DailyStats {
                    date: date.clone(),
                    users: day.ips.len() as u64,
                    small: day.small,
                    essay: day.essay,
                })
                .collect(),
        };
        Ok(Summary::new(by_date))
    }
}

fn open_sqlite(path: &Path) -> Result<Connection, Error> {
    let conn = Connection::open(path)?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// Load the days recorded in a JSON statistics file. Unreadable files and malformed days are
/// skipped.
fn load_json(path: &Path) -> BTreeMap<String, Day> {
    if !path.is_file() {
        return Default::default();
    }
    let by_date = match fs::read(path)
        .map_err(Error::from)
        .and_then(|bytes| Ok(serde_json::from_slice::<Value>(&bytes)?))
    {
        Ok(Value::Object(mut file)) => match file.remove("by_date") {
            Some(Value::Object(by_date)) => by_date,
            _ => Map::new(),
        },
        Ok(_) => Map::new(),
        Err(err) => {
            tracing::warn!("unable to load statistics from {}: {err:#}", path.display());
            return Default::default();
        }
    };
    let days: BTreeMap<_, _> = by_date
        .into_iter()
        .filter_map(|(date, day)| match serde_json::from_value::<Day>(day) {
            Ok(day) => Some((date, day)),
            Err(err) => {
                tracing::warn!("skipping malformed statistics for {date}: {err}");
                None
            }
        })
        .collect();
    tracing::info!("loaded statistics for {} days from {}", days.len(), path.display());
    days
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    fn record_sample(stats: &Stats) {
        stats.record_at(at("2025-02-24 23:59"), SubmissionKind::Essay, Some("1.1.1.1"));
        stats.record_at(at("2025-02-25 08:00"), SubmissionKind::Small, Some("1.1.1.1"));
        stats.record_at(at("2025-02-25 09:00"), SubmissionKind::Small, Some("2.2.2.2"));
        stats.record_at(at("2025-02-25 10:00"), SubmissionKind::Essay, Some("1.1.1.1"));
        stats.record_at(at("2025-02-25 11:00"), SubmissionKind::Small, None);
    }

    fn expected() -> Summary {
        Summary {
            by_date: vec![
                DailyStats {
                    date: "2025-02-25".into(),
                    users: 2,
                    small: 3,
                    essay: 1,
                },
                DailyStats {
                    date: "2025-02-24".into(),
                    users: 1,
                    small: 0,
                    essay: 1,
                },
            ],
            total_small: 3,
            total_essay: 2,
        }
    }

    #[test]
    fn test_sqlite() {
        let tmp = TempDir::new().unwrap();
        let db = tmp.path().join("stats.db");
        let json = tmp.path().join("stats.json");

        let stats = Stats::open(Some(&db), &json);
        assert_eq!(stats.summary(), Summary::default());
        record_sample(&stats);
        assert_eq!(stats.summary(), expected());
        assert!(!json.exists());

        // Records survive a restart.
        drop(stats);
        assert_eq!(Stats::open(Some(&db), &json).summary(), expected());
    }

    #[test]
    fn test_json() {
        let tmp = TempDir::new().unwrap();
        let json = tmp.path().join("stats.json");

        let stats = Stats::open(None, &json);
        record_sample(&stats);
        assert_eq!(stats.summary(), expected());

        let file: Value = serde_json::from_slice(&fs::read(&json).unwrap()).unwrap();
        assert_eq!(
            file["by_date"]["2025-02-25"],
            serde_json::json!({"small": 3, "essay": 1, "ips": ["1.1.1.1", "2.2.2.2"]})
        );

        drop(stats);
        assert_eq!(Stats::open(None, &json).summary(), expected());
    }

    #[test]
    fn test_sqlite_falls_back_to_json() {
        let tmp = TempDir::new().unwrap();
        let db = tmp.path().join("missing").join("stats.db");
        let json = tmp.path().join("stats.json");

        let stats = Stats::open(Some(&db), &json);
        stats.record_at(at("2025-02-25 08:00"), SubmissionKind::Small, Some("1.1.1.1"));
        assert!(json.exists());
        assert_eq!(stats.summary().total_small, 1);
    }

    #[test]
    fn test_malformed_json() {
        let tmp = TempDir::new().unwrap();
        let json = tmp.path().join("stats.json");
        fs::write(
            &json,
            r#"{"by_date": {"2025-02-25": {"small": 2, "ips": ["a"]}, "2025-02-26": "junk"}}"#,
        )
        .unwrap();
        let summary = Stats::open(None, &json).summary();
        assert_eq!(
            summary.by_date,
            [DailyStats {
                date: "2025-02-25".into(),
                users: 1,
                small: 2,
                essay: 0,
            }]
        );

        fs::write(&json, "not json").unwrap();
        assert_eq!(Stats::open(None, &json).summary(), Summary::default());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(SubmissionKind::Essay.to_string(), "essay");
        assert_eq!("small".parse::<SubmissionKind>().unwrap(), SubmissionKind::Small);
    }
}
