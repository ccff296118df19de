//! The catalog of exam papers.
//!
//! Papers are stored as one JSON file per paper in a data directory:
//!
//! ```text
//! DIR/
//!     <id>.json
//! ```
//!
//! The whole directory is loaded into memory at startup, so that serving the index or a single
//! paper never touches the disk. Papers which appear on disk after startup are still served, by
//! falling back to reading the file directly.

use anyhow::Error;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub mod fields;
pub mod repair;

/// The region of papers from the national exam, which are listed before all provincial papers.
pub const NATIONWIDE: &str = "全国";

const DEFAULT_NAME: &str = "未命名试卷";
const DEFAULT_YEAR: i64 = 2024;
const DEFAULT_EXAM_TYPE: &str = "公务员";
const EMPTY_ETAG: &str = "\"empty\"";

/// Errors looking up a single paper.
#[derive(Debug, thiserror::Error)]
pub enum PaperError {
    #[error("试卷文件不存在: {0}")]
    NotFound(String),
    #[error("试卷解析失败: {0}")]
    Malformed(String),
}

/// The entry for a paper in the catalog index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaperSummary {
    pub id: String,
    pub name: String,
    pub year: i64,
    pub region: String,
    pub exam_type: String,
}

impl PaperSummary {
    fn new(id: String, paper: &Value) -> Self {
        let string = |key: &str, default: &str| {
            paper
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or(default)
                .to_string()
        };
        let year = match paper.get("year") {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        };
        Self {
            id,
            name: string("name", DEFAULT_NAME),
            year: year.unwrap_or(DEFAULT_YEAR),
            region: string("region", NATIONWIDE),
            exam_type: string("examType", DEFAULT_EXAM_TYPE),
        }
    }

    /// National papers first, then provinces by name, newest first within a region.
    fn sort_key(&self) -> (bool, &str, Reverse<i64>) {
        (self.region != NATIONWIDE, &self.region, Reverse(self.year))
    }
}

/// An in-memory copy of every paper in the data directory.
#[derive(Debug)]
pub struct Catalog {
    dir: PathBuf,
    index: Vec<PaperSummary>,
    papers: HashMap<String, Value>,
    paper_json: HashMap<String, Vec<u8>>,
    index_json: Vec<u8>,
    etag: String,
}

impl Catalog {
    /// Load every paper in `dir`.
    ///
    /// If `dir` does not exist it is created, and the catalog starts out empty. Files which cannot
    /// be read or parsed are logged and skipped.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let dir = dir.into();
        if !dir.is_dir() {
            tracing::warn!(
                "data directory {} does not exist, starting with an empty catalog",
                dir.display()
            );
            fs::create_dir_all(&dir)?;
            return Ok(Self::empty(dir));
        }

        let mut index = vec![];
        let mut papers = HashMap::new();
        let mut paper_json = HashMap::new();
        let mut paths = dir
            .read_dir()?
            .filter_map(|dirent| match dirent {
                Ok(dirent) => Some(dirent.path()),
                Err(err) => {
                    tracing::error!("unable to read directory {}: {err}", dir.display());
                    None
                }
            })
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("json"))
            .collect::<Vec<_>>();
        // Sorted, so that the choice among duplicate IDs is stable.
        paths.sort();
        for path in paths {
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                tracing::warn!("file {} has a malformed name, skipping", path.display());
                continue;
            };
            let paper = match read_paper(&path) {
                Ok(paper) => paper,
                Err(err) => {
                    tracing::error!("unable to load paper {}: {err:#}", path.display());
                    continue;
                }
            };

            let id = paper
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or(stem)
                .to_string();
            if papers.contains_key(&id) {
                tracing::warn!(
                    "duplicate paper {id} in {}, keeping the first copy",
                    path.display()
                );
                continue;
            }
            index.push(PaperSummary::new(id.clone(), &paper));
            paper_json.insert(id.clone(), serde_json::to_vec(&paper)?);
            papers.insert(id, paper);
        }
        index.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        let index_json = serde_json::to_vec(&index)?;
        let etag = format!("\"{}\"", hex::encode(Sha256::digest(&index_json)));
        tracing::info!(
            papers = index.len(),
            index_bytes = index_json.len(),
            %etag,
            "loaded catalog from {}",
            dir.display()
        );
        Ok(Self {
            dir,
            index,
            papers,
            paper_json,
            index_json,
            etag,
        })
    }

    fn empty(dir: PathBuf) -> Self {
        Self {
            dir,
            index: vec![],
            papers: HashMap::new(),
            paper_json: HashMap::new(),
            index_json: b"[]".to_vec(),
            etag: EMPTY_ETAG.into(),
        }
    }

    /// The sorted index of all papers.
    pub fn summaries(&self) -> &[PaperSummary] {
        &self.index
    }

    /// The serialized index, as served to clients.
    pub fn index_json(&self) -> &[u8] {
        &self.index_json
    }

    /// An entity tag identifying the current contents of the index.
    pub fn etag(&self) -> &str {
        &self.etag
    }

    /// The serialized contents of the paper `id`.
    ///
    /// A trailing `.json` on `id` is ignored.
    pub fn paper_json(&self, id: &str) -> Result<Cow<'_, [u8]>, PaperError> {
        let id = normalize_id(id);
        if let Some(json) = self.paper_json.get(id) {
            return Ok(Cow::Borrowed(json.as_slice()));
        }
        let paper = self.read_uncached(id)?;
        serde_json::to_vec(&paper)
            .map(Cow::Owned)
            .map_err(|err| PaperError::Malformed(err.to_string()))
    }

    /// The contents of the paper `id`, if it exists.
    pub fn paper(&self, id: &str) -> Option<Cow<'_, Value>> {
        let id = normalize_id(id);
        if let Some(paper) = self.papers.get(id) {
            return Some(Cow::Borrowed(paper));
        }
        match self.read_uncached(id) {
            Ok(paper) => Some(Cow::Owned(paper)),
            Err(err) => {
                tracing::warn!(
                    "paper {id} not available (data dir {}): {err}",
                    self.dir.display()
                );
                None
            }
        }
    }

    fn read_uncached(&self, id: &str) -> Result<Value, PaperError> {
        if !is_file_name(id) {
            return Err(PaperError::NotFound(id.into()));
        }
        let path = self.dir.join(format!("{id}.json"));
        if !path.is_file() {
            return Err(PaperError::NotFound(id.into()));
        }
        tracing::info!("paper {id} not cached, reading {}", path.display());
        read_paper(&path).map_err(|err| PaperError::Malformed(format!("{err:#}")))
    }
}

fn normalize_id(id: &str) -> &str {
    id.strip_suffix(".json").unwrap_or(id)
}

/// Only plain file names may be looked up on disk.
fn is_file_name(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains(['/', '\\'])
}

fn read_paper(path: &Path) -> Result<Value, Error> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}


#[cfg(test)]
mod test {
    use super::testing::{catalog, jiangsu_paper};
    use super::*;
    use serde_json::json;

    #[test]
    fn test_index_order_and_defaults() {
        let (_dir, catalog) = catalog([
            json!({"id": "zj_2022", "region": "浙江", "year": 2022}),
            json!({"id": "gk_2021", "region": "全国", "year": 2021}),
            json!({"id": "zj_2023", "region": "浙江", "year": 2023}),
            json!({"id": "ah_2020", "region": "安徽", "year": "2020"}),
            json!({"id": "gk_2023", "year": 2023}),
        ]);
        let ids = catalog
            .summaries()
            .iter()
            .map(|p| p.id.as_str())
            .collect::<Vec<_>>();
        // National papers first, then provinces ordered by name ("安" < "浙"), newest first.
        assert_eq!(ids, ["gk_2023", "gk_2021", "ah_2020", "zj_2023", "zj_2022"]);

        let defaulted = &catalog.summaries()[0];
        assert_eq!(defaulted.name, DEFAULT_NAME);
        assert_eq!(defaulted.region, NATIONWIDE);
        assert_eq!(defaulted.exam_type, DEFAULT_EXAM_TYPE);
        let ah = catalog.summaries().iter().find(|p| p.id == "ah_2020").unwrap();
        assert_eq!(ah.year, 2020);
    }

    #[test]
    fn test_index_json_is_camel_case() {
        let (_dir, catalog) = catalog([jiangsu_paper()]);
        let index: Value = serde_json::from_slice(catalog.index_json()).unwrap();
        assert_eq!(
            index,
            json!([{
                "id": "gwy_jiangsu_2024_A",
                "name": "2024年江苏省考申论（A类）",
                "year": 2024,
                "region": "江苏",
                "examType": "公务员"
            }])
        );
    }

    #[test]
    fn test_skips_malformed_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("good.json"), r#"{"name": "好试卷"}"#).unwrap();
        fs::write(dir.path().join("bad.json"), "{ not json").unwrap();
        fs::write(dir.path().join("notes.txt"), "{}").unwrap();
        let catalog = Catalog::load(dir.path()).unwrap();
        assert_eq!(catalog.summaries().len(), 1);
        // Without an explicit ID, the file name is used.
        assert_eq!(catalog.summaries()[0].id, "good");
    }

    #[test]
    fn test_missing_dir_is_created_empty() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        let catalog = Catalog::load(&data).unwrap();
        assert!(data.is_dir());
        assert_eq!(catalog.index_json(), b"[]");
        assert_eq!(catalog.etag(), EMPTY_ETAG);
    }

    #[test]
    fn test_etag_tracks_contents() {
        let (_a, first) = catalog([jiangsu_paper()]);
        let (_b, second) = catalog([jiangsu_paper()]);
        assert_eq!(first.etag(), second.etag());
        assert_eq!(
            first.etag(),
            format!("\"{:x}\"", Sha256::digest(first.index_json()))
        );

        let mut renamed = jiangsu_paper();
        renamed["name"] = json!("改名后的试卷");
        let (_c, third) = catalog([renamed]);
        assert_ne!(first.etag(), third.etag());
    }

    #[test]
    fn test_paper_lookup() {
        let (dir, catalog) = catalog([jiangsu_paper()]);

        let cached: Value =
            serde_json::from_slice(&catalog.paper_json("gwy_jiangsu_2024_A.json").unwrap())
                .unwrap();
        assert_eq!(cached, jiangsu_paper());

        // Papers added after startup are read from disk.
        fs::write(dir.path().join("late.json"), r#"{"id": "late"}"#).unwrap();
        assert_eq!(catalog.paper("late").unwrap()["id"], "late");
        assert!(matches!(catalog.paper_json("late"), Ok(Cow::Owned(_))));

        fs::write(dir.path().join("broken.json"), "[").unwrap();
        assert!(matches!(
            catalog.paper_json("broken"),
            Err(PaperError::Malformed(_))
        ));
        assert!(matches!(
            catalog.paper_json("missing"),
            Err(PaperError::NotFound(_))
        ));
        assert!(catalog.paper("missing").is_none());
    }

    #[test]
    fn test_lookup_rejects_paths() {
        let (dir, catalog) = catalog(Vec::new());
        let nested = dir.path().join("nested");
        fs::create_dir(&nested).unwrap();
        fs::write(nested.join("secret.json"), "{}").unwrap();
        assert!(matches!(
            catalog.paper_json("nested/secret"),
            Err(PaperError::NotFound(_))
        ));
        assert!(matches!(
            catalog.paper_json("../secret"),
            Err(PaperError::NotFound(_))
        ));
    }
}
