//! Heuristic repair of scraped papers.
//!
//! The scrapers which produce paper files often miss a question's score, fail to mark the essay
//! question as such, or leave its word limit unset. Most of this can be recovered from the text of
//! the question itself, since exam papers follow rigid conventions: scores are written as
//! `（15分）` after the question, and essay requirements read like `不少于1000字`.

use super::fields;
use anyhow::Error;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

static SCORE_IN_TEXT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[（(](\d{1,2})分[）)]").unwrap());
// Titles are sometimes cut off in the middle of the score, as in `……（25` or `……（25分`.
static SCORE_AT_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"[（(](\d{1,2})分?\s*$").unwrap());

static AT_LEAST: Lazy<Regex> = Lazy::new(|| Regex::new(r"不少于(\d+)字").unwrap());
static RANGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)[~—\-]\s*(\d+)字").unwrap());
static ABOUT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)字\s*左右|约\s*(\d+)字").unwrap());

static ESSAY_LENGTH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"不少于\d+字|\d+[~—\-]\s*\d+字|\d+字\s*左右|约\s*\d+字|总字数\s*\d+").unwrap()
});
static SHORT_LENGTH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"不超过[3-6]\d{2}字|[34]\d{2}-[45]\d{2}字").unwrap());

/// Practical writing tasks which can look like essays but are graded as small questions.
const SHORT_DOCUMENTS: [&str; 8] = [
    "简报", "报告", "倡议书", "短评", "宣传稿", "报道", "提纲", "动员",
];

/// The minimum word limit of an essay.
const ESSAY_MIN_WORDS: u64 = 600;

fn text<'a>(question: &'a Value, key: &str) -> &'a str {
    question.get(key).and_then(Value::as_str).unwrap_or("")
}

/// Parse the score of a question from its title or requirements.
pub fn parse_score(question: &Value) -> Option<u64> {
    let title = text(question, "title");
    let requirements = text(question, "requirements");
    let captures = SCORE_IN_TEXT
        .captures(title)
        .or_else(|| SCORE_IN_TEXT.captures(requirements))
        .or_else(|| SCORE_AT_END.captures(title))?;
    fields::digits(&captures[1])
}

/// Parse the word limit of an essay from its requirements.
///
/// A range is resolved to its midpoint. Upper bounds (`不超过500字`) belong to small questions and
/// are ignored.
pub fn parse_word_limit(requirements: &str) -> Option<u64> {
    if let Some(captures) = AT_LEAST.captures(requirements) {
        return fields::digits(&captures[1]);
    }
    if let Some(captures) = RANGE.captures(requirements) {
        let low = fields::digits(&captures[1])?;
        let high = fields::digits(&captures[2])?;
        return Some((low + high) / 2);
    }
    let captures = ABOUT.captures(requirements)?;
    fields::digits(captures.get(1).or_else(|| captures.get(2))?.as_str())
}

/// Does the question at `index` (of `count`) look like the essay?
///
/// The essay is always the last question of a paper.
pub fn is_essay(question: &Value, index: usize, count: usize) -> bool {
    if index + 1 != count {
        return false;
    }
    let title = text(question, "title");
    let requirements = text(question, "requirements");

    if SHORT_DOCUMENTS.iter().any(|doc| title.contains(doc)) && SHORT_LENGTH.is_match(requirements)
    {
        return false;
    }

    let essay_title = title.contains("写一篇")
        || title.contains("写⼀篇")
        || (title.contains("自拟题") && title.contains('写'))
        || (title.contains("联系实际") && title.contains('写'));
    let word_limit = question
        .get("wordLimit")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    ESSAY_LENGTH.is_match(requirements) || (essay_title && word_limit >= ESSAY_MIN_WORDS)
}

/// Fill in whatever can be recovered from the text of the questions in `paper`.
///
/// Returns whether the paper was changed.
pub fn repair_paper(paper: &mut Value) -> bool {
    let all_materials = fields::objects(paper, "materials")
        .filter_map(|material| material.get("id").cloned())
        .collect::<Vec<_>>();
    let all_material_ids = all_materials
        .iter()
        .filter_map(fields::id_string)
        .collect::<HashSet<_>>();

    let Some(questions) = paper.get_mut("questions").and_then(Value::as_array_mut) else {
        return false;
    };
    let count = questions.len();
    let mut modified = false;
    for (index, question) in questions.iter_mut().enumerate() {
        if !question.is_object() {
            continue;
        }

        if let Some(score) = parse_score(question) {
            if question.get("maxScore").and_then(Value::as_u64) != Some(score) {
                question["maxScore"] = json!(score);
                modified = true;
            }
        }

        if !is_essay(question, index, count) {
            continue;
        }
        if question.get("type").and_then(Value::as_str) != Some("ESSAY") {
            question["type"] = json!("ESSAY");
            modified = true;
        }
        let material_ids = question
            .get("materialIds")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(fields::id_string).collect::<HashSet<_>>())
            .unwrap_or_default();
        if material_ids != all_material_ids {
            question["materialIds"] = Value::Array(all_materials.clone());
            modified = true;
        }
        if let Some(limit) = parse_word_limit(text(question, "requirements")) {
            if question.get("wordLimit").and_then(Value::as_u64) != Some(limit) {
                question["wordLimit"] = json!(limit);
                modified = true;
            }
        }
    }
    modified
}

/// Repair every paper in `dir` whose file name starts with one of `prefixes` (or every paper, if
/// `prefixes` is empty).
///
/// Changed papers are written back in place. Returns the names of the changed files.
pub fn repair_dir(dir: impl AsRef<Path>, prefixes: &[String]) -> Result<Vec<String>, Error> {
    let dir = dir.as_ref();
    let mut names = dir
        .read_dir()?
        .filter_map(|dirent| match dirent {
            Ok(dirent) => dirent.file_name().into_string().ok(),
            Err(err) => {
                tracing::error!("unable to read directory {}: {err}", dir.display());
                None
            }
        })
        .filter(|name| name.ends_with(".json"))
        .filter(|name| prefixes.is_empty() || prefixes.iter().any(|p| name.starts_with(p)))
        .collect::<Vec<_>>();
    names.sort();

    let mut repaired = vec![];
    for name in names {
        let path = dir.join(&name);
        let mut paper: Value = match fs::read(&path)
            .map_err(Error::from)
            .and_then(|bytes| Ok(serde_json::from_slice(&bytes)?))
        {
            Ok(paper) => paper,
            Err(err) => {
                tracing::error!("unable to load paper {}: {err:#}", path.display());
                continue;
            }
        };
        if repair_paper(&mut paper) {
            fs::write(&path, serde_json::to_string_pretty(&paper)?)?;
            tracing::info!("repaired {name}");
            repaired.push(name);
        }
    }
    Ok(repaired)
}
