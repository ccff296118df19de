//! Grading reports.

use super::request::ModelQuestion;
use crate::catalog::fields;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Number, Value};

/// Matches `得分：15/20`, `**得分**：15／满分20` and the like.
static SCORE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"得分[*：:\s]*(\d+)\s*[/／]\s*(?:满分)?\s*(\d+)").unwrap());

/// Assumed maximum score of a question which does not state one.
const DEFAULT_MAX_SCORE: u64 = 100;

/// Parse the score a model wrote into its report, as `(score, max_score)`.
pub fn parse_score(text: &str) -> Option<(u64, u64)> {
    let captures = SCORE.captures(text)?;
    Some((fields::digits(&captures[1])?, fields::digits(&captures[2])?))
}

/// The grading result returned to the client.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    /// The model's Markdown report.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_raw_output: Option<String>,
    pub score: u64,
    pub max_score: Number,
    pub overall_evaluation: String,
    pub detailed_comments: Vec<Value>,
    /// Scores by question ID, in question order.
    pub per_question: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_answer: Option<String>,
}

/// The score of a single question, when the report is broken down by question.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionScore {
    pub score: u64,
    pub max_score: Number,
    pub deductions: Vec<Deduction>,
    pub reference_answer: String,
}

/// Points taken off an answer, and why.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Deduction {
    pub point: String,
    pub deduct: u64,
}

impl Default for Report {
    fn default() -> Self {
        Self {
            content: None,
            model_raw_output: None,
            score: 0,
            max_score: DEFAULT_MAX_SCORE.into(),
            overall_evaluation: String::new(),
            detailed_comments: vec![],
            per_question: Map::new(),
            model_answer: None,
        }
    }
}

impl Report {
    /// A report carrying the model's Markdown output.
    ///
    /// The score is parsed out of the text. If the text does not state a maximum, the maximum is
    /// the total of the questions' scores.
    pub fn from_model(text: &str, questions: &[ModelQuestion]) -> Self {
        let (score, max_score) = match parse_score(text) {
            Some((score, max_score)) => (score, max_score.into()),
            None => (0, total_max_score(questions)),
        };
        Self {
            content: Some(text.into()),
            model_raw_output: Some(text.into()),
            score,
            max_score,
            model_answer: Some(String::new()),
            ..Default::default()
        }
    }

    /// A zero-score report for a model response that could not be used.
    pub fn unparsable(questions: &[ModelQuestion], message: &str, raw: &str) -> Self {
        let per_question = questions
            .iter()
            .enumerate()
            .map(|(i, q)| {
                let score = QuestionScore {
                    score: 0,
                    max_score: max_score(q),
                    deductions: vec![],
                    reference_answer: "（模型未返回有效结果）".into(),
                };
                (question_key(q, i), score)
            })
            .collect::<Vec<_>>();
        Self {
            model_raw_output: Some(raw.into()),
            max_score: total_max_score(questions),
            overall_evaluation: format!("【解析异常】{message}"),
            per_question: per_question_json(per_question),
            ..Default::default()
        }
    }

    /// A placeholder report for when no language model is available.
    ///
    /// Longer answers get a higher placeholder score, so that the frontend can still be exercised
    /// end to end.
    pub fn simulated(questions: &[ModelQuestion], answers: &Map<String, Value>) -> Self {
        let per_question = questions
            .iter()
            .enumerate()
            .map(|(i, q)| {
                let key = question_key(q, i);
                let max_score = max_score(q);
                let answer_len = match answers.get(&key) {
                    Some(Value::String(answer)) => answer.chars().count(),
                    Some(answer) => answer.to_string().chars().count(),
                    None => 0,
                };
                let ratio = if answer_len > 50 { 0.8 } else { 0.6 };
                let title = match &q.title {
                    Value::String(title) => title.clone(),
                    title => title.to_string(),
                };
                let points = max_score.as_f64().unwrap_or_default();
                let score = QuestionScore {
                    score: (points * ratio) as u64,
                    max_score,
                    deductions: vec![Deduction {
                        point: "论证不够丰满".into(),
                        deduct: ((points * 0.2) as u64).max(1),
                    }],
                    reference_answer: format!("（模拟参考答案，基于题目 {title}）"),
                };
                (key, score)
            })
            .collect::<Vec<_>>();
        Self {
            score: per_question.iter().map(|(_, q)| q.score).sum(),
            max_score: total(
                &per_question
                    .iter()
                    .map(|(_, q)| q.max_score.clone())
                    .collect::<Vec<_>>(),
            ),
            overall_evaluation:
                "【后端模拟评分】这是一个自动生成的模拟结果，用于在未配置语言模型时的占位。".into(),
            per_question: per_question_json(per_question),
            ..Default::default()
        }
    }
}

fn max_score(question: &ModelQuestion) -> Number {
    question
        .max_score
        .clone()
        .unwrap_or_else(|| DEFAULT_MAX_SCORE.into())
}

fn total_max_score(questions: &[ModelQuestion]) -> Number {
    if questions.is_empty() {
        return DEFAULT_MAX_SCORE.into();
    }
    total(&questions.iter().map(max_score).collect::<Vec<_>>())
}

/// Sum scores, staying integral unless some score is fractional.
fn total(scores: &[Number]) -> Number {
    if let Some(total) = scores.iter().map(Number::as_u64).sum::<Option<u64>>() {
        return total.into();
    }
    Number::from_f64(scores.iter().filter_map(Number::as_f64).sum())
        .unwrap_or_else(|| DEFAULT_MAX_SCORE.into())
}

fn per_question_json(scores: Vec<(String, QuestionScore)>) -> Map<String, Value> {
    scores
        .into_iter()
        .filter_map(|(key, score)| Some((key, serde_json::to_value(score).ok()?)))
        .collect()
}

/// Questions without an ID are keyed by their 1-based position.
fn question_key(question: &ModelQuestion, index: usize) -> String {
    Some(&question.id)
        .filter(|id| fields::truthy(id))
        .and_then(fields::id_string)
        .unwrap_or_else(|| (index + 1).to_string())
}
