//! Resolving a grading request against the catalog.
//!
//! The frontend has gone through several request formats, and all of them are still in use by
//! cached clients. A request may name a paper (`paperId`) or carry the paper inline (`questions`,
//! `materials`), and may answer a single question (`question_id` + `user_answer`) or several
//! (`answers`). [`Submission::resolve`] reduces all of these to a single [`GradingJob`] with
//! exactly the materials, questions and answers the model should see.

use super::{prompt::IMAGE_ANSWER_PLACEHOLDER, GradeError, Image};
use crate::catalog::{fields, Catalog};
use crate::stats::SubmissionKind;
use serde::{
    de::{Deserializer, Error as _},
    Deserialize, Serialize,
};
use serde_json::{json, Map, Number, Value};
use std::borrow::Cow;
use std::collections::HashSet;

const MISSING_PAPER: &str = "请求缺少 paperId 和 question_id，无法加载试卷。请刷新页面后再试；请求需包含 paperId、question_id、user_answer，或直接包含 answers。";
const MISSING_IMAGES: &str =
    "前端标记有图片但未收到图片数据，请稍等图片加载完成（约 1～2 秒）后再点击提交。";
const UNREADABLE_IMAGES: &str = "上传的作答图片无法解析，请重新拍照上传或改用文字作答。";
const INCOMPLETE_HINT: &str =
    "。请确认：1) 后端 data 目录已部署且含对应试卷 JSON；2) 前端请求带有 paperId 与 answers。";

/// The body of a grading request.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Submission {
    #[serde(rename = "paperId", default, deserialize_with = "lenient_id")]
    pub paper_id: Option<String>,
    /// Older clients send the paper ID as `id`.
    #[serde(default, deserialize_with = "lenient_id")]
    pub id: Option<String>,
    #[serde(rename = "paperName")]
    pub paper_name: Option<String>,
    pub region: Option<String>,
    #[serde(default, deserialize_with = "lenient_id")]
    pub question_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_ids")]
    pub question_ids: Option<Vec<String>>,
    pub user_answer: Option<String>,
    /// Answers keyed by question ID, in the order the user answered them.
    pub answers: Option<Map<String, Value>>,
    /// A single question sent inline.
    pub question: Option<Value>,
    pub questions: Option<Vec<Value>>,
    pub materials: Option<Vec<Value>>,
    /// Photos of handwritten answers, as data URLs.
    pub answer_images: Option<Vec<String>>,
    /// Set by the frontend when the answer is given as photos. Any truthy value counts.
    #[serde(default)]
    pub has_images: Value,
}

/// A question, reduced to the fields the model needs.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelQuestion {
    pub id: Value,
    pub title: Value,
    pub requirements: Value,
    pub max_score: Option<Number>,
}

impl ModelQuestion {
    fn new(question: &Value) -> Self {
        Self {
            id: question.get("id").cloned().unwrap_or(Value::Null),
            title: fields::first(question, &["title", "question", "text", "stem"])
                .cloned()
                .unwrap_or(Value::Null),
            requirements: fields::first(question, &["requirements", "要求"])
                .cloned()
                .unwrap_or_else(|| json!("")),
            max_score: fields::first(question, &["maxScore", "score"]).and_then(fields::score),
        }
    }
}

/// Everything needed to grade one submission.
#[derive(Clone, Debug)]
pub struct GradingJob {
    pub paper_id: String,
    pub paper_name: String,
    pub region: Option<String>,
    /// Whether the submission includes the essay question.
    pub essay: bool,
    pub materials: Vec<Value>,
    pub questions: Vec<ModelQuestion>,
    pub answers: Map<String, Value>,
    pub images: Vec<Image>,
}

impl GradingJob {
    /// The statistics bucket this submission counts towards.
    pub fn kind(&self) -> SubmissionKind {
        if self.essay {
            SubmissionKind::Essay
        } else {
            SubmissionKind::Small
        }
    }

    /// Is the answer given as photos?
    pub fn has_images(&self) -> bool {
        !self.images.is_empty()
    }
}

impl Submission {
    /// Resolve this submission into a grading job.
    ///
    /// Fails with [`GradeError::BadRequest`] if the request is inconsistent, or if after resolution
    /// there are no materials, questions or answers to send to the model.
    pub fn resolve(self, catalog: &Catalog) -> Result<GradingJob, GradeError> {
        let paper_id = self
            .paper_id
            .as_deref()
            .and_then(non_empty)
            .or_else(|| self.id.as_deref().and_then(non_empty));
        let question_id = self.question_id.as_deref().and_then(non_empty);
        let user_answer = self.user_answer.as_deref().and_then(non_empty);
        let payload_questions = self.questions.clone().unwrap_or_default();
        let payload_materials = self.materials.clone().unwrap_or_default();

        let mut answers = self.answers.clone().unwrap_or_default();

        let mut paper = match paper_id {
            Some(id) => catalog.paper(id),
            None if user_answer.is_some() && answers.is_empty() && question_id.is_none() => {
                return Err(GradeError::BadRequest(MISSING_PAPER.into()));
            }
            None => None,
        };
        if paper.is_none() && (!payload_questions.is_empty() || !payload_materials.is_empty()) {
            paper = Some(Cow::Owned(json!({
                "id": paper_id.unwrap_or("inline"),
                "name": self.paper_name.as_deref().unwrap_or("inline paper"),
                "materials": payload_materials,
                "questions": payload_questions,
            })));
        }

        if answers.is_empty() {
            if let (Some(qid), Some(answer)) = (question_id, user_answer) {
                answers.insert(qid.into(), answer.into());
            }
        }

        let raw_images = self.answer_images.clone().unwrap_or_default();
        let has_images = fields::truthy(&self.has_images);
        tracing::info!(
            has_images,
            images = raw_images.len(),
            "grading request"
        );
        if has_images && raw_images.is_empty() {
            return Err(GradeError::BadRequest(MISSING_IMAGES.into()));
        }
        let images = raw_images
            .iter()
            .enumerate()
            .filter_map(|(i, data_url)| {
                let image = Image::parse(data_url);
                if image.is_none() {
                    tracing::warn!(
                        "unable to parse image {}: {:.50}",
                        i + 1,
                        data_url.trim()
                    );
                }
                image
            })
            .collect::<Vec<_>>();
        if !raw_images.is_empty() && images.is_empty() {
            return Err(GradeError::BadRequest(UNREADABLE_IMAGES.into()));
        }
        if !images.is_empty() && answers.is_empty() {
            if let Some(qid) = question_id {
                answers.insert(qid.into(), IMAGE_ANSWER_PLACEHOLDER.into());
            }
        }

        let question_ids = if !answers.is_empty() {
            answers.keys().cloned().collect()
        } else if let Some(qid) = question_id {
            vec![qid.to_string()]
        } else {
            self.question_ids.clone().unwrap_or_default()
        };

        let paper_questions = paper
            .as_deref()
            .map(|paper| fields::objects(paper, "questions").collect::<Vec<_>>())
            .unwrap_or_default();
        let questions: Vec<&Value> = if question_ids.is_empty() {
            paper_questions.clone()
        } else {
            question_ids
                .iter()
                .filter_map(|qid| {
                    find_question(&paper_questions, qid).or_else(|| self.inline_question(qid))
                })
                .collect()
        };

        let materials = if !payload_materials.is_empty() {
            payload_materials.clone()
        } else {
            paper
                .as_deref()
                .map(|paper| fields::objects(paper, "materials").cloned().collect())
                .unwrap_or_default()
        };
        tracing::info!(
            ?paper_id,
            paper_loaded = paper.is_some(),
            materials = materials.len(),
            questions = questions.len(),
            answers = ?answers.keys().collect::<Vec<_>>(),
            "resolved grading request"
        );

        if materials.is_empty() || questions.is_empty() || answers.is_empty() {
            let mut missing = vec![];
            if materials.is_empty() {
                tracing::warn!("no materials; is the paper JSON deployed to the data directory?");
                missing.push("材料为空");
            }
            if questions.is_empty() {
                missing.push("题目为空");
            }
            if answers.is_empty() {
                missing.push("答案为空");
            }
            return Err(GradeError::BadRequest(format!(
                "{}{INCOMPLETE_HINT}",
                missing.join("；")
            )));
        }

        let essay = questions.iter().any(|q| fields::is_essay(q));
        let materials = if essay {
            // The essay is graded against the whole paper, so prefer the complete materials from
            // the catalog over whatever the client sent.
            let paper_materials = paper
                .as_deref()
                .map(|paper| fields::objects(paper, "materials").cloned().collect::<Vec<_>>())
                .unwrap_or_default();
            tracing::info!(
                paper = paper_materials.len(),
                payload = materials.len(),
                "essay question, sending all materials"
            );
            if paper_materials.is_empty() {
                materials
            } else {
                paper_materials
            }
        } else {
            self.select_materials(&questions, materials)
        };

        Ok(GradingJob {
            paper_id: paper
                .as_deref()
                .and_then(|paper| paper.get("id"))
                .and_then(fields::id_string)
                .or(paper_id.map(String::from))
                .unwrap_or_else(|| "unknown".into()),
            paper_name: match &paper {
                Some(paper) => paper.get("name").and_then(Value::as_str).unwrap_or(""),
                None => self.paper_name.as_deref().unwrap_or(""),
            }
            .to_string(),
            region: match &paper {
                Some(paper) => paper.get("region").and_then(Value::as_str),
                None => self.region.as_deref(),
            }
            .and_then(non_empty)
            .map(String::from),
            essay,
            materials,
            questions: questions.into_iter().map(ModelQuestion::new).collect(),
            answers,
            images,
        })
    }

    /// A question sent inline with the request, if it has the ID `qid`.
    fn inline_question(&self, qid: &str) -> Option<&Value> {
        self.question
            .iter()
            .chain(self.questions.iter().flatten())
            .find(|q| q.is_object() && fields::has_id(q, qid))
    }

    /// Only send a small question the materials it refers to.
    ///
    /// Material references are collected from the resolved questions and from any questions sent
    /// inline. If nothing refers to any material, all materials are sent.
    fn select_materials(&self, questions: &[&Value], materials: Vec<Value>) -> Vec<Value> {
        let referenced = questions
            .iter()
            .copied()
            .chain(self.question.iter())
            .chain(self.questions.iter().flatten())
            .filter(|q| q.is_object())
            .flat_map(fields::material_ids)
            .collect::<HashSet<_>>();
        if referenced.is_empty() {
            tracing::info!(
                materials = materials.len(),
                "small question without materialIds, sending all materials"
            );
            return materials;
        }

        let selected = materials
            .iter()
            .filter(|m| {
                m.get("id")
                    .and_then(fields::id_string)
                    .is_some_and(|id| referenced.contains(&id))
            })
            .cloned()
            .collect::<Vec<_>>();
        if selected.is_empty() {
            tracing::warn!(
                ?referenced,
                available = ?materials.iter().map(|m| m.get("id")).collect::<Vec<_>>(),
                "question refers to materials which do not exist, sending no materials"
            );
        } else {
            tracing::info!(
                ?referenced,
                selected = selected.len(),
                "small question, sending referenced materials"
            );
        }
        selected
    }
}

/// Find a question by ID, or failing that by its 1-based position in the paper.
fn find_question<'a>(questions: &[&'a Value], qid: &str) -> Option<&'a Value> {
    questions
        .iter()
        .find(|q| fields::has_id(q, qid))
        .or_else(|| {
            let position: usize = qid.trim().parse().ok()?;
            questions.get(position.checked_sub(1)?)
        })
        .copied()
}

fn non_empty(s: &str) -> Option<&str> {
    (!s.is_empty()).then_some(s)
}

/// Accept IDs sent as either strings or numbers.
fn lenient_id<'a, D: Deserializer<'a>>(d: D) -> Result<Option<String>, D::Error> {
    match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => Ok(None),
        Some(value) => fields::id_string(&value)
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("invalid ID {value}"))),
    }
}

fn lenient_ids<'a, D: Deserializer<'a>>(d: D) -> Result<Option<Vec<String>>, D::Error> {
    match Option::<Vec<Value>>::deserialize(d)? {
        None => Ok(None),
        Some(ids) => ids
            .iter()
            .map(|id| {
                fields::id_string(id).ok_or_else(|| D::Error::custom(format!("invalid ID {id}")))
            })
            .collect::<Result<_, _>>()
            .map(Some),
    }
}
