//! Grading of submitted answers.
//!
//! A [`Submission`] from the frontend is resolved against the catalog into a [`GradingJob`], which
//! is turned into a [`Prompt`] for a [`LanguageModel`](model::LanguageModel). The model's Markdown
//! report comes back to the client as a [`Report`].

use model::LanguageModel;

mod image;
pub mod model;
pub mod prompt;
pub mod request;
pub mod score;

pub use image::Image;
pub use prompt::Prompt;
pub use request::{GradingJob, Submission};
pub use score::Report;

/// Returned to the client when a submission with photos cannot be graded. There is no simulated
/// fallback for photos, since we cannot see what the student wrote.
pub const IMAGES_UNAVAILABLE: &str =
    "图片批改服务暂时不可用。请稍后重试，或减少图片数量、改用文字作答后再提交。";

const EMPTY_OUTPUT: &str = "模型未返回内容（可能被截断或安全过滤）";

/// Output longer than this is truncated in the logs.
const LOGGED_CHARS: usize = 5000;

/// Errors that end a grading request.
#[derive(Debug, thiserror::Error)]
pub enum GradeError {
    /// The submission is inconsistent or incomplete.
    #[error("{0}")]
    BadRequest(String),

    /// No language model could grade the submission.
    #[error("{0}")]
    Unavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Grades jobs with a language model.
pub struct Grader {
    model: Box<dyn LanguageModel>,
}

impl Grader {
    pub fn new(model: impl LanguageModel + 'static) -> Self {
        Self {
            model: Box::new(model),
        }
    }

    /// Grade a job.
    ///
    /// If the model fails on a text-only job, the client still gets a simulated report. If it fails
    /// on a job with photos, the job fails with [`GradeError::Unavailable`].
    pub async fn grade(&self, job: &GradingJob) -> Result<Report, GradeError> {
        let prompt = Prompt::build(job)?;
        tracing::info!(
            paper = %job.paper_id,
            kind = %job.kind(),
            questions = job.questions.len(),
            images = prompt.images.len(),
            prompt_chars = prompt.text.chars().count(),
            model = self.model.name(),
            "grading"
        );

        let output = match self.model.generate(&prompt).await {
            Ok(output) => output,
            Err(err) if job.has_images() => {
                tracing::error!("unable to grade photo answers: {err:#}");
                return Err(GradeError::Unavailable(IMAGES_UNAVAILABLE.into()));
            }
            Err(err) => {
                tracing::warn!("no model available, returning a simulated report: {err:#}");
                return Ok(Report::simulated(&job.questions, &job.answers));
            }
        };

        let body = output.trim();
        let len = body.chars().count();
        tracing::info!(len, "model output");
        if len <= LOGGED_CHARS {
            tracing::info!("{body}");
        } else {
            let (end, _) = body.char_indices().nth(LOGGED_CHARS).unwrap_or((body.len(), ' '));
            tracing::info!("{} ... (truncated, {len} chars in total)", &body[..end]);
        }

        if body.is_empty() {
            tracing::warn!("model returned only whitespace");
            return Ok(Report::unparsable(&job.questions, EMPTY_OUTPUT, &output));
        }
        Ok(Report::from_model(body, &job.questions))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::grading::model::Scripted;
    use crate::grading::request::ModelQuestion;
    use serde_json::{json, Map, Number};
    use std::sync::Arc;

    fn job(images: Vec<Image>) -> GradingJob {
        GradingJob {
            paper_id: "gwy_jiangsu_2024_A".into(),
            paper_name: "江苏".into(),
            region: None,
            essay: false,
            materials: vec![json!({"id": "m1", "content": "材料"})],
            questions: vec![ModelQuestion {
                id: json!("q1"),
                title: json!("概括"),
                requirements: json!(""),
                max_score: Some(20.into()),
            }],
            answers: Map::from_iter([("q1".to_string(), json!("作答"))]),
            images,
        }
    }

    fn image() -> Image {
        Image {
            mime: "image/jpeg".into(),
            data: "aGVsbG8=".into(),
        }
    }

    #[async_std::test]
    async fn test_grade() {
        let model = Arc::new(Scripted::reply("\n**得分**：15／满分20\n\n总评：较好\n"));
        let grader = Grader::new(model.clone());
        let report = grader.grade(&job(vec![])).await.unwrap();
        assert_eq!(report.score, 15);
        assert_eq!(report.max_score, Number::from(20));
        assert_eq!(
            report.content.as_deref(),
            Some("**得分**：15／满分20\n\n总评：较好")
        );

        let prompts = model.prompts();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0], Prompt::build(&job(vec![])).unwrap());
    }

    #[async_std::test]
    async fn test_simulated_without_model() {
        let grader = Grader::new(Scripted::failing());
        let report = grader.grade(&job(vec![])).await.unwrap();
        assert!(report.overall_evaluation.starts_with("【后端模拟评分】"));
        assert_eq!(report.per_question["q1"]["score"], 12);
        assert_eq!(report.max_score, Number::from(20));
    }

    #[async_std::test]
    async fn test_images_unavailable() {
        let grader = Grader::new(Scripted::failing());
        match grader.grade(&job(vec![image()])).await {
            Err(GradeError::Unavailable(msg)) => assert_eq!(msg, IMAGES_UNAVAILABLE),
            res => panic!("expected unavailable, got {res:?}"),
        }
    }

    #[async_std::test]
    async fn test_images_sent_to_model() {
        let model = Arc::new(Scripted::reply("得分：5/20"));
        let grader = Grader::new(model.clone());
        let report = grader.grade(&job(vec![image()])).await.unwrap();
        assert_eq!(report.score, 5);
        assert_eq!(model.prompts()[0].images, [image()]);
    }

    #[async_std::test]
    async fn test_blank_output() {
        let grader = Grader::new(Scripted::reply(" \n "));
        let report = grader.grade(&job(vec![])).await.unwrap();
        assert_eq!(
            report.overall_evaluation,
            format!("【解析异常】{EMPTY_OUTPUT}")
        );
        assert_eq!(report.model_raw_output.as_deref(), Some(" \n "));
        assert_eq!(report.per_question["q1"]["maxScore"], 20);
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(GradeError::BadRequest("缺少".into()).to_string(), "缺少");
        assert_eq!(
            GradeError::from(anyhow::Error::msg("boom")).to_string(),
            "boom"
        );
    }
}
