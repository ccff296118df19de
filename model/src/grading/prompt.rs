//! Prompt construction.
//!
//! The prompt is one block of text: grading instructions for the kind of question, then the
//! materials, questions and answers as JSON. Answer photos travel alongside the text.

use super::{GradingJob, Image};
use anyhow::Error;

const ESSAY_INSTRUCTIONS: &str = include_str!("prompts/essay.md");
const SMALL_QUESTION_INSTRUCTIONS: &str = include_str!("prompts/small_question.md");

/// Answer text substituted when the user only uploaded photos.
pub const IMAGE_ANSWER_PLACEHOLDER: &str = "（考生上传了作答图片，请根据图片内容批改）";

const GENERIC_SCALE: &str =
    "在评分时，请结合本题材料与一般公务员申论评分逻辑，自行归纳合理的评分尺度。";
const OUTPUT_FORMAT: &str = "请用 Markdown 格式直接输出你的分析报告（可使用标题、加粗、列表、分段等），不要输出 JSON。报告中请明确写出得分（例如：得分：X/满分Y），便于系统解析。";
const MATERIALS_HEADER: &str =
    "材料（materials）如下（含完整正文，请依据材料原文评分、给出参考答案与扣分点）：";
const QUESTIONS_HEADER: &str =
    "\n题目（questions）如下（每题包含 id、title、requirements、maxScore）：";
const IMAGES_HEADER: &str = "\n学生答案以图片形式提供，下方有多张图片，请将全部图片均视为同一道题的作答内容，按顺序识别并综合批改。若同时有文字答案则见下方。";
const ESSAY_IMAGE_LENGTH_RULE: &str =
    "【大作文字数说明】大作文不识别、不判定字数，一律视为字数符合规定，不因字数扣分。";
const IMAGE_LENGTH_RULE: &str = "【图片字数判定规则】每行固定为 25 字，总字数=行数*25。若题目有字数要求，而据此估算的总字数与要求相差超过 20%（过多或过少），则视为字数合适、不扣字数分。";
const TEXT_WITH_IMAGES_HEADER: &str = "学生答案（文字补充）：";
const ANSWERS_HEADER: &str = "\n学生答案（answers，键为题目id）：";
const CLOSING: &str = "\n请按上述要求，直接输出完整的 Markdown 分析报告。";

/// A request to a language model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Prompt {
    pub text: String,
    pub images: Vec<Image>,
}

impl Prompt {
    /// A text-only prompt.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            images: vec![],
        }
    }

    /// Build the grading prompt for `job`.
    pub fn build(job: &GradingJob) -> Result<Self, Error> {
        let mut lines = vec![if job.essay {
            ESSAY_INSTRUCTIONS.to_string()
        } else {
            SMALL_QUESTION_INSTRUCTIONS.to_string()
        }];
        lines.push(match &job.region {
            Some(region) => format!(
                "本套试卷的地区（供评分标准参考）：{region}。在评分时，请优先参考该地区公务员申论考试的常见评分要求进行分析。"
            ),
            None => GENERIC_SCALE.into(),
        });
        lines.push(OUTPUT_FORMAT.into());
        lines.push(MATERIALS_HEADER.into());
        lines.push(serde_json::to_string(&job.materials)?);
        lines.push(QUESTIONS_HEADER.into());
        lines.push(serde_json::to_string(&job.questions)?);

        if job.has_images() {
            lines.push(IMAGES_HEADER.into());
            lines.push(if job.essay {
                ESSAY_IMAGE_LENGTH_RULE.into()
            } else {
                IMAGE_LENGTH_RULE.into()
            });
            let placeholder_only = job
                .answers
                .values()
                .next()
                .and_then(|answer| answer.as_str())
                .is_some_and(|answer| answer.trim().starts_with(IMAGE_ANSWER_PLACEHOLDER));
            if !job.answers.is_empty() && !placeholder_only {
                lines.push(TEXT_WITH_IMAGES_HEADER.into());
                lines.push(serde_json::to_string(&job.answers)?);
            }
        } else {
            lines.push(ANSWERS_HEADER.into());
            lines.push(serde_json::to_string(&job.answers)?);
        }
        lines.push(CLOSING.into());

        Ok(Self {
            text: lines.join("\n"),
            images: job.images.clone(),
        })
    }
}
