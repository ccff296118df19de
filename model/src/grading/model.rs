//! Clients for the language models that do the actual grading.

use super::Prompt;
use anyhow::Error;
use async_trait::async_trait;
use std::sync::Arc;

mod cooldown;
pub mod gemini;
pub mod relay;
#[cfg(any(test, feature = "testing"))]
pub mod scripted;

pub use cooldown::Cooldown;
pub use gemini::Gemini;
pub use relay::Relay;
#[cfg(any(test, feature = "testing"))]
pub use scripted::Scripted;

/// Sampling temperature for grading. Low, since grading should be consistent.
pub const TEMPERATURE: f64 = 0.3;

/// Upper bound on the length of a report, in tokens. Essay reports with rewritten paragraphs and
/// a model essay are long.
pub const MAX_OUTPUT_TOKENS: u32 = 65536;

/// A language model.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// A short name for this model, for logging.
    fn name(&self) -> &str;

    /// Generate a response to `prompt`.
    ///
    /// Fails if the model is unavailable (not configured, out of quota, unreachable) or returns no
    /// usable text.
    async fn generate(&self, prompt: &Prompt) -> Result<String, Error>;
}

#[async_trait]
impl<M: LanguageModel + ?Sized> LanguageModel for Arc<M> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String, Error> {
        (**self).generate(prompt).await
    }
}

#[async_trait]
impl<M: LanguageModel + ?Sized> LanguageModel for Box<M> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String, Error> {
        (**self).generate(prompt).await
    }
}

/// Use `secondary` whenever `primary` fails.
#[derive(Clone, Debug)]
pub struct Fallback<A, B> {
    primary: A,
    secondary: B,
    name: String,
}

impl<A: LanguageModel, B: LanguageModel> Fallback<A, B> {
    pub fn new(primary: A, secondary: B) -> Self {
        let name = format!("{} -> {}", primary.name(), secondary.name());
        Self {
            primary,
            secondary,
            name,
        }
    }
}

#[async_trait]
impl<A: LanguageModel, B: LanguageModel> LanguageModel for Fallback<A, B> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String, Error> {
        match self.primary.generate(prompt).await {
            Ok(text) => Ok(text),
            Err(err) => {
                tracing::warn!(
                    "{} failed, falling back to {}: {err:#}",
                    self.primary.name(),
                    self.secondary.name()
                );
                self.secondary.generate(prompt).await.map_err(|fallback_err| {
                    Error::msg(format!(
                        "{}: {err:#}; {}: {fallback_err:#}",
                        self.primary.name(),
                        self.secondary.name()
                    ))
                })
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[async_std::test]
    async fn test_fallback() {
        let primary = Arc::new(Scripted::failing());
        let secondary = Arc::new(Scripted::reply("得分：5/10"));
        let model = Fallback::new(primary.clone(), secondary.clone());

        let prompt = Prompt::text("批改");
        assert_eq!(model.generate(&prompt).await.unwrap(), "得分：5/10");
        assert_eq!(primary.prompts(), [prompt.clone()]);
        assert_eq!(secondary.prompts(), [prompt]);
    }

    #[async_std::test]
    async fn test_fallback_both_fail() {
        let model = Fallback::new(Scripted::failing(), Scripted::failing());
        let err = model.generate(&Prompt::text("批改")).await.unwrap_err();
        assert_eq!(model.name(), "scripted -> scripted");
        assert!(err.to_string().contains("scripted"), "{err:#}");
    }

    #[async_std::test]
    async fn test_primary_success_skips_secondary() {
        let secondary = Arc::new(Scripted::reply("unused"));
        let model = Fallback::new(Scripted::reply("primary"), secondary.clone());
        assert_eq!(model.generate(&Prompt::text("批改")).await.unwrap(), "primary");
        assert!(secondary.prompts().is_empty());
    }
}
