//! A language model with canned responses, for testing.

use super::LanguageModel;
use crate::grading::Prompt;
use anyhow::Error;
use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};

/// A language model which always gives the same reply, or always fails.
///
/// Every prompt it receives is recorded, so tests can check what would have been sent to a real
/// model.
#[derive(Debug, Default)]
pub struct Scripted {
    reply: Option<String>,
    prompts: Mutex<Vec<Prompt>>,
}

impl Scripted {
    /// A model which answers every prompt with `reply`.
    pub fn reply(reply: impl Into<String>) -> Self {
        Self {
            reply: Some(reply.into()),
            prompts: Default::default(),
        }
    }

    /// A model which is never available.
    pub fn failing() -> Self {
        Self::default()
    }

    /// The prompts received so far.
    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl LanguageModel for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String, Error> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prompt.clone());
        self.reply
            .clone()
            .ok_or_else(|| Error::msg("scripted model is unavailable"))
    }
}
