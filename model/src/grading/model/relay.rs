//! Client for an OpenAI-compatible relay in front of Gemini.

use super::{LanguageModel, MAX_OUTPUT_TOKENS, TEMPERATURE};
use crate::grading::Prompt;
use anyhow::{ensure, Context, Error};
use async_std::future::timeout;
use async_trait::async_trait;
use clap::Args;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(120);

/// Relay connection options.
#[derive(Clone, Debug, Default, Args)]
pub struct Options {
    /// API key for the relay.
    #[clap(long, env = "RELAY_API_KEY")]
    pub relay_api_key: Option<String>,

    /// Base URL of the relay, without the `/v1` suffix.
    #[clap(long, env = "RELAY_ENDPOINT")]
    pub relay_endpoint: Option<String>,

    /// Model name to request from the relay.
    #[clap(long, env = "RELAY_MODEL", default_value = "gemini-2.5-flash")]
    pub relay_model: String,
}

/// A chat completions client.
#[derive(Debug)]
pub struct Relay {
    client: surf::Client,
    key: Option<String>,
    url: Option<String>,
    model: String,
}

impl Relay {
    pub fn new(opt: &Options) -> Self {
        let non_empty = |s: &Option<String>| {
            s.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
        };
        Self {
            client: surf::Client::new(),
            key: non_empty(&opt.relay_api_key),
            url: non_empty(&opt.relay_endpoint).map(|endpoint| {
                format!("{}/v1/chat/completions", endpoint.trim_end_matches('/'))
            }),
            model: opt.relay_model.trim().into(),
        }
    }
}

#[async_trait]
impl LanguageModel for Relay {
    fn name(&self) -> &str {
        "relay"
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String, Error> {
        let key = self
            .key
            .as_ref()
            .context("relay is not configured (missing RELAY_API_KEY)")?;
        let url = self
            .url
            .as_ref()
            .context("relay is not configured (missing RELAY_ENDPOINT)")?;

        let req = ChatRequest {
            model: &self.model,
            messages: [Message {
                role: "user",
                content: MessageContent::new(prompt),
            }],
            temperature: TEMPERATURE,
            max_tokens: MAX_OUTPUT_TOKENS,
        };
        let res = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {key}"))
            .body_json(&req)
            .map_err(Error::msg)?;
        let mut res = timeout(TIMEOUT, res)
            .await
            .map_err(|_| Error::msg(format!("relay timed out after {TIMEOUT:?}")))?
            .map_err(Error::msg)?;
        let status = res.status();
        let body = res.body_string().await.map_err(Error::msg)?;
        ensure!(status.is_success(), "relay returned {status}");
        ensure!(!body.trim().is_empty(), "relay returned an empty body");

        let res: ChatResponse = match serde_json::from_str(&body) {
            Ok(res) => res,
            Err(err) => {
                tracing::warn!("relay response is not JSON, using it verbatim: {err}");
                return Ok(body);
            }
        };
        if let Some(err) = res.error {
            return Err(Error::msg(format!("relay API error: {err}")));
        }
        let text = res
            .choices
            .into_iter()
            .next()
            .context("relay returned no choices")?
            .message
            .content
            .unwrap_or_default();
        let text = text.trim();
        ensure!(!text.is_empty(), "relay returned an empty message");
        Ok(text.into())
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [Message<'a>; 1],
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: MessageContent<'a>,
}

/// Plain text, or text followed by images.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MessageContent<'a> {
    Text(&'a str),
    Parts(Vec<ContentPart<'a>>),
}

impl<'a> MessageContent<'a> {
    fn new(prompt: &'a Prompt) -> Self {
        if prompt.images.is_empty() {
            return Self::Text(&prompt.text);
        }
        let mut parts = vec![ContentPart::Text { text: &prompt.text }];
        parts.extend(prompt.images.iter().map(|image| ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: image.data_url(),
            },
        }));
        Self::Parts(parts)
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChatResponse {
    choices: Vec<Choice>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ResponseMessage {
    content: Option<String>,
}
