//! Google Gemini client.

use super::{Cooldown, LanguageModel, MAX_OUTPUT_TOKENS, TEMPERATURE};
use crate::grading::Prompt;
use anyhow::{ensure, Error};
use async_std::future::timeout;
use async_trait::async_trait;
use clap::Args;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use surf::StatusCode;

const TEXT_TIMEOUT: Duration = Duration::from_secs(60);
const IMAGE_TIMEOUT: Duration = Duration::from_secs(90);

/// Gemini connection options.
#[derive(Clone, Debug, Default, Args)]
pub struct Options {
    /// Gemini API key.
    #[clap(long, env = "GEMINI_API_KEY")]
    pub gemini_api_key: Option<String>,

    /// Second Gemini API key, used when the first is out of quota.
    #[clap(long, env = "GEMINI_API_KEY_FALLBACK")]
    pub gemini_api_key_fallback: Option<String>,

    /// Base URL of the Gemini API.
    #[clap(
        long,
        env = "GEMINI_ENDPOINT",
        default_value = "https://generativelanguage.googleapis.com"
    )]
    pub gemini_endpoint: String,

    /// Gemini model to grade with.
    #[clap(long, env = "GEMINI_MODEL", default_value = "gemini-3-flash-preview")]
    pub gemini_model: String,

    /// How long to stop using Gemini once every key is out of quota, in seconds.
    ///
    /// By default, or if this is not a positive whole number, Gemini is skipped until quotas reset
    /// at midnight Pacific time.
    #[clap(long, env = "GEMINI_COOLDOWN_SECONDS")]
    pub gemini_cooldown_seconds: Option<String>,
}

impl Options {
    /// The configured cooldown period, ignoring values that are not a number of seconds.
    fn cooldown_seconds(&self) -> Option<u64> {
        let value = self.gemini_cooldown_seconds.as_deref()?.trim();
        if value.is_empty() {
            return None;
        }
        match value.parse() {
            Ok(secs) => Some(secs),
            Err(err) => {
                tracing::warn!("ignoring GEMINI_COOLDOWN_SECONDS={value:?}: {err}");
                None
            }
        }
    }
}

/// A Gemini client with API key rotation.
#[derive(Debug)]
pub struct Gemini {
    client: surf::Client,
    keys: Vec<String>,
    url: String,
    cooldown: Cooldown,
}

impl Gemini {
    pub fn new(opt: &Options) -> Self {
        let mut keys: Vec<String> = vec![];
        for key in [&opt.gemini_api_key, &opt.gemini_api_key_fallback]
            .into_iter()
            .flatten()
        {
            let key = key.trim();
            if !key.is_empty() && !keys.iter().any(|k| k == key) {
                keys.push(key.into());
            }
        }
        Self {
            client: surf::Client::new(),
            keys,
            url: format!(
                "{}/v1beta/models/{}:generateContent",
                opt.gemini_endpoint.trim().trim_end_matches('/'),
                opt.gemini_model.trim()
            ),
            cooldown: Cooldown::new(opt.cooldown_seconds()),
        }
    }

    /// Is at least one API key configured?
    pub fn is_configured(&self) -> bool {
        !self.keys.is_empty()
    }

    async fn call(
        &self,
        key: &str,
        req: &GenerateRequest<'_>,
        limit: Duration,
    ) -> Result<Attempt, Error> {
        let res = self
            .client
            .post(&self.url)
            .header("x-goog-api-key", key)
            .body_json(req)
            .map_err(Error::msg)?;
        let mut res = timeout(limit, res)
            .await
            .map_err(|_| Error::msg(format!("Gemini timed out after {limit:?}")))?
            .map_err(Error::msg)?;
        let status = res.status();
        let body = res.body_string().await.map_err(Error::msg)?;

        if !status.is_success() {
            let err = serde_json::from_str::<GenerateResponse>(&body)
                .ok()
                .and_then(|res| res.error);
            tracing::warn!(%status, ?err, "Gemini request failed");
            if status == StatusCode::TooManyRequests
                || err.as_ref().is_some_and(ApiError::is_quota)
            {
                return Ok(Attempt::Quota);
            }
            return Err(Error::msg(format!("Gemini returned {status}")));
        }
        if body.trim().is_empty() {
            tracing::warn!("Gemini returned an empty body");
            return Ok(Attempt::Empty);
        }
        let res: GenerateResponse = match serde_json::from_str(&body) {
            Ok(res) => res,
            Err(err) => {
                tracing::warn!("Gemini response is not JSON, using it verbatim: {err}");
                return Ok(Attempt::Text(body));
            }
        };
        if let Some(err) = res.error {
            tracing::warn!(?err, "Gemini API error");
            if err.is_quota() {
                return Ok(Attempt::Quota);
            }
            return Err(Error::msg(format!("Gemini API error: {err}")));
        }

        let Some(candidate) = res.candidates.into_iter().next() else {
            tracing::warn!("Gemini returned no candidates: {}", truncate(&body, 500));
            return Err(Error::msg("Gemini returned no candidates"));
        };
        let text = candidate
            .content
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        let text = text.trim();
        ensure!(
            !text.is_empty(),
            "Gemini candidate has no text, possibly filtered (finish reason {:?})",
            candidate.finish_reason
        );
        Ok(Attempt::Text(text.into()))
    }
}

#[async_trait]
impl LanguageModel for Gemini {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String, Error> {
        ensure!(self.is_configured(), "Gemini is not configured");
        ensure!(
            !self.cooldown.active(),
            "Gemini quota is exhausted, skipping until the cooldown ends"
        );

        let req = GenerateRequest::new(prompt);
        let limit = if prompt.images.is_empty() {
            TEXT_TIMEOUT
        } else {
            tracing::info!(images = prompt.images.len(), "sending multimodal Gemini request");
            IMAGE_TIMEOUT
        };

        for (i, key) in self.keys.iter().enumerate() {
            match self.call(key, &req, limit).await? {
                Attempt::Text(text) => return Ok(text),
                Attempt::Empty => continue,
                Attempt::Quota if i + 1 < self.keys.len() => {
                    tracing::warn!("Gemini key {} is out of quota, trying the next key", i + 1);
                }
                Attempt::Quota => {
                    let until = self.cooldown.trip();
                    tracing::warn!(%until, "every Gemini key is out of quota, cooling down");
                    return Err(Error::msg("Gemini quota is exhausted"));
                }
            }
        }
        Err(Error::msg("Gemini returned no response"))
    }
}

/// The outcome of a call with a single API key.
enum Attempt {
    Text(String),
    /// An empty body. The next key may do better.
    Empty,
    Quota,
}

fn truncate(s: &str, chars: usize) -> &str {
    s.char_indices().nth(chars).map_or(s, |(i, _)| &s[..i])
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
    generation_config: GenerationConfig,
}

impl<'a> GenerateRequest<'a> {
    fn new(prompt: &'a Prompt) -> Self {
        let mut parts = vec![Part::Text(&prompt.text)];
        parts.extend(prompt.images.iter().map(|image| {
            Part::InlineData(InlineData {
                mime_type: &image.mime,
                data: &image.data,
            })
        }));
        Self {
            contents: [Content {
                role: "user",
                parts,
            }],
            generation_config: GenerationConfig {
                temperature: TEMPERATURE,
                max_output_tokens: MAX_OUTPUT_TOKENS,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum Part<'a> {
    Text(&'a str),
    InlineData(InlineData<'a>),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData<'a> {
    mime_type: &'a str,
    data: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f64,
    max_output_tokens: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GenerateResponse {
    candidates: Vec<Candidate>,
    error: Option<ApiError>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CandidateContent {
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApiError {
    code: Option<u16>,
    status: Option<String>,
    message: Option<String>,
}

impl ApiError {
    fn is_quota(&self) -> bool {
        self.code == Some(429)
            || self
                .status
                .as_deref()
                .is_some_and(|status| status.to_uppercase().contains("RESOURCE_EXHAUSTED"))
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} {}: {}",
            self.code.map(|code| code.to_string()).unwrap_or_default(),
            self.status.as_deref().unwrap_or_default(),
            self.message.as_deref().unwrap_or_default()
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::grading::Image;
    use async_std::task::{sleep, spawn};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};
    use tide::{Body, Request, Response};

    /// How the fake Gemini server responds to a given key.
    #[derive(Clone, Copy, Debug)]
    enum Behavior {
        Ok,
        HttpQuota,
        ErrorQuota,
        Empty,
        Raw,
    }

    #[derive(Clone, Default)]
    struct Upstream {
        behaviors: Arc<Vec<(&'static str, Behavior)>>,
        /// Keys and request bodies received, in order.
        requests: Arc<Mutex<Vec<(String, Value)>>>,
    }

    async fn generate(mut req: Request<Upstream>) -> tide::Result {
        let key = req
            .header("x-goog-api-key")
            .map(|h| h.last().as_str().to_string())
            .unwrap_or_default();
        let body: Value = req.body_json().await?;
        req.state()
            .requests
            .lock()
            .unwrap()
            .push((key.clone(), body));

        let behavior = req
            .state()
            .behaviors
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, behavior)| *behavior)
            .unwrap_or(Behavior::HttpQuota);
        Ok(match behavior {
            Behavior::Ok => Response::builder(StatusCode::Ok)
                .body(Body::from_json(&json!({
                    "candidates": [{
                        "content": {"parts": [{"text": "得分：15/20"}, {"text": "总评 "}]},
                        "finishReason": "STOP",
                    }]
                }))?)
                .build(),
            Behavior::HttpQuota => Response::builder(StatusCode::TooManyRequests)
                .body(Body::from_json(&json!({
                    "error": {"code": 429, "status": "RESOURCE_EXHAUSTED", "message": "quota"}
                }))?)
                .build(),
            Behavior::ErrorQuota => Response::builder(StatusCode::Ok)
                .body(Body::from_json(&json!({
                    "error": {"code": 429, "status": "RESOURCE_EXHAUSTED"}
                }))?)
                .build(),
            Behavior::Empty => Response::new(StatusCode::Ok),
            Behavior::Raw => Response::builder(StatusCode::Ok)
                .body("得分：3/5，纯文本")
                .build(),
        })
    }

    async fn upstream(behaviors: Vec<(&'static str, Behavior)>) -> (Upstream, String) {
        let state = Upstream {
            behaviors: Arc::new(behaviors),
            ..Default::default()
        };
        let port = portpicker::pick_unused_port().unwrap();
        let mut app = tide::with_state(state.clone());
        app.at("/v1beta/models/*").post(generate);
        spawn(app.listen(format!("127.0.0.1:{port}")));
        // Give the server a moment to bind.
        sleep(Duration::from_millis(100)).await;
        (state, format!("http://127.0.0.1:{port}/"))
    }

    fn options(endpoint: String, keys: [&str; 2]) -> Options {
        Options {
            gemini_api_key: Some(keys[0].into()),
            gemini_api_key_fallback: Some(keys[1].into()),
            gemini_endpoint: endpoint,
            gemini_model: "test-model".into(),
            gemini_cooldown_seconds: Some("3600".into()),
        }
    }

    fn keys(upstream: &Upstream) -> Vec<String> {
        upstream
            .requests
            .lock()
            .unwrap()
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    #[test]
    fn test_keys() {
        let gemini = Gemini::new(&options("http://localhost/".into(), [" a ", "a"]));
        assert_eq!(gemini.keys, ["a"]);
        assert_eq!(
            gemini.url,
            "http://localhost/v1beta/models/test-model:generateContent"
        );

        let gemini = Gemini::new(&options("http://localhost".into(), ["", " "]));
        assert!(!gemini.is_configured());
    }

    #[test]
    fn test_cooldown_seconds() {
        let mut opt = options("http://localhost".into(), ["a", "b"]);
        assert_eq!(opt.cooldown_seconds(), Some(3600));
        opt.gemini_cooldown_seconds = Some(" 60 ".into());
        assert_eq!(opt.cooldown_seconds(), Some(60));
        for bad in ["abc", "-5", "1.5", ""] {
            opt.gemini_cooldown_seconds = Some(bad.into());
            assert_eq!(opt.cooldown_seconds(), None, "{bad}");
        }
        opt.gemini_cooldown_seconds = None;
        assert_eq!(opt.cooldown_seconds(), None);
    }

    #[async_std::test]
    async fn test_unconfigured() {
        let gemini = Gemini::new(&Options::default());
        gemini.generate(&Prompt::text("批改")).await.unwrap_err();
    }

    #[async_std::test]
    async fn test_generate() {
        let (upstream, endpoint) = upstream(vec![("primary", Behavior::Ok)]).await;
        let gemini = Gemini::new(&options(endpoint, ["primary", "secondary"]));

        let text = gemini.generate(&Prompt::text("批改")).await.unwrap();
        assert_eq!(text, "得分：15/20\n总评");

        let requests = upstream.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "primary");
        assert_eq!(
            requests[0].1,
            json!({
                "contents": [{"role": "user", "parts": [{"text": "批改"}]}],
                "generationConfig": {"temperature": 0.3, "maxOutputTokens": 65536},
            })
        );
    }

    #[async_std::test]
    async fn test_inline_images() {
        let (upstream, endpoint) = upstream(vec![("primary", Behavior::Ok)]).await;
        let gemini = Gemini::new(&options(endpoint, ["primary", "secondary"]));

        let prompt = Prompt {
            text: "批改".into(),
            images: vec![Image {
                mime: "image/png".into(),
                data: "aGVsbG8=".into(),
            }],
        };
        gemini.generate(&prompt).await.unwrap();
        let requests = upstream.requests.lock().unwrap().clone();
        assert_eq!(
            requests[0].1["contents"][0]["parts"],
            json!([
                {"text": "批改"},
                {"inlineData": {"mimeType": "image/png", "data": "aGVsbG8="}},
            ])
        );
    }

    #[async_std::test]
    async fn test_rotate_on_quota() {
        for behavior in [Behavior::HttpQuota, Behavior::ErrorQuota, Behavior::Empty] {
            tracing::info!(?behavior, "testing key rotation");
            let (upstream, endpoint) =
                upstream(vec![("primary", behavior), ("secondary", Behavior::Ok)]).await;
            let gemini = Gemini::new(&options(endpoint, ["primary", "secondary"]));

            let text = gemini.generate(&Prompt::text("批改")).await.unwrap();
            assert_eq!(text, "得分：15/20\n总评");
            assert_eq!(keys(&upstream), ["primary", "secondary"]);
            assert!(!gemini.cooldown.active());
        }
    }

    #[async_std::test]
    async fn test_cooldown_when_exhausted() {
        let (upstream, endpoint) = upstream(vec![
            ("primary", Behavior::HttpQuota),
            ("secondary", Behavior::ErrorQuota),
        ])
        .await;
        let gemini = Gemini::new(&options(endpoint, ["primary", "secondary"]));

        gemini.generate(&Prompt::text("批改")).await.unwrap_err();
        assert_eq!(keys(&upstream), ["primary", "secondary"]);
        assert!(gemini.cooldown.active());

        // While cooling down, the API is not called at all.
        gemini.generate(&Prompt::text("批改")).await.unwrap_err();
        assert_eq!(keys(&upstream).len(), 2);
    }

    #[async_std::test]
    async fn test_raw_body() {
        let (_, endpoint) = upstream(vec![("primary", Behavior::Raw)]).await;
        let gemini = Gemini::new(&options(endpoint, ["primary", "secondary"]));
        let text = gemini.generate(&Prompt::text("批改")).await.unwrap();
        assert_eq!(text, "得分：3/5，纯文本");
    }

    #[test]
    fn test_quota_errors() {
        let err = |code, status: &str| ApiError {
            code,
            status: Some(status.into()),
            message: None,
        };
        assert!(err(Some(429), "").is_quota());
        assert!(err(None, "resource_exhausted").is_quota());
        assert!(!err(Some(400), "INVALID_ARGUMENT").is_quota());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("得分很高", 2), "得分");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
