use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatReq<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
}

#[derive(Deserialize, Debug)]
struct ChatChoice {
    message: Option<serde_json::Value>,
}

#[derive(Deserialize, Debug)]
struct ChatResp {
    choices: Vec<ChatChoice>,
}

#[derive(Debug)]
pub struct HttpLlm {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

/// Chat-completion client used by the describe stage. `Http` speaks the
/// OpenAI-compatible shape against `KG_LLM_URL`; `Scripted` replays canned
/// responses for tests and the simulator.
pub enum LlmClient {
    Http(HttpLlm),
    Scripted(Mutex<VecDeque<String>>),
}

impl LlmClient {
    /// Endpoint from `KG_LLM_URL` (the `/v1/chat/completions` path is
    /// appended unless already present), model from `KG_LLM_MODEL`, key from
    /// `KG_LLM_API_KEY`. A missing URL is a configuration error: the
    /// describe stage cannot run without a model.
    pub fn from_env() -> Result<Self> {
        let base = std::env::var("KG_LLM_URL").context("KG_LLM_URL not set")?;
        let endpoint = if base.contains("/v1/") {
            base
        } else {
            format!("{}/v1/chat/completions", base.trim_end_matches('/'))
        };
        let model = std::env::var("KG_LLM_MODEL").unwrap_or_else(|_| "gpt-5-nano".to_string());
        Ok(Self::Http(HttpLlm {
            client: Client::new(),
            endpoint,
            model,
            api_key: std::env::var("KG_LLM_API_KEY").ok(),
        }))
    }

    pub fn scripted<S: Into<String>>(responses: impl IntoIterator<Item = S>) -> Self {
        Self::Scripted(Mutex::new(
            responses.into_iter().map(|s| s.into()).collect(),
        ))
    }

    pub async fn complete(&self, system: &str, user: &str) -> Result<String> {
        match self {
            Self::Scripted(queue) => {
                let mut q = queue.lock().expect("scripted llm lock poisoned");
                q.pop_front()
                    .ok_or_else(|| anyhow!("scripted llm has no responses left"))
            }
            Self::Http(http) => http.complete(system, user).await,
        }
    }
}

impl HttpLlm {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let body = ChatReq {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            max_completion_tokens: Some(2048),
        };
        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.context("llm request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("llm request failed: {} {}", status, text));
        }
        let jr: ChatResp = resp.json().await.context("decoding llm response")?;
        let msg = jr
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .ok_or_else(|| anyhow!("llm response has no choices"))?;
        extract_content(msg).ok_or_else(|| anyhow!("llm response has no message content"))
    }
}

/// Pull assistant text out of a chat message. Some servers return the
/// content as a plain string, others nest it as `{"text": "..."}`.
fn extract_content(msg: &serde_json::Value) -> Option<String> {
    let content = msg.get("content")?;
    if let Some(s) = content.as_str() {
        return Some(s.trim().to_string());
    }
    if let Some(s) = content.get("text").and_then(|t| t.as_str()) {
        return Some(s.trim().to_string());
    }
    None
}
