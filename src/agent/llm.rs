//! LLM chat-completion client (spec §6).

use serde::Serialize;

use crate::error::AppError;

const CHAT_COMPLETIONS_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const DEFAULT_MAX_TOKENS: u32 = 2048;
const DEFAULT_TEMPERATURE: f32 = 0.3;

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

pub struct LlmClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl LlmClient {
    pub fn new(api_key: String, model: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self { http, api_key, model })
    }

    pub async fn chat_completion(&self, system_prompt: &str, user_message: &str) -> Result<String, AppError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                ChatMessage { role: "system", content: system_prompt },
                ChatMessage { role: "user", content: user_message },
            ],
            "max_tokens": DEFAULT_MAX_TOKENS,
            "temperature": DEFAULT_TEMPERATURE,
        });

        let resp = self
            .http
            .post(CHAT_COMPLETIONS_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Connection(format!("LLM request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(AppError::Connection(format!("LLM service returned {}", resp.status())));
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AppError::Parse(format!("invalid LLM response: {e}")))?;

        data["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| AppError::Parse("LLM response missing choices[0].message.content".to_string()))
    }
}
