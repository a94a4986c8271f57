use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::types::*;
use crate::{Provider, ProviderError};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    default_model: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: Option<String>, model: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
            default_model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        }
    }

    pub fn from_config(config: &reviewd_config::Config) -> Result<Self> {
        let api_key = config
            .model
            .api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no model API key configured"))?;
        Ok(Self::new(
            api_key,
            config.model.base_url.clone(),
            Some(config.model.id.clone()),
        ))
    }

    fn build_messages(&self, request: &ChatRequest) -> Vec<serde_json::Value> {
        request
            .messages
            .iter()
            .map(|msg| {
                let content = match &msg.content {
                    MessageContent::Text(text) => json!(text),
                    MessageContent::Parts(parts) => {
                        let content: Vec<serde_json::Value> = parts
                            .iter()
                            .map(|p| match p {
                                ContentPart::Text { text } => {
                                    json!({"type": "text", "text": text})
                                }
                                ContentPart::ToolUse { id, name, input } => json!({
                                    "type": "tool_use",
                                    "id": id,
                                    "name": name,
                                    "input": input,
                                }),
                                ContentPart::ToolResult {
                                    tool_use_id,
                                    content,
                                    is_error,
                                } => json!({
                                    "type": "tool_result",
                                    "tool_use_id": tool_use_id,
                                    "content": content,
                                    "is_error": is_error,
                                }),
                            })
                            .collect();
                        json!(content)
                    }
                };
                json!({
                    "role": match msg.role {
                        Role::Assistant => "assistant",
                        Role::User => "user",
                    },
                    "content": content,
                })
            })
            .collect()
    }

    fn build_tools(&self, tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect()
    }
}

fn parse_content_parts(data: &serde_json::Value) -> Result<Vec<ContentPart>> {
    let blocks = data["content"]
        .as_array()
        .ok_or_else(|| ProviderError::DeserializationError("missing content array".into()))?;

    let mut parts = Vec::with_capacity(blocks.len());
    for block in blocks {
        match block["type"].as_str() {
            Some("text") => parts.push(ContentPart::Text {
                text: block["text"].as_str().unwrap_or("").to_string(),
            }),
            Some("tool_use") => parts.push(ContentPart::ToolUse {
                id: block["id"].as_str().unwrap_or("").to_string(),
                name: block["name"].as_str().unwrap_or("").to_string(),
                input: block["input"].clone(),
            }),
            // Thinking and other block types carry nothing the loop uses.
            _ => {}
        }
    }
    Ok(parts)
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let model = if request.model.is_empty() {
            &self.default_model
        } else {
            &request.model
        };

        let mut body = json!({
            "model": model,
            "messages": self.build_messages(request),
            "max_tokens": request.max_tokens.unwrap_or(4096),
        });

        if let Some(system) = &request.system {
            body["system"] = json!(system);
        }
        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }
        if !request.tools.is_empty() {
            body["tools"] = json!(self.build_tools(&request.tools));
        }

        let resp = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let body = resp.text().await.unwrap_or_default();
            return Err(
                ProviderError::from_http(status.as_u16(), body, retry_after.as_deref()).into(),
            );
        }

        let data: serde_json::Value = resp.json().await?;
        let parts = parse_content_parts(&data)?;

        Ok(ChatResponse {
            message: Message {
                role: Role::Assistant,
                content: MessageContent::Parts(parts),
            },
            usage: Usage {
                input_tokens: data["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
                output_tokens: data["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
            },
            stop_reason: StopReason::parse(data["stop_reason"].as_str()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_content_blocks() {
        let data = json!({
            "content": [
                {"type": "text", "text": "Let me look at the diff."},
                {"type": "tool_use", "id": "toolu_1", "name": "git_diff",
                 "input": {"base_sha": "abc1234"}},
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 120, "output_tokens": 40},
        });

        let parts = parse_content_parts(&data).unwrap();
        assert_eq!(parts.len(), 2);
        assert!(matches!(&parts[1], ContentPart::ToolUse { name, .. } if name == "git_diff"));
    }

    #[test]
    fn missing_content_is_an_error() {
        let data = json!({"stop_reason": "end_turn"});
        assert!(parse_content_parts(&data).is_err());
    }
}
