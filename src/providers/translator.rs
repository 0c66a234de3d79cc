//! OpenAI ↔ Anthropic wire-format translation for the `anthropic-openai`
//! provider. This is the only flow that rewrites request or response JSON;
//! every other provider passes bodies through untouched.

use serde::{Deserialize, Serialize};

/// Anthropic requires `max_tokens`; applied when the OpenAI request omits it.
const DEFAULT_MAX_TOKENS: i64 = 4096;

/// Upstream path for translated requests.
pub const ANTHROPIC_MESSAGES_PATH: &str = "/v1/messages";

#[derive(Debug, Deserialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(default)]
    max_tokens: Option<i64>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    top_p: Option<f64>,
    #[serde(default)]
    stream: Option<bool>,
}

#[derive(Debug, Deserialize, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    max_tokens: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: String,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Default, Deserialize)]
struct ContentBlock {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
}

#[derive(Debug, Serialize)]
struct OpenAiResponse {
    id: String,
    object: &'static str,
    created: i64,
    model: String,
    choices: Vec<Choice>,
    usage: OpenAiUsage,
}

#[derive(Debug, Serialize)]
struct Choice {
    index: i64,
    message: ChatMessage,
    finish_reason: String,
}

#[derive(Debug, Serialize)]
struct OpenAiUsage {
    prompt_tokens: i64,
    completion_tokens: i64,
    total_tokens: i64,
}

/// Converts an OpenAI chat-completions request to an Anthropic messages
/// request: the first system message is lifted into the top-level `system`
/// field and dropped from the messages array. Returns the translated body
/// and the rewritten upstream path.
pub fn openai_request_to_anthropic(
    body: &[u8],
) -> Result<(Vec<u8>, &'static str), serde_json::Error> {
    let request: OpenAiRequest = serde_json::from_slice(body)?;

    let mut system = None;
    let mut messages = Vec::with_capacity(request.messages.len());
    for message in request.messages {
        if message.role == "system" {
            if system.is_none() {
                system = Some(message.content);
            }
            continue;
        }
        messages.push(message);
    }

    let translated = AnthropicRequest {
        model: request.model,
        messages,
        system,
        max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        temperature: request.temperature,
        top_p: request.top_p,
        stream: request.stream,
    };

    Ok((serde_json::to_vec(&translated)?, ANTHROPIC_MESSAGES_PATH))
}

/// Converts an Anthropic messages response back to OpenAI chat-completions
/// shape: text blocks are concatenated into one assistant message and the
/// stop reason is mapped onto OpenAI's finish reasons.
pub fn anthropic_response_to_openai(body: &[u8]) -> Result<Vec<u8>, serde_json::Error> {
    let response: AnthropicResponse = serde_json::from_slice(body)?;

    let mut content = String::new();
    for block in &response.content {
        if block.kind == "text" {
            content.push_str(&block.text);
        }
    }

    let finish_reason = match response.stop_reason.as_str() {
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        // end_turn, stop_sequence, and anything unexpected read as a plain
        // stop to OpenAI clients.
        _ => "stop",
    };

    let translated = OpenAiResponse {
        id: response.id,
        object: "chat.completion",
        created: 0,
        model: response.model,
        choices: vec![Choice {
            index: 0,
            message: ChatMessage {
                role: "assistant".to_string(),
                content,
            },
            finish_reason: finish_reason.to_string(),
        }],
        usage: OpenAiUsage {
            prompt_tokens: response.usage.input_tokens,
            completion_tokens: response.usage.output_tokens,
            total_tokens: response.usage.input_tokens + response.usage.output_tokens,
        },
    };

    serde_json::to_vec(&translated)
}
