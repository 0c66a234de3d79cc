use serde::Deserialize;

use crate::models::UsageMetrics;

/// Accepts both OpenAI wire formats: Chat Completions
/// (`prompt_tokens`/`completion_tokens`) and the Responses API
/// (`input_tokens`/`output_tokens`), preferring whichever is populated.
#[derive(Debug, Default, Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    usage: OpenAiUsage,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
    #[serde(default)]
    prompt_tokens_details: TokenDetails,
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
    #[serde(default)]
    input_tokens_details: TokenDetails,
}

#[derive(Debug, Default, Deserialize)]
struct TokenDetails {
    #[serde(default)]
    cached_tokens: i64,
}

pub(super) fn parse_response(body: &[u8]) -> Result<UsageMetrics, serde_json::Error> {
    let parsed: OpenAiResponse = serde_json::from_slice(body)?;

    let mut input_tokens = parsed.usage.prompt_tokens;
    let mut output_tokens = parsed.usage.completion_tokens;
    let mut cached_tokens = parsed.usage.prompt_tokens_details.cached_tokens;
    if parsed.usage.input_tokens > 0 || parsed.usage.output_tokens > 0 {
        input_tokens = parsed.usage.input_tokens;
        output_tokens = parsed.usage.output_tokens;
        cached_tokens = parsed.usage.input_tokens_details.cached_tokens;
    }

    Ok(UsageMetrics {
        model: parsed.model,
        input_tokens,
        output_tokens,
        cached_tokens,
        cache_creation_tokens: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_chat_completions_usage() {
        let body = br#"{
            "model": "gpt-4o-2024-08-06",
            "usage": {
                "prompt_tokens": 13,
                "completion_tokens": 9,
                "total_tokens": 22,
                "prompt_tokens_details": {"cached_tokens": 4}
            }
        }"#;
        let metrics = parse_response(body).expect("parse");
        assert_eq!(metrics.model, "gpt-4o-2024-08-06");
        assert_eq!(metrics.input_tokens, 13);
        assert_eq!(metrics.output_tokens, 9);
        assert_eq!(metrics.cached_tokens, 4);
    }

    #[test]
    fn prefers_responses_api_fields_when_populated() {
        let body = br#"{
            "model": "gpt-4o",
            "usage": {
                "input_tokens": 120,
                "output_tokens": 40,
                "input_tokens_details": {"cached_tokens": 100}
            }
        }"#;
        let metrics = parse_response(body).expect("parse");
        assert_eq!(metrics.input_tokens, 120);
        assert_eq!(metrics.output_tokens, 40);
        assert_eq!(metrics.cached_tokens, 100);
    }

    #[test]
    fn tolerates_missing_usage() {
        let metrics = parse_response(br#"{"model":"gpt-4o"}"#).expect("parse");
        assert_eq!(metrics.input_tokens, 0);
        assert_eq!(metrics.output_tokens, 0);
    }

    #[test]
    fn rejects_non_json() {
        assert!(parse_response(b"<html>bad gateway</html>").is_err());
    }
}
