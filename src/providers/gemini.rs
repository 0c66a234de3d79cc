use serde::Deserialize;

use crate::models::UsageMetrics;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    usage_metadata: GeminiUsageMetadata,
    #[serde(default)]
    model_version: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsageMetadata {
    #[serde(default)]
    prompt_token_count: i64,
    #[serde(default)]
    candidates_token_count: i64,
    #[serde(default)]
    cached_content_token_count: i64,
}

pub(super) fn parse_response(body: &[u8]) -> Result<UsageMetrics, serde_json::Error> {
    let parsed: GeminiResponse = serde_json::from_slice(body)?;

    Ok(UsageMetrics {
        model: parsed.model_version,
        input_tokens: parsed.usage_metadata.prompt_token_count,
        output_tokens: parsed.usage_metadata.candidates_token_count,
        cached_tokens: parsed.usage_metadata.cached_content_token_count,
        cache_creation_tokens: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_generate_content_usage() {
        let body = br#"{
            "candidates": [{"content": {"parts": [{"text": "hi"}]}}],
            "usageMetadata": {
                "promptTokenCount": 21,
                "candidatesTokenCount": 7,
                "totalTokenCount": 28,
                "cachedContentTokenCount": 16
            },
            "modelVersion": "gemini-2.0-flash"
        }"#;
        let metrics = parse_response(body).expect("parse");
        assert_eq!(metrics.model, "gemini-2.0-flash");
        assert_eq!(metrics.input_tokens, 21);
        assert_eq!(metrics.output_tokens, 7);
        assert_eq!(metrics.cached_tokens, 16);
    }

    #[test]
    fn tolerates_missing_usage_metadata() {
        let metrics = parse_response(br#"{"candidates": []}"#).expect("parse");
        assert_eq!(metrics.model, "");
        assert_eq!(metrics.input_tokens, 0);
    }
}
