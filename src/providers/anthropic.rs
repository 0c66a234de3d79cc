use serde::Deserialize;

use crate::models::UsageMetrics;

#[derive(Debug, Default, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
    #[serde(default)]
    cache_read_input_tokens: i64,
    #[serde(default)]
    cache_creation_input_tokens: i64,
}

pub(super) fn parse_response(body: &[u8]) -> Result<UsageMetrics, serde_json::Error> {
    let parsed: AnthropicResponse = serde_json::from_slice(body)?;

    // Anthropic's input_tokens excludes cache reads and cache creation;
    // normalize to the OpenAI convention where the input count is the total
    // prompt, so downstream cost math is uniform.
    let input_tokens = parsed.usage.input_tokens
        + parsed.usage.cache_read_input_tokens
        + parsed.usage.cache_creation_input_tokens;

    Ok(UsageMetrics {
        model: parsed.model,
        input_tokens,
        output_tokens: parsed.usage.output_tokens,
        cached_tokens: parsed.usage.cache_read_input_tokens,
        cache_creation_tokens: parsed.usage.cache_creation_input_tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_cached_input_tokens() {
        let body = br#"{
            "model": "claude-sonnet-4-20250514",
            "usage": {
                "input_tokens": 150,
                "output_tokens": 89,
                "cache_read_input_tokens": 2048
            }
        }"#;
        let metrics = parse_response(body).expect("parse");
        assert_eq!(metrics.input_tokens, 2198);
        assert_eq!(metrics.output_tokens, 89);
        assert_eq!(metrics.cached_tokens, 2048);
        assert_eq!(metrics.cache_creation_tokens, 0);
    }

    #[test]
    fn counts_cache_creation_into_input() {
        let body = br#"{
            "model": "claude-sonnet-4-20250514",
            "usage": {
                "input_tokens": 10,
                "output_tokens": 5,
                "cache_read_input_tokens": 100,
                "cache_creation_input_tokens": 30
            }
        }"#;
        let metrics = parse_response(body).expect("parse");
        assert_eq!(metrics.input_tokens, 140);
        assert_eq!(metrics.cached_tokens, 100);
        assert_eq!(metrics.cache_creation_tokens, 30);
    }
}
