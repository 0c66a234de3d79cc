mod anthropic;
mod gemini;
mod openai;
pub mod translator;

use std::collections::HashMap;

use serde::Deserialize;

use crate::models::UsageMetrics;

/// Header carrying an explicit provider choice.
pub const PROVIDER_HEADER: &str = "x-majordomo-provider";

/// The upstream back-ends the gateway knows how to talk to. The tag selects
/// the usage parser, the default base URL, and the translation behavior.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Provider {
    OpenAi,
    Anthropic,
    Gemini,
    /// Gemini via its OpenAI-compatible endpoint.
    GeminiOpenAi,
    /// OpenAI wire format in, Anthropic wire format out.
    AnthropicOpenAi,
    Azure,
    Bedrock,
    Unknown,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Gemini => "gemini",
            Provider::GeminiOpenAi => "gemini-openai",
            Provider::AnthropicOpenAi => "anthropic-openai",
            Provider::Azure => "azure",
            Provider::Bedrock => "bedrock",
            Provider::Unknown => "unknown",
        }
    }

    pub fn from_label(label: &str) -> Provider {
        match label.to_ascii_lowercase().as_str() {
            "openai" => Provider::OpenAi,
            "anthropic" => Provider::Anthropic,
            "gemini" => Provider::Gemini,
            "gemini-openai" => Provider::GeminiOpenAi,
            "anthropic-openai" => Provider::AnthropicOpenAi,
            "azure" => Provider::Azure,
            "bedrock" => Provider::Bedrock,
            _ => Provider::Unknown,
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Provider::OpenAi => "https://api.openai.com",
            Provider::Anthropic | Provider::AnthropicOpenAi => "https://api.anthropic.com",
            Provider::Gemini => "https://generativelanguage.googleapis.com",
            Provider::GeminiOpenAi => "https://generativelanguage.googleapis.com/v1beta/openai",
            Provider::Azure | Provider::Bedrock | Provider::Unknown => "",
        }
    }

    /// Whether the request/response JSON is rewritten between wire formats.
    pub fn requires_translation(self) -> bool {
        self == Provider::AnthropicOpenAi
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Picks the provider for a request: an explicit `X-Majordomo-Provider`
/// header wins, otherwise well-known path shapes decide, otherwise openai.
pub fn detect(path: &str, headers: &HashMap<String, String>) -> Provider {
    if let Some(explicit) = headers.get(PROVIDER_HEADER) {
        return Provider::from_label(explicit);
    }
    detect_from_path(path)
}

fn detect_from_path(path: &str) -> Provider {
    if path.starts_with("/v1/chat/completions")
        || path.starts_with("/v1/completions")
        || path.starts_with("/v1/embeddings")
        || path.starts_with("/v1/responses")
    {
        return Provider::OpenAi;
    }
    if path.starts_with("/v1/messages") {
        return Provider::Anthropic;
    }
    if path.contains("generateContent") || path.contains("streamGenerateContent") {
        return Provider::Gemini;
    }
    Provider::OpenAi
}

/// Extracts token usage and the model name from an upstream response body.
pub fn parse_response(provider: Provider, body: &[u8]) -> Result<UsageMetrics, serde_json::Error> {
    match provider {
        Provider::Anthropic => anthropic::parse_response(body),
        Provider::Gemini => gemini::parse_response(body),
        _ => openai::parse_response(body),
    }
}

/// Pulls the model name out of a request body, used when the response body
/// omits it.
pub fn extract_model(request_body: &[u8]) -> String {
    #[derive(Deserialize)]
    struct ModelOnly {
        #[serde(default)]
        model: String,
    }

    match serde_json::from_slice::<ModelOnly>(request_body) {
        Ok(parsed) if !parsed.model.is_empty() => parsed.model,
        _ => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn explicit_header_wins_case_insensitively() {
        let provider = detect(
            "/v1/chat/completions",
            &headers(&[(PROVIDER_HEADER, "Anthropic-OpenAI")]),
        );
        assert_eq!(provider, Provider::AnthropicOpenAi);

        let provider = detect("/v1/messages", &headers(&[(PROVIDER_HEADER, "GEMINI")]));
        assert_eq!(provider, Provider::Gemini);

        let provider = detect("/v1/messages", &headers(&[(PROVIDER_HEADER, "mystery")]));
        assert_eq!(provider, Provider::Unknown);
    }

    #[test]
    fn paths_select_providers() {
        let none = HashMap::new();
        assert_eq!(detect("/v1/chat/completions", &none), Provider::OpenAi);
        assert_eq!(detect("/v1/completions", &none), Provider::OpenAi);
        assert_eq!(detect("/v1/embeddings", &none), Provider::OpenAi);
        assert_eq!(detect("/v1/responses", &none), Provider::OpenAi);
        assert_eq!(detect("/v1/messages", &none), Provider::Anthropic);
        assert_eq!(
            detect("/v1beta/models/gemini-2.0-flash:generateContent", &none),
            Provider::Gemini
        );
        assert_eq!(
            detect("/v1beta/models/gemini-2.0-flash:streamGenerateContent", &none),
            Provider::Gemini
        );
        // Everything else defaults to openai.
        assert_eq!(detect("/v1/images/generations", &none), Provider::OpenAi);
    }

    #[test]
    fn extracts_model_from_request_bodies() {
        assert_eq!(extract_model(br#"{"model":"gpt-4o","messages":[]}"#), "gpt-4o");
        assert_eq!(extract_model(br#"{"messages":[]}"#), "unknown");
        assert_eq!(extract_model(b"not json"), "unknown");
    }

    #[test]
    fn base_urls_and_labels_round_trip() {
        for provider in [
            Provider::OpenAi,
            Provider::Anthropic,
            Provider::Gemini,
            Provider::GeminiOpenAi,
            Provider::AnthropicOpenAi,
            Provider::Azure,
            Provider::Bedrock,
        ] {
            assert_eq!(Provider::from_label(provider.as_str()), provider);
        }
        assert_eq!(Provider::OpenAi.default_base_url(), "https://api.openai.com");
        assert!(Provider::AnthropicOpenAi.requires_translation());
        assert!(!Provider::Anthropic.requires_translation());
    }
}
