//! Anthropic provider against a mocked Messages API.

use linkscout_core::session::TranscriptEntry;
use linkscout_providers::anthropic::AnthropicProvider;
use linkscout_providers::{CompletionRequest, Credentials, LlmProvider};
use serde_json::json;
use tokio_stream::StreamExt;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOOL_USE_STREAM: &str = "event: message_start\n\
data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"usage\":{\"input_tokens\":30,\"output_tokens\":1}}}\n\
\n\
event: content_block_start\n\
data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"tool_use\",\"id\":\"toolu_1\",\"name\":\"report_social_links\",\"input\":{}}}\n\
\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"links\\\": [\\\"https://x.com/rep\\\"]}\"}}\n\
\n\
event: content_block_stop\n\
data: {\"type\":\"content_block_stop\",\"index\":0}\n\
\n\
event: message_delta\n\
data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"tool_use\"},\"usage\":{\"output_tokens\":22}}\n\
\n\
event: message_stop\n\
data: {\"type\":\"message_stop\"}\n\
\n";

fn request(provider: &AnthropicProvider) -> CompletionRequest {
    CompletionRequest {
        model: "claude-test".into(),
        messages: provider.format_messages(&[TranscriptEntry::user_text("go")]),
        max_tokens: 100,
        temperature: None,
        tools: Some(vec![json!({
            "name": "report_social_links",
            "description": "Report links",
            "input_schema": {"type": "object"},
        })]),
        system: Some("system prompt".into()),
    }
}

#[tokio::test]
async fn test_stream_against_mock_server() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-test"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_partial_json(json!({
            "model": "claude-test",
            "stream": true,
            "system": "system prompt",
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(TOOL_USE_STREAM),
        )
        .expect(1)
        .mount(&server)
        .await;

    let provider = AnthropicProvider::new(Some(&server.uri()));
    let credentials = Credentials::ApiKey {
        api_key: "sk-test".into(),
    };

    let mut stream = provider
        .stream(&request(&provider), &credentials)
        .await
        .expect("stream should open");

    let mut tool_uses = Vec::new();
    let mut stop_reason = None;
    let mut output_tokens = None;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.expect("chunk");
        if let Some(tool) = chunk.tool_use {
            tool_uses.push(tool);
        }
        if let Some(reason) = chunk.stop_reason {
            stop_reason = Some(reason);
        }
        if let Some(usage) = chunk.usage {
            output_tokens = usage.output_tokens.or(output_tokens);
        }
    }

    assert_eq!(tool_uses.len(), 1);
    assert_eq!(tool_uses[0].id, "toolu_1");
    let input: serde_json::Value = serde_json::from_str(&tool_uses[0].input_json).unwrap();
    assert_eq!(input["links"][0], "https://x.com/rep");
    assert_eq!(stop_reason.as_deref(), Some("tool_use"));
    assert_eq!(output_tokens, Some(22));
}

#[tokio::test]
async fn test_http_error_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(401).set_body_string(
            r#"{"type":"error","error":{"type":"authentication_error","message":"invalid x-api-key"}}"#,
        ))
        .mount(&server)
        .await;

    let provider = AnthropicProvider::new(Some(&server.uri()));
    let credentials = Credentials::ApiKey {
        api_key: "bad".into(),
    };

    let err = match provider.stream(&request(&provider), &credentials).await {
        Ok(_) => panic!("expected an error"),
        Err(e) => e.to_string(),
    };
    assert!(err.contains("401"), "unexpected error: {err}");
    assert!(err.contains("invalid x-api-key"));
}

#[tokio::test]
async fn test_list_models_uses_bearer_for_oauth() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .and(header("authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"id": "claude-sonnet-4-5-20250929", "display_name": "Claude Sonnet 4.5"},
                {"id": "claude-haiku"}
            ]
        })))
        .mount(&server)
        .await;

    let provider = AnthropicProvider::new(Some(&server.uri()));
    let credentials = Credentials::OAuth {
        access_token: "tok-1".into(),
    };

    let models = provider.list_models(&credentials).await.unwrap();
    assert_eq!(models.len(), 2);
    assert_eq!(models[0].name, "Claude Sonnet 4.5");
    assert_eq!(models[1].name, "claude-haiku");
}
