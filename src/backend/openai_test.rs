use std::sync::Mutex;

use super::*;
use crate::backend::ReplySink;

#[derive(Default)]
struct CollectSink {
    partials: Mutex<Vec<String>>,
}

#[async_trait]
impl ReplySink for CollectSink {
    async fn partial(&self, text: &str) {
        self.partials.lock().unwrap().push(text.to_string());
    }
}

fn stream_body(deltas: &[&str]) -> String {
    let mut lines = deltas
        .iter()
        .map(|d| CompletionResponse {
            id: "chatcmpl-1".to_string(),
            choices: vec![CompletionChoiceResponse {
                delta: Some(CompletionMessageResponse {
                    content: Some(d.to_string()),
                }),
                ..Default::default()
            }],
        })
        .collect::<Vec<_>>();

    lines.push(CompletionResponse {
        id: "chatcmpl-1".to_string(),
        choices: vec![CompletionChoiceResponse {
            delta: Some(CompletionMessageResponse { content: None }),
            finish_reason: Some("stop".to_string()),
            ..Default::default()
        }],
    });

    let mut lines = lines
        .into_iter()
        .map(|l| {
            format!(
                "data: {}\n",
                serde_json::to_string(&l).expect("Failed to serialize")
            )
        })
        .collect::<Vec<_>>();
    lines.push("data: [DONE]".to_string());
    lines.join("\n")
}

fn setup_backend(url: String) -> OpenAI {
    OpenAI::default()
        .with_endpoint(&url)
        .with_api_key("test_token")
        .with_model("llama-2-7b-chat")
}

#[tokio::test]
async fn test_complete() {
    let body = serde_json::json!({
        "id": "chatcmpl-1",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "  hi there\n"},
            "finish_reason": "stop"
        }]
    });

    let mut server = mockito::Server::new_async().await;
    let completion_handler = server
        .mock("POST", "/v1/chat/completions")
        .with_status(200)
        .match_header("Authorization", "Bearer test_token")
        .match_body(mockito::Matcher::PartialJson(serde_json::json!({
            "model": "llama-2-7b-chat",
            "stream": false,
            "messages": [
                {"role": "user", "content": "hello"},
                {"role": "assistant", "content": "hey"},
                {"role": "user", "content": "how are you?"}
            ]
        })))
        .with_body(body.to_string())
        .create_async()
        .await;

    let backend = setup_backend(server.url());
    let text = backend
        .complete(vec![
            Turn::user("hello"),
            Turn::assistant("hey"),
            Turn::user("how are you?"),
        ])
        .await
        .expect("Failed to get completion");

    assert_eq!(text, "hi there");
    completion_handler.assert_async().await;
}

#[tokio::test]
async fn test_stream() {
    let mut server = mockito::Server::new_async().await;
    let completion_handler = server
        .mock("POST", "/v1/chat/completions")
        .with_status(200)
        .match_body(mockito::Matcher::PartialJson(
            serde_json::json!({"stream": true}),
        ))
        .with_body(stream_body(&["Hello ", "there", "!"]))
        .create_async()
        .await;

    let sink = Arc::new(CollectSink::default());
    let backend = setup_backend(server.url());
    let text = backend
        .stream(vec![Turn::user("hi")], sink.clone())
        .await
        .expect("Failed to stream completion");

    assert_eq!(text, "Hello there!");
    assert_eq!(
        *sink.partials.lock().unwrap(),
        vec!["Hello ", "Hello there", "Hello there!"]
    );
    completion_handler.assert_async().await;
}

#[tokio::test]
async fn test_stream_cuts_blank_output() {
    let mut deltas = vec!["Hi"];
    deltas.extend(std::iter::repeat_n(" ", MAX_BLANK_DELTAS + 1));
    deltas.push("never reached");

    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/v1/chat/completions")
        .with_status(200)
        .with_body(stream_body(&deltas))
        .create_async()
        .await;

    let sink = Arc::new(CollectSink::default());
    let backend = setup_backend(server.url());
    let text = backend
        .stream(vec![Turn::user("hi")], sink.clone())
        .await
        .unwrap();

    assert_eq!(text, BLANK_OUTPUT_NOTICE);
    assert_eq!(
        sink.partials.lock().unwrap().last().map(String::as_str),
        Some(BLANK_OUTPUT_NOTICE)
    );
}

#[tokio::test]
async fn test_stream_tolerates_some_blank_deltas() {
    let mut deltas = vec!["Hi"];
    deltas.extend(std::iter::repeat_n(" ", MAX_BLANK_DELTAS));
    deltas.push("there");

    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/v1/chat/completions")
        .with_status(200)
        .with_body(stream_body(&deltas))
        .create_async()
        .await;

    let backend = setup_backend(server.url());
    let text = backend
        .stream(vec![Turn::user("hi")], Arc::new(CollectSink::default()))
        .await
        .unwrap();
    assert_eq!(text, format!("Hi{}there", " ".repeat(MAX_BLANK_DELTAS)));
}

#[tokio::test]
async fn test_stream_keeps_paragraph_breaks() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/v1/chat/completions")
        .with_status(200)
        .with_body(stream_body(&["First.", "\n\n", "Second."]))
        .create_async()
        .await;

    let sink = Arc::new(CollectSink::default());
    let backend = setup_backend(server.url());
    let text = backend
        .stream(vec![Turn::user("hi")], sink.clone())
        .await
        .unwrap();

    assert_eq!(text, "First.\n\nSecond.");
    assert_eq!(
        *sink.partials.lock().unwrap(),
        vec!["First.", "First.\n\nSecond."]
    );
}

#[tokio::test]
async fn test_error_response() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/v1/chat/completions")
        .with_status(503)
        .with_body(
            serde_json::json!({
                "error": {"message": "Loading model", "type": "unavailable_error", "code": 503}
            })
            .to_string(),
        )
        .create_async()
        .await;

    let backend = setup_backend(server.url());
    let err = backend.complete(vec![Turn::user("hi")]).await.unwrap_err();
    let err = err
        .downcast_ref::<OpenAIError>()
        .expect("expected an OpenAI error");
    assert_eq!(err.http_code, 503);
    assert_eq!(err.message, "Loading model");
    assert_eq!(err.to_string(), "OpenAI error (503): Loading model");
}

#[tokio::test]
async fn test_plain_text_error_response() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/v1/chat/completions")
        .with_status(500)
        .with_body("upstream exploded")
        .create_async()
        .await;

    let backend = setup_backend(server.url());
    let err = backend
        .stream(vec![Turn::user("hi")], Arc::new(CollectSink::default()))
        .await
        .unwrap_err();
    let err = err.downcast_ref::<OpenAIError>().unwrap();
    assert_eq!(err.http_code, 500);
    assert_eq!(err.message, "upstream exploded");
}

#[test]
fn test_from_connection() {
    let connection = BackendConnection::new("http://127.0.0.1:8080/", "mistral")
        .with_api_key("secret")
        .with_timeout(time::Duration::from_secs(3));
    let backend = OpenAI::from(&connection);

    assert_eq!(backend.endpoint(), "http://127.0.0.1:8080");
    assert_eq!(backend.model(), "mistral");
    assert_eq!(backend.api_key(), Some("secret"));
    assert_eq!(backend.timeout(), Some(time::Duration::from_secs(3)));
}
