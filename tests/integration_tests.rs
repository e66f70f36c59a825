use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use candle_core::{Device, Tensor};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokenizers::models::wordlevel::WordLevel;
use tokenizers::pre_tokenizers::whitespace::Whitespace;
use tokenizers::{AddedToken, Tokenizer};
use tower::ServiceExt;

use rlhf_mini::core::adapter::{sanitize_adapter_dir, AdapterConfig, SanitizeOutcome, ADAPTER_CONFIG_FILE, ALLOWED_KEYS};
use rlhf_mini::core::tokenizer::TokenizerConfig;
use rlhf_mini::core::GenerationConfig;
use rlhf_mini::runner::EMPTY_PROMPT_MESSAGE;
use rlhf_mini::{router, AppState, CausalLm, ChatTokenizer, Engine};

const WORDS: &[&str] = &[
    "system", "user", "assistant", "You", "are", "a", "helpful", ",", "clear", ".", "hello", "there", "friend",
];

fn word_tokenizer() -> Tokenizer {
    let mut vocab: HashMap<String, u32> = HashMap::new();
    vocab.insert("<unk>".to_string(), 0);
    for w in WORDS {
        let next = vocab.len() as u32;
        vocab.entry(w.to_string()).or_insert(next);
    }
    let model = WordLevel::builder()
        .vocab(vocab.into_iter().collect())
        .unk_token("<unk>".into())
        .build()
        .unwrap();
    let mut tokenizer = Tokenizer::new(model);
    tokenizer.with_pre_tokenizer(Some(Whitespace {}));
    tokenizer.add_special_tokens(&[
        AddedToken::from("<|im_start|>", true),
        AddedToken::from("<|im_end|>", true),
        AddedToken::from("<|endoftext|>", true),
    ]);
    tokenizer
}

/// Replies with a fixed word sequence and then end of sequence.
struct EchoLm {
    script: Vec<u32>,
    eos: u32,
    vocab: usize,
    step: usize,
    calls: Arc<AtomicUsize>,
}

impl CausalLm for EchoLm {
    fn forward(&mut self, _input: &[u32], _offset: usize) -> rlhf_mini::Result<Tensor> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let hot = self.script.get(self.step).copied().unwrap_or(self.eos);
        self.step += 1;
        let mut logits = vec![-1e4f32; self.vocab];
        logits[hot as usize] = 1e4;
        Ok(Tensor::new(logits, &Device::Cpu)?)
    }

    fn clear_cache(&mut self) {
        self.step = 0;
    }
}

fn app(reply: &[&str]) -> (Router, Arc<AtomicUsize>) {
    let config = TokenizerConfig::from_json(r#"{"eos_token": "<|im_end|>", "pad_token": "<|endoftext|>"}"#).unwrap();
    let tokenizer = ChatTokenizer::new(word_tokenizer(), config).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let model = EchoLm {
        script: reply.iter().map(|w| tokenizer.token_to_id(w).unwrap()).collect(),
        eos: tokenizer.eos_id(),
        vocab: WORDS.len() + 4,
        step: 0,
        calls: Arc::clone(&calls),
    };
    let engine = Engine::new(Box::new(model), tokenizer, GenerationConfig::default()).with_seed(Some(7));
    (router(AppState::new(engine)), calls)
}

async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn text_body(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn scratch_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("rlhf_mini_it_{}_{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn test_unknown_adapter_keys_are_dropped_from_disk() {
    let dir = scratch_dir("adapter");
    let path = dir.join(ADAPTER_CONFIG_FILE);
    let original = json!({
        "peft_type": "LORA",
        "task_type": "CAUSAL_LM",
        "r": 16,
        "lora_alpha": 32,
        "lora_dropout": 0.05,
        "target_modules": ["q_proj", "v_proj"],
        "foo": "bar",
        "use_dora": false
    });
    std::fs::write(&path, serde_json::to_string_pretty(&original).unwrap()).unwrap();

    assert!(matches!(sanitize_adapter_dir(&dir), Some(SanitizeOutcome::Rewritten { .. })));

    let cleaned: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    let cleaned = cleaned.as_object().unwrap();
    assert!(!cleaned.contains_key("foo"));
    assert!(!cleaned.contains_key("use_dora"));
    assert!(cleaned.keys().all(|k| ALLOWED_KEYS.contains(&k.as_str())));
    for key in ["peft_type", "task_type", "r", "lora_alpha", "lora_dropout", "target_modules"] {
        assert_eq!(cleaned[key], original[key]);
    }

    assert!(matches!(sanitize_adapter_dir(&dir), Some(SanitizeOutcome::Unchanged)));
    let config = AdapterConfig::load(&dir).unwrap();
    assert_eq!(config.scaling(), 2.0);
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn test_index_renders_form() {
    let (app, _) = app(&[]);
    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let html = text_body(response).await;
    assert!(html.contains(r#"name="prompt""#));
    assert!(html.contains(r#"min="0.1" max="1.2" step="0.05" value="0.7""#));
    assert!(html.contains(r#"min="32" max="512" step="8" value="200""#));
    assert!(html.contains("Generate"));
}

#[tokio::test]
async fn test_empty_prompt_gets_advisory() {
    let (app, calls) = app(&["there"]);
    let (status, body) = post_json(
        app,
        "/api/generate",
        json!({"prompt": "", "temperature": 0.7, "max_new_tokens": 200}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["output"], EMPTY_PROMPT_MESSAGE);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_blank_prompt_wins_over_bad_knobs() {
    let (app, calls) = app(&["there"]);
    for body in [
        json!({"prompt": "", "temperature": "warm"}),
        json!({"prompt": "   ", "max_new_tokens": -5}),
    ] {
        let (status, body) = post_json(app.clone(), "/api/generate", body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["output"], EMPTY_PROMPT_MESSAGE);
    }

    let request = Request::builder()
        .method("POST")
        .uri("/generate")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from("prompt=+&temperature=hot&max_new_tokens=64"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(text_body(response).await.contains(EMPTY_PROMPT_MESSAGE));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_api_generate_coerces_string_numbers() {
    let (app, calls) = app(&["there", "friend"]);
    let (status, body) = post_json(
        app,
        "/api/generate",
        json!({"prompt": "hello", "temperature": "0.7", "max_new_tokens": "200"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let output = body["output"].as_str().unwrap();
    assert_eq!(output, "assistant there friend");
    assert!(!output.starts_with("hello"));
    assert!(body["created_at"].is_string());
    assert!(body["duration_ms"].is_u64());
    // Prefill, then one step per sampled token before eos.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_api_generate_rejects_bad_numbers() {
    let (app, calls) = app(&["there"]);
    let (status, body) = post_json(
        app.clone(),
        "/api/generate",
        json!({"prompt": "hello", "temperature": "warm", "max_new_tokens": 200}),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("temperature"));

    let (status, _) = post_json(
        app,
        "/api/generate",
        json!({"prompt": "hello", "temperature": 0, "max_new_tokens": 200}),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_form_submission_fills_output() {
    let (app, _) = app(&["there", "friend"]);
    let request = Request::builder()
        .method("POST")
        .uri("/generate")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from("prompt=hello&temperature=0.5&max_new_tokens=64"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let html = text_body(response).await;
    assert!(html.contains("assistant there friend"));
    assert!(html.contains(r#"value="0.5""#));
    assert!(html.contains(r#"value="64""#));
}

#[tokio::test]
async fn test_requests_are_served_one_at_a_time() {
    let (app, calls) = app(&["there", "friend"]);
    let mut handles = Vec::new();
    for _ in 0..4 {
        let app = app.clone();
        handles.push(tokio::spawn(async move {
            post_json(app, "/api/generate", json!({"prompt": "hello"})).await
        }));
    }
    for handle in handles {
        let (status, body) = handle.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["output"], "assistant there friend");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 12);
}

#[tokio::test]
async fn test_health_and_version() {
    let (app, _) = app(&[]);
    let response = app
        .clone()
        .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(Request::builder().uri("/api/version").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body: Value = serde_json::from_str(&text_body(response).await).unwrap();
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}
