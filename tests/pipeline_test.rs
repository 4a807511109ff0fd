//! End-to-end pipeline tests over the public API: raw line in,
//! classified, orchestrated, generated reply out.

use anyhow::Result;
use async_trait::async_trait;
use nakenbot::commands::CommandRouter;
use nakenbot::config::{Config, OllamaConfig, RateLimitConfig};
use nakenbot::context::ContextStore;
use nakenbot::ollama::OllamaClient;
use nakenbot::rate_limit::RateLimiter;
use nakenbot::{Classifier, Generator, MessageKind, RequestOrchestrator};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct CountingGenerator {
    prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl Generator for CountingGenerator {
    async fn generate(&self, prompt: &str, _context: &str, _model: &str) -> Result<String> {
        self.prompts.lock().push(prompt.to_string());
        Ok(format!("reply to: {prompt}"))
    }
}

struct Pipeline {
    classifier: Classifier,
    orchestrator: RequestOrchestrator,
    generator: Arc<CountingGenerator>,
    outbound: mpsc::Receiver<String>,
}

fn pipeline(max_requests: usize) -> Pipeline {
    let mut config = Config::from_env().unwrap();
    config.bot.trigger = "Bot".to_string();
    config.bot.username = "Bot".to_string();
    config.bot.response_delay = Duration::ZERO;
    config.rate_limit = RateLimitConfig {
        enabled: true,
        max_requests,
        time_window: Duration::from_secs(60),
    };

    let ollama = Arc::new(
        OllamaClient::new(
            &OllamaConfig {
                host: "http://localhost".to_string(),
                port: 9,
                model: "llama2".to_string(),
                timeout: Duration::from_millis(200),
                max_tokens: 100,
                temperature: 0.7,
                system_prompt: "sys".to_string(),
            },
            "Bot",
        )
        .unwrap(),
    );
    let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit));
    let context = Arc::new(ContextStore::new(config.bot.context_length, true));
    let current_model = Arc::new(RwLock::new("llama2".to_string()));
    let router = Arc::new(CommandRouter::new(
        ollama,
        Arc::clone(&rate_limiter),
        Arc::clone(&context),
        Arc::clone(&current_model),
        config.bot.clone(),
        config.rate_limit.clone(),
    ));

    let generator = Arc::new(CountingGenerator {
        prompts: Mutex::new(Vec::new()),
    });
    let (tx, rx) = mpsc::channel(16);
    let orchestrator = RequestOrchestrator::new(
        config.bot,
        Arc::clone(&generator) as Arc<dyn Generator>,
        router,
        rate_limiter,
        context,
        current_model,
        tx,
    );

    Pipeline {
        classifier: Classifier::new("Bot"),
        orchestrator,
        generator,
        outbound: rx,
    }
}

async fn feed(p: &Pipeline, raw: &str) {
    let msg = p.classifier.classify(raw);
    if msg.kind == MessageKind::Chat {
        if let Some(username) = msg.username.as_deref() {
            p.orchestrator.handle_chat(username, &msg.content).await;
        }
    }
}

#[tokio::test]
async fn triggered_chat_line_produces_one_generated_reply() {
    let mut p = pipeline(5);

    feed(&p, "<2>alice: Bot, what time is it?").await;

    assert_eq!(p.outbound.recv().await.unwrap(), "reply to: what time is it?");
    assert_eq!(p.generator.prompts.lock().as_slice(), ["what time is it?"]);
}

#[tokio::test]
async fn system_and_echo_lines_never_reach_generation() {
    let p = pipeline(5);

    feed(&p, ">> Welcome to NakenChat").await;
    feed(&p, "Total: 4 users").await;
    feed(&p, "[1]Bot: earlier reply").await;

    assert!(p.generator.prompts.lock().is_empty());
}

#[tokio::test]
async fn command_lines_are_answered_without_generation() {
    let mut p = pipeline(5);

    feed(&p, "[3]alice: Bot ping").await;

    let reply = p.outbound.recv().await.unwrap();
    assert!(reply.starts_with("Pong!"));
    assert!(p.generator.prompts.lock().is_empty());
}

#[tokio::test]
async fn over_limit_user_gets_notice_instead_of_reply() {
    let mut p = pipeline(1);

    feed(&p, "[3]alice: Bot first question").await;
    assert!(p.outbound.recv().await.unwrap().starts_with("reply to:"));

    feed(&p, "[3]alice: Bot second question").await;
    let notice = p.outbound.recv().await.unwrap();
    assert!(notice.contains("rate limit"));
    assert_eq!(p.generator.prompts.lock().len(), 1);
}
