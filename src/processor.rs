//! Request orchestration
//!
//! Turns an admitted chat line into a generation request: context append,
//! trigger check, prompt derivation, command divert, rate-limit admission,
//! then a spawned generation task under a per-identity in-flight guard.
//! Once a line passes the trigger check, failure is always a plain-text
//! notice outbound, never a silent drop and never a propagated error.

use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::commands::{self, CommandRouter};
use crate::config::BotConfig;
use crate::context::ContextStore;
use crate::ollama::Generator;
use crate::rate_limit::RateLimiter;

/// Punctuation tolerated between the trigger and the prompt text.
const PROMPT_SEPARATORS: &[char] = &[':', '-', '>', '|', ','];

/// Canned reply when the backend yields nothing usable.
const APOLOGY: &str = "Sorry, I couldn't generate a response right now. Please try again later.";

/// Releases the identity's in-flight slot when the generation task ends,
/// success or not.
struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<String>>>,
    identity: String,
}

impl InFlightGuard {
    /// Claim the identity's slot; `None` when a generation is already
    /// running for it.
    fn acquire(in_flight: &Arc<Mutex<HashSet<String>>>, identity: &str) -> Option<Self> {
        if !in_flight.lock().insert(identity.to_string()) {
            return None;
        }
        Some(Self {
            in_flight: Arc::clone(in_flight),
            identity: identity.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.identity);
    }
}

/// Drives admitted chat lines through generation and reply delivery.
#[derive(Clone)]
pub struct RequestOrchestrator {
    bot: BotConfig,
    generator: Arc<dyn Generator>,
    router: Arc<CommandRouter>,
    rate_limiter: Arc<RateLimiter>,
    context: Arc<ContextStore>,
    current_model: Arc<RwLock<String>>,
    outbound: mpsc::Sender<String>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl RequestOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bot: BotConfig,
        generator: Arc<dyn Generator>,
        router: Arc<CommandRouter>,
        rate_limiter: Arc<RateLimiter>,
        context: Arc<ContextStore>,
        current_model: Arc<RwLock<String>>,
        outbound: mpsc::Sender<String>,
    ) -> Self {
        Self {
            bot,
            generator,
            router,
            rate_limiter,
            context,
            current_model,
            outbound,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Handle one classified chat line from a named user.
    pub async fn handle_chat(&self, username: &str, content: &str) {
        if username.is_empty() {
            return;
        }

        // Every user line feeds the conversation context, triggered or not.
        self.context.append(username, content, false);

        let Some(prompt) = extract_prompt(content, &self.bot.trigger) else {
            return;
        };

        // Known command words go to the router instead of generation.
        if let Some(command) = commands::parse(content, &self.bot.trigger) {
            if CommandRouter::is_known(&command.name) {
                let reply = self.router.dispatch(username, &command).await;
                self.send(&reply).await;
                return;
            }
        }

        if !self.rate_limiter.is_allowed(username) {
            info!(username, "rate limit rejection");
            let stats = self.rate_limiter.stats(username);
            self.send(&format!(
                "You've reached the rate limit ({}/{} requests per {} seconds). \
                 Please wait a moment before asking again.",
                stats.user_requests, stats.user_limit, stats.window_secs
            ))
            .await;
            return;
        }
        self.rate_limiter.record(username);

        let Some(guard) = InFlightGuard::acquire(&self.in_flight, username) else {
            debug!(username, "generation already in flight, dropping request");
            return;
        };

        let this = self.clone();
        let username = username.to_string();
        tokio::spawn(async move {
            this.run_generation(&username, &prompt).await;
            drop(guard);
        });
    }

    async fn run_generation(&self, username: &str, prompt: &str) {
        sleep(self.bot.response_delay).await;

        let context = self.context.read(username, true);
        let model = self.current_model.read().clone();
        info!(username, model = %model, prompt = %truncate_response(prompt, 50), "generating response");

        match self.generator.generate(prompt, &context, &model).await {
            Ok(response) if !response.is_empty() => {
                let reply = truncate_response(&response, self.bot.max_response_length);
                self.context.append(&self.bot.username, &reply, true);
                self.send(&reply).await;
                info!(username, "response sent");
            }
            Ok(_) => {
                warn!(username, "backend returned an empty response");
                self.send(APOLOGY).await;
            }
            Err(e) => {
                error!(username, "generation failed: {e:#}");
                self.send(APOLOGY).await;
            }
        }
    }

    /// Queue a line for the outbound writer; degrades to a logged no-op
    /// when the connection side is already gone.
    async fn send(&self, line: &str) {
        if self.outbound.send(line.to_string()).await.is_err() {
            warn!("outbound channel closed, dropping reply");
        }
    }
}

/// Take the text after the trigger, dropping one leading separator.
/// Returns `None` when the trigger is absent or nothing follows it.
fn extract_prompt(content: &str, trigger: &str) -> Option<String> {
    let mut rest = commands::after_trigger(content, trigger)?.trim();
    if let Some(stripped) = rest.strip_prefix(PROMPT_SEPARATORS) {
        rest = stripped.trim();
    }
    if rest.is_empty() {
        return None;
    }
    Some(rest.to_string())
}

/// Word-boundary truncation: keep the first `max_len - 3` characters,
/// search backward for a space, accept the cut only past 80% of the
/// budget, and append `"..."` whenever anything was dropped.
pub fn truncate_response(response: &str, max_len: usize) -> String {
    let chars: Vec<char> = response.chars().collect();
    if chars.len() <= max_len {
        return response.to_string();
    }

    let truncated = &chars[..max_len.saturating_sub(3)];
    let cut = truncated
        .iter()
        .rposition(|&c| c == ' ')
        .filter(|&pos| pos as f64 > max_len as f64 * 0.8);

    let kept: String = match cut {
        Some(pos) => truncated[..pos].iter().collect(),
        None => truncated.iter().collect(),
    };
    format!("{kept}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{Classifier, MessageKind};
    use crate::config::{Config, OllamaConfig, RateLimitConfig};
    use crate::ollama::OllamaClient;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Records calls and replays a fixed outcome.
    struct MockGenerator {
        calls: Mutex<Vec<(String, String, String)>>,
        reply: Result<String>,
        delay: Duration,
    }

    impl MockGenerator {
        fn replying(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                reply: Ok(reply.to_string()),
                delay: Duration::ZERO,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                reply: Err(anyhow!("backend down")),
                delay: Duration::ZERO,
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl Generator for MockGenerator {
        async fn generate(&self, prompt: &str, context: &str, model: &str) -> Result<String> {
            sleep(self.delay).await;
            self.calls
                .lock()
                .push((prompt.to_string(), context.to_string(), model.to_string()));
            match &self.reply {
                Ok(reply) => Ok(reply.clone()),
                Err(e) => Err(anyhow!("{e}")),
            }
        }
    }

    struct Harness {
        orchestrator: RequestOrchestrator,
        generator: Arc<MockGenerator>,
        outbound: mpsc::Receiver<String>,
        context: Arc<ContextStore>,
        rate_limiter: Arc<RateLimiter>,
    }

    fn harness(generator: Arc<MockGenerator>, max_requests: usize) -> Harness {
        let mut config = Config::from_env().unwrap();
        config.bot.trigger = "Bot".to_string();
        config.bot.username = "Bot".to_string();
        config.bot.response_delay = Duration::ZERO;
        config.rate_limit = RateLimitConfig {
            enabled: true,
            max_requests,
            time_window: Duration::from_secs(60),
        };

        let ollama_config = OllamaConfig {
            host: "http://localhost".to_string(),
            port: 9,
            model: "llama2".to_string(),
            timeout: Duration::from_millis(200),
            max_tokens: 100,
            temperature: 0.7,
            system_prompt: "sys".to_string(),
        };
        let ollama = Arc::new(OllamaClient::new(&ollama_config, "Bot").unwrap());
        let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        let context = Arc::new(ContextStore::new(10, true));
        let current_model = Arc::new(RwLock::new("llama2".to_string()));
        let router = Arc::new(CommandRouter::new(
            ollama,
            Arc::clone(&rate_limiter),
            Arc::clone(&context),
            Arc::clone(&current_model),
            config.bot.clone(),
            config.rate_limit.clone(),
        ));

        let (tx, rx) = mpsc::channel(16);
        let orchestrator = RequestOrchestrator::new(
            config.bot,
            generator.clone(),
            router,
            Arc::clone(&rate_limiter),
            Arc::clone(&context),
            current_model,
            tx,
        );

        Harness {
            orchestrator,
            generator,
            outbound: rx,
            context,
            rate_limiter,
        }
    }

    mod truncation {
        use super::*;

        #[test]
        fn long_response_is_cut_with_ellipsis() {
            let result =
                truncate_response("This is a very long response that should be truncated", 20);
            assert!(result.chars().count() <= 20);
            assert!(result.ends_with("..."));
        }

        #[test]
        fn short_response_is_untouched() {
            assert_eq!(truncate_response("Short", 20), "Short");
        }

        #[test]
        fn word_boundary_cut_is_used_when_late_enough() {
            // Space at position 21 of the 22-char window, past 80% of 25,
            // so the cut lands on the word boundary instead of mid-window.
            let input = format!("{} bbbbbbbbbb", "a".repeat(21));
            assert_eq!(truncate_response(&input, 25), format!("{}...", "a".repeat(21)));
        }

        #[test]
        fn early_space_falls_back_to_hard_cut() {
            // Only space is at position 4, well before 80% of 25.
            let input = format!("aaaa {}", "b".repeat(40));
            let result = truncate_response(&input, 25);
            assert_eq!(result.chars().count(), 25);
            assert!(result.ends_with("..."));
        }

        #[test]
        fn multibyte_text_never_splits_a_char() {
            let result = truncate_response(&"é".repeat(50), 20);
            assert!(result.chars().count() <= 20);
            assert!(result.ends_with("..."));
        }
    }

    mod prompt_extraction {
        use super::*;

        #[test]
        fn takes_text_after_trigger() {
            assert_eq!(
                extract_prompt("Bot, what time is it?", "Bot").as_deref(),
                Some("what time is it?")
            );
        }

        #[test]
        fn strips_one_leading_separator() {
            assert_eq!(extract_prompt("Bot: hello", "Bot").as_deref(), Some("hello"));
            assert_eq!(extract_prompt("Bot > hello", "Bot").as_deref(), Some("hello"));
        }

        #[test]
        fn trigger_is_case_insensitive() {
            assert_eq!(extract_prompt("hey BOT tell me", "Bot").as_deref(), Some("tell me"));
        }

        #[test]
        fn empty_remainder_aborts() {
            assert_eq!(extract_prompt("Bot", "Bot"), None);
            assert_eq!(extract_prompt("Bot:", "Bot"), None);
            assert_eq!(extract_prompt("no mention here", "Bot"), None);
        }
    }

    mod pipeline {
        use super::*;

        #[tokio::test]
        async fn end_to_end_classified_line_issues_one_generation() {
            let mut h = harness(MockGenerator::replying("It is tea time."), 5);

            let classifier = Classifier::new("Bot");
            let msg = classifier.classify("<2>alice: Bot, what time is it?");
            assert_eq!(msg.kind, MessageKind::Chat);
            assert_eq!(msg.username.as_deref(), Some("alice"));
            assert_eq!(msg.content, "Bot, what time is it?");

            h.orchestrator
                .handle_chat(msg.username.as_deref().unwrap(), &msg.content)
                .await;

            let reply = h.outbound.recv().await.unwrap();
            assert_eq!(reply, "It is tea time.");

            let calls = h.generator.calls.lock();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].0, "what time is it?");
            assert_eq!(calls[0].2, "llama2");
        }

        #[tokio::test]
        async fn untriggered_lines_feed_context_but_not_generation() {
            let h = harness(MockGenerator::replying("ignored"), 5);

            h.orchestrator.handle_chat("alice", "just chatting").await;

            assert_eq!(h.generator.call_count(), 0);
            assert_eq!(h.context.read("alice", false), "alice: just chatting");
        }

        #[tokio::test]
        async fn empty_identity_is_rejected_entirely() {
            let h = harness(MockGenerator::replying("ignored"), 5);

            h.orchestrator.handle_chat("", "Bot hello there").await;

            assert_eq!(h.generator.call_count(), 0);
            assert_eq!(h.context.stats().global_len, 0);
        }

        #[tokio::test]
        async fn rate_limited_user_gets_a_notice() {
            let mut h = harness(MockGenerator::replying("ignored"), 1);
            h.rate_limiter.record("alice");

            h.orchestrator.handle_chat("alice", "Bot another question").await;

            let notice = h.outbound.recv().await.unwrap();
            assert!(notice.contains("rate limit (1/1 requests per 60 seconds)"));
            assert_eq!(h.generator.call_count(), 0);
        }

        #[tokio::test]
        async fn backend_failure_sends_apology() {
            let mut h = harness(MockGenerator::failing(), 5);

            h.orchestrator.handle_chat("alice", "Bot hello").await;

            assert_eq!(h.outbound.recv().await.unwrap(), APOLOGY);
        }

        #[tokio::test]
        async fn reply_is_truncated_and_recorded_as_bot_turn() {
            let long = "word ".repeat(200);
            let mut h = harness(MockGenerator::replying(long.trim()), 5);

            h.orchestrator.handle_chat("alice", "Bot ramble please").await;

            let reply = h.outbound.recv().await.unwrap();
            assert!(reply.chars().count() <= 400);
            assert!(reply.ends_with("..."));
            assert!(h.context.read("alice", true).contains("Assistant: "));
        }

        #[tokio::test]
        async fn second_concurrent_request_per_identity_is_rejected() {
            let generator = Arc::new(MockGenerator {
                calls: Mutex::new(Vec::new()),
                reply: Ok("slow reply".to_string()),
                delay: Duration::from_millis(100),
            });
            let mut h = harness(generator, 5);

            h.orchestrator.handle_chat("alice", "Bot first question").await;
            h.orchestrator.handle_chat("alice", "Bot second question").await;

            // Only the first request's reply arrives.
            assert_eq!(h.outbound.recv().await.unwrap(), "slow reply");
            assert_eq!(h.generator.call_count(), 1);
        }

        #[tokio::test]
        async fn known_command_diverts_to_router() {
            let mut h = harness(MockGenerator::replying("ignored"), 5);

            h.orchestrator.handle_chat("alice", "Bot ping").await;

            let reply = h.outbound.recv().await.unwrap();
            assert!(reply.starts_with("Pong!"));
            assert_eq!(h.generator.call_count(), 0);
        }

        #[tokio::test]
        async fn unknown_word_is_a_prompt_not_a_command() {
            let mut h = harness(MockGenerator::replying("an answer"), 5);

            h.orchestrator.handle_chat("alice", "Bot weather tomorrow?").await;

            assert_eq!(h.outbound.recv().await.unwrap(), "an answer");
            let calls = h.generator.calls.lock();
            assert_eq!(calls[0].0, "weather tomorrow?");
        }
    }
}
