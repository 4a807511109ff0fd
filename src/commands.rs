//! Command parsing and dispatch
//!
//! Recognizes `<trigger> <word> [rest]` with a case-insensitive trigger
//! and a case-folded command word, and dispatches against a fixed
//! registry. Unknown names get a canned reply; handler failures become
//! a visible error string, never an escalation.

use anyhow::Result;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{error, info};

use crate::config::{BotConfig, RateLimitConfig};
use crate::context::ContextStore;
use crate::ollama::OllamaClient;
use crate::rate_limit::RateLimiter;

/// Registered command names, in help order.
const COMMANDS: &[&str] = &[
    "help", "model", "models", "stats", "context", "clear", "ping", "info", "reset",
];

/// Separators tolerated between the trigger and the command word.
const SEPARATORS: &[char] = &[':', '-', '>', '|'];

/// A parsed trigger command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Case-folded command word
    pub name: String,
    /// Remainder after the command word, untouched
    pub args: String,
}

/// Find the first case-insensitive occurrence of `trigger` and return
/// the text following it. Works on char boundaries, so mixed-case and
/// non-ASCII lines never split a code point.
pub(crate) fn after_trigger<'a>(message: &'a str, trigger: &str) -> Option<&'a str> {
    if trigger.is_empty() {
        return None;
    }
    let needle = trigger.to_lowercase();
    let needle_chars = needle.chars().count();

    for (start, _) in message.char_indices() {
        let rest = &message[start..];
        let candidate: String = rest.chars().take(needle_chars).collect();
        if candidate.to_lowercase() == needle {
            return Some(&rest[candidate.len()..]);
        }
    }
    None
}

/// Parse `message` as a trigger command. The trigger match is
/// case-insensitive and one leading separator after it is stripped.
pub fn parse(message: &str, trigger: &str) -> Option<Command> {
    if message.is_empty() || trigger.is_empty() {
        return None;
    }

    let mut rest = after_trigger(message, trigger)?.trim();
    if let Some(stripped) = rest.strip_prefix(SEPARATORS) {
        rest = stripped.trim_start();
    }
    if rest.is_empty() {
        return None;
    }

    let (word, args) = match rest.split_once(char::is_whitespace) {
        Some((word, args)) => (word, args.trim_start()),
        None => (rest, ""),
    };

    Some(Command {
        name: word.to_lowercase(),
        args: args.to_string(),
    })
}

/// Dispatches parsed commands against the fixed registry
pub struct CommandRouter {
    ollama: Arc<OllamaClient>,
    rate_limiter: Arc<RateLimiter>,
    context: Arc<ContextStore>,
    current_model: Arc<RwLock<String>>,
    bot: BotConfig,
    rate_limit: RateLimitConfig,
}

impl CommandRouter {
    pub fn new(
        ollama: Arc<OllamaClient>,
        rate_limiter: Arc<RateLimiter>,
        context: Arc<ContextStore>,
        current_model: Arc<RwLock<String>>,
        bot: BotConfig,
        rate_limit: RateLimitConfig,
    ) -> Self {
        Self {
            ollama,
            rate_limiter,
            context,
            current_model,
            bot,
            rate_limit,
        }
    }

    /// Whether `name` is in the registry. The orchestrator uses this to
    /// divert only real commands away from the generation flow.
    pub fn is_known(name: &str) -> bool {
        COMMANDS.contains(&name)
    }

    /// Run a command and return its reply text.
    pub async fn dispatch(&self, identity: &str, command: &Command) -> String {
        info!(identity, command = %command.name, args = %command.args, "command");

        if !Self::is_known(&command.name) {
            return format!(
                "Unknown command: {}. Type '{} help' for available commands.",
                command.name, self.bot.trigger
            );
        }

        match self.run(identity, command).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(command = %command.name, "command failed: {e:#}");
                format!("Error executing command: {e}")
            }
        }
    }

    async fn run(&self, identity: &str, command: &Command) -> Result<String> {
        match command.name.as_str() {
            "help" => Ok(self.cmd_help()),
            "model" => self.cmd_model(identity, &command.args).await,
            "models" => Ok(self.cmd_models().await),
            "stats" => Ok(self.cmd_stats(identity)),
            "context" => Ok(self.cmd_context(identity)),
            "clear" => Ok(self.cmd_clear(identity)),
            "ping" => Ok(format!("Pong! Hello {identity}, I'm here and ready to help!")),
            "info" => Ok(self.cmd_info()),
            "reset" => Ok(self.cmd_reset(identity)),
            _ => unreachable!("registry checked in dispatch"),
        }
    }

    fn cmd_help(&self) -> String {
        let name = &self.bot.name;
        format!(
            "Available commands:\n\
             {name} help - Show this help message\n\
             {name} model <name> - Change AI model (e.g., {name} model llama2)\n\
             {name} models - List available models\n\
             {name} stats - Show bot statistics\n\
             {name} context - Show context information\n\
             {name} clear - Clear your conversation context\n\
             {name} ping - Test bot response\n\
             {name} info - Show bot information\n\
             {name} reset - Reset rate limiting for your user\n\
             \n\
             To ask me something, just mention my name followed by your question!"
        )
    }

    async fn cmd_model(&self, identity: &str, args: &str) -> Result<String> {
        let new_model = args.trim();
        if new_model.is_empty() {
            return Ok(format!(
                "Current model: {}\nUsage: {} model <model_name>",
                self.current_model.read(),
                self.bot.trigger
            ));
        }

        if self.ollama.model_exists(new_model).await {
            *self.current_model.write() = new_model.to_string();
            info!(model = new_model, identity, "model changed");
            Ok(format!("Model changed to {new_model}"))
        } else {
            Ok(format!(
                "Model '{new_model}' not found. Use '{} models' to see available models.",
                self.bot.trigger
            ))
        }
    }

    async fn cmd_models(&self) -> String {
        match self.ollama.list_models().await {
            Ok(models) if !models.is_empty() => {
                let current = self.current_model.read().clone();
                let list = models
                    .iter()
                    .map(|m| {
                        if *m == current {
                            format!("\u{2022} {m} (current)")
                        } else {
                            format!("\u{2022} {m}")
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                format!("Available models:\n{list}")
            }
            _ => "Could not retrieve model list. Check if Ollama is running.".to_string(),
        }
    }

    fn cmd_stats(&self, identity: &str) -> String {
        let rate = self.rate_limiter.stats(identity);
        let ctx = self.context.stats();
        format!(
            "Bot Statistics:\n\
             \u{2022} Current model: {}\n\
             \u{2022} Rate limit: {}/{} requests\n\
             \u{2022} Context enabled: {}\n\
             \u{2022} Active users: {}\n\
             \u{2022} Global context: {} messages",
            self.current_model.read(),
            rate.user_requests,
            rate.user_limit,
            ctx.enabled,
            ctx.total_users,
            ctx.global_len
        )
    }

    fn cmd_context(&self, identity: &str) -> String {
        let mut context = self.context.read(identity, false);
        if context.is_empty() {
            return "No conversation context found.".to_string();
        }
        if context.chars().count() > 500 {
            context = context.chars().take(500).collect::<String>() + "...";
        }
        format!("Your conversation context:\n{context}")
    }

    fn cmd_clear(&self, identity: &str) -> String {
        self.context.clear(identity);
        "Your conversation context has been cleared.".to_string()
    }

    fn cmd_info(&self) -> String {
        format!(
            "{} Information:\n\
             \u{2022} Version: {}\n\
             \u{2022} Trigger: {}\n\
             \u{2022} Model: {}\n\
             \u{2022} Max response length: {}\n\
             \u{2022} Context length: {}\n\
             \u{2022} Rate limiting: {}",
            self.bot.name,
            env!("CARGO_PKG_VERSION"),
            self.bot.trigger,
            self.current_model.read(),
            self.bot.max_response_length,
            self.bot.context_length,
            if self.rate_limit.enabled { "Enabled" } else { "Disabled" }
        )
    }

    fn cmd_reset(&self, identity: &str) -> String {
        self.rate_limiter.reset(identity);
        "Your rate limiting has been reset.".to_string()
    }
}
