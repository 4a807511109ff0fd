//! Configuration management
//!
//! All settings come from environment variables (`.env` supported via
//! dotenvy in `main`). Bad numeric values are a fatal startup error.

use anyhow::{Context, Result};
use std::time::Duration;

/// Default system prompt; `{bot_name}` is substituted at request time.
const DEFAULT_SYSTEM_PROMPT: &str = "You are {bot_name}, a friendly and helpful \
AI assistant in a chat room. Keep your answers short and conversational.";

/// Chat server connection settings
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// NakenChat server host
    pub host: String,
    /// NakenChat server port
    pub port: u16,
    /// Fixed delay between reconnection attempts
    pub reconnect_delay: Duration,
    /// Consecutive failed attempts before giving up
    pub max_reconnect_attempts: u32,
}

/// Bot identity and response behavior
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Display name used in help/info text
    pub name: String,
    /// Username registered with `.n` and matched against echo lines
    pub username: String,
    /// Substring that marks a line as directed at the bot
    pub trigger: String,
    /// Delay before sending a generated reply
    pub response_delay: Duration,
    /// Maximum outbound reply length in characters
    pub max_response_length: usize,
    /// Turns kept per identity and globally
    pub context_length: usize,
    /// Whether conversation context is collected at all
    pub enable_context: bool,
}

/// Sliding-window rate limit settings
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Per-identity requests allowed inside the window
    pub max_requests: usize,
    /// Window length
    pub time_window: Duration,
}

/// Ollama backend settings
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub host: String,
    pub port: u16,
    pub model: String,
    pub timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f32,
    /// System prompt template, `{bot_name}` substituted per request
    pub system_prompt: String,
}

/// Top-level configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub chat: ChatConfig,
    pub bot: BotConfig,
    pub rate_limit: RateLimitConfig,
    pub ollama: OllamaConfig,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let chat = ChatConfig {
            host: env_or("NAKENCHAT_HOST", "localhost"),
            port: env_parse("NAKENCHAT_PORT", 6666)?,
            reconnect_delay: Duration::from_secs_f64(env_parse("NAKENCHAT_RECONNECT_DELAY", 5.0)?),
            max_reconnect_attempts: env_parse("NAKENCHAT_MAX_RECONNECT_ATTEMPTS", 5)?,
        };

        let name = env_or("BOT_NAME", "NakenBot");
        let bot = BotConfig {
            username: env_or("BOT_USERNAME", &name),
            trigger: env_or("BOT_TRIGGER", &name),
            response_delay: Duration::from_secs_f64(env_parse("BOT_RESPONSE_DELAY", 1.0)?),
            max_response_length: env_parse("BOT_MAX_RESPONSE_LENGTH", 400)?,
            context_length: env_parse("BOT_CONTEXT_LENGTH", 10)?,
            enable_context: env_bool("BOT_ENABLE_CONTEXT", true),
            name,
        };

        let rate_limit = RateLimitConfig {
            enabled: env_bool("RATE_LIMIT_ENABLED", true),
            max_requests: env_parse("RATE_LIMIT_MAX_REQUESTS", 5)?,
            time_window: Duration::from_secs(env_parse("RATE_LIMIT_TIME_WINDOW", 60)?),
        };

        let ollama = OllamaConfig {
            host: env_or("OLLAMA_HOST", "http://localhost"),
            port: env_parse("OLLAMA_PORT", 11434)?,
            model: env_or("OLLAMA_MODEL", "llama3.2:3b"),
            timeout: Duration::from_secs(env_parse("OLLAMA_TIMEOUT", 60)?),
            max_tokens: env_parse("OLLAMA_MAX_TOKENS", 200)?,
            temperature: env_parse("OLLAMA_TEMPERATURE", 0.7)?,
            system_prompt: env_or("OLLAMA_SYSTEM_PROMPT", DEFAULT_SYSTEM_PROMPT),
        };

        Ok(Self {
            chat,
            bot,
            rate_limit,
            ollama,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_env() {
        let config = Config::from_env().expect("defaults should parse");
        assert_eq!(config.chat.port, 6666);
        assert_eq!(config.bot.name, "NakenBot");
        assert_eq!(config.bot.trigger, "NakenBot");
        assert!(config.rate_limit.enabled);
        assert_eq!(config.ollama.model, "llama3.2:3b");
        assert!(config.ollama.system_prompt.contains("{bot_name}"));
    }
}
