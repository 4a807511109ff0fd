//! NakenBot
//!
//! AI chat bot for NakenChat servers, backed by Ollama for generation.
//!
//! # Features
//!
//! - **Persistent connection**: reconnecting line-oriented TCP client
//! - **Line classification**: system chatter, self-echo and user chat
//!   separated before anything else reacts
//! - **Rate limiting**: sliding windows per identity plus a global ceiling
//! - **Conversation context**: bounded rolling history with TTL eviction
//! - **Commands**: help/model/models/stats/context/clear/ping/info/reset
//! - **Generation**: Ollama `/api/generate` with deduplicated, delayed,
//!   length-capped replies
//!
//! # Architecture
//!
//! ```text
//! NakenChat ──► ChatConnection ──► Classifier ──► RequestOrchestrator
//!   (tcp)         │ read loop         │                │
//!                 │                System/Echo      ├── RateLimiter
//!                 ◄── outbound ───── dropped        ├── ContextStore
//!                      writer                       ├── CommandRouter
//!                                                   └── OllamaClient ──► Ollama
//! ```

pub mod bot;
pub mod classifier;
pub mod commands;
pub mod config;
pub mod connection;
pub mod context;
pub mod ollama;
pub mod processor;
pub mod rate_limit;

pub use bot::{Bot, BotHandle};
pub use classifier::{ClassifiedMessage, Classifier, MessageKind};
pub use commands::{Command, CommandRouter};
pub use config::Config;
pub use connection::{ChatConnection, ConnectionError, ConnectionState};
pub use context::{ContextStats, ContextStore};
pub use ollama::{Generator, OllamaClient};
pub use processor::RequestOrchestrator;
pub use rate_limit::{RateLimitStats, RateLimiter};
