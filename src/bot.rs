//! Bot assembly and dispatch loop
//!
//! Wires every component together, drives inbound lines through
//! classification and orchestration, and forwards queued replies to the
//! connection. Shutdown is an explicitly owned [`BotHandle`] handed to
//! whatever installs signal handling; there is no global bot reference.

use anyhow::{bail, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use crate::classifier::{Classifier, MessageKind};
use crate::commands::CommandRouter;
use crate::config::Config;
use crate::connection::{ChatConnection, ConnectionState};
use crate::context::ContextStore;
use crate::ollama::{Generator, OllamaClient};
use crate::processor::RequestOrchestrator;
use crate::rate_limit::RateLimiter;

/// How often the dispatch loop checks for a dead connection.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Cloneable shutdown handle for signal handlers.
#[derive(Clone)]
pub struct BotHandle {
    shutdown: Arc<Notify>,
}

impl BotHandle {
    /// Request a graceful stop; safe to call from any task.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

/// The assembled bot: one connection, one dispatch loop.
pub struct Bot {
    config: Config,
    classifier: Classifier,
    connection: ChatConnection,
    orchestrator: RequestOrchestrator,
    ollama: Arc<OllamaClient>,
    current_model: Arc<RwLock<String>>,
    line_rx: Option<mpsc::Receiver<String>>,
    outbound_rx: Option<mpsc::Receiver<String>>,
    shutdown: Arc<Notify>,
}

impl Bot {
    pub fn new(config: Config) -> Result<Self> {
        let (line_tx, line_rx) = mpsc::channel(256);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);

        let ollama = Arc::new(OllamaClient::new(&config.ollama, &config.bot.name)?);
        let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        let context = Arc::new(ContextStore::new(
            config.bot.context_length,
            config.bot.enable_context,
        ));
        let current_model = Arc::new(RwLock::new(config.ollama.model.clone()));

        let router = Arc::new(CommandRouter::new(
            Arc::clone(&ollama),
            Arc::clone(&rate_limiter),
            Arc::clone(&context),
            Arc::clone(&current_model),
            config.bot.clone(),
            config.rate_limit.clone(),
        ));

        let orchestrator = RequestOrchestrator::new(
            config.bot.clone(),
            Arc::clone(&ollama) as Arc<dyn Generator>,
            router,
            rate_limiter,
            context,
            Arc::clone(&current_model),
            outbound_tx,
        );

        let connection = ChatConnection::new(config.chat.clone(), &config.bot.username, line_tx);

        Ok(Self {
            classifier: Classifier::new(config.bot.username.clone()),
            config,
            connection,
            orchestrator,
            ollama,
            current_model,
            line_rx: Some(line_rx),
            outbound_rx: Some(outbound_rx),
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Shutdown handle for signal handling; clone freely.
    pub fn handle(&self) -> BotHandle {
        BotHandle {
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Verify the generation backend and pick a usable model before
    /// touching the chat server.
    async fn check_backend(&self) -> Result<()> {
        if !self.ollama.test_connection().await {
            bail!("failed to connect to Ollama API");
        }

        let configured = self.current_model.read().clone();
        if !self.ollama.model_exists(&configured).await {
            warn!(model = %configured, "configured model not found");
            let models = self.ollama.list_models().await?;
            match models.first() {
                Some(fallback) => {
                    info!(model = %fallback, "falling back to first available model");
                    *self.current_model.write() = fallback.clone();
                }
                None => bail!("no models available on the Ollama instance"),
            }
        }
        Ok(())
    }

    /// Connect and run until shutdown or attempt exhaustion.
    pub async fn run(&mut self) -> Result<()> {
        info!(name = %self.config.bot.name, "starting bot");
        self.check_backend().await?;
        self.connection.connect().await?;

        // Writer loop: serializes replies onto the connection and turns
        // send failures into logged no-ops (the reconnect policy already
        // handles the socket).
        let (Some(mut line_rx), Some(mut outbound_rx)) =
            (self.line_rx.take(), self.outbound_rx.take())
        else {
            bail!("run() called twice on the same bot");
        };
        let connection = self.connection.clone();
        let writer = tokio::spawn(async move {
            while let Some(line) = outbound_rx.recv().await {
                if let Err(e) = connection.send(&line).await {
                    warn!("dropping outbound line: {e}");
                }
            }
        });

        let shutdown = Arc::clone(&self.shutdown);
        let mut health = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        let result = loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("shutdown requested");
                    break Ok(());
                }
                line = line_rx.recv() => match line {
                    Some(line) => self.dispatch(&line).await,
                    None => break Ok(()),
                },
                _ = health.tick() => {
                    if self.connection.state() == ConnectionState::Disconnected {
                        error!("connection lost and reconnection exhausted");
                        break Err(anyhow::anyhow!("connection lost"));
                    }
                }
            }
        };

        self.connection.disconnect().await;
        writer.abort();
        result
    }

    /// Classify one inbound line and hand chat lines to the orchestrator.
    async fn dispatch(&self, line: &str) {
        let msg = self.classifier.classify(line);
        match msg.kind {
            MessageKind::System => debug!(%line, "skipping system message"),
            MessageKind::Echo => debug!(%line, "skipping own echo"),
            MessageKind::Chat => match msg.username.as_deref() {
                Some(username) => self.orchestrator.handle_chat(username, &msg.content).await,
                None => debug!(%line, "no username extracted, ignoring"),
            },
        }
    }
}
