//! Middleware pipeline
//!
//! Middleware wraps the bot like an onion: each component runs code before
//! calling `next`, and after it returns. Not calling `next` short-circuits
//! the rest of the pipeline, including the bot.

use super::Bot;
use crate::error::Result;
use crate::turn::TurnContext;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Instant;

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn on_turn(&self, turn: &mut TurnContext, next: Next<'_>) -> Result<()>;
}

/// The remainder of the pipeline after the current middleware
pub struct Next<'a> {
    middleware: &'a [Arc<dyn Middleware>],
    bot: &'a dyn Bot,
}

impl<'a> Next<'a> {
    pub(crate) fn new(middleware: &'a [Arc<dyn Middleware>], bot: &'a dyn Bot) -> Self {
        Self { middleware, bot }
    }

    /// Run the rest of the pipeline
    pub fn run<'t>(self, turn: &'t mut TurnContext) -> BoxFuture<'t, Result<()>>
    where
        'a: 't,
    {
        Box::pin(async move {
            match self.middleware.split_first() {
                Some((first, rest)) => first.on_turn(turn, Next::new(rest, self.bot)).await,
                None => self.bot.on_turn(turn).await,
            }
        })
    }
}

/// Logs the start and outcome of every turn
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn on_turn(&self, turn: &mut TurnContext, next: Next<'_>) -> Result<()> {
        let started = Instant::now();
        let activity = turn.activity();
        tracing::info!(
            channel = %activity.channel_id,
            conversation = ?activity.conversation_id(),
            from = ?activity.from_id(),
            activity_type = activity.activity_type.as_str(),
            "Turn started"
        );

        let result = next.run(turn).await;

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match &result {
            Ok(()) => tracing::info!(
                elapsed_ms,
                outbound = turn.outbound().len(),
                "Turn finished"
            ),
            Err(e) => tracing::warn!(elapsed_ms, error = %e, "Turn failed"),
        }
        result
    }
}
