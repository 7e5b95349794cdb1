//! Turn pipeline
//!
//! The adapter owns the fixed order of a turn: validate the activity, run the
//! middleware pipeline and the bot, deliver queued replies, then save the
//! registered states. Any failure goes to the turn error handler.

mod middleware;

pub use middleware::{LoggingMiddleware, Middleware, Next};

use crate::activity::Activity;
use crate::dialogs::DialogTurnResult;
use crate::error::{Error, Result};
use crate::state::{BotState, BotStateSet, StateScope};
use crate::turn::TurnContext;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Application turn logic
#[async_trait]
pub trait Bot: Send + Sync {
    async fn on_turn(&self, turn: &mut TurnContext) -> Result<()>;
}

#[async_trait]
impl<T: Bot + ?Sized> Bot for Arc<T> {
    async fn on_turn(&self, turn: &mut TurnContext) -> Result<()> {
        (**self).on_turn(turn).await
    }
}

/// Outbound transport to the channel
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn send_activities(&self, activities: &[Activity]) -> Result<()>;
}

/// Last-chance handler for a failed turn. Anything it sends is delivered.
#[async_trait]
pub trait TurnErrorHandler: Send + Sync {
    async fn on_turn_error(&self, turn: &mut TurnContext, error: &Error) -> Result<()>;
}

/// Sends a fixed apology message
pub struct ApologyHandler {
    message: String,
}

impl Default for ApologyHandler {
    fn default() -> Self {
        Self::new("Sorry, it looks like something went wrong.")
    }
}

impl ApologyHandler {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl TurnErrorHandler for ApologyHandler {
    async fn on_turn_error(&self, turn: &mut TurnContext, _error: &Error) -> Result<()> {
        turn.send_text(self.message.clone());
        Ok(())
    }
}

/// What a successful turn produced
#[derive(Debug, Clone, Default)]
pub struct TurnReport {
    /// Activities handed to the connector, in order
    pub delivered: Vec<Activity>,
    /// Set when the bot ran a dialog turn
    pub dialog_result: Option<DialogTurnResult>,
}

pub struct Adapter {
    connector: Arc<dyn ChannelConnector>,
    middleware: Vec<Arc<dyn Middleware>>,
    states: BotStateSet,
    on_turn_error: Option<Arc<dyn TurnErrorHandler>>,
    reset_state_on_error: bool,
}

impl Adapter {
    pub fn new(connector: Arc<dyn ChannelConnector>) -> Self {
        Self {
            connector,
            middleware: Vec::new(),
            states: BotStateSet::new(),
            on_turn_error: None,
            reset_state_on_error: false,
        }
    }

    /// Append middleware; registration order is execution order
    #[must_use]
    pub fn use_middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Save this state at the end of every successful turn
    #[must_use]
    pub fn with_state(mut self, state: BotState) -> Self {
        self.states.add(state);
        self
    }

    #[must_use]
    pub fn on_turn_error(mut self, handler: impl TurnErrorHandler + 'static) -> Self {
        self.on_turn_error = Some(Arc::new(handler));
        self
    }

    /// Delete conversation-scoped state after a failed turn so the next turn
    /// starts clean. Off by default.
    #[must_use]
    pub fn reset_state_on_error(mut self, enabled: bool) -> Self {
        self.reset_state_on_error = enabled;
        self
    }

    pub async fn process_activity(&self, activity: Activity, bot: &dyn Bot) -> Result<TurnReport> {
        self.process_activity_with_cancellation(activity, bot, CancellationToken::new())
            .await
    }

    /// Run one turn. Errors are returned after the error handler has run and
    /// its replies have been delivered.
    pub async fn process_activity_with_cancellation(
        &self,
        activity: Activity,
        bot: &dyn Bot,
        cancel: CancellationToken,
    ) -> Result<TurnReport> {
        self.validate(&activity)?;

        let mut turn = TurnContext::with_cancellation(activity, cancel);
        let mut delivered = Vec::new();
        match self.run_turn(&mut turn, bot, &mut delivered).await {
            Ok(()) => Ok(TurnReport {
                delivered,
                dialog_result: turn.services_mut().remove::<DialogTurnResult>(),
            }),
            Err(error) => {
                self.recover(&mut turn, &error).await;
                Err(error)
            }
        }
    }

    /// Reject activities missing an id that the channel or a registered
    /// state needs
    fn validate(&self, activity: &Activity) -> Result<()> {
        if activity.channel().is_none() {
            return Err(Error::InvalidActivity("missing channel id".to_string()));
        }
        if activity.conversation_id().is_none() {
            return Err(Error::InvalidActivity("missing conversation id".to_string()));
        }
        for state in self.states.iter() {
            state.scope().storage_key(activity)?;
        }
        Ok(())
    }

    async fn run_turn(
        &self,
        turn: &mut TurnContext,
        bot: &dyn Bot,
        delivered: &mut Vec<Activity>,
    ) -> Result<()> {
        Next::new(&self.middleware, bot).run(turn).await?;
        self.deliver(turn, delivered).await?;
        self.states.save_all(turn, false).await
    }

    async fn deliver(&self, turn: &mut TurnContext, delivered: &mut Vec<Activity>) -> Result<()> {
        let outbound = turn.drain_outbound();
        if outbound.is_empty() {
            return Ok(());
        }
        turn.ensure_active()?;
        self.connector.send_activities(&outbound).await?;
        delivered.extend(outbound);
        Ok(())
    }

    async fn recover(&self, turn: &mut TurnContext, error: &Error) {
        // A cancelled turn must not write anything, including replies
        if matches!(error, Error::Cancelled) {
            tracing::info!(conversation = ?turn.activity().conversation_id(), "Turn cancelled");
            return;
        }
        tracing::error!(
            error = %error,
            conversation = ?turn.activity().conversation_id(),
            "Turn failed"
        );

        if let Some(handler) = &self.on_turn_error {
            if let Err(e) = handler.on_turn_error(turn, error).await {
                tracing::error!(error = %e, "Turn error handler failed");
            }
        }

        let outbound = turn.drain_outbound();
        if !outbound.is_empty() {
            if let Err(e) = self.connector.send_activities(&outbound).await {
                tracing::error!(error = %e, "Failed to deliver error replies");
            }
        }

        // On a conflict the stored document belongs to the writer that won
        if self.reset_state_on_error && !error.is_conflict() {
            for state in self
                .states
                .iter()
                .filter(|s| s.scope() == StateScope::Conversation)
            {
                if let Err(e) = state.delete(turn).await {
                    tracing::warn!(state = %state.name(), error = %e, "Failed to reset state");
                }
            }
        }
    }
}
