//! turnwise - conversational turn orchestration
//!
//! Runs one inbound activity at a time through a middleware pipeline and a
//! bot, persisting per-conversation and per-user state with optimistic
//! concurrency. Dialogs are resumable, stack-based units of conversation
//! logic whose progress lives in conversation state.

pub mod activity;
pub mod adapter;
pub mod config;
pub mod dialogs;
pub mod error;
pub mod memory;
pub mod runtime;
pub mod state;
pub mod storage;
pub mod turn;

#[cfg(test)]
pub(crate) mod testing;

pub use activity::{Activity, ActivityType};
pub use adapter::{Adapter, Bot, ChannelConnector, TurnReport};
pub use config::EngineConfig;
pub use dialogs::{Dialog, DialogContext, DialogManager, DialogTurnResult, DialogTurnStatus};
pub use error::{Error, Result};
pub use runtime::TurnDispatcher;
pub use state::{BotState, StatePropertyAccessor};
pub use storage::{MemoryStorage, SqliteStorage, Storage};
pub use turn::TurnContext;
