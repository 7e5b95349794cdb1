//! turnwise console bot
//!
//! Reads one message per stdin line and runs it as a turn of a single console
//! conversation. The greeting dialog remembers the user's name in user state,
//! so with `TURNWISE_DB_PATH` set it survives restarts.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use turnwise::activity::{Activity, ChannelAccount, ConversationAccount};
use turnwise::adapter::{Adapter, ApologyHandler, ChannelConnector, LoggingMiddleware};
use turnwise::dialogs::{
    DialogManager, DialogServices, TextPrompt, TracingDebugger, WaterfallDialog,
};
use turnwise::{BotState, EngineConfig, TurnDispatcher};

const CHANNEL_ID: &str = "console";

/// Prints outbound message text to stdout
struct ConsoleConnector;

#[async_trait]
impl ChannelConnector for ConsoleConnector {
    async fn send_activities(&self, activities: &[Activity]) -> turnwise::Result<()> {
        for text in activities.iter().filter_map(|a| a.text.as_deref()) {
            println!("bot> {text}");
        }
        Ok(())
    }
}

fn greeting_dialog() -> WaterfallDialog {
    WaterfallDialog::new("greeting")
        .step(|mut step| {
            Box::pin(async move {
                match step.context().get_value_as::<String>("user.name")? {
                    Some(name) => step.next(Some(json!(name))).await,
                    None => step.prompt("text", "Hi! What's your name?").await,
                }
            })
        })
        .step(|mut step| {
            Box::pin(async move {
                let name = step.result_str().unwrap_or("friend").to_string();
                let visits = step
                    .context()
                    .get_value_as::<u64>("user.visits")?
                    .unwrap_or_default()
                    + 1;
                step.context().set_value("user.name", json!(name))?;
                step.context().set_value("user.visits", json!(visits))?;
                step.turn()
                    .send_text(format!("Hello, {name}! That's visit number {visits}."));
                step.end_dialog(Some(json!(name))).await
            })
        })
}

fn console_activity(user_id: &str, text: String) -> Activity {
    Activity {
        id: Some(uuid::Uuid::new_v4().to_string()),
        timestamp: Some(chrono::Utc::now()),
        channel_id: CHANNEL_ID.to_string(),
        from: Some(ChannelAccount::new(user_id)),
        recipient: Some(ChannelAccount::new("turnwise")),
        conversation: Some(ConversationAccount::new(CHANNEL_ID)),
        ..Activity::message(text)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr; stdout is the conversation
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "turnwise=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = EngineConfig::from_env();
    tracing::info!(?config, "Starting turnwise console");

    let storage = config.open_storage()?;
    let conversation = BotState::conversation(Arc::clone(&storage));
    let user = BotState::user(storage);

    let services = DialogServices::new(config.scope_registry()?).with_debugger(TracingDebugger);
    let bot = DialogManager::new(greeting_dialog(), conversation.clone())?
        .add_dialog(TextPrompt::new("text"))?
        .with_state(user.clone())
        .with_services(Arc::new(services));

    let adapter = Adapter::new(Arc::new(ConsoleConnector))
        .use_middleware(LoggingMiddleware)
        .with_state(conversation)
        .with_state(user)
        .on_turn_error(ApologyHandler::default())
        .reset_state_on_error(config.reset_state_on_error);

    let dispatcher = TurnDispatcher::new(Arc::new(adapter), Arc::new(bot))
        .with_queue_depth(config.queue_depth)
        .with_idle_timeout(config.idle_timeout);

    let user_id = std::env::var("USER").unwrap_or_else(|_| "local-user".to_string());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        // Failures were already answered by the error handler
        if let Err(e) = dispatcher.dispatch(console_activity(&user_id, line)).await {
            tracing::warn!(error = %e, "Turn failed");
        }
    }

    tracing::info!("stdin closed, exiting");
    Ok(())
}
