//! Test doubles and builders
//!
//! Shared by the unit tests of every module; nothing here does real I/O.

use crate::activity::{Activity, ChannelAccount, ConversationAccount};
use crate::adapter::{Bot, ChannelConnector};
use crate::dialogs::{Dialog, DialogContext, DialogInstance, DialogReason, DialogTurnResult};
use crate::error::{Error, Result};
use crate::turn::TurnContext;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Activities
// ============================================================================

/// Message from `user-1` to `bot` in conversation `conv-1` on channel `test`
pub fn activity(text: &str) -> Activity {
    activity_in("conv-1", text)
}

pub fn activity_in(conversation: &str, text: &str) -> Activity {
    Activity {
        id: Some(uuid::Uuid::new_v4().to_string()),
        channel_id: "test".to_string(),
        from: Some(ChannelAccount::new("user-1")),
        recipient: Some(ChannelAccount::new("bot")),
        conversation: Some(ConversationAccount::new(conversation)),
        ..Activity::message(text)
    }
}

// ============================================================================
// Event log
// ============================================================================

/// Shared, ordered record of what test doubles observed
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

// ============================================================================
// Mock connector
// ============================================================================

/// Connector that records everything it is asked to send
#[derive(Default)]
pub struct RecordingConnector {
    sent: Mutex<Vec<Activity>>,
}

impl RecordingConnector {
    pub fn sent(&self) -> Vec<Activity> {
        self.sent.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent().into_iter().filter_map(|a| a.text).collect()
    }
}

#[async_trait]
impl ChannelConnector for RecordingConnector {
    async fn send_activities(&self, activities: &[Activity]) -> Result<()> {
        self.sent.lock().unwrap().extend_from_slice(activities);
        Ok(())
    }
}

// ============================================================================
// Mock bots
// ============================================================================

/// Bot whose turn always fails
pub struct FailingBot;

#[async_trait]
impl Bot for FailingBot {
    async fn on_turn(&self, _turn: &mut TurnContext) -> Result<()> {
        Err(Error::step("failing-bot", "boom"))
    }
}

/// Bot that echoes message text back, logging `start:` and `end:` around
/// a delay
pub struct EchoBot {
    log: EventLog,
    delay: Duration,
}

impl EchoBot {
    pub fn with_delay(log: &EventLog, delay: Duration) -> Self {
        Self {
            log: log.clone(),
            delay,
        }
    }
}

#[async_trait]
impl Bot for EchoBot {
    async fn on_turn(&self, turn: &mut TurnContext) -> Result<()> {
        let text = turn.activity().text.clone().unwrap_or_default();
        let conversation = turn
            .activity()
            .conversation_id()
            .unwrap_or_default()
            .to_string();
        self.log.push(format!("start:{conversation}:{text}"));
        tokio::time::sleep(self.delay).await;
        turn.send_text(format!("echo:{text}"));
        self.log.push(format!("end:{conversation}:{text}"));
        Ok(())
    }
}

// ============================================================================
// Mock dialog
// ============================================================================

enum OnBegin {
    Wait,
    End(Value),
    BeginChild(String),
}

/// Dialog that logs every lifecycle call as `action:id[:detail]`
pub struct RecordingDialog {
    id: String,
    on_begin: OnBegin,
    log: EventLog,
    fail_on_end: bool,
}

impl RecordingDialog {
    /// Waits on begin, ends with the message text on continue
    pub fn waiting(id: &str) -> Self {
        Self::waiting_logged(id, &EventLog::default())
    }

    pub fn waiting_logged(id: &str, log: &EventLog) -> Self {
        Self::build(id, OnBegin::Wait, log)
    }

    /// Ends immediately with `result`
    pub fn ends_with(id: &str, result: Value, log: &EventLog) -> Self {
        Self::build(id, OnBegin::End(result), log)
    }

    /// Begins `child` and ends with whatever the child returns
    pub fn begins_child(id: &str, child: &str, log: &EventLog) -> Self {
        Self::build(id, OnBegin::BeginChild(child.to_string()), log)
    }

    /// Logs the end call, then fails it
    #[must_use]
    pub fn failing_end(mut self) -> Self {
        self.fail_on_end = true;
        self
    }

    fn build(id: &str, on_begin: OnBegin, log: &EventLog) -> Self {
        Self {
            id: id.to_string(),
            on_begin,
            log: log.clone(),
            fail_on_end: false,
        }
    }
}

#[async_trait]
impl Dialog for RecordingDialog {
    fn id(&self) -> &str {
        &self.id
    }

    async fn begin_dialog(
        &self,
        dc: &mut DialogContext<'_>,
        _options: Option<Value>,
    ) -> Result<DialogTurnResult> {
        self.log.push(format!("begin:{}", self.id));
        match &self.on_begin {
            OnBegin::Wait => Ok(DialogTurnResult::waiting()),
            OnBegin::End(result) => dc.end_dialog(Some(result.clone())).await,
            OnBegin::BeginChild(child) => dc.begin_dialog(child, None).await,
        }
    }

    async fn continue_dialog(&self, dc: &mut DialogContext<'_>) -> Result<DialogTurnResult> {
        self.log.push(format!("continue:{}", self.id));
        let text = dc.activity().text.clone().map(Value::String);
        dc.end_dialog(text).await
    }

    async fn resume_dialog(
        &self,
        dc: &mut DialogContext<'_>,
        reason: DialogReason,
        result: Option<Value>,
    ) -> Result<DialogTurnResult> {
        let shown = result.clone().unwrap_or_default();
        self.log
            .push(format!("resume:{}:{reason:?}:{shown}", self.id));
        dc.end_dialog(result).await
    }

    async fn end_dialog(
        &self,
        _dc: &mut DialogContext<'_>,
        instance: &mut DialogInstance,
        reason: DialogReason,
    ) -> Result<()> {
        self.log.push(format!("end:{}:{reason:?}", instance.id));
        if self.fail_on_end {
            return Err(Error::step(&self.id, "cleanup failed"));
        }
        Ok(())
    }
}
