//! Waterfall dialogs: a fixed sequence of async steps
//!
//! Each step either waits (usually after starting a prompt), advances with
//! [`WaterfallStepContext::next`], or ends the dialog. Progress is kept in the
//! instance state, so a waterfall survives between turns.

use super::{Dialog, DialogContext, DialogInstance, DialogReason, DialogTurnResult};
use crate::error::{Error, Result};
use crate::turn::TurnContext;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

const STEP_INDEX: &str = "stepIndex";
const OPTIONS: &str = "options";
const VALUES: &str = "values";
const INSTANCE_ID: &str = "instanceId";

/// Future returned by a waterfall step
pub type StepFuture<'s> = BoxFuture<'s, Result<DialogTurnResult>>;

type Step = dyn for<'s, 'a> Fn(WaterfallStepContext<'s, 'a>) -> StepFuture<'s> + Send + Sync;

pub struct WaterfallDialog {
    id: String,
    steps: Vec<Box<Step>>,
}

impl WaterfallDialog {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step
    #[must_use]
    pub fn step<F>(mut self, step: F) -> Self
    where
        F: for<'s, 'a> Fn(WaterfallStepContext<'s, 'a>) -> StepFuture<'s> + Send + Sync + 'static,
    {
        self.steps.push(Box::new(step));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    async fn run_step(
        &self,
        dc: &mut DialogContext<'_>,
        index: usize,
        reason: DialogReason,
        result: Option<Value>,
    ) -> Result<DialogTurnResult> {
        let Some(step) = self.steps.get(index) else {
            // Past the last step: the last result becomes the dialog's result
            return dc.end_dialog(result).await;
        };

        let options = {
            let instance = dc.active_dialog_mut().ok_or_else(|| {
                Error::InvalidOperation(format!("waterfall '{}' is not on the stack", self.id))
            })?;
            instance.state.insert(STEP_INDEX.to_string(), json!(index));
            instance.state.get(OPTIONS).filter(|v| !v.is_null()).cloned()
        };

        tracing::debug!(dialog_id = %self.id, step = index, ?reason, "Running waterfall step");
        step(WaterfallStepContext {
            dc,
            waterfall: self,
            index,
            options,
            reason,
            result,
        })
        .await
    }
}

#[async_trait]
impl Dialog for WaterfallDialog {
    fn id(&self) -> &str {
        &self.id
    }

    async fn begin_dialog(
        &self,
        dc: &mut DialogContext<'_>,
        options: Option<Value>,
    ) -> Result<DialogTurnResult> {
        {
            let instance = dc.active_dialog_mut().ok_or_else(|| {
                Error::InvalidOperation(format!("waterfall '{}' is not on the stack", self.id))
            })?;
            if let Some(options) = options {
                instance.state.insert(OPTIONS.to_string(), options);
            }
            instance
                .state
                .insert(VALUES.to_string(), Value::Object(Map::new()));
            instance.state.insert(
                INSTANCE_ID.to_string(),
                json!(uuid::Uuid::new_v4().to_string()),
            );
        }
        self.run_step(dc, 0, DialogReason::BeginCalled, None).await
    }

    async fn continue_dialog(&self, dc: &mut DialogContext<'_>) -> Result<DialogTurnResult> {
        if !dc.activity().is_message() {
            return Ok(DialogTurnResult::waiting());
        }
        let text = dc.activity().text.clone().map(Value::String);
        self.resume_dialog(dc, DialogReason::ContinueCalled, text).await
    }

    async fn resume_dialog(
        &self,
        dc: &mut DialogContext<'_>,
        reason: DialogReason,
        result: Option<Value>,
    ) -> Result<DialogTurnResult> {
        let index = dc
            .active_dialog()
            .and_then(|instance| instance.state.get(STEP_INDEX))
            .and_then(Value::as_u64)
            .and_then(|i| usize::try_from(i).ok())
            .unwrap_or_default();
        self.run_step(dc, index + 1, reason, result).await
    }

    async fn end_dialog(
        &self,
        _dc: &mut DialogContext<'_>,
        instance: &mut DialogInstance,
        reason: DialogReason,
    ) -> Result<()> {
        let step = instance.state.get(STEP_INDEX).and_then(Value::as_u64);
        tracing::debug!(dialog_id = %self.id, ?step, ?reason, "Waterfall ended");
        Ok(())
    }

    fn class_memory(&self) -> Map<String, Value> {
        let mut memory = Map::new();
        memory.insert("id".to_string(), json!(self.id));
        memory.insert("steps".to_string(), json!(self.steps.len()));
        memory
    }
}

/// Handle passed to a waterfall step
pub struct WaterfallStepContext<'s, 'a> {
    dc: &'s mut DialogContext<'a>,
    waterfall: &'s WaterfallDialog,
    index: usize,
    options: Option<Value>,
    reason: DialogReason,
    result: Option<Value>,
}

impl<'s, 'a> WaterfallStepContext<'s, 'a> {
    /// Zero-based step index
    pub fn index(&self) -> usize {
        self.index
    }

    /// Options the waterfall was started with
    pub fn options(&self) -> Option<&Value> {
        self.options.as_ref()
    }

    pub fn reason(&self) -> DialogReason {
        self.reason
    }

    /// Result of the previous step, prompt or child dialog
    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn result_str(&self) -> Option<&str> {
        self.result.as_ref().and_then(Value::as_str)
    }

    pub fn context(&mut self) -> &mut DialogContext<'a> {
        self.dc
    }

    pub fn turn(&mut self) -> &mut TurnContext {
        self.dc.turn_mut()
    }

    /// Values collected by earlier steps of this run
    pub fn values(&self) -> Option<&Map<String, Value>> {
        self.dc
            .active_dialog()
            .and_then(|instance| instance.state.get(VALUES))
            .and_then(Value::as_object)
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values().and_then(|values| values.get(key))
    }

    pub fn set_value(&mut self, key: impl Into<String>, value: Value) -> Result<()> {
        let instance = self.dc.active_dialog_mut().ok_or_else(|| {
            Error::InvalidOperation("waterfall step has no active dialog".to_string())
        })?;
        let values = instance
            .state
            .entry(VALUES)
            .or_insert_with(|| Value::Object(Map::new()));
        match values {
            Value::Object(values) => {
                values.insert(key.into(), value);
                Ok(())
            }
            _ => Err(Error::InvalidOperation(
                "waterfall values are not an object".to_string(),
            )),
        }
    }

    /// Skip to the next step, handing it `result`
    pub async fn next(self, result: Option<Value>) -> Result<DialogTurnResult> {
        self.waterfall
            .resume_dialog(self.dc, DialogReason::NextCalled, result)
            .await
    }

    pub async fn begin_dialog(
        self,
        dialog_id: &str,
        options: Option<Value>,
    ) -> Result<DialogTurnResult> {
        self.dc.begin_dialog(dialog_id, options).await
    }

    /// Start a prompt dialog with the given text
    pub async fn prompt(self, dialog_id: &str, text: &str) -> Result<DialogTurnResult> {
        self.dc
            .begin_dialog(dialog_id, Some(json!({ "prompt": text })))
            .await
    }

    pub async fn end_dialog(self, result: Option<Value>) -> Result<DialogTurnResult> {
        self.dc.end_dialog(result).await
    }

    pub async fn replace_dialog(
        self,
        dialog_id: &str,
        options: Option<Value>,
    ) -> Result<DialogTurnResult> {
        self.dc.replace_dialog(dialog_id, options).await
    }

    pub async fn cancel_all_dialogs(self) -> Result<DialogTurnResult> {
        self.dc.cancel_all_dialogs().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialogs::{DialogSet, DialogState, DialogTurnStatus, TextPrompt};
    use crate::testing::activity;

    fn greet() -> WaterfallDialog {
        WaterfallDialog::new("greet")
            .step(|step| Box::pin(async move { step.prompt("text", "What's your name?").await }))
            .step(|mut step| {
                Box::pin(async move {
                    let name = step.result_str().unwrap_or("friend").to_string();
                    step.set_value("name", json!(name))?;
                    step.turn().send_text(format!("Hello, {name}!"));
                    step.end_dialog(Some(json!(name))).await
                })
            })
    }

    fn set() -> DialogSet {
        let mut set = DialogSet::new();
        set.add(greet()).unwrap();
        set.add(TextPrompt::new("text")).unwrap();
        set
    }

    fn texts(turn: &mut TurnContext) -> Vec<String> {
        turn.drain_outbound()
            .into_iter()
            .filter_map(|a| a.text)
            .collect()
    }

    #[tokio::test]
    async fn test_greet_across_two_turns() {
        let set = set();
        let mut state = DialogState::default();

        let mut first = TurnContext::new(activity("hi"));
        let result = {
            let mut dc = DialogContext::new(&set, &mut first, &mut state);
            dc.begin_dialog("greet", None).await.unwrap()
        };
        assert_eq!(result.status, DialogTurnStatus::Waiting);
        assert_eq!(texts(&mut first), vec!["What's your name?"]);
        let ids: Vec<_> = state.dialog_stack.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["greet", "text"]);

        // The stack survives a serialization round trip between turns
        let mut state: DialogState =
            serde_json::from_value(serde_json::to_value(&state).unwrap()).unwrap();

        let mut second = TurnContext::new(activity("Bob"));
        let result = {
            let mut dc = DialogContext::new(&set, &mut second, &mut state);
            dc.continue_dialog().await.unwrap()
        };
        assert_eq!(result.status, DialogTurnStatus::Complete);
        assert_eq!(result.result, Some(json!("Bob")));
        assert_eq!(texts(&mut second), vec!["Hello, Bob!"]);
        assert!(state.dialog_stack.is_empty());
    }

    #[tokio::test]
    async fn test_next_chains_steps_and_values() {
        let waterfall = WaterfallDialog::new("chain")
            .step(|mut step| {
                Box::pin(async move {
                    step.set_value("a", json!(1))?;
                    step.next(Some(json!("from-0"))).await
                })
            })
            .step(|mut step| {
                Box::pin(async move {
                    assert_eq!(step.index(), 1);
                    assert_eq!(step.reason(), DialogReason::NextCalled);
                    let carried = step.result().cloned();
                    let a = step.value("a").cloned();
                    step.turn().send_text(format!(
                        "{} {}",
                        carried.unwrap_or_default(),
                        a.unwrap_or_default()
                    ));
                    step.next(None).await
                })
            });
        let mut set = DialogSet::new();
        set.add(waterfall).unwrap();

        let mut turn = TurnContext::new(activity("go"));
        let mut state = DialogState::default();
        let mut dc = DialogContext::new(&set, &mut turn, &mut state);
        let result = dc.begin_dialog("chain", Some(json!({"x": 1}))).await.unwrap();
        drop(dc);

        assert_eq!(result.status, DialogTurnStatus::Complete);
        assert_eq!(
            texts(&mut turn),
            vec![r#""from-0" 1"#]
        );
    }

    #[tokio::test]
    async fn test_options_reach_steps() {
        let waterfall = WaterfallDialog::new("opts").step(|step| {
            Box::pin(async move {
                let who = step.options().and_then(|o| o["who"].as_str()).map(String::from);
                step.end_dialog(who.map(Value::String)).await
            })
        });
        let mut set = DialogSet::new();
        set.add(waterfall).unwrap();

        let mut turn = TurnContext::new(activity("go"));
        let mut state = DialogState::default();
        let mut dc = DialogContext::new(&set, &mut turn, &mut state);
        let result = dc.begin_dialog("opts", Some(json!({"who": "Ada"}))).await.unwrap();
        assert_eq!(result.result, Some(json!("Ada")));
    }

    #[tokio::test]
    async fn test_non_message_activity_keeps_waiting() {
        let waterfall = WaterfallDialog::new("wait")
            .step(|_step| Box::pin(async move { Ok(DialogTurnResult::waiting()) }))
            .step(|step| Box::pin(async move { step.end_dialog(None).await }));
        let mut set = DialogSet::new();
        set.add(waterfall).unwrap();
        let mut state = DialogState::default();

        let mut turn = TurnContext::new(activity("start"));
        DialogContext::new(&set, &mut turn, &mut state)
            .begin_dialog("wait", None)
            .await
            .unwrap();

        let mut typing = TurnContext::new(crate::activity::Activity {
            activity_type: crate::activity::ActivityType::Typing,
            text: None,
            ..activity("")
        });
        let result = DialogContext::new(&set, &mut typing, &mut state)
            .continue_dialog()
            .await
            .unwrap();
        assert!(result.is_waiting());
        assert_eq!(state.dialog_stack.len(), 1);
    }

    #[tokio::test]
    async fn test_step_error_propagates() {
        let waterfall = WaterfallDialog::new("bad").step(|_step| {
            Box::pin(async move { Err(Error::step("bad", "boom")) })
        });
        let mut set = DialogSet::new();
        set.add(waterfall).unwrap();

        let mut turn = TurnContext::new(activity("go"));
        let mut state = DialogState::default();
        let err = DialogContext::new(&set, &mut turn, &mut state)
            .begin_dialog("bad", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Step { .. }));
    }
}
