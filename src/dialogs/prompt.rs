use super::{Dialog, DialogContext, DialogReason, DialogTurnResult};
use crate::activity::Activity;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

const OPTIONS: &str = "options";
const ATTEMPTS: &str = "attempts";

/// Options accepted by prompts. A bare JSON string is taken as `prompt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PromptOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Sent instead of `prompt` after an unusable reply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_prompt: Option<String>,
}

impl PromptOptions {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            retry_prompt: None,
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry_prompt: impl Into<String>) -> Self {
        self.retry_prompt = Some(retry_prompt.into());
        self
    }

    fn from_value(value: Option<Value>) -> Result<Self> {
        match value {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(Value::String(prompt)) => Ok(Self::new(prompt)),
            Some(other) => Ok(serde_json::from_value(other)?),
        }
    }
}

/// Asks for free text and ends with the (trimmed) reply.
///
/// Empty replies re-send the retry prompt (or the prompt) and keep waiting;
/// non-message activities are ignored.
pub struct TextPrompt {
    id: String,
}

impl TextPrompt {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    fn options(&self, dc: &DialogContext<'_>) -> Result<PromptOptions> {
        let value = dc
            .active_dialog()
            .ok_or_else(|| {
                Error::InvalidOperation(format!("prompt '{}' is not on the stack", self.id))
            })?
            .state
            .get(OPTIONS)
            .cloned();
        PromptOptions::from_value(value)
    }

    fn send(dc: &mut DialogContext<'_>, text: Option<&str>) {
        if let Some(text) = text {
            dc.turn_mut().send_activity(Activity::message(text));
        }
    }
}

#[async_trait]
impl Dialog for TextPrompt {
    fn id(&self) -> &str {
        &self.id
    }

    async fn begin_dialog(
        &self,
        dc: &mut DialogContext<'_>,
        options: Option<Value>,
    ) -> Result<DialogTurnResult> {
        let options = PromptOptions::from_value(options)?;
        let prompt = options.prompt.clone();
        if let Some(instance) = dc.active_dialog_mut() {
            instance
                .state
                .insert(OPTIONS.to_string(), serde_json::to_value(&options)?);
            instance.state.insert(ATTEMPTS.to_string(), json!(0));
        }
        Self::send(dc, prompt.as_deref());
        Ok(DialogTurnResult::waiting())
    }

    async fn continue_dialog(&self, dc: &mut DialogContext<'_>) -> Result<DialogTurnResult> {
        if !dc.activity().is_message() {
            return Ok(DialogTurnResult::waiting());
        }

        let reply = dc
            .activity()
            .text
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(String::from);
        if let Some(reply) = reply {
            return dc.end_dialog(Some(Value::String(reply))).await;
        }

        let options = self.options(dc)?;
        if let Some(instance) = dc.active_dialog_mut() {
            let attempts = instance
                .state
                .get(ATTEMPTS)
                .and_then(Value::as_u64)
                .unwrap_or_default();
            instance.state.insert(ATTEMPTS.to_string(), json!(attempts + 1));
        }
        tracing::debug!(dialog_id = %self.id, "Empty reply, re-prompting");
        Self::send(dc, options.retry_prompt.as_deref().or(options.prompt.as_deref()));
        Ok(DialogTurnResult::waiting())
    }

    async fn resume_dialog(
        &self,
        dc: &mut DialogContext<'_>,
        _reason: DialogReason,
        _result: Option<Value>,
    ) -> Result<DialogTurnResult> {
        // A dialog pushed over the prompt ended; ask again
        self.reprompt_dialog(dc).await?;
        Ok(DialogTurnResult::waiting())
    }

    async fn reprompt_dialog(&self, dc: &mut DialogContext<'_>) -> Result<()> {
        let options = self.options(dc)?;
        Self::send(dc, options.prompt.as_deref());
        Ok(())
    }

    fn class_memory(&self) -> Map<String, Value> {
        let mut memory = Map::new();
        memory.insert("id".to_string(), json!(self.id));
        memory.insert("kind".to_string(), json!("text"));
        memory
    }
}
