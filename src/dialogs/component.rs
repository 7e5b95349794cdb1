use super::{
    Dialog, DialogContext, DialogInstance, DialogReason, DialogSet, DialogState, DialogTurnResult,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};

/// Key of the inner stack inside the component's instance state
const INNER_STATE: &str = "dialogs";

/// A dialog that runs its own inner stack of dialogs.
///
/// The inner stack is persisted inside the component's instance state. The
/// component ends, returning the inner result, as soon as the inner stack
/// stops waiting.
pub struct ComponentDialog {
    id: String,
    dialogs: DialogSet,
    initial_dialog_id: Option<String>,
}

impl ComponentDialog {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            dialogs: DialogSet::new(),
            initial_dialog_id: None,
        }
    }

    /// Add an inner dialog. The first one added is the initial dialog unless
    /// [`with_initial_dialog`](Self::with_initial_dialog) says otherwise.
    pub fn add_dialog(mut self, dialog: impl Dialog + 'static) -> Result<Self> {
        let id = dialog.id().to_string();
        self.dialogs.add(dialog)?;
        self.initial_dialog_id.get_or_insert(id);
        Ok(self)
    }

    #[must_use]
    pub fn with_initial_dialog(mut self, id: impl Into<String>) -> Self {
        self.initial_dialog_id = Some(id.into());
        self
    }

    pub fn dialogs(&self) -> &DialogSet {
        &self.dialogs
    }

    fn take_inner(state: &mut Map<String, Value>) -> Result<DialogState> {
        match state.remove(INNER_STATE) {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(DialogState::default()),
        }
    }

    fn take_active_inner(&self, dc: &mut DialogContext<'_>) -> Result<DialogState> {
        let instance = dc.active_dialog_mut().ok_or_else(|| self.not_on_stack())?;
        Self::take_inner(&mut instance.state)
    }

    fn store_inner(&self, dc: &mut DialogContext<'_>, inner: &DialogState) -> Result<()> {
        let value = serde_json::to_value(inner)?;
        let instance = dc.active_dialog_mut().ok_or_else(|| self.not_on_stack())?;
        instance.state.insert(INNER_STATE.to_string(), value);
        Ok(())
    }

    fn not_on_stack(&self) -> Error {
        Error::InvalidOperation(format!("component '{}' is not on the stack", self.id))
    }

    /// End the component unless the inner stack is still waiting
    async fn finish(
        &self,
        dc: &mut DialogContext<'_>,
        inner: &DialogState,
        turn_result: Result<DialogTurnResult>,
    ) -> Result<DialogTurnResult> {
        // Persist the inner stack even when the inner turn failed
        self.store_inner(dc, inner)?;
        let turn_result = turn_result?;
        if turn_result.is_waiting() {
            return Ok(turn_result);
        }
        tracing::debug!(dialog_id = %self.id, status = ?turn_result.status, "Inner stack finished");
        dc.end_dialog(turn_result.result).await
    }
}

#[async_trait]
impl Dialog for ComponentDialog {
    fn id(&self) -> &str {
        &self.id
    }

    async fn begin_dialog(
        &self,
        dc: &mut DialogContext<'_>,
        options: Option<Value>,
    ) -> Result<DialogTurnResult> {
        let initial = self.initial_dialog_id.as_deref().ok_or_else(|| {
            Error::InvalidOperation(format!("component '{}' has no dialogs", self.id))
        })?;

        let mut inner = DialogState::default();
        let turn_result = dc
            .child(&self.dialogs, &mut inner.dialog_stack)
            .begin_dialog(initial, options)
            .await;
        self.finish(dc, &inner, turn_result).await
    }

    async fn continue_dialog(&self, dc: &mut DialogContext<'_>) -> Result<DialogTurnResult> {
        let mut inner = self.take_active_inner(dc)?;
        let turn_result = dc
            .child(&self.dialogs, &mut inner.dialog_stack)
            .continue_dialog()
            .await;
        self.finish(dc, &inner, turn_result).await
    }

    /// Something pushed on top of the component has ended. The component
    /// itself is not done, so re-prompt the inner stack and keep waiting.
    async fn resume_dialog(
        &self,
        dc: &mut DialogContext<'_>,
        _reason: DialogReason,
        _result: Option<Value>,
    ) -> Result<DialogTurnResult> {
        self.reprompt_dialog(dc).await?;
        Ok(DialogTurnResult::waiting())
    }

    async fn reprompt_dialog(&self, dc: &mut DialogContext<'_>) -> Result<()> {
        let mut inner = self.take_active_inner(dc)?;
        let reprompted = dc
            .child(&self.dialogs, &mut inner.dialog_stack)
            .reprompt_dialog()
            .await;
        self.store_inner(dc, &inner)?;
        reprompted
    }

    async fn end_dialog(
        &self,
        dc: &mut DialogContext<'_>,
        instance: &mut DialogInstance,
        reason: DialogReason,
    ) -> Result<()> {
        if reason != DialogReason::CancelCalled {
            return Ok(());
        }
        let mut inner = Self::take_inner(&mut instance.state)?;
        dc.detached_child(&self.dialogs, &mut inner.dialog_stack)
            .cancel_all_dialogs()
            .await?;
        Ok(())
    }

    fn is_container(&self) -> bool {
        true
    }

    fn class_memory(&self) -> Map<String, Value> {
        let mut memory = Map::new();
        memory.insert("id".to_string(), json!(self.id));
        memory.insert("initialDialogId".to_string(), json!(self.initial_dialog_id));
        memory.insert("dialogCount".to_string(), json!(self.dialogs.len()));
        memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialogs::{DialogTurnStatus, TextPrompt, WaterfallDialog};
    use crate::testing::{activity, EventLog, RecordingDialog};
    use crate::turn::TurnContext;

    fn profile_component() -> ComponentDialog {
        let waterfall = WaterfallDialog::new("ask")
            .step(|step| Box::pin(async move { step.prompt("text", "Name?").await }))
            .step(|mut step| {
                Box::pin(async move {
                    let name = step.result().cloned();
                    step.context().set_value("dialog.name", name.clone().unwrap_or_default())?;
                    step.end_dialog(name).await
                })
            });
        ComponentDialog::new("profile")
            .add_dialog(waterfall)
            .unwrap()
            .add_dialog(TextPrompt::new("text"))
            .unwrap()
    }

    #[tokio::test]
    async fn test_inner_stack_persists_inside_component_state() {
        let mut set = DialogSet::new();
        set.add(profile_component()).unwrap();
        let mut state = DialogState::default();

        let mut turn = TurnContext::new(activity("start"));
        let result = DialogContext::new(&set, &mut turn, &mut state)
            .begin_dialog("profile", None)
            .await
            .unwrap();
        assert!(result.is_waiting());

        // Only the component is on the outer stack
        assert_eq!(state.dialog_stack.len(), 1);
        let inner: DialogState =
            serde_json::from_value(state.dialog_stack[0].state[INNER_STATE].clone()).unwrap();
        let ids: Vec<_> = inner.dialog_stack.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["ask", "text"]);

        let mut turn = TurnContext::new(activity("Ada"));
        let result = DialogContext::new(&set, &mut turn, &mut state)
            .continue_dialog()
            .await
            .unwrap();
        assert_eq!(result.status, DialogTurnStatus::Complete);
        assert_eq!(result.result, Some(json!("Ada")));
        assert!(state.dialog_stack.is_empty());
    }

    #[tokio::test]
    async fn test_component_result_resumes_outer_parent() {
        let log = EventLog::default();
        let mut set = DialogSet::new();
        set.add(RecordingDialog::begins_child("outer", "profile", &log))
            .unwrap();
        set.add(profile_component()).unwrap();
        let mut state = DialogState::default();

        let mut turn = TurnContext::new(activity("start"));
        DialogContext::new(&set, &mut turn, &mut state)
            .begin_dialog("outer", None)
            .await
            .unwrap();
        let mut turn = TurnContext::new(activity("Ada"));
        DialogContext::new(&set, &mut turn, &mut state)
            .continue_dialog()
            .await
            .unwrap();

        assert!(log
            .events()
            .contains(&"resume:outer:EndOfChildDialog:\"Ada\"".to_string()));
    }

    #[tokio::test]
    async fn test_cancel_reaches_inner_dialogs() {
        let log = EventLog::default();
        let component = ComponentDialog::new("comp")
            .add_dialog(RecordingDialog::begins_child("inner-a", "inner-b", &log))
            .unwrap()
            .add_dialog(RecordingDialog::waiting_logged("inner-b", &log))
            .unwrap();
        let mut set = DialogSet::new();
        set.add(component).unwrap();

        let mut turn = TurnContext::new(activity("start"));
        let mut state = DialogState::default();
        let mut dc = DialogContext::new(&set, &mut turn, &mut state);
        dc.begin_dialog("comp", None).await.unwrap();
        dc.cancel_all_dialogs().await.unwrap();
        assert!(dc.stack().is_empty());

        let ends: Vec<_> = log
            .events()
            .into_iter()
            .filter(|e| e.starts_with("end:"))
            .collect();
        assert_eq!(ends, vec!["end:inner-b:CancelCalled", "end:inner-a:CancelCalled"]);
    }

    #[tokio::test]
    async fn test_empty_component_cannot_begin() {
        let mut set = DialogSet::new();
        set.add(ComponentDialog::new("hollow")).unwrap();
        let mut turn = TurnContext::new(activity("start"));
        let mut state = DialogState::default();
        let err = DialogContext::new(&set, &mut turn, &mut state)
            .begin_dialog("hollow", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn test_inner_dialogs_can_reach_outer_set() {
        let mut set = DialogSet::new();
        set.add(TextPrompt::new("shared-prompt")).unwrap();
        let waterfall = WaterfallDialog::new("uses-outer")
            .step(|step| Box::pin(async move { step.prompt("shared-prompt", "Color?").await }))
            .step(|step| Box::pin(async move {
                let color = step.result().cloned();
                step.end_dialog(color).await
            }));
        set.add(ComponentDialog::new("comp").add_dialog(waterfall).unwrap())
            .unwrap();

        let mut state = DialogState::default();
        let mut turn = TurnContext::new(activity("start"));
        DialogContext::new(&set, &mut turn, &mut state)
            .begin_dialog("comp", None)
            .await
            .unwrap();
        let mut turn = TurnContext::new(activity("blue"));
        let result = DialogContext::new(&set, &mut turn, &mut state)
            .continue_dialog()
            .await
            .unwrap();
        assert_eq!(result.result, Some(json!("blue")));
    }
}
