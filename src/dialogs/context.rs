use super::{
    DebugEvent, Dialog, DialogInstance, DialogReason, DialogServices, DialogSet, DialogState,
    DialogTurnResult,
};
use crate::activity::Activity;
use crate::error::{Error, Result};
use crate::turn::TurnContext;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Drives one dialog stack for the current turn.
///
/// Dialog lookup walks from this context's set outwards through every
/// enclosing context's set. Child contexts (for a component's inner stack)
/// also see the state of the dialog that owns them.
pub struct DialogContext<'a> {
    turn: &'a mut TurnContext,
    /// Innermost set first
    dialogs: Vec<&'a DialogSet>,
    stack: &'a mut Vec<DialogInstance>,
    parent_state: Option<&'a mut Map<String, Value>>,
    parent_id: Option<String>,
    services: Arc<DialogServices>,
}

impl<'a> DialogContext<'a> {
    /// Context over a persisted stack with the standard memory scopes
    pub fn new(dialogs: &'a DialogSet, turn: &'a mut TurnContext, state: &'a mut DialogState) -> Self {
        Self::with_services(dialogs, turn, state, Arc::new(DialogServices::default()))
    }

    pub fn with_services(
        dialogs: &'a DialogSet,
        turn: &'a mut TurnContext,
        state: &'a mut DialogState,
        services: Arc<DialogServices>,
    ) -> Self {
        Self {
            turn,
            dialogs: vec![dialogs],
            stack: &mut state.dialog_stack,
            parent_state: None,
            parent_id: None,
            services,
        }
    }

    /// Context for an inner stack owned by this context's active dialog
    pub fn child<'c>(
        &'c mut self,
        dialogs: &'c DialogSet,
        stack: &'c mut Vec<DialogInstance>,
    ) -> DialogContext<'c> {
        let parent_id = self.stack.last().map(|i| i.id.clone());
        DialogContext {
            turn: &mut *self.turn,
            dialogs: chain(dialogs, &self.dialogs),
            stack,
            parent_state: self.stack.last_mut().map(|i| &mut i.state),
            parent_id,
            services: Arc::clone(&self.services),
        }
    }

    /// Context for an inner stack whose owner is no longer on this stack
    /// (used while the owner is being ended)
    pub fn detached_child<'c>(
        &'c mut self,
        dialogs: &'c DialogSet,
        stack: &'c mut Vec<DialogInstance>,
    ) -> DialogContext<'c> {
        DialogContext {
            turn: &mut *self.turn,
            dialogs: chain(dialogs, &self.dialogs),
            stack,
            parent_state: None,
            parent_id: None,
            services: Arc::clone(&self.services),
        }
    }

    pub fn turn(&self) -> &TurnContext {
        self.turn
    }

    pub fn turn_mut(&mut self) -> &mut TurnContext {
        self.turn
    }

    pub fn activity(&self) -> &Activity {
        self.turn.activity()
    }

    pub fn services(&self) -> &DialogServices {
        &self.services
    }

    /// Stack, bottom first
    pub fn stack(&self) -> &[DialogInstance] {
        self.stack
    }

    pub fn active_dialog(&self) -> Option<&DialogInstance> {
        self.stack.last()
    }

    pub fn active_dialog_mut(&mut self) -> Option<&mut DialogInstance> {
        self.stack.last_mut()
    }

    /// State of the dialog that owns this (child) context
    pub fn parent_state(&self) -> Option<&Map<String, Value>> {
        self.parent_state.as_deref()
    }

    pub fn parent_state_mut(&mut self) -> Option<&mut Map<String, Value>> {
        self.parent_state.as_deref_mut()
    }

    pub fn parent_dialog_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub(crate) fn active_is_container(&self) -> bool {
        self.active_dialog()
            .and_then(|instance| self.find_dialog(&instance.id))
            .is_some_and(|dialog| dialog.is_container())
    }

    /// Find a dialog in this context's set or any enclosing one
    pub fn find_dialog(&self, id: &str) -> Option<&'a dyn Dialog> {
        self.dialogs.iter().copied().find_map(|set| set.find(id))
    }

    fn require_dialog(&self, id: &str) -> Result<&'a dyn Dialog> {
        self.find_dialog(id)
            .ok_or_else(|| Error::DialogNotFound(id.to_string()))
    }

    fn debug(&self, dialog_id: &str, action: &'static str) {
        self.services.debugger().on_event(&DebugEvent {
            dialog_id,
            action,
            depth: self.stack.len(),
            conversation_id: self.turn.activity().conversation_id(),
        });
    }

    /// Push `dialog_id` and start it. Fails with `DialogNotFound`, leaving the
    /// stack untouched, when no reachable set has the id.
    pub async fn begin_dialog(
        &mut self,
        dialog_id: &str,
        options: Option<Value>,
    ) -> Result<DialogTurnResult> {
        self.turn.ensure_active()?;
        let dialog = self.require_dialog(dialog_id)?;

        self.stack.push(DialogInstance::new(dialog_id));
        tracing::debug!(dialog_id, depth = self.stack.len(), "Beginning dialog");
        self.debug(dialog_id, "begin");
        dialog.begin_dialog(self, options).await
    }

    /// Route the current activity to the active dialog
    pub async fn continue_dialog(&mut self) -> Result<DialogTurnResult> {
        self.turn.ensure_active()?;
        let Some(active) = self.stack.last() else {
            return Ok(DialogTurnResult::empty());
        };
        let id = active.id.clone();
        let dialog = self.require_dialog(&id)?;

        self.debug(&id, "continue");
        dialog.continue_dialog(self).await
    }

    /// Pop the active dialog and resume its parent with `result`. With no
    /// parent left the stack is empty and the result is `Complete`.
    pub async fn end_dialog(&mut self, result: Option<Value>) -> Result<DialogTurnResult> {
        self.turn.ensure_active()?;
        self.end_active_dialog(DialogReason::EndCalled).await?;

        let Some(parent) = self.stack.last() else {
            return Ok(DialogTurnResult::complete(result));
        };
        let id = parent.id.clone();
        let dialog = self.require_dialog(&id)?;

        self.debug(&id, "resume");
        dialog
            .resume_dialog(self, DialogReason::EndOfChildDialog, result)
            .await
    }

    /// End every dialog on the stack, innermost first. Always empties the
    /// stack; a failing cleanup hook is logged and the rest still run.
    pub async fn cancel_all_dialogs(&mut self) -> Result<DialogTurnResult> {
        self.cancel_all_dialogs_with_event(None, None).await
    }

    /// Like [`cancel_all_dialogs`](Self::cancel_all_dialogs), recording the
    /// cancellation event under `turn.dialogEvent` so cleanup hooks can see
    /// why the stack is being torn down.
    pub async fn cancel_all_dialogs_with_event(
        &mut self,
        event_name: Option<&str>,
        event_value: Option<Value>,
    ) -> Result<DialogTurnResult> {
        if let Some(name) = event_name {
            self.turn.memory_mut().insert(
                "dialogEvent".to_string(),
                json!({ "name": name, "value": event_value }),
            );
        }

        if !self.stack.is_empty() {
            tracing::debug!(depth = self.stack.len(), "Cancelling all dialogs");
        }
        while let Some(active) = self.stack.last() {
            let id = active.id.clone();
            if let Err(e) = self.end_active_dialog(DialogReason::CancelCalled).await {
                tracing::warn!(dialog = %id, error = %e, "Dialog cleanup failed during cancel");
            }
        }
        Ok(DialogTurnResult::cancelled())
    }

    /// End the active dialog and begin `dialog_id` in its place, without
    /// resuming the parent in between
    pub async fn replace_dialog(
        &mut self,
        dialog_id: &str,
        options: Option<Value>,
    ) -> Result<DialogTurnResult> {
        self.turn.ensure_active()?;
        self.require_dialog(dialog_id)?;
        self.end_active_dialog(DialogReason::ReplaceCalled).await?;
        self.begin_dialog(dialog_id, options).await
    }

    /// Ask the active dialog to re-send its prompt
    pub async fn reprompt_dialog(&mut self) -> Result<()> {
        self.turn.ensure_active()?;
        let Some(active) = self.stack.last() else {
            return Ok(());
        };
        let id = active.id.clone();
        let dialog = self.require_dialog(&id)?;

        self.debug(&id, "reprompt");
        dialog.reprompt_dialog(self).await
    }

    async fn end_active_dialog(&mut self, reason: DialogReason) -> Result<()> {
        let Some(mut instance) = self.stack.pop() else {
            return Ok(());
        };
        tracing::debug!(dialog_id = %instance.id, ?reason, depth = self.stack.len(), "Ending dialog");
        self.debug(
            &instance.id,
            if reason == DialogReason::CancelCalled {
                "cancel"
            } else {
                "end"
            },
        );
        if let Some(dialog) = self.find_dialog(&instance.id) {
            dialog.end_dialog(self, &mut instance, reason).await?;
        }
        Ok(())
    }

    /// Read a memory path. Unset data reads as `None`; only a malformed path
    /// or an unknown scope is an error.
    pub fn get_value(&self, path: &str) -> Result<Option<Value>> {
        let resolved = self.services.scopes().resolve(path)?;
        let Some(memory) = resolved.scope.memory(self) else {
            return Ok(None);
        };
        if resolved.path.is_empty() {
            return Ok(Some(Value::Object(memory.into_owned())));
        }
        Ok(resolved.path.get(&memory).cloned())
    }

    /// Read a memory path and deserialize it
    pub fn get_value_as<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        match self.get_value(path)? {
            Some(Value::Null) | None => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
        }
    }

    /// Write a memory path, creating intermediate containers. Assigning a
    /// whole scope requires an object.
    pub fn set_value(&mut self, path: &str, value: Value) -> Result<()> {
        let services = Arc::clone(&self.services);
        let resolved = services.scopes().resolve(path)?;
        let memory = resolved.scope.memory_mut(self)?;

        if !resolved.path.is_empty() {
            return resolved.path.set(memory, value);
        }
        match value {
            Value::Object(map) => {
                *memory = map;
                Ok(())
            }
            _ => Err(Error::invalid_path(
                path,
                "a whole memory scope can only be assigned an object",
            )),
        }
    }

    /// Remove a memory path, returning the old value
    pub fn remove_value(&mut self, path: &str) -> Result<Option<Value>> {
        let services = Arc::clone(&self.services);
        let resolved = services.scopes().resolve(path)?;
        if resolved.path.is_empty() {
            return Err(Error::invalid_path(path, "cannot remove a whole memory scope"));
        }
        let memory = resolved.scope.memory_mut(self)?;
        Ok(resolved.path.remove(memory))
    }
}

fn chain<'c>(inner: &'c DialogSet, outer: &[&'c DialogSet]) -> Vec<&'c DialogSet> {
    let mut sets = Vec::with_capacity(outer.len() + 1);
    sets.push(inner);
    sets.extend_from_slice(outer);
    sets
}
