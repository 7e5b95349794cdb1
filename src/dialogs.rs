//! Dialogs and the dialog stack
//!
//! A dialog is a stateless definition; its per-conversation progress lives in
//! a `DialogInstance` on a persisted stack. `DialogContext` drives the stack
//! for one turn.

mod component;
mod context;
mod debugger;
mod manager;
mod prompt;
mod waterfall;

pub use component::ComponentDialog;
pub use context::DialogContext;
pub use debugger::{DebugEvent, DialogDebugger, NullDebugger, TracingDebugger};
pub use manager::{DialogManager, DIALOG_STATE_PROPERTY};
pub use prompt::{PromptOptions, TextPrompt};
pub use waterfall::{StepFuture, WaterfallDialog, WaterfallStepContext};

use crate::error::{Error, Result};
use crate::memory::ScopeRegistry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// One entry on the dialog stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DialogInstance {
    pub id: String,
    #[serde(default)]
    pub state: Map<String, Value>,
}

impl DialogInstance {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Map::new(),
        }
    }
}

/// Persisted dialog stack; the last element is the active dialog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DialogState {
    #[serde(default)]
    pub dialog_stack: Vec<DialogInstance>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DialogTurnStatus {
    /// Nothing was on the stack
    Empty,
    /// The active dialog is waiting for the next activity
    Waiting,
    /// The root dialog ended this turn
    Complete,
    /// Ended, but the host should wait before starting anything new
    CompleteAndWait,
    /// The stack was cancelled
    Cancelled,
}

/// Outcome of a dialog operation
#[derive(Debug, Clone, PartialEq)]
pub struct DialogTurnResult {
    pub status: DialogTurnStatus,
    pub result: Option<Value>,
    /// Set when a container's parent ended as a consequence of this turn
    pub parent_ended: bool,
}

impl DialogTurnResult {
    pub fn new(status: DialogTurnStatus, result: Option<Value>) -> Self {
        Self {
            status,
            result,
            parent_ended: false,
        }
    }

    pub fn empty() -> Self {
        Self::new(DialogTurnStatus::Empty, None)
    }

    pub fn waiting() -> Self {
        Self::new(DialogTurnStatus::Waiting, None)
    }

    pub fn complete(result: Option<Value>) -> Self {
        Self::new(DialogTurnStatus::Complete, result)
    }

    pub fn cancelled() -> Self {
        Self::new(DialogTurnStatus::Cancelled, None)
    }

    pub fn is_waiting(&self) -> bool {
        self.status == DialogTurnStatus::Waiting
    }
}

/// Why a dialog is being started, resumed or ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogReason {
    BeginCalled,
    ContinueCalled,
    EndCalled,
    ReplaceCalled,
    CancelCalled,
    NextCalled,
    EndOfChildDialog,
}

/// A dialog definition.
///
/// Implementations hold no per-conversation data; anything that must survive
/// between turns goes in the instance state reachable through the context.
#[async_trait]
pub trait Dialog: Send + Sync {
    fn id(&self) -> &str;

    /// Called right after the dialog's instance was pushed
    async fn begin_dialog(
        &self,
        dc: &mut DialogContext<'_>,
        options: Option<Value>,
    ) -> Result<DialogTurnResult>;

    /// A new activity arrived while this dialog was active
    async fn continue_dialog(&self, dc: &mut DialogContext<'_>) -> Result<DialogTurnResult> {
        dc.end_dialog(None).await
    }

    /// A child this dialog started has ended
    async fn resume_dialog(
        &self,
        dc: &mut DialogContext<'_>,
        _reason: DialogReason,
        result: Option<Value>,
    ) -> Result<DialogTurnResult> {
        dc.end_dialog(result).await
    }

    /// Re-send whatever the dialog is waiting on
    async fn reprompt_dialog(&self, _dc: &mut DialogContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Cleanup hook, called after `instance` was popped off the stack
    async fn end_dialog(
        &self,
        _dc: &mut DialogContext<'_>,
        _instance: &mut DialogInstance,
        _reason: DialogReason,
    ) -> Result<()> {
        Ok(())
    }

    /// Whether this dialog runs its own inner stack
    fn is_container(&self) -> bool {
        false
    }

    /// Properties exposed through the read-only `class` memory scope
    fn class_memory(&self) -> Map<String, Value> {
        let mut memory = Map::new();
        memory.insert("id".to_string(), json!(self.id()));
        memory
    }
}

/// Dialogs addressable by id
#[derive(Clone, Default)]
pub struct DialogSet {
    dialogs: HashMap<String, Arc<dyn Dialog>>,
}

impl std::fmt::Debug for DialogSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.dialogs.keys().collect();
        ids.sort_unstable();
        f.debug_struct("DialogSet").field("dialogs", &ids).finish()
    }
}

impl DialogSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dialog; ids must be unique within the set
    pub fn add(&mut self, dialog: impl Dialog + 'static) -> Result<&mut Self> {
        self.add_arc(Arc::new(dialog))
    }

    pub fn add_arc(&mut self, dialog: Arc<dyn Dialog>) -> Result<&mut Self> {
        let id = dialog.id().to_string();
        if id.is_empty() {
            return Err(Error::InvalidOperation("dialog id must not be empty".to_string()));
        }
        if self.dialogs.contains_key(&id) {
            return Err(Error::InvalidOperation(format!(
                "a dialog with id '{id}' is already in the set"
            )));
        }
        self.dialogs.insert(id, dialog);
        Ok(self)
    }

    pub fn find(&self, id: &str) -> Option<&dyn Dialog> {
        self.dialogs.get(id).map(Arc::as_ref)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.dialogs.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.dialogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dialogs.is_empty()
    }
}

/// Shared, turn-independent services every `DialogContext` carries
pub struct DialogServices {
    scopes: ScopeRegistry,
    debugger: Arc<dyn DialogDebugger>,
}

impl Default for DialogServices {
    fn default() -> Self {
        Self::new(ScopeRegistry::default())
    }
}

impl DialogServices {
    pub fn new(scopes: ScopeRegistry) -> Self {
        Self {
            scopes,
            debugger: Arc::new(NullDebugger),
        }
    }

    #[must_use]
    pub fn with_debugger(mut self, debugger: impl DialogDebugger + 'static) -> Self {
        self.debugger = Arc::new(debugger);
        self
    }

    pub fn scopes(&self) -> &ScopeRegistry {
        &self.scopes
    }

    pub fn debugger(&self) -> &dyn DialogDebugger {
        self.debugger.as_ref()
    }
}
