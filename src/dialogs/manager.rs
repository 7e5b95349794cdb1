use super::{
    Dialog, DialogContext, DialogServices, DialogSet, DialogState, DialogTurnResult, DialogTurnStatus,
};
use crate::adapter::Bot;
use crate::error::Result;
use crate::state::{BotState, BotStateSet, StatePropertyAccessor};
use crate::turn::TurnContext;
use async_trait::async_trait;
use std::sync::Arc;

/// Conversation-state property holding the persisted dialog stack
pub const DIALOG_STATE_PROPERTY: &str = "DialogState";

/// Runs a root dialog against conversation state.
///
/// Each turn: load the registered states, continue the active dialog, begin
/// the root dialog if nothing was running, then write the stack back into
/// conversation state. Saving to storage is left to the adapter.
pub struct DialogManager {
    dialogs: DialogSet,
    root_dialog_id: String,
    dialog_state: StatePropertyAccessor<DialogState>,
    states: BotStateSet,
    services: Arc<DialogServices>,
}

impl DialogManager {
    pub fn new(root: impl Dialog + 'static, conversation_state: BotState) -> Result<Self> {
        let root_dialog_id = root.id().to_string();
        let mut dialogs = DialogSet::new();
        dialogs.add(root)?;
        let dialog_state = conversation_state.property(DIALOG_STATE_PROPERTY)?;
        let mut states = BotStateSet::new();
        states.add(conversation_state);

        Ok(Self {
            dialogs,
            root_dialog_id,
            dialog_state,
            states,
            services: Arc::new(DialogServices::default()),
        })
    }

    /// Make another dialog reachable from the root level (shared prompts)
    pub fn add_dialog(mut self, dialog: impl Dialog + 'static) -> Result<Self> {
        self.dialogs.add(dialog)?;
        Ok(self)
    }

    /// Load an additional state (e.g. user state) every turn so its memory
    /// scope is available to dialogs
    #[must_use]
    pub fn with_state(mut self, state: BotState) -> Self {
        self.states.add(state);
        self
    }

    #[must_use]
    pub fn with_services(mut self, services: Arc<DialogServices>) -> Self {
        self.services = services;
        self
    }

    pub fn root_dialog_id(&self) -> &str {
        &self.root_dialog_id
    }

    /// Run one turn and record the result in the turn's services
    pub async fn run_turn(&self, turn: &mut TurnContext) -> Result<DialogTurnResult> {
        self.states.load_all(turn, false).await?;
        let mut state = self.dialog_state.get(turn, DialogState::default).await?;

        let result = {
            let mut dc =
                DialogContext::with_services(&self.dialogs, turn, &mut state, Arc::clone(&self.services));
            let mut result = dc.continue_dialog().await?;
            if result.status == DialogTurnStatus::Empty {
                result = dc.begin_dialog(&self.root_dialog_id, None).await?;
            }
            result
        };

        self.dialog_state.set(turn, &state).await?;
        tracing::debug!(
            root = %self.root_dialog_id,
            status = ?result.status,
            depth = state.dialog_stack.len(),
            "Dialog turn finished"
        );
        turn.services_mut().insert(result.clone());
        Ok(result)
    }
}

#[async_trait]
impl Bot for DialogManager {
    async fn on_turn(&self, turn: &mut TurnContext) -> Result<()> {
        self.run_turn(turn).await.map(|_| ())
    }
}
