//! Hooks for observing dialog stack activity

/// A stack operation about to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugEvent<'e> {
    pub dialog_id: &'e str,
    /// `begin`, `continue`, `resume`, `reprompt`, `end` or `cancel`
    pub action: &'static str,
    /// Stack depth at the time of the event
    pub depth: usize,
    pub conversation_id: Option<&'e str>,
}

pub trait DialogDebugger: Send + Sync {
    fn on_event(&self, event: &DebugEvent<'_>);
}

/// Ignores everything
pub struct NullDebugger;

impl DialogDebugger for NullDebugger {
    fn on_event(&self, _event: &DebugEvent<'_>) {}
}

/// Emits each event at `trace` level
pub struct TracingDebugger;

impl DialogDebugger for TracingDebugger {
    fn on_event(&self, event: &DebugEvent<'_>) {
        tracing::trace!(
            dialog_id = %event.dialog_id,
            action = event.action,
            depth = event.depth,
            conversation_id = ?event.conversation_id,
            "Dialog step"
        );
    }
}
