//! Memory scopes
//!
//! Each scope binds a name to one backing map reachable from a
//! `DialogContext`. Scopes are stateless; everything they expose lives in the
//! turn, its state caches, or the dialog stack.

use crate::dialogs::DialogContext;
use crate::error::{Error, Result};
use serde_json::{json, Map, Value};
use std::borrow::Cow;

pub trait MemoryScope: Send + Sync {
    fn name(&self) -> &str;

    /// Backing map for reads, or `None` when the scope is currently unbound
    /// (no active dialog, state not loaded, ...)
    fn memory<'m>(&'m self, dc: &'m DialogContext<'_>) -> Option<Cow<'m, Map<String, Value>>>;

    /// Backing map for writes
    fn memory_mut<'m>(&'m self, dc: &'m mut DialogContext<'_>) -> Result<&'m mut Map<String, Value>>;

    fn is_read_only(&self) -> bool {
        false
    }
}

fn read_only(name: &str) -> Error {
    Error::InvalidOperation(format!("memory scope '{name}' is read-only"))
}

fn no_active_dialog(name: &str) -> Error {
    Error::InvalidOperation(format!("memory scope '{name}' needs an active dialog"))
}

/// `turn`: scratch memory that lives for one turn
pub struct TurnScope;

impl MemoryScope for TurnScope {
    fn name(&self) -> &str {
        "turn"
    }

    fn memory<'m>(&'m self, dc: &'m DialogContext<'_>) -> Option<Cow<'m, Map<String, Value>>> {
        Some(Cow::Borrowed(dc.turn().memory()))
    }

    fn memory_mut<'m>(&'m self, dc: &'m mut DialogContext<'_>) -> Result<&'m mut Map<String, Value>> {
        Ok(dc.turn_mut().memory_mut())
    }
}

/// A `BotState` document (`conversation`, `user`, ...), bound by state name
pub struct BotStateScope {
    name: String,
    state_name: String,
}

impl BotStateScope {
    pub fn new(name: impl Into<String>, state_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state_name: state_name.into(),
        }
    }
}

impl MemoryScope for BotStateScope {
    fn name(&self) -> &str {
        &self.name
    }

    fn memory<'m>(&'m self, dc: &'m DialogContext<'_>) -> Option<Cow<'m, Map<String, Value>>> {
        dc.turn().state_memory(&self.state_name).map(Cow::Borrowed)
    }

    fn memory_mut<'m>(&'m self, dc: &'m mut DialogContext<'_>) -> Result<&'m mut Map<String, Value>> {
        dc.turn_mut()
            .state_memory_mut(&self.state_name)
            .ok_or_else(|| {
                Error::InvalidOperation(format!(
                    "memory scope '{}' is unavailable: {} was not loaded this turn",
                    self.name, self.state_name
                ))
            })
    }
}

/// `dialog`: state of the innermost container.
///
/// A container dialog (component) owns the memory of everything running
/// inside it, so from within a child context this is the parent's state
/// unless the active dialog is itself a container.
pub struct DialogScope;

impl DialogScope {
    fn binds_active(dc: &DialogContext<'_>) -> bool {
        dc.parent_state().is_none() || dc.active_is_container()
    }
}

impl MemoryScope for DialogScope {
    fn name(&self) -> &str {
        "dialog"
    }

    fn memory<'m>(&'m self, dc: &'m DialogContext<'_>) -> Option<Cow<'m, Map<String, Value>>> {
        if Self::binds_active(dc) {
            dc.active_dialog().map(|instance| Cow::Borrowed(&instance.state))
        } else {
            dc.parent_state().map(Cow::Borrowed)
        }
    }

    fn memory_mut<'m>(&'m self, dc: &'m mut DialogContext<'_>) -> Result<&'m mut Map<String, Value>> {
        if Self::binds_active(dc) {
            dc.active_dialog_mut()
                .map(|instance| &mut instance.state)
                .ok_or_else(|| no_active_dialog(self.name()))
        } else {
            dc.parent_state_mut()
                .ok_or_else(|| no_active_dialog(self.name()))
        }
    }
}

/// `this`: state of the active dialog instance
pub struct ThisScope;

impl MemoryScope for ThisScope {
    fn name(&self) -> &str {
        "this"
    }

    fn memory<'m>(&'m self, dc: &'m DialogContext<'_>) -> Option<Cow<'m, Map<String, Value>>> {
        dc.active_dialog().map(|instance| Cow::Borrowed(&instance.state))
    }

    fn memory_mut<'m>(&'m self, dc: &'m mut DialogContext<'_>) -> Result<&'m mut Map<String, Value>> {
        dc.active_dialog_mut()
            .map(|instance| &mut instance.state)
            .ok_or_else(|| no_active_dialog(self.name()))
    }
}

/// `class`: read-only properties of the active dialog's definition
pub struct ClassScope;

impl MemoryScope for ClassScope {
    fn name(&self) -> &str {
        "class"
    }

    fn memory<'m>(&'m self, dc: &'m DialogContext<'_>) -> Option<Cow<'m, Map<String, Value>>> {
        let instance = dc.active_dialog()?;
        let dialog = dc.find_dialog(&instance.id)?;
        Some(Cow::Owned(dialog.class_memory()))
    }

    fn memory_mut<'m>(&'m self, _dc: &'m mut DialogContext<'_>) -> Result<&'m mut Map<String, Value>> {
        Err(read_only(self.name()))
    }

    fn is_read_only(&self) -> bool {
        true
    }
}

/// `settings`: read-only host configuration
pub struct SettingsScope {
    settings: Map<String, Value>,
}

impl SettingsScope {
    pub fn new(settings: Map<String, Value>) -> Self {
        Self { settings }
    }
}

impl MemoryScope for SettingsScope {
    fn name(&self) -> &str {
        "settings"
    }

    fn memory<'m>(&'m self, _dc: &'m DialogContext<'_>) -> Option<Cow<'m, Map<String, Value>>> {
        Some(Cow::Borrowed(&self.settings))
    }

    fn memory_mut<'m>(&'m self, _dc: &'m mut DialogContext<'_>) -> Result<&'m mut Map<String, Value>> {
        Err(read_only(self.name()))
    }

    fn is_read_only(&self) -> bool {
        true
    }
}

/// `dialogcontext`: read-only view of the stack (`stack`, `activeDialog`,
/// `parent`)
pub struct DialogContextScope;

impl MemoryScope for DialogContextScope {
    fn name(&self) -> &str {
        "dialogcontext"
    }

    fn memory<'m>(&'m self, dc: &'m DialogContext<'_>) -> Option<Cow<'m, Map<String, Value>>> {
        let stack: Vec<&str> = dc.stack().iter().rev().map(|i| i.id.as_str()).collect();
        let mut memory = Map::new();
        memory.insert("stack".to_string(), json!(stack));
        memory.insert(
            "activeDialog".to_string(),
            json!(dc.active_dialog().map(|i| i.id.as_str())),
        );
        memory.insert("parent".to_string(), json!(dc.parent_dialog_id()));
        Some(Cow::Owned(memory))
    }

    fn memory_mut<'m>(&'m self, _dc: &'m mut DialogContext<'_>) -> Result<&'m mut Map<String, Value>> {
        Err(read_only(self.name()))
    }

    fn is_read_only(&self) -> bool {
        true
    }
}
