use super::BotState;
use crate::error::{Error, Result};
use crate::memory::PropertyPath;
use crate::turn::TurnContext;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

/// Typed view of one property inside a `BotState`.
///
/// Every operation loads the state into the turn cache on first use. Nothing
/// here writes to storage; persistence happens when the owning state is saved.
pub struct StatePropertyAccessor<T> {
    state: BotState,
    name: String,
    path: PropertyPath,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for StatePropertyAccessor<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            name: self.name.clone(),
            path: self.path.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> StatePropertyAccessor<T> {
    pub(super) fn new(state: BotState, name: &str) -> Result<Self> {
        let path = PropertyPath::parse(name)?;
        if path.is_empty() {
            return Err(Error::invalid_path(name, "property name is empty"));
        }
        Ok(Self {
            state,
            name: name.to_string(),
            path,
            _marker: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> StatePropertyAccessor<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    /// Current value, or `None` when unset (or null)
    pub async fn get_opt(&self, turn: &mut TurnContext) -> Result<Option<T>> {
        self.state.load(turn, false).await?;
        let value = turn
            .state_memory(self.state.name())
            .and_then(|memory| self.path.get(memory))
            .filter(|value| !value.is_null());
        match value {
            Some(value) => Ok(Some(T::deserialize(value)?)),
            None => Ok(None),
        }
    }

    /// Current value; when unset, `default` is stored and returned
    pub async fn get(
        &self,
        turn: &mut TurnContext,
        default: impl FnOnce() -> T + Send,
    ) -> Result<T> {
        if let Some(value) = self.get_opt(turn).await? {
            return Ok(value);
        }
        let value = default();
        self.set(turn, &value).await?;
        Ok(value)
    }

    pub async fn set(&self, turn: &mut TurnContext, value: &T) -> Result<()> {
        self.state.load(turn, false).await?;
        let value = serde_json::to_value(value)?;
        let memory = turn.state_memory_mut(self.state.name()).ok_or_else(|| {
            Error::InvalidOperation(format!("{} is not loaded", self.state.name()))
        })?;
        self.path.set(memory, value)
    }

    pub async fn delete(&self, turn: &mut TurnContext) -> Result<()> {
        self.state.load(turn, false).await?;
        if let Some(memory) = turn.state_memory_mut(self.state.name()) {
            self.path.remove(memory);
        }
        Ok(())
    }
}
