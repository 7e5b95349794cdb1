//! Scoped bot state with per-turn caching
//!
//! A `BotState` maps a turn to one storage key (per conversation, per user or
//! per user-in-conversation). The first access in a turn loads the document
//! into the turn's cache; `save_changes` writes it back only when it changed,
//! guarded by the ETag seen at load time.

mod accessor;

#[cfg(test)]
mod proptests;

pub use accessor::StatePropertyAccessor;

use crate::activity::Activity;
use crate::error::{Error, Result};
use crate::storage::{Storage, StoreItem, ETAG_ANY};
use crate::turn::TurnContext;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub const CONVERSATION_STATE: &str = "ConversationState";
pub const USER_STATE: &str = "UserState";
pub const PRIVATE_CONVERSATION_STATE: &str = "PrivateConversationState";

/// Which correlation ids a state is keyed on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateScope {
    Conversation,
    User,
    PrivateConversation,
}

impl StateScope {
    /// Storage key for an activity. Pure function of the activity's ids.
    pub fn storage_key(self, activity: &Activity) -> Result<String> {
        let channel = activity
            .channel()
            .ok_or_else(|| Error::InvalidActivity("missing channel id".to_string()))?;
        let conversation = || {
            activity
                .conversation_id()
                .ok_or_else(|| Error::InvalidActivity("missing conversation id".to_string()))
        };
        let user = || {
            activity
                .from_id()
                .ok_or_else(|| Error::InvalidActivity("missing from id".to_string()))
        };

        Ok(match self {
            Self::Conversation => format!("{channel}/conversations/{}", conversation()?),
            Self::User => format!("{channel}/users/{}", user()?),
            Self::PrivateConversation => {
                format!("{channel}/conversations/{}/users/{}", conversation()?, user()?)
            }
        })
    }

    pub fn default_name(self) -> &'static str {
        match self {
            Self::Conversation => CONVERSATION_STATE,
            Self::User => USER_STATE,
            Self::PrivateConversation => PRIVATE_CONVERSATION_STATE,
        }
    }
}

/// A state document as loaded into a turn
#[derive(Debug, Clone)]
pub struct CachedBotState {
    pub(crate) state: Map<String, Value>,
    pub(crate) etag: Option<String>,
    /// Serialized form at load/save time, for change detection
    snapshot: String,
}

impl CachedBotState {
    fn new(state: Map<String, Value>, etag: Option<String>) -> Self {
        let snapshot = serde_json::to_string(&state).unwrap_or_default();
        Self {
            state,
            etag,
            snapshot,
        }
    }

    pub fn is_changed(&self) -> bool {
        serde_json::to_string(&self.state).map_or(true, |current| current != self.snapshot)
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    fn mark_saved(&mut self, etag: Option<String>) {
        self.etag = etag;
        self.snapshot = serde_json::to_string(&self.state).unwrap_or_default();
    }
}

/// Handle to one scoped state document
#[derive(Clone)]
pub struct BotState {
    storage: Arc<dyn Storage>,
    name: String,
    scope: StateScope,
}

impl std::fmt::Debug for BotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotState")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl BotState {
    pub fn new(storage: Arc<dyn Storage>, scope: StateScope, name: impl Into<String>) -> Self {
        Self {
            storage,
            name: name.into(),
            scope,
        }
    }

    pub fn conversation(storage: Arc<dyn Storage>) -> Self {
        Self::new(storage, StateScope::Conversation, CONVERSATION_STATE)
    }

    pub fn user(storage: Arc<dyn Storage>) -> Self {
        Self::new(storage, StateScope::User, USER_STATE)
    }

    pub fn private_conversation(storage: Arc<dyn Storage>) -> Self {
        Self::new(storage, StateScope::PrivateConversation, PRIVATE_CONVERSATION_STATE)
    }

    /// Cache key within the turn; also the memory scope's binding name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> StateScope {
        self.scope
    }

    pub fn storage_key(&self, turn: &TurnContext) -> Result<String> {
        self.scope.storage_key(turn.activity())
    }

    /// Load into the turn cache. A no-op when already cached unless `force`.
    pub async fn load(&self, turn: &mut TurnContext, force: bool) -> Result<()> {
        let key = self.storage_key(turn)?;
        if !force && turn.cached_state(&self.name).is_some() {
            return Ok(());
        }
        turn.ensure_active()?;

        let mut items = self.storage.read(std::slice::from_ref(&key)).await?;
        let cached = match items.remove(&key) {
            Some(item) => {
                let state = match item.value {
                    Value::Object(map) => map,
                    Value::Null => Map::new(),
                    _ => {
                        return Err(Error::InvalidOperation(format!(
                            "{} at '{key}' is not a JSON object",
                            self.name
                        )))
                    }
                };
                CachedBotState::new(state, item.etag)
            }
            None => CachedBotState::new(Map::new(), None),
        };

        tracing::debug!(state = %self.name, key = %key, etag = ?cached.etag, "Loaded bot state");
        turn.set_cached_state(&self.name, cached);
        Ok(())
    }

    /// Write the cached document back if it changed.
    ///
    /// With `force` the write is unconditional (wildcard ETag) and happens even
    /// when nothing changed. A stale ETag surfaces as a storage conflict and
    /// the cache is left as it was.
    pub async fn save_changes(&self, turn: &mut TurnContext, force: bool) -> Result<()> {
        let Some(cached) = turn.cached_state(&self.name) else {
            return Ok(());
        };
        if !force && !cached.is_changed() {
            return Ok(());
        }

        let key = self.storage_key(turn)?;
        let etag = if force {
            Some(ETAG_ANY.to_string())
        } else {
            cached.etag.clone()
        };
        let item = StoreItem::new(Value::Object(cached.state.clone()), etag);

        // Never start a write for a cancelled turn
        turn.ensure_active()?;
        let mut etags = self.storage.write(HashMap::from([(key.clone(), item)])).await?;

        let new_etag = etags.remove(&key);
        tracing::debug!(state = %self.name, key = %key, etag = ?new_etag, "Saved bot state");
        if let Some(cached) = turn.cached_state_mut(&self.name) {
            cached.mark_saved(new_etag);
        }
        Ok(())
    }

    /// Reset the cached document to empty. The next save overwrites the stored
    /// document under the ETag it was loaded with.
    pub async fn clear(&self, turn: &mut TurnContext) -> Result<()> {
        self.load(turn, false).await?;
        if let Some(cached) = turn.cached_state_mut(&self.name) {
            cached.state = Map::new();
            // Force the next save even if the document was already empty
            cached.snapshot.clear();
        }
        Ok(())
    }

    /// Drop the cache and delete the stored document
    pub async fn delete(&self, turn: &mut TurnContext) -> Result<()> {
        let key = self.storage_key(turn)?;
        turn.clear_cached_state(&self.name);
        turn.ensure_active()?;
        self.storage.delete(&[key.clone()]).await?;
        tracing::debug!(state = %self.name, key = %key, "Deleted bot state");
        Ok(())
    }

    /// The cached document, if loaded this turn
    pub fn get<'t>(&self, turn: &'t TurnContext) -> Option<&'t Map<String, Value>> {
        turn.state_memory(&self.name)
    }

    /// Typed accessor for a top-level (or dotted) property
    pub fn property<T>(&self, name: &str) -> Result<StatePropertyAccessor<T>> {
        StatePropertyAccessor::new(self.clone(), name)
    }
}

/// A group of states loaded and saved together
#[derive(Clone, Debug, Default)]
pub struct BotStateSet {
    states: Vec<BotState>,
}

impl BotStateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a state; a state with the same name replaces the earlier one
    pub fn add(&mut self, state: BotState) -> &mut Self {
        self.states.retain(|s| s.name() != state.name());
        self.states.push(state);
        self
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BotState> {
        self.states.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub async fn load_all(&self, turn: &mut TurnContext, force: bool) -> Result<()> {
        for state in &self.states {
            state.load(turn, force).await?;
        }
        Ok(())
    }

    /// Save in registration order, stopping at the first failure
    pub async fn save_all(&self, turn: &mut TurnContext, force: bool) -> Result<()> {
        for state in &self.states {
            state.save_changes(turn, force).await?;
        }
        Ok(())
    }
}

impl<'s> IntoIterator for &'s BotStateSet {
    type Item = &'s BotState;
    type IntoIter = std::slice::Iter<'s, BotState>;

    fn into_iter(self) -> Self::IntoIter {
        self.states.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::testing::activity;
    use serde_json::json;

    fn storage() -> Arc<MemoryStorage> {
        Arc::new(MemoryStorage::new())
    }

    #[test]
    fn test_storage_keys() {
        let a = activity("hi");
        assert_eq!(
            StateScope::Conversation.storage_key(&a).unwrap(),
            "test/conversations/conv-1"
        );
        assert_eq!(StateScope::User.storage_key(&a).unwrap(), "test/users/user-1");
        assert_eq!(
            StateScope::PrivateConversation.storage_key(&a).unwrap(),
            "test/conversations/conv-1/users/user-1"
        );
    }

    #[test]
    fn test_missing_ids_are_invalid() {
        let mut a = activity("hi");
        a.from = None;
        assert!(StateScope::Conversation.storage_key(&a).is_ok());
        assert!(matches!(
            StateScope::User.storage_key(&a),
            Err(Error::InvalidActivity(_))
        ));

        a.channel_id.clear();
        assert!(matches!(
            StateScope::Conversation.storage_key(&a),
            Err(Error::InvalidActivity(_))
        ));
    }

    #[test]
    fn test_state_set_replaces_same_name() {
        let mut set = BotStateSet::new();
        set.add(BotState::conversation(storage()))
            .add(BotState::user(storage()))
            .add(BotState::conversation(storage()));

        let mut names = Vec::new();
        for state in &set {
            names.push(state.name().to_string());
        }
        assert_eq!(names, vec![USER_STATE, CONVERSATION_STATE]);
        assert_eq!(set.iter().count(), 2);
    }

    #[tokio::test]
    async fn test_load_missing_is_empty_and_save_persists() {
        let storage = storage();
        let state = BotState::conversation(storage.clone());

        let mut turn = TurnContext::new(activity("hi"));
        state.load(&mut turn, false).await.unwrap();
        assert!(state.get(&turn).unwrap().is_empty());

        turn.state_memory_mut(CONVERSATION_STATE)
            .unwrap()
            .insert("count".to_string(), json!(1));
        state.save_changes(&mut turn, false).await.unwrap();

        let mut next = TurnContext::new(activity("again"));
        state.load(&mut next, false).await.unwrap();
        assert_eq!(state.get(&next).unwrap()["count"], json!(1));
    }

    #[tokio::test]
    async fn test_unchanged_save_skips_write() {
        let storage = storage();
        let state = BotState::conversation(storage.clone());

        let mut turn = TurnContext::new(activity("hi"));
        state.load(&mut turn, false).await.unwrap();
        state.save_changes(&mut turn, false).await.unwrap();
        assert!(storage.is_empty());

        state.save_changes(&mut turn, true).await.unwrap();
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_writer_conflicts() {
        let storage = storage();
        let state = BotState::conversation(storage.clone());

        let mut seed = TurnContext::new(activity("seed"));
        state.load(&mut seed, false).await.unwrap();
        seed.state_memory_mut(CONVERSATION_STATE)
            .unwrap()
            .insert("v".to_string(), json!(0));
        state.save_changes(&mut seed, false).await.unwrap();

        let mut first = TurnContext::new(activity("a"));
        let mut second = TurnContext::new(activity("b"));
        state.load(&mut first, false).await.unwrap();
        state.load(&mut second, false).await.unwrap();

        first
            .state_memory_mut(CONVERSATION_STATE)
            .unwrap()
            .insert("v".to_string(), json!(1));
        second
            .state_memory_mut(CONVERSATION_STATE)
            .unwrap()
            .insert("v".to_string(), json!(2));

        state.save_changes(&mut first, false).await.unwrap();
        let err = state.save_changes(&mut second, false).await.unwrap_err();
        assert!(err.is_conflict());

        let mut check = TurnContext::new(activity("check"));
        state.load(&mut check, false).await.unwrap();
        assert_eq!(state.get(&check).unwrap()["v"], json!(1));
    }

    #[tokio::test]
    async fn test_load_is_cached_unless_forced() {
        let storage = storage();
        let state = BotState::conversation(storage.clone());

        let mut turn = TurnContext::new(activity("hi"));
        state.load(&mut turn, false).await.unwrap();
        turn.state_memory_mut(CONVERSATION_STATE)
            .unwrap()
            .insert("local".to_string(), json!(true));

        state.load(&mut turn, false).await.unwrap();
        assert_eq!(state.get(&turn).unwrap()["local"], json!(true));

        state.load(&mut turn, true).await.unwrap();
        assert!(state.get(&turn).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_and_delete() {
        let storage = storage();
        let state = BotState::user(storage.clone());

        let mut turn = TurnContext::new(activity("hi"));
        state.load(&mut turn, false).await.unwrap();
        turn.state_memory_mut(USER_STATE)
            .unwrap()
            .insert("name".to_string(), json!("Ada"));
        state.save_changes(&mut turn, false).await.unwrap();

        state.clear(&mut turn).await.unwrap();
        state.save_changes(&mut turn, false).await.unwrap();
        let items = storage.read(&["test/users/user-1".to_string()]).await.unwrap();
        assert_eq!(items["test/users/user-1"].value, json!({}));

        state.delete(&mut turn).await.unwrap();
        assert!(state.get(&turn).is_none());
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_turn_does_not_write() {
        let storage = storage();
        let state = BotState::conversation(storage.clone());
        let token = tokio_util::sync::CancellationToken::new();

        let mut turn = TurnContext::with_cancellation(activity("hi"), token.clone());
        state.load(&mut turn, false).await.unwrap();
        turn.state_memory_mut(CONVERSATION_STATE)
            .unwrap()
            .insert("x".to_string(), json!(1));

        token.cancel();
        let err = state.save_changes(&mut turn, false).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_state_set_saves_each_scope() {
        let storage = storage();
        let conversation = BotState::conversation(storage.clone());
        let user = BotState::user(storage.clone());
        let mut set = BotStateSet::new();
        set.add(conversation).add(user);

        let mut turn = TurnContext::new(activity("hi"));
        set.load_all(&mut turn, false).await.unwrap();
        for name in [CONVERSATION_STATE, USER_STATE] {
            turn.state_memory_mut(name)
                .unwrap()
                .insert("seen".to_string(), json!(true));
        }
        set.save_all(&mut turn, false).await.unwrap();
        assert_eq!(storage.len(), 2);
    }
}
