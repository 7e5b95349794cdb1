//! Per-turn context
//!
//! A `TurnContext` lives for exactly one inbound activity. It owns everything
//! scoped to the turn: the activity, registered services, the `turn` memory
//! scope, the `BotState` caches and the outbound queue.

use crate::activity::Activity;
use crate::error::{Error, Result};
use crate::state::CachedBotState;
use serde_json::{Map, Value};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Services registered on a turn, keyed by type or by name
#[derive(Default)]
pub struct TurnServices {
    typed: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    named: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl TurnServices {
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) -> Option<T> {
        self.typed
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.typed
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any + Send + Sync>(&mut self) -> Option<&mut T> {
        self.typed
            .get_mut(&TypeId::of::<T>())
            .and_then(|v| v.downcast_mut::<T>())
    }

    pub fn remove<T: Any + Send + Sync>(&mut self) -> Option<T> {
        self.typed
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast::<T>().ok())
            .map(|v| *v)
    }

    pub fn insert_named<T: Any + Send + Sync>(&mut self, name: impl Into<String>, value: T) {
        self.named.insert(name.into(), Box::new(value));
    }

    pub fn get_named<T: Any + Send + Sync>(&self, name: &str) -> Option<&T> {
        self.named.get(name).and_then(|v| v.downcast_ref::<T>())
    }
}

/// Context for a single turn
pub struct TurnContext {
    activity: Arc<Activity>,
    services: TurnServices,
    /// Backing map of the `turn` memory scope
    memory: Map<String, Value>,
    /// `BotState` caches keyed by state name; dropped with the turn
    state_cache: HashMap<String, CachedBotState>,
    outbound: Vec<Activity>,
    responded: bool,
    cancel: CancellationToken,
}

impl TurnContext {
    pub fn new(activity: Activity) -> Self {
        Self::with_cancellation(activity, CancellationToken::new())
    }

    pub fn with_cancellation(activity: Activity, cancel: CancellationToken) -> Self {
        let mut memory = Map::new();
        memory.insert(
            "activity".to_string(),
            serde_json::to_value(&activity).unwrap_or(Value::Null),
        );
        Self {
            activity: Arc::new(activity),
            services: TurnServices::default(),
            memory,
            state_cache: HashMap::new(),
            outbound: Vec::new(),
            responded: false,
            cancel,
        }
    }

    /// The inbound activity
    pub fn activity(&self) -> &Activity {
        &self.activity
    }

    pub fn services(&self) -> &TurnServices {
        &self.services
    }

    pub fn services_mut(&mut self) -> &mut TurnServices {
        &mut self.services
    }

    /// `turn` memory scope
    pub fn memory(&self) -> &Map<String, Value> {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.memory
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fail fast when the turn has been cancelled
    pub fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Queue an outbound activity, stamped with this turn's conversation
    /// reference. Returns the id assigned to it.
    pub fn send_activity(&mut self, mut activity: Activity) -> String {
        self.activity.apply_reference_to(&mut activity);
        let id = activity
            .id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();
        tracing::debug!(
            activity_id = %id,
            activity_type = activity.activity_type.as_str(),
            "Queued outbound activity"
        );
        self.outbound.push(activity);
        self.responded = true;
        id
    }

    /// Queue several activities, preserving their order
    pub fn send_activities(&mut self, activities: impl IntoIterator<Item = Activity>) -> Vec<String> {
        activities
            .into_iter()
            .map(|activity| self.send_activity(activity))
            .collect()
    }

    pub fn send_text(&mut self, text: impl Into<String>) -> String {
        self.send_activity(Activity::message(text))
    }

    /// Whether anything has been sent this turn
    pub fn responded(&self) -> bool {
        self.responded
    }

    /// Activities queued but not yet delivered
    pub fn outbound(&self) -> &[Activity] {
        &self.outbound
    }

    /// Take the queued activities for delivery
    pub fn drain_outbound(&mut self) -> Vec<Activity> {
        std::mem::take(&mut self.outbound)
    }

    pub(crate) fn cached_state(&self, name: &str) -> Option<&CachedBotState> {
        self.state_cache.get(name)
    }

    pub(crate) fn cached_state_mut(&mut self, name: &str) -> Option<&mut CachedBotState> {
        self.state_cache.get_mut(name)
    }

    pub(crate) fn set_cached_state(&mut self, name: &str, cached: CachedBotState) {
        self.state_cache.insert(name.to_string(), cached);
    }

    pub(crate) fn clear_cached_state(&mut self, name: &str) -> Option<CachedBotState> {
        self.state_cache.remove(name)
    }

    /// Backing map of a loaded `BotState`, if it was loaded this turn
    pub fn state_memory(&self, state_name: &str) -> Option<&Map<String, Value>> {
        self.state_cache.get(state_name).map(|c| &c.state)
    }

    pub fn state_memory_mut(&mut self, state_name: &str) -> Option<&mut Map<String, Value>> {
        self.state_cache.get_mut(state_name).map(|c| &mut c.state)
    }
}
