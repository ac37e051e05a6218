//! Entity instances shared between callers, the compiler and materialized results.

use crate::types::Value;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Persistence state of an entity instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Created in memory, not yet persisted
    New,
    /// Loaded from the store and not modified since
    Unchanged,
    /// Loaded and modified through the tracking setter
    Modified,
    Deleted,
    /// Materialized without tracking
    Detached,
}

#[derive(Debug)]
pub struct EntityObject {
    entity_type: String,
    values: BTreeMap<String, Value>,
    state: EntityState,
    environment: Option<String>,
    changed: BTreeSet<String>,
}

/// Shared, interior-mutable handle to an entity instance.
#[derive(Clone)]
pub struct EntityRef(Arc<RwLock<EntityObject>>);

impl EntityRef {
    /// A fresh tracked instance in the `New` state.
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self::with_state(entity_type, EntityState::New)
    }

    /// A raw instance as built by materialization before property assignment.
    pub fn raw(entity_type: impl Into<String>) -> Self {
        Self::with_state(entity_type, EntityState::New)
    }

    /// An untracked instance with members bound directly.
    pub fn detached(entity_type: impl Into<String>, values: Vec<(String, Value)>) -> Self {
        let entity = Self::with_state(entity_type, EntityState::Detached);
        {
            let mut inner = entity.0.write();
            inner.values.extend(values);
        }
        entity
    }

    fn with_state(entity_type: impl Into<String>, state: EntityState) -> Self {
        Self(Arc::new(RwLock::new(EntityObject {
            entity_type: entity_type.into(),
            values: BTreeMap::new(),
            state,
            environment: None,
            changed: BTreeSet::new(),
        })))
    }

    /// Builder-style initializer for tests and callers composing commands.
    pub fn with(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bind(property, value.into());
        self
    }

    pub fn entity_type(&self) -> String {
        self.0.read().entity_type.clone()
    }

    pub fn value(&self, property: &str) -> Option<Value> {
        self.0.read().values.get(property).cloned()
    }

    /// All property values ordered by property name.
    pub fn values(&self) -> Vec<(String, Value)> {
        self.0
            .read()
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Assigns a property through the tracking pathway: records the change and
    /// moves an `Unchanged` instance to `Modified`.
    pub fn set_value(&self, property: impl Into<String>, value: Value) {
        let property = property.into();
        let mut inner = self.0.write();
        let differs = inner.values.get(&property) != Some(&value);
        inner.values.insert(property.clone(), value);
        if differs && inner.state != EntityState::Detached {
            inner.changed.insert(property);
            if inner.state == EntityState::Unchanged {
                inner.state = EntityState::Modified;
            }
        }
    }

    /// Plain member binding, bypassing change tracking.
    pub fn bind(&self, property: impl Into<String>, value: Value) {
        self.0.write().values.insert(property.into(), value);
    }

    pub fn state(&self) -> EntityState {
        self.0.read().state
    }

    pub fn set_state(&self, state: EntityState) {
        self.0.write().state = state;
    }

    /// Clears recorded changes and marks the instance as freshly loaded.
    pub fn mark_unchanged(&self) {
        let mut inner = self.0.write();
        inner.changed.clear();
        inner.state = EntityState::Unchanged;
    }

    pub fn changed_properties(&self) -> Vec<String> {
        self.0.read().changed.iter().cloned().collect()
    }

    /// Stamps the persistence environment the instance belongs to.
    pub fn attach(&self, environment: impl Into<String>) {
        self.0.write().environment = Some(environment.into());
    }

    pub fn environment(&self) -> Option<String> {
        self.0.read().environment.clone()
    }

    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.read();
        f.debug_struct("Entity")
            .field("type", &inner.entity_type)
            .field("state", &inner.state)
            .field("values", &inner.values)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracking_setter_marks_modified() {
        let person = EntityRef::raw("Person");
        person.set_value("Name", Value::from("Ann"));
        person.mark_unchanged();
        assert_eq!(person.state(), EntityState::Unchanged);
        assert!(person.changed_properties().is_empty());

        person.set_value("Name", Value::from("Ann"));
        assert_eq!(person.state(), EntityState::Unchanged);

        person.set_value("Name", Value::from("Bob"));
        assert_eq!(person.state(), EntityState::Modified);
        assert_eq!(person.changed_properties(), vec!["Name".to_string()]);
    }

    #[test]
    fn test_detached_binding_is_untracked() {
        let person = EntityRef::detached("Person", vec![("Age".into(), Value::Int32(3))]);
        person.set_value("Age", Value::Int32(4));
        assert_eq!(person.state(), EntityState::Detached);
        assert!(person.changed_properties().is_empty());
        assert_eq!(person.value("Age"), Some(Value::Int32(4)));
    }

    #[test]
    fn test_handles_share_identity() {
        let a = EntityRef::new("Person").with("Name", "Ann");
        let b = a.clone();
        b.bind("Id", Value::Int64(9));
        assert!(a.ptr_eq(&b));
        assert_eq!(a.value("Id"), Some(Value::Int64(9)));
        assert_eq!(a.environment(), None);
        a.attach("main");
        assert_eq!(b.environment().as_deref(), Some("main"));
    }
}
