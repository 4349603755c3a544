use crate::PlanError;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

/// Facts accumulated for one session.
pub type ContextValues = BTreeMap<String, Value>;

const MAX_KEY_LENGTH: usize = 256;

/// Per-session fact accumulator shared by step enrichment and synthesis.
///
/// Last write wins on key collisions. Nothing expires; sessions are cleared
/// explicitly when a new plan starts.
#[derive(Clone, Default)]
pub struct ContextStore {
    inner: Arc<RwLock<HashMap<String, ContextValues>>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(
        &self,
        session_id: &str,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), PlanError> {
        let key = key.into();
        validate_context_key(&key)?;
        let mut sessions = self.write()?;
        sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(key, value);
        Ok(())
    }

    pub fn store_many(&self, session_id: &str, values: &ContextValues) -> Result<(), PlanError> {
        if values.is_empty() {
            return Ok(());
        }
        for key in values.keys() {
            validate_context_key(key)?;
        }
        let mut sessions = self.write()?;
        let entry = sessions.entry(session_id.to_string()).or_default();
        for (key, value) in values {
            entry.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    pub fn get(&self, session_id: &str, key: &str) -> Result<Option<Value>, PlanError> {
        Ok(self
            .read()?
            .get(session_id)
            .and_then(|values| values.get(key))
            .cloned())
    }

    /// Every fact of the session; empty when nothing was stored.
    pub fn snapshot(&self, session_id: &str) -> Result<ContextValues, PlanError> {
        Ok(self.read()?.get(session_id).cloned().unwrap_or_default())
    }

    /// With a key: whether that key is present. Without: whether the session
    /// holds any fact at all.
    pub fn has(&self, session_id: &str, key: Option<&str>) -> Result<bool, PlanError> {
        let sessions = self.read()?;
        let Some(values) = sessions.get(session_id) else {
            return Ok(false);
        };
        Ok(match key {
            Some(key) => values.contains_key(key),
            None => !values.is_empty(),
        })
    }

    pub fn clear(&self, session_id: &str) -> Result<(), PlanError> {
        self.write()?.remove(session_id);
        Ok(())
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, ContextValues>>, PlanError> {
        self.inner
            .read()
            .map_err(|_| PlanError::Context("context read lock poisoned".to_string()))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, ContextValues>>, PlanError> {
        self.inner
            .write()
            .map_err(|_| PlanError::Context("context write lock poisoned".to_string()))
    }
}

pub fn validate_context_key(key: &str) -> Result<(), PlanError> {
    if key.trim().is_empty() {
        return Err(PlanError::Context("context key cannot be empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(PlanError::Context(format!(
            "context key '{}' exceeds max length {}",
            key, MAX_KEY_LENGTH
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn store_and_get_are_scoped_by_session() {
        let store = ContextStore::new();
        store
            .store("s-1", "flight.price", json!(412))
            .expect("store should succeed");

        assert_eq!(
            store.get("s-1", "flight.price").expect("get should succeed"),
            Some(json!(412))
        );
        assert_eq!(store.get("s-2", "flight.price").expect("get"), None);
        assert!(store.has("s-1", None).expect("has"));
        assert!(!store.has("s-2", None).expect("has"));
    }

    #[test]
    fn store_many_last_write_wins() {
        let store = ContextStore::new();
        store
            .store("s-1", "city", json!("Lisbon"))
            .expect("store should succeed");
        store
            .store_many(
                "s-1",
                &BTreeMap::from([
                    ("city".to_string(), json!("Porto")),
                    ("nights".to_string(), json!(3)),
                ]),
            )
            .expect("store many should succeed");

        let snapshot = store.snapshot("s-1").expect("snapshot");
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get("city"), Some(&json!("Porto")));
        assert!(store.has("s-1", Some("nights")).expect("has"));
    }

    #[test]
    fn clear_drops_only_that_session() {
        let store = ContextStore::new();
        store.store("s-1", "a", json!(1)).expect("store");
        store.store("s-2", "b", json!(2)).expect("store");

        store.clear("s-1").expect("clear");
        assert!(store.snapshot("s-1").expect("snapshot").is_empty());
        assert_eq!(store.get("s-2", "b").expect("get"), Some(json!(2)));
    }

    #[test]
    fn reject_empty_and_oversized_keys() {
        let store = ContextStore::new();
        assert!(matches!(
            store.store("s-1", "  ", json!(1)),
            Err(PlanError::Context(_))
        ));
        let long_key = "k".repeat(MAX_KEY_LENGTH + 1);
        let error = store
            .store_many("s-1", &BTreeMap::from([(long_key, json!(1))]))
            .expect_err("oversized key should fail");
        assert!(matches!(error, PlanError::Context(message) if message.contains("max length")));
        assert!(!store.has("s-1", None).expect("has"));
    }
}
