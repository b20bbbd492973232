use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use routed_core::cookie::SameSite;

/// Values under this key hold flash messages as `[category, message]`
/// pairs; retrieval drains them.
const FLASH_KEY: &str = "_flash";

/// Cookie attributes applied when the session is persisted.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub path: String,
    pub domain: Option<String>,
    pub max_age: Option<Duration>,
    pub secure: bool,
    pub http_only: bool,
    pub partitioned: bool,
    pub same_site: SameSite,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            domain: None,
            max_age: None,
            secure: false,
            http_only: true,
            partitioned: false,
            same_site: SameSite::Lax,
        }
    }
}

/// One client's session state for the current request.
///
/// Mutations mark the session dirty; the manager only calls the store's
/// `write` for sessions that are new, dirty, or destroyed, so read-only
/// requests emit no `Set-Cookie`.
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    name: String,
    values: HashMap<String, Value>,
    pub options: SessionOptions,
    created_at: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
    is_new: bool,
    destroyed: bool,
    dirty: bool,
}

impl Session {
    /// A fresh session with a random id.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            values: HashMap::new(),
            options: SessionOptions::default(),
            created_at: now,
            last_accessed: now,
            is_new: true,
            destroyed: false,
            dirty: false,
        }
    }

    /// Rehydrate a persisted session.
    pub fn restored(
        id: impl Into<String>,
        name: impl Into<String>,
        values: HashMap<String, Value>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            values,
            options: SessionOptions::default(),
            created_at,
            last_accessed: Utc::now(),
            is_new: false,
            destroyed: false,
            dirty: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_accessed(&self) -> DateTime<Utc> {
        self.last_accessed
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether the store's `write` must run for this session.
    pub fn needs_write(&self) -> bool {
        self.is_new || self.dirty || self.destroyed
    }

    pub fn values(&self) -> &HashMap<String, Value> {
        &self.values
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Serialize) {
        if let Ok(value) = serde_json::to_value(value) {
            self.values.insert(key.into(), value);
            self.dirty = true;
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.values.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// Queue a flash message under an optional category (default `message`).
    pub fn flash(&mut self, message: impl Into<String>, category: Option<&str>) {
        let mut flashes: Vec<(String, String)> = self.get(FLASH_KEY).unwrap_or_default();
        flashes.push((
            category.unwrap_or("message").to_string(),
            message.into(),
        ));
        self.insert(FLASH_KEY, flashes);
    }

    /// Drain flash messages, optionally keeping only some categories.
    /// Messages not matching the filter stay queued for a later read.
    pub fn take_flashes(&mut self, filter: Option<&[&str]>) -> Vec<(String, String)> {
        let flashes: Vec<(String, String)> = self.get(FLASH_KEY).unwrap_or_default();
        if flashes.is_empty() {
            return Vec::new();
        }
        match filter {
            None => {
                self.remove(FLASH_KEY);
                flashes
            }
            Some(categories) => {
                let (taken, kept): (Vec<_>, Vec<_>) = flashes
                    .into_iter()
                    .partition(|(category, _)| categories.contains(&category.as_str()));
                if kept.is_empty() {
                    self.remove(FLASH_KEY);
                } else {
                    self.insert(FLASH_KEY, kept);
                }
                taken
            }
        }
    }

    /// Swap in a fresh id while keeping the values.
    pub fn regenerate(&mut self) {
        self.id = Uuid::new_v4().to_string();
        self.dirty = true;
    }

    /// Clear everything and mark the session for deletion; the store's
    /// `write` removes persisted state and emits an expiring cookie.
    pub fn destroy(&mut self) {
        self.values.clear();
        self.options.max_age = Some(Duration::ZERO);
        self.destroyed = true;
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_sessions_are_new_and_clean() {
        let session = Session::new("sid");
        assert!(session.is_new());
        assert!(!session.is_dirty());
        assert!(session.needs_write());
    }

    #[test]
    fn restored_sessions_do_not_need_write_until_mutated() {
        let mut session = Session::restored("abc", "sid", HashMap::new(), Utc::now());
        assert!(!session.needs_write());
        session.insert("user", 42);
        assert!(session.needs_write());
    }

    #[test]
    fn typed_values_round_trip() {
        let mut session = Session::new("sid");
        session.insert("count", 3u64);
        session.insert("who", "alice");
        assert_eq!(session.get::<u64>("count"), Some(3));
        assert_eq!(session.get::<String>("who"), Some("alice".to_string()));
        assert_eq!(session.get::<u64>("absent"), None);
    }

    #[test]
    fn flashes_drain_on_read() {
        let mut session = Session::new("sid");
        session.flash("saved", None);
        session.flash("oops", Some("error"));

        let all = session.take_flashes(None);
        assert_eq!(all.len(), 2);
        assert!(session.take_flashes(None).is_empty());
    }

    #[test]
    fn flash_filter_keeps_other_categories() {
        let mut session = Session::new("sid");
        session.flash("saved", None);
        session.flash("oops", Some("error"));

        let errors = session.take_flashes(Some(&["error"]));
        assert_eq!(errors, vec![("error".to_string(), "oops".to_string())]);

        let rest = session.take_flashes(None);
        assert_eq!(rest, vec![("message".to_string(), "saved".to_string())]);
    }

    #[test]
    fn regenerate_keeps_values_changes_id() {
        let mut session = Session::new("sid");
        session.insert("user", "alice");
        let old_id = session.id().to_string();
        session.regenerate();
        assert_ne!(session.id(), old_id);
        assert_eq!(session.get::<String>("user"), Some("alice".to_string()));
    }

    #[test]
    fn destroy_clears_and_expires() {
        let mut session = Session::new("sid");
        session.insert("user", "alice");
        session.destroy();
        assert!(session.is_destroyed());
        assert!(session.values().is_empty());
        assert_eq!(session.options.max_age, Some(Duration::ZERO));
    }
}
