use std::collections::HashMap;
use std::sync::Mutex;

/// Opaque-per-spec in-memory state machine: `key -> (value, lastReqId)`.
/// `set` is a no-op for a `reqId` at or below what's already been recorded
/// for that key, matching `raft.py`'s `HashTable.set`.
#[derive(Default)]
struct Inner {
    map: HashMap<String, (String, u64)>,
}

pub struct Kv {
    inner: Mutex<Inner>,
}

impl Default for Kv {
    fn default() -> Self {
        Kv::new()
    }
}

impl Kv {
    pub fn new() -> Self {
        Kv { inner: Mutex::new(Inner::default()) }
    }

    /// Idempotent on `req_id`: a `set` whose `req_id` doesn't exceed the
    /// last one recorded for `key` is dropped silently.
    pub fn set(&self, key: &str, value: &str, req_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        let should_apply = match inner.map.get(key) {
            Some((_, last_req_id)) => req_id > *last_req_id,
            None => true,
        };
        if should_apply {
            inner.map.insert(key.to_string(), (value.to_string(), req_id));
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.map.get(key).map(|(value, _)| value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_on_missing_key_is_none() {
        let kv = Kv::new();
        assert_eq!(kv.get("x"), None);
    }

    #[test]
    fn set_then_get_round_trips() {
        let kv = Kv::new();
        kv.set("x", "1", 1);
        assert_eq!(kv.get("x"), Some("1".to_string()));
    }

    #[test]
    fn idempotent_on_req_id() {
        let kv = Kv::new();
        kv.set("x", "1", 5);
        kv.set("x", "2", 5);
        assert_eq!(kv.get("x"), Some("1".to_string()), "duplicate req_id must not overwrite");
        kv.set("x", "3", 4);
        assert_eq!(kv.get("x"), Some("1".to_string()), "stale req_id must not overwrite");
        kv.set("x", "4", 6);
        assert_eq!(kv.get("x"), Some("4".to_string()), "newer req_id must overwrite");
    }
}
