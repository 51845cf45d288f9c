use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::Database;

/// Uniform key-value API over an ordered list of backends.
///
/// `get` walks the list until a backend answers; `put` and `delete` fan out
/// to every backend best-effort. Backend failures degrade to null/no-op and
/// a log line; a skill never sees a storage error.
pub struct Memory {
    backends: Vec<Arc<dyn Database>>,
    warned_empty: AtomicBool,
}

impl Memory {
    pub fn new(backends: Vec<Arc<dyn Database>>) -> Self {
        Self {
            backends,
            warned_empty: AtomicBool::new(false),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }

    fn note_if_empty(&self) -> bool {
        if self.backends.is_empty() {
            if !self.warned_empty.swap(true, Ordering::Relaxed) {
                warn!("No database backends configured; memory operations are no-ops");
            }
            return true;
        }
        false
    }

    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        if self.note_if_empty() {
            return None;
        }
        for backend in &self.backends {
            match backend.get(key).await {
                Ok(Some(value)) => {
                    debug!(backend = %backend.name(), key, "Memory hit");
                    return Some(value);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(backend = %backend.name(), key, error = %e, "Memory get failed");
                }
            }
        }
        None
    }

    pub async fn put(&self, key: &str, value: serde_json::Value) {
        if self.note_if_empty() {
            return;
        }
        let writes = self.backends.iter().map(|backend| {
            let value = value.clone();
            async move {
                if let Err(e) = backend.put(key, value).await {
                    warn!(backend = %backend.name(), key, error = %e, "Memory put failed");
                }
            }
        });
        join_all(writes).await;
    }

    pub async fn delete(&self, key: &str) {
        if self.note_if_empty() {
            return;
        }
        let deletes = self.backends.iter().map(|backend| async move {
            if let Err(e) = backend.delete(key).await {
                warn!(backend = %backend.name(), key, error = %e, "Memory delete failed");
            }
        });
        join_all(deletes).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryDatabase;
    use courier_core::{Error, Result};

    struct FailingDatabase;

    #[async_trait::async_trait]
    impl Database for FailingDatabase {
        fn name(&self) -> &str {
            "failing"
        }
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
        async fn put(&self, _key: &str, _value: serde_json::Value) -> Result<()> {
            Err(Error::Backend("write refused".to_string()))
        }
        async fn get(&self, _key: &str) -> Result<Option<serde_json::Value>> {
            Err(Error::Backend("read refused".to_string()))
        }
        async fn delete(&self, _key: &str) -> Result<()> {
            Err(Error::Backend("delete refused".to_string()))
        }
    }

    #[tokio::test]
    async fn get_walks_backends_in_order() {
        let first = Arc::new(InMemoryDatabase::new("first"));
        let second = Arc::new(InMemoryDatabase::new("second"));
        second.put("k", serde_json::json!("from-second")).await.unwrap();

        let memory = Memory::new(vec![first.clone(), second.clone()]);
        assert_eq!(memory.get("k").await, Some(serde_json::json!("from-second")));

        // Once the first backend has the key it wins.
        first.put("k", serde_json::json!("from-first")).await.unwrap();
        assert_eq!(memory.get("k").await, Some(serde_json::json!("from-first")));
    }

    #[tokio::test]
    async fn put_fans_out_to_all_backends() {
        let first = Arc::new(InMemoryDatabase::new("first"));
        let second = Arc::new(InMemoryDatabase::new("second"));
        let memory = Memory::new(vec![first.clone(), second.clone()]);

        memory.put("k", serde_json::json!(42)).await;
        assert_eq!(first.get("k").await.unwrap(), Some(serde_json::json!(42)));
        assert_eq!(second.get("k").await.unwrap(), Some(serde_json::json!(42)));

        memory.delete("k").await;
        assert_eq!(first.get("k").await.unwrap(), None);
        assert_eq!(second.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn failing_backend_degrades_to_fallthrough() {
        let good = Arc::new(InMemoryDatabase::new("good"));
        good.put("k", serde_json::json!("v")).await.unwrap();

        let memory = Memory::new(vec![Arc::new(FailingDatabase) as Arc<dyn Database>, good]);
        // The failing backend is logged and skipped; the next one answers.
        assert_eq!(memory.get("k").await, Some(serde_json::json!("v")));
        // Fan-out writes do not bubble the failure either.
        memory.put("k2", serde_json::json!(1)).await;
    }

    #[tokio::test]
    async fn no_backends_is_a_noop() {
        let memory = Memory::empty();
        memory.put("k", serde_json::json!(1)).await;
        memory.delete("k").await;
        assert_eq!(memory.get("k").await, None);
    }
}
