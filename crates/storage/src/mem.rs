use std::collections::HashMap;

use async_trait::async_trait;
use courier_core::Result;
use tokio::sync::RwLock;

use crate::Database;

/// Process-local backend. Contents vanish on restart; useful for development
/// and as the fast first backend in a layered facade.
pub struct InMemoryDatabase {
    name: String,
    items: RwLock<HashMap<String, serde_json::Value>>,
}

impl InMemoryDatabase {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            items: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Database for InMemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn put(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.items.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.items.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.items.write().await.remove(key);
        Ok(())
    }
}
