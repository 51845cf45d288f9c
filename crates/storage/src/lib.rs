use async_trait::async_trait;
use courier_core::Result;

pub mod codec;
pub mod facade;
pub mod mem;
pub mod sqlite;

pub use facade::Memory;
pub use mem::InMemoryDatabase;
pub use sqlite::SqliteDatabase;

/// A key-value persistence backend. Values are JSON trees; timestamps inside
/// them travel as tagged strings (see [`codec`]). Concurrency safety is each
/// backend's responsibility; the facade never serializes access.
#[async_trait]
pub trait Database: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    async fn put(&self, key: &str, value: serde_json::Value) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;

    async fn delete(&self, key: &str) -> Result<()>;
}
