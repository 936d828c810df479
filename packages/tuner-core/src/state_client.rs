//! Abstraction over "somewhere to get/set/delete TTL state", independent of
//! whether that's the in-process [`crate::state::StateStore`] (tests, and
//! the parent process that owns it) or the `state` peer's command methods
//! (the capture process, which per §5 never touches the store directly).

use async_trait::async_trait;

use crate::error::TunerResult;

#[async_trait]
pub trait StateClient: Send + Sync {
    async fn get(&self, key: &str) -> TunerResult<Option<String>>;
    async fn set_with_ttl(&self, key: &str, value: Option<String>, ttl_ms: Option<i64>) -> TunerResult<()>;
    async fn delete(&self, key: &str) -> TunerResult<bool>;
    async fn exists(&self, key: &str) -> TunerResult<bool>;
}
