use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::types::{ImageReference, Task};

/// One provider family's translation of a generic task into its wire protocol.
///
/// Implementations check their credential before any network call and only
/// forward the parameters they know. Long-running implementations must stop
/// when `cancel` fires; dropping the returned future must stop them too.
#[async_trait]
pub trait ImageAdapter: Send + Sync {
    fn provider(&self) -> &str;

    async fn generate(&self, task: &Task, cancel: &CancellationToken) -> Result<ImageReference>;
}
