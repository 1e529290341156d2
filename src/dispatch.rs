use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span};

use crate::config::EngineConfig;
use crate::error::ErrorKind;
use crate::registry::{Capability, ProviderRegistry};
use crate::types::{Task, TaskResult};
use crate::ImagegenError;

/// Slack on top of the adapter's own budget so the adapter gets to report its
/// own timeout first.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// Routes one task to its adapter and folds every outcome into a `TaskResult`.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    registry: Arc<ProviderRegistry>,
    sync_deadline: Duration,
    async_deadline: Duration,
    grace: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self::from_config(registry, &EngineConfig::default())
    }

    pub fn from_config(registry: Arc<ProviderRegistry>, config: &EngineConfig) -> Self {
        Self {
            registry,
            sync_deadline: config.sync_timeout(),
            async_deadline: config.poll_deadline(),
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn deadline(&self, capability: Capability) -> Duration {
        let budget = if capability.is_async() {
            self.async_deadline
        } else {
            self.sync_deadline
        };
        budget + self.grace
    }

    pub async fn dispatch(&self, task: &Task, cancel: &CancellationToken) -> TaskResult {
        self.dispatch_indexed(0, task, cancel).await
    }

    /// Same as [`Dispatcher::dispatch`], with the task's batch position
    /// recorded on the span.
    pub async fn dispatch_indexed(
        &self,
        index: usize,
        task: &Task,
        cancel: &CancellationToken,
    ) -> TaskResult {
        let provider = task.provider_id();
        let span = info_span!("imagegen.task", index, provider = %provider);
        self.run(task, provider, cancel).instrument(span).await
    }

    async fn run(&self, task: &Task, provider: String, cancel: &CancellationToken) -> TaskResult {
        let Some(registered) = self.registry.resolve(&provider) else {
            tracing::warn!("unsupported provider");
            return TaskResult::failure(
                task,
                provider.clone(),
                ErrorKind::Unsupported,
                format!("unsupported provider: {provider}"),
            );
        };

        let deadline = self.deadline(registered.descriptor().capability);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ImagegenError::Cancelled),
            res = tokio::time::timeout(deadline, registered.adapter().generate(task, cancel)) => {
                match res {
                    Ok(res) => res,
                    Err(_) => Err(ImagegenError::Timeout(format!(
                        "task exceeded its {}s deadline",
                        deadline.as_secs()
                    ))),
                }
            }
        };

        match outcome {
            Ok(image) => {
                tracing::info!("task succeeded");
                TaskResult::success(task, provider, image)
            }
            Err(err) => {
                let kind = err.kind();
                tracing::warn!(error = %err, ?kind, "task failed");
                TaskResult::failure(task, provider, kind, err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageAdapter;
    use crate::registry::ProviderDescriptor;
    use crate::types::{ImageReference, TaskStatus};
    use async_trait::async_trait;

    struct Fixed;

    #[async_trait]
    impl ImageAdapter for Fixed {
        fn provider(&self) -> &str {
            "fixed"
        }

        async fn generate(
            &self,
            task: &Task,
            _cancel: &CancellationToken,
        ) -> crate::Result<ImageReference> {
            Ok(ImageReference::url(format!("https://img.example/{}", task.prompt)))
        }
    }

    struct Hangs;

    #[async_trait]
    impl ImageAdapter for Hangs {
        fn provider(&self) -> &str {
            "hangs"
        }

        async fn generate(
            &self,
            _task: &Task,
            _cancel: &CancellationToken,
        ) -> crate::Result<ImageReference> {
            std::future::pending().await
        }
    }

    struct Broken;

    #[async_trait]
    impl ImageAdapter for Broken {
        fn provider(&self) -> &str {
            "broken"
        }

        async fn generate(
            &self,
            _task: &Task,
            _cancel: &CancellationToken,
        ) -> crate::Result<ImageReference> {
            Err(ImagegenError::InvalidResponse("no data".to_string()))
        }
    }

    fn descriptor(id: &str, capability: Capability) -> ProviderDescriptor {
        ProviderDescriptor {
            id: id.to_string(),
            credit_cost: 1,
            capability,
        }
    }

    fn dispatcher() -> Dispatcher {
        let mut registry = ProviderRegistry::new();
        registry
            .register(descriptor("fixed", Capability::Synchronous), Fixed)
            .expect("fixed");
        registry
            .register(descriptor("hangs", Capability::Synchronous), Hangs)
            .expect("hangs");
        registry
            .register(descriptor("slow-job", Capability::AsyncPoll), Hangs)
            .expect("slow-job");
        registry
            .register(descriptor("broken", Capability::PassthroughParams), Broken)
            .expect("broken");
        Dispatcher::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn provider_lookup_is_case_insensitive() {
        let result = dispatcher()
            .dispatch(&Task::new("cat", "FiXeD"), &CancellationToken::new())
            .await;
        assert_eq!(result.status, TaskStatus::Success);
        assert_eq!(result.provider, "fixed");
        assert_eq!(
            result.image.as_ref().and_then(ImageReference::as_url),
            Some("https://img.example/cat")
        );
    }

    #[tokio::test]
    async fn unknown_provider_is_unsupported() {
        let result = dispatcher()
            .dispatch(&Task::new("cat", "midjourney"), &CancellationToken::new())
            .await;
        assert_eq!(result.error_kind, Some(ErrorKind::Unsupported));
        assert_eq!(
            result.error.as_deref(),
            Some("unsupported provider: midjourney")
        );
    }

    #[tokio::test]
    async fn adapter_error_becomes_failed_result() {
        let result = dispatcher()
            .dispatch(&Task::new("cat", "broken"), &CancellationToken::new())
            .await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error_kind, Some(ErrorKind::Provider));
        assert!(result.image.is_none());
    }

    #[test]
    fn deadlines_follow_capability() {
        let dispatcher = dispatcher();
        assert_eq!(
            dispatcher.deadline(Capability::Synchronous),
            Duration::from_secs(65)
        );
        assert_eq!(
            dispatcher.deadline(Capability::PassthroughParams),
            Duration::from_secs(65)
        );
        assert_eq!(
            dispatcher.deadline(Capability::AsyncPoll),
            Duration::from_secs(95)
        );

        let config = EngineConfig::from_toml_str("sync_timeout_secs = 20\npoll_deadline_secs = 40")
            .expect("config");
        let tuned = Dispatcher::from_config(dispatcher.registry.clone(), &config)
            .with_grace(Duration::from_secs(1));
        assert_eq!(tuned.deadline(Capability::Synchronous), Duration::from_secs(21));
        assert_eq!(tuned.deadline(Capability::AsyncPoll), Duration::from_secs(41));
    }

    #[tokio::test(start_paused = true)]
    async fn synchronous_deadline_includes_grace() {
        let started = tokio::time::Instant::now();
        let result = dispatcher()
            .dispatch(&Task::new("cat", "hangs"), &CancellationToken::new())
            .await;
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(started.elapsed().as_secs(), 65);
    }

    #[tokio::test(start_paused = true)]
    async fn async_capability_gets_the_longer_deadline() {
        let started = tokio::time::Instant::now();
        let result = dispatcher()
            .dispatch(&Task::new("cat", "slow-job"), &CancellationToken::new())
            .await;
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(started.elapsed().as_secs(), 95);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_a_hanging_adapter() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            trigger.cancel();
        });

        let result = dispatcher()
            .dispatch(&Task::new("cat", "hangs"), &cancel)
            .await;
        assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));
    }
}
