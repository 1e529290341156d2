use std::sync::Arc;

use futures_util::StreamExt as _;
use futures_util::stream;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{DEFAULT_MAX_IN_FLIGHT, EngineConfig};
use crate::dispatch::Dispatcher;
use crate::ledger::{Affordability, Clock, CreditLedger, LedgerError, LedgerGateway, UsageEvent};
use crate::registry::ProviderRegistry;
use crate::types::{BatchReport, Task, TaskResult};

pub const MAX_BATCH_SIZE: usize = 100;

/// Batch-fatal failures. Nothing has been executed or charged when one of
/// these is returned.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("invalid batch: {0}")]
    Validation(String),
    #[error("unknown provider: {provider}")]
    UnknownProvider { provider: String },
    #[error("insufficient credits: {required} required, {available} available")]
    InsufficientCredits { required: u64, available: u64 },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Validates, prices, runs and settles a batch of generation tasks.
#[derive(Clone)]
pub struct BatchExecutor {
    registry: Arc<ProviderRegistry>,
    dispatcher: Dispatcher,
    ledger: LedgerGateway,
    max_in_flight: usize,
}

impl std::fmt::Debug for BatchExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchExecutor")
            .field("registry", &self.registry)
            .field("max_in_flight", &self.max_in_flight)
            .finish_non_exhaustive()
    }
}

impl BatchExecutor {
    pub fn new(registry: Arc<ProviderRegistry>, ledger: Arc<dyn CreditLedger>) -> Self {
        Self {
            dispatcher: Dispatcher::new(registry.clone()),
            registry,
            ledger: LedgerGateway::new(ledger),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }

    pub fn from_config(
        config: &EngineConfig,
        registry: Arc<ProviderRegistry>,
        ledger: Arc<dyn CreditLedger>,
    ) -> Self {
        Self {
            dispatcher: Dispatcher::from_config(registry.clone(), config),
            registry,
            ledger: LedgerGateway::new(ledger),
            max_in_flight: config.max_in_flight(),
        }
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// Timestamps usage events with `clock`; the ledger is kept.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.ledger = self.ledger.with_clock(clock);
        self
    }

    pub fn validate(tasks: &[Task]) -> Result<(), BatchError> {
        if tasks.is_empty() {
            return Err(BatchError::Validation("batch has no tasks".to_string()));
        }
        if tasks.len() > MAX_BATCH_SIZE {
            return Err(BatchError::Validation(format!(
                "batch has {} tasks, at most {MAX_BATCH_SIZE} are allowed",
                tasks.len()
            )));
        }
        if let Some(index) = tasks.iter().position(|task| task.prompt.trim().is_empty()) {
            return Err(BatchError::Validation(format!(
                "task {index} has an empty prompt"
            )));
        }
        Ok(())
    }

    /// Worst-case cost of the batch, as if every task succeeded.
    pub fn credits_requested(&self, tasks: &[Task]) -> Result<u64, BatchError> {
        tasks.iter().try_fold(0u64, |total, task| {
            let provider = task.provider_id();
            let cost = self
                .registry
                .credit_cost(&provider)
                .ok_or(BatchError::UnknownProvider { provider })?;
            Ok(total.saturating_add(cost))
        })
    }

    pub async fn run(&self, account: &str, tasks: Vec<Task>) -> Result<BatchReport, BatchError> {
        self.run_with_cancel(account, tasks, CancellationToken::new())
            .await
    }

    /// Cancelling `cancel` fails every task that has not finished yet; the
    /// report is still assembled and settled for the ones that did.
    #[tracing::instrument(skip_all, fields(account = %account, tasks = tasks.len()))]
    pub async fn run_with_cancel(
        &self,
        account: &str,
        tasks: Vec<Task>,
        cancel: CancellationToken,
    ) -> Result<BatchReport, BatchError> {
        Self::validate(&tasks)?;
        let credits_requested = self.credits_requested(&tasks)?;

        match self.ledger.reserve(account, credits_requested).await? {
            Affordability::Ok { balance } => {
                tracing::info!(credits_requested, balance, "batch accepted");
            }
            Affordability::Insufficient { balance } => {
                tracing::info!(credits_requested, balance, "batch rejected: insufficient credits");
                return Err(BatchError::InsufficientCredits {
                    required: credits_requested,
                    available: balance,
                });
            }
        }

        let results: Vec<TaskResult> = stream::iter(tasks.iter().enumerate())
            .map(|(index, task)| {
                let cancel = cancel.child_token();
                let dispatcher = &self.dispatcher;
                async move { dispatcher.dispatch_indexed(index, task, &cancel).await }
            })
            .buffered(self.max_in_flight.max(1))
            .collect()
            .await;

        let usage = UsageEvent::from_results(
            self.ledger.now_epoch_seconds(),
            account,
            &results,
            |provider| self.registry.credit_cost(provider).unwrap_or(0),
        );
        let credits_used = usage.credits_used;
        let (accounting, credits_remaining) =
            self.ledger.debit(account, credits_used, &usage).await;

        let successful = usage.task_details.success_count;
        let failed = usage.task_details.failure_count;
        tracing::info!(successful, failed, credits_used, ?accounting, "batch finished");

        Ok(BatchReport {
            total_tasks: results.len(),
            successful,
            failed,
            credits_requested,
            credits_used,
            credits_remaining,
            accounting,
            results,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageAdapter;
    use crate::ledger::InMemoryLedger;
    use crate::registry::{Capability, ProviderDescriptor};
    use crate::types::{Accounting, ImageReference};
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl ImageAdapter for Echo {
        fn provider(&self) -> &str {
            "echo"
        }

        async fn generate(
            &self,
            task: &Task,
            _cancel: &CancellationToken,
        ) -> crate::Result<ImageReference> {
            Ok(ImageReference::url(format!("https://img.example/{}", task.prompt)))
        }
    }

    fn executor(balance: u64) -> (BatchExecutor, Arc<InMemoryLedger>) {
        let mut registry = ProviderRegistry::new();
        registry
            .register(
                ProviderDescriptor {
                    id: "echo".to_string(),
                    credit_cost: 3,
                    capability: Capability::Synchronous,
                },
                Echo,
            )
            .expect("register");
        let ledger = Arc::new(InMemoryLedger::with_account("u1", balance));
        (
            BatchExecutor::new(Arc::new(registry), ledger.clone()),
            ledger,
        )
    }

    #[test]
    fn validation_rejects_empty_oversized_and_blank_prompts() {
        assert!(matches!(
            BatchExecutor::validate(&[]),
            Err(BatchError::Validation(_))
        ));

        let oversized = vec![Task::new("x", "echo"); MAX_BATCH_SIZE + 1];
        assert!(matches!(
            BatchExecutor::validate(&oversized),
            Err(BatchError::Validation(_))
        ));
        assert!(BatchExecutor::validate(&oversized[..MAX_BATCH_SIZE]).is_ok());

        let blank = vec![Task::new("x", "echo"), Task::new("  ", "echo")];
        let err = BatchExecutor::validate(&blank).expect_err("blank prompt");
        assert!(err.to_string().contains("task 1"));
    }

    #[tokio::test]
    async fn small_batch_is_charged_per_success() -> Result<(), BatchError> {
        let (executor, ledger) = executor(10);
        let report = executor
            .run(
                "u1",
                vec![Task::new("a", "echo"), Task::new("b", "ECHO")],
            )
            .await?;

        assert_eq!(report.total_tasks, 2);
        assert_eq!(report.successful, 2);
        assert_eq!(report.credits_requested, 6);
        assert_eq!(report.credits_used, 6);
        assert_eq!(report.credits_remaining, Some(4));
        assert_eq!(report.accounting, Accounting::Charged);
        assert_eq!(ledger.usage_log("u1").await.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn insufficient_credits_rejects_before_running() {
        let (executor, ledger) = executor(5);
        let err = executor
            .run(
                "u1",
                vec![Task::new("a", "echo"), Task::new("b", "echo")],
            )
            .await
            .expect_err("insufficient");

        assert!(matches!(
            err,
            BatchError::InsufficientCredits {
                required: 6,
                available: 5
            }
        ));
        assert!(ledger.usage_log("u1").await.is_empty());
    }

    #[tokio::test]
    async fn unknown_account_is_a_ledger_error() {
        let (executor, _) = executor(5);
        let err = executor
            .run("nobody", vec![Task::new("a", "echo")])
            .await
            .expect_err("unknown account");
        assert!(matches!(err, BatchError::Ledger(LedgerError::UnknownAccount(_))));
    }

    struct FrozenClock;

    impl Clock for FrozenClock {
        fn now_epoch_seconds(&self) -> u64 {
            1_700_000_000
        }
    }

    #[tokio::test]
    async fn usage_event_carries_the_injected_clock() -> Result<(), BatchError> {
        let (executor, ledger) = executor(10);
        let executor = executor.with_clock(Arc::new(FrozenClock));

        let report = executor.run("u1", vec![Task::new("a", "echo")]).await?;

        assert_eq!(report.accounting, Accounting::Charged);
        assert_eq!(report.credits_remaining, Some(7));
        let log = ledger.usage_log("u1").await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].timestamp, 1_700_000_000);
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_batch_still_reports_and_charges_nothing() -> Result<(), BatchError> {
        let (executor, ledger) = executor(10);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = executor
            .run_with_cancel("u1", vec![Task::new("a", "echo")], cancel)
            .await?;

        assert_eq!(report.failed, 1);
        assert_eq!(report.credits_used, 0);
        assert_eq!(report.credits_remaining, Some(10));
        assert_eq!(ledger.usage_log("u1").await.len(), 1);
        Ok(())
    }
}
