//! Credit accounting around a batch: a pre-flight affordability check and a
//! single post-hoc debit for the tasks that actually produced an image.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::types::{Accounting, TaskResult};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("unknown account: {0}")]
    UnknownAccount(String),
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// External credit store. Balances are referenced, never owned, by the engine.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    async fn get_balance(&self, account: &str) -> Result<u64, LedgerError>;

    /// Returns `false` when the ledger declines the debit.
    async fn debit(
        &self,
        account: &str,
        amount: u64,
        usage: &UsageEvent,
    ) -> Result<bool, LedgerError>;
}

pub trait Clock: Send + Sync {
    fn now_epoch_seconds(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0));
        now.as_secs()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub succeeded: usize,
    pub failed: usize,
    pub credits: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDetails {
    pub task_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub providers_used: Vec<String>,
    pub per_provider: BTreeMap<String, ProviderUsage>,
}

/// One entry of an account's usage log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub timestamp: u64,
    pub user_id: String,
    pub credits_used: u64,
    pub task_details: TaskDetails,
}

impl UsageEvent {
    /// Summarizes `results`; `cost` prices one successful task of a provider.
    pub fn from_results(
        timestamp: u64,
        user_id: impl Into<String>,
        results: &[TaskResult],
        cost: impl Fn(&str) -> u64,
    ) -> Self {
        let mut details = TaskDetails {
            task_count: results.len(),
            ..TaskDetails::default()
        };
        let mut credits_used = 0u64;

        for result in results {
            let usage = details
                .per_provider
                .entry(result.provider.clone())
                .or_default();
            if result.is_success() {
                let credits = cost(&result.provider);
                usage.succeeded += 1;
                usage.credits = usage.credits.saturating_add(credits);
                credits_used = credits_used.saturating_add(credits);
                details.success_count += 1;
            } else {
                usage.failed += 1;
                details.failure_count += 1;
            }
        }
        details.providers_used = details.per_provider.keys().cloned().collect();

        Self {
            timestamp,
            user_id: user_id.into(),
            credits_used,
            task_details: details,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affordability {
    Ok { balance: u64 },
    Insufficient { balance: u64 },
}

/// Wraps a [`CreditLedger`] with the engine's accounting rules.
#[derive(Clone)]
pub struct LedgerGateway {
    ledger: Arc<dyn CreditLedger>,
    clock: Arc<dyn Clock>,
}

impl LedgerGateway {
    pub fn new(ledger: Arc<dyn CreditLedger>) -> Self {
        Self {
            ledger,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now_epoch_seconds(&self) -> u64 {
        self.clock.now_epoch_seconds()
    }

    /// Pre-flight check only; nothing is held.
    pub async fn reserve(&self, account: &str, requested: u64) -> Result<Affordability, LedgerError> {
        let balance = self.ledger.get_balance(account).await?;
        if balance < requested {
            return Ok(Affordability::Insufficient { balance });
        }
        Ok(Affordability::Ok { balance })
    }

    /// Debits `charged` once. Never fails: ledger trouble is reported through
    /// the returned [`Accounting`]. The second value is the balance after a
    /// successful charge, when the ledger can still report it.
    pub async fn debit(
        &self,
        account: &str,
        charged: u64,
        usage: &UsageEvent,
    ) -> (Accounting, Option<u64>) {
        let accounting = match self.ledger.debit(account, charged, usage).await {
            Ok(true) => Accounting::Charged,
            Ok(false) => {
                tracing::error!(account, charged, "ledger declined the batch debit");
                Accounting::Rejected
            }
            Err(err) => {
                tracing::error!(account, charged, error = %err, "batch debit failed");
                Accounting::Failed {
                    message: err.to_string(),
                }
            }
        };

        let remaining = match self.ledger.get_balance(account).await {
            Ok(balance) => Some(balance),
            Err(err) => {
                tracing::warn!(account, error = %err, "could not read balance after debit");
                None
            }
        };
        (accounting, remaining)
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    balances: HashMap<String, u64>,
    usage: HashMap<String, Vec<UsageEvent>>,
}

/// Process-local ledger for the CLI and tests.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(account: impl Into<String>, balance: u64) -> Self {
        let mut state = LedgerState::default();
        state.balances.insert(account.into(), balance);
        Self {
            state: Mutex::new(state),
        }
    }

    pub async fn set_balance(&self, account: impl Into<String>, balance: u64) {
        self.state
            .lock()
            .await
            .balances
            .insert(account.into(), balance);
    }

    /// Usage events for `account`, newest first.
    pub async fn usage_log(&self, account: &str) -> Vec<UsageEvent> {
        self.state
            .lock()
            .await
            .usage
            .get(account)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl CreditLedger for InMemoryLedger {
    async fn get_balance(&self, account: &str) -> Result<u64, LedgerError> {
        self.state
            .lock()
            .await
            .balances
            .get(account)
            .copied()
            .ok_or_else(|| LedgerError::UnknownAccount(account.to_string()))
    }

    async fn debit(
        &self,
        account: &str,
        amount: u64,
        usage: &UsageEvent,
    ) -> Result<bool, LedgerError> {
        let mut state = self.state.lock().await;
        let Some(balance) = state.balances.get_mut(account) else {
            return Err(LedgerError::UnknownAccount(account.to_string()));
        };
        if *balance < amount {
            return Ok(false);
        }
        *balance -= amount;
        state
            .usage
            .entry(account.to_string())
            .or_default()
            .insert(0, usage.clone());
        Ok(true)
    }
}
