pub mod batch;
pub mod config;
pub mod dispatch;
mod error;
pub mod image;
pub mod ledger;
pub mod poll;
pub mod providers;
pub mod registry;
pub mod types;

pub use error::{ErrorKind, ImagegenError, Result};

pub use batch::{BatchError, BatchExecutor, MAX_BATCH_SIZE};
pub use config::{ConfigError, EngineConfig, Env, ProviderOverride};
pub use dispatch::Dispatcher;
pub use image::ImageAdapter;
pub use ledger::{
    Affordability, Clock, CreditLedger, InMemoryLedger, LedgerError, LedgerGateway, SystemClock,
    UsageEvent,
};
pub use poll::{AsyncJobHandle, JobState, PollDriver, PollSource, PollStatus};
pub use registry::{Capability, ProviderDescriptor, ProviderRegistry, builtin_descriptors};
pub use types::{
    Accounting, BatchReport, ImageReference, Parameters, Task, TaskResult, TaskStatus,
};
