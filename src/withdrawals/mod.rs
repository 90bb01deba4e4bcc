// Outbound withdrawals: guarded state machine plus the batch processor
pub mod memory;
pub mod models;
pub mod processor;
pub mod repository;

pub use memory::InMemoryWithdrawalStore;
pub use models::{NewWithdrawal, Withdrawal};
pub use processor::{
    AdapterWithdrawalExecutor, BatchSummary, DebitSweep, ExecutionOutcome, ProcessorConfig,
    WithdrawalExecutor, WithdrawalProcessor,
};
pub use repository::{PgWithdrawalRepository, WithdrawalStore};
