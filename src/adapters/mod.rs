pub mod events;
pub mod mock;
pub mod rpc;
pub mod traits;

pub use events::SettlementPush;
pub use mock::MockSettlementAdapter;
pub use rpc::{RpcAdapterConfig, RpcSettlementAdapter};
pub use traits::{
    AdapterResult, CreatedInvoice, InvoiceRequest, ObservedInvoiceState, SettlementAdapter,
    SettlementListener, SubscriptionHandle, WithdrawalReceipt, WithdrawalRequest,
};
