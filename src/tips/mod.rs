// Tip intents: one payment intent per invoice
pub mod memory;
pub mod models;
pub mod repository;

pub use memory::InMemoryTipIntentStore;
pub use models::{InvoiceState, NewTipIntent, TipIntent, TipIntentQuery};
pub use repository::{PgTipIntentRepository, TipIntentStore};
