//! Business logic services for conciliacao-service.

pub mod audit;
pub mod competence;
pub mod database;
pub mod lytex;
pub mod metrics;
pub mod status;
pub mod sync;

pub use audit::SyncRunLog;
pub use database::{Database, LedgerStore, PaidUpdate};
pub use lytex::{FetchedInvoice, InvoiceGateway, InvoicePage, LytexClient};
pub use metrics::{get_metrics, init_metrics};
pub use sync::SyncEngine;
