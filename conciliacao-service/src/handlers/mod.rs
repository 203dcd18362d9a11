//! HTTP handlers for conciliacao-service.

pub mod sync;

pub use sync::{
    fetch_paid_invoices, fix_contribution_types, get_sync_log, import_external_paid_invoices,
    import_from_lytex, sync_all_pending,
};
