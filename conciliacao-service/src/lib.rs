//! Conciliacao Service - keeps the contribution ledger consistent with
//! the state of invoices issued through the Lytex payment gateway.

pub mod config;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;
