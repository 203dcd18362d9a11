pub mod tracing;

pub use tracing::request_id_middleware;
