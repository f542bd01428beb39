/// CareLedger daemon library
///
/// Hosts a ledger node behind an HTTP API.

pub mod api;

pub use api::ApiServer;
