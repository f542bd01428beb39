/// REST API for the ledger daemon
///
/// Lets operators and scripts drive a node over HTTP: inspect the chain,
/// balances and pending pool, submit transactions, mine, sync with peers and
/// run the clinic, lab and pharmacy workflow steps.

pub mod handlers;
pub mod responses;
pub mod server;

pub use server::{router, ApiServer};
pub use responses::*;
