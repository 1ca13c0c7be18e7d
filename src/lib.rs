pub mod config;
pub mod distribution;
pub mod error;
pub mod lease;
pub mod ledger;
pub mod local_ledger;
pub mod mirror;
pub mod order;
pub mod product;
pub mod reconcile;
pub mod registry;
pub mod status;
pub mod tracking;
pub mod types;
pub mod utils;
