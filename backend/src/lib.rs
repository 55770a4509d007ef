pub mod assignment;
pub mod blob;
pub mod config;
pub mod db;
pub mod ledger;
pub mod metrics;
pub mod store;

pub mod error;
pub mod logger;
pub mod time;
