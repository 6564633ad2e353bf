pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod gaps;
pub mod granule;
pub mod harmonize;
pub mod ledger;
pub mod output;
pub mod pool;
pub mod recovery;
pub mod resolver;
pub mod store;
pub mod validate;
