pub mod compare;
pub mod config;
pub mod config_validation;
pub mod driver;
pub mod errors;
pub mod finalize;
pub mod forward;
pub mod gate;
pub mod generator;
pub mod listener;
pub mod locator;
pub mod metrics;
pub mod results;
pub mod science;
pub mod storage;
pub mod tls;
pub mod tree_hash;
pub mod utils;
