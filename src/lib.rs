pub mod config;
pub mod db;
pub mod logging;
pub mod metrics_server;
pub mod selector;
pub mod version;
