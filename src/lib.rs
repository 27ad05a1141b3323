pub mod access_log;
pub mod body;
pub mod config;
pub mod constants;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod server;
pub mod storage;
pub mod upstream;
