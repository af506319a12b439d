pub mod config;
pub mod durable;
pub mod engine;
pub mod fetcher;
pub mod model;
pub mod notify;
pub mod observability;
pub mod poller;
pub mod storage;
pub mod wal;
