pub mod api;
pub mod client;
pub mod config;
pub mod credentials;
pub mod event;
pub mod format;
pub mod inline;
pub mod processor;
pub mod prometheus;
pub mod publish;
pub mod retry;
pub mod router;
pub mod server;
pub mod transport;
