pub mod codec;
pub mod config;
pub mod error;
pub mod handlers;
pub mod insight;
pub mod memory;
pub mod request_handler;
pub mod session;
pub mod store;
pub mod structure;
pub mod sync;
