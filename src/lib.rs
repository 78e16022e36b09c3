pub mod auth;
pub mod consolidate;
pub mod logging;
pub mod server;
pub mod store;
