pub mod cancel;
pub mod config;
pub mod error;
pub mod types;
