pub mod config;

pub use config::Connection;
