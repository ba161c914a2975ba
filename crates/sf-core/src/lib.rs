pub mod config;
pub mod crypto;
pub mod error;
pub mod repository;
pub mod store;
pub mod types;
