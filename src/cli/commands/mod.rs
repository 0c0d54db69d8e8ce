pub mod clean;
pub mod complete;
pub mod config;
pub mod health;
pub mod status;
