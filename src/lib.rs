pub mod api;
pub mod clients;
pub mod config;
pub mod consumers;
pub mod error;
pub mod logging;
pub mod models;
pub mod utils;
pub mod worker;
