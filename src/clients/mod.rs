pub mod broker;
pub mod database;
pub mod email;
pub mod health;
pub mod memory;
pub mod publisher;
pub mod rbmq;
pub mod redis;
pub mod store;
pub mod template;
