pub mod delivery;
pub mod email;
pub mod envelope;
pub mod health;
pub mod retry;
pub mod routing;
pub mod status;
pub mod template;
pub mod topology;
pub mod user;
