pub mod auth;
pub mod health;
pub mod metrics;
pub mod roles;
pub mod users;
