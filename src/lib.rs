pub mod auth;
pub mod config;
pub mod engine;
pub mod geo;
pub mod limits;
pub mod model;
pub mod observability;
pub mod recompute;
pub mod sql;
pub mod wal;
pub mod wire;
