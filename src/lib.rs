pub mod auth;
pub mod config;
pub mod engine;
pub mod ical;
pub mod journal;
pub mod limits;
pub mod model;
pub mod observability;
pub mod payment;
pub mod reaper;
pub mod schema;
pub mod sql;
pub mod sync;
pub mod tls;
pub mod wal;
pub mod wire;
