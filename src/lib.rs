pub mod chunks;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod intake;
pub mod jobs;
pub mod models;
pub mod registry;
pub mod routes;
pub mod schema;
pub mod state;
pub mod storage;
pub mod workers;

pub use workers::{JobExecution, Worker};
