//! Infrastructure layer: job orchestration, processors, persistence and
//! notification adapters.

pub mod config;
pub mod content;
pub mod jobs;
pub mod notify;
pub mod processors;
pub mod schema;
pub mod workers;

mod integration_tests;
