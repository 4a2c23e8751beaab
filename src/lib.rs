pub mod channels;
pub mod cleanup;
pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod log;
pub mod orchestration;
pub mod planner;
pub mod ports;
pub mod run;
pub mod service;
pub mod spawner;
pub mod store;

pub use error::{Error, Result};
pub use service::{Conductor, ConductorBuilder, RunHandle};
