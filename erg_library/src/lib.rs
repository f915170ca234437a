//! Erg Library
//!
//! Measures the energy and power an application uses, on one rank or across many cooperating ranks.
//! Sensors are assigned to one rank per host, sampled while the application runs,
//! and reduced into a result tree that accumulates statistics over rounds and executions.

pub mod transaction;
pub mod utils;
#[macro_use]
pub mod macros;
pub mod application;
pub mod clock;
pub mod comm;
pub mod config;
pub mod coordination;
pub mod data;
pub mod errors;
pub mod logging;
pub mod monitor_config;
pub mod orchestrator;
pub mod processing;
pub mod sensor;
pub mod storage;
pub mod threading;
pub mod worker;
