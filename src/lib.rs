//! Simulated federated learning: skewed data partitioning, resource-constrained
//! concurrent local training and federated averaging, plus the HTTP services that
//! expose a run's progress.

pub mod compute;
pub mod config;
pub mod data;
pub mod gateway;
pub mod model;
pub mod orchestra;
pub mod simulation;

pub use config::SimulationConfig;
pub use simulation::{simulate, Simulation, SimulationError};
