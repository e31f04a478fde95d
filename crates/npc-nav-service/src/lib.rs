//! NPC pathfinding and crowd steering service
//!
//! Loads a mesh-set asset once, then serves path queries and drives a crowd of
//! NPC agents from concurrent request handlers while a background task ticks
//! the simulation.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use npc_nav_service::{NavService, ServiceConfig, TickScheduler};
//!
//! let config = ServiceConfig::default();
//! let service = Arc::new(NavService::load("world.bin", config.clone())?);
//! let scheduler = TickScheduler::start(Arc::clone(&service), &config.tick);
//!
//! service.add_agent("wolf-17", &[12.0, 0.0, 4.0])?;
//! service.set_target("wolf-17", &[20.0, 0.0, 9.0])?;
//! ```

pub mod agent_directory;
pub mod api;
pub mod config;
pub mod error;
pub mod query_pool;
pub mod scheduler;
pub mod service;

pub use agent_directory::{AgentDirectory, NpcId};
pub use api::{NavRequest, NavResponse};
pub use config::{AgentProfile, ServiceConfig, TickConfig};
pub use error::{ServiceError, ServiceResult};
pub use query_pool::{QueryGuard, QueryPool};
pub use scheduler::TickScheduler;
pub use service::{AgentSnapshot, HealthReport, NavService, ServiceStats, SERVICE_NAME};

#[cfg(test)]
mod service_tests;
