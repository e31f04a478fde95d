//! Multi-agent crowd simulation on navigation meshes
//!
//! This crate moves groups of agents over a shared [`detour::NavMesh`]. Each
//! agent follows a polygon corridor towards its target while local steering
//! keeps it clear of neighbours and walls.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use detour_crowd::{AgentParams, Crowd};
//!
//! let mut crowd = Crowd::new(Arc::new(nav_mesh), 50, 0.6);
//! let agent = crowd.add_agent(&start_pos, &AgentParams::default())?;
//! crowd.request_move_target(agent, target_poly, &target_pos)?;
//!
//! // Once per frame
//! crowd.update(delta_time)?;
//! ```
//!
//! # Architecture
//!
//! - [`Crowd`]: agent slots and the per-frame update
//! - [`PathCorridor`]: the polygon corridor an agent follows
//! - [`DtLocalBoundary`]: nearby wall segments
//! - [`DtObstacleAvoidanceQuery`]: sampled velocity obstacle avoidance
//! - [`ProximityGrid`]: spatial hash for neighbour lookups

pub mod crowd;
pub mod local_boundary;
pub mod obstacle_avoidance;
pub mod path_corridor;
pub mod proximity_grid;

pub use crowd::*;
pub use local_boundary::*;
pub use obstacle_avoidance::*;
pub use path_corridor::*;
pub use proximity_grid::*;
