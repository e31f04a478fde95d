//! The navigation service
//!
//! [`NavService`] owns the loaded mesh, a pool of query contexts and the crowd.
//! The mesh is read-only after load and is shared without locking. The crowd
//! and the agent directory sit behind one mutex, so a directory lookup and the
//! slot mutation that follows it happen atomically with respect to the tick.
//!
//! Operations return [`ServiceResult`]; expected outcomes such as an unknown
//! agent or no polygon near a point are [`ServiceError::is_expected`] and only
//! logged at debug level.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use detour::{load_mesh_set, load_mesh_set_file, NavMesh, PolyRef, QueryFilter};
use detour_common::{dt_vdist_2d, Error, Status};
use detour_crowd::{Crowd, CrowdAgent, DtObstacleAvoidanceParams, MoveRequestState};
use serde::{Deserialize, Serialize};

use crate::agent_directory::{AgentDirectory, NpcId};
use crate::config::ServiceConfig;
use crate::error::{not_found_at, ServiceError, ServiceResult};
use crate::query_pool::QueryPool;

/// Name reported by health checks
pub const SERVICE_NAME: &str = "npc-nav";

/// Number of obstacle avoidance quality tiers set up on the crowd
const AVOIDANCE_TIERS: u8 = 4;

/// Crowd state guarded by the service mutex
#[derive(Debug)]
struct CrowdState {
    crowd: Crowd,
    agents: AgentDirectory,
}

impl CrowdState {
    /// Slot of a registered agent that still occupies its crowd slot
    fn active_slot(&self, id: &str) -> ServiceResult<usize> {
        let slot = self.agents.slot(id)?;
        if self.crowd.agent(slot).is_none() {
            return Err(ServiceError::InactiveAgent(id.to_string()));
        }
        Ok(slot)
    }

    fn active_agent(&self, id: &str) -> ServiceResult<&CrowdAgent> {
        let slot = self.agents.slot(id)?;
        self.crowd
            .agent(slot)
            .ok_or_else(|| ServiceError::InactiveAgent(id.to_string()))
    }

    fn active_agent_mut(&mut self, id: &str) -> ServiceResult<&mut CrowdAgent> {
        let slot = self.agents.slot(id)?;
        self.crowd
            .agent_mut(slot)
            .ok_or_else(|| ServiceError::InactiveAgent(id.to_string()))
    }
}

#[derive(Debug, Default)]
struct StatsCounters {
    agents_added: AtomicU64,
    agents_removed: AtomicU64,
    targets_set: AtomicU64,
    stops: AtomicU64,
    force_stops: AtomicU64,
    path_queries: AtomicU64,
    ticks: AtomicU64,
}

impl StatsCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Operation counters since the service started
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStats {
    pub agents_added: u64,
    pub agents_removed: u64,
    pub targets_set: u64,
    pub stops: u64,
    pub force_stops: u64,
    pub path_queries: u64,
    pub ticks: u64,
}

/// Health report of a running service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub service: String,
    pub tiles: usize,
    pub polygons: usize,
    pub active_agents: usize,
    pub max_agents: usize,
}

/// Read-only view of one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: NpcId,
    pub position: [f32; 3],
    pub velocity: [f32; 3],
    pub target_state: MoveRequestState,
    pub target: Option<[f32; 3]>,
    pub max_acceleration: f32,
}

/// NPC pathfinding and crowd steering over one navigation mesh
#[derive(Debug)]
pub struct NavService {
    config: ServiceConfig,
    nav_mesh: Arc<NavMesh>,
    queries: QueryPool,
    filter: QueryFilter,
    state: Mutex<CrowdState>,
    stats: StatsCounters,
}

impl NavService {
    /// Loads a mesh-set asset from disk and starts a service on it
    pub fn load<P: AsRef<Path>>(path: P, config: ServiceConfig) -> ServiceResult<Self> {
        let path = path.as_ref();
        log::info!("Loading navigation mesh from {}", path.display());
        let nav_mesh = load_mesh_set_file(path)?;
        Self::from_mesh(nav_mesh, config)
    }

    /// Starts a service on an in-memory mesh-set asset
    pub fn from_bytes(data: &[u8], config: ServiceConfig) -> ServiceResult<Self> {
        let nav_mesh = load_mesh_set(data)?;
        Self::from_mesh(nav_mesh, config)
    }

    pub fn from_mesh(nav_mesh: NavMesh, config: ServiceConfig) -> ServiceResult<Self> {
        config.validate().map_err(ServiceError::Config)?;

        let nav_mesh = Arc::new(nav_mesh);
        let queries = QueryPool::new(Arc::clone(&nav_mesh), config.query_pool_size, config.max_nodes);

        let mut crowd = Crowd::new(Arc::clone(&nav_mesh), config.max_agents, config.max_agent_radius);
        for tier in 0..AVOIDANCE_TIERS {
            crowd.set_obstacle_avoidance_params(tier as usize, DtObstacleAvoidanceParams::for_quality(tier))?;
        }

        log::info!(
            "Navigation service ready: {} tiles, {} polygons, {} agent slots",
            nav_mesh.tile_count(),
            nav_mesh.poly_count(),
            config.max_agents
        );

        Ok(Self {
            config,
            nav_mesh,
            queries,
            filter: QueryFilter::default(),
            state: Mutex::new(CrowdState {
                crowd,
                agents: AgentDirectory::new(),
            }),
            stats: StatsCounters::default(),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn nav_mesh(&self) -> &Arc<NavMesh> {
        &self.nav_mesh
    }

    fn lock(&self) -> ServiceResult<MutexGuard<'_, CrowdState>> {
        self.state
            .lock()
            .map_err(|_| ServiceError::Internal(Error::Crowd("crowd state lock poisoned".to_string())))
    }

    fn find_nearest(&self, pos: &[f32; 3], extents: &[f32; 3]) -> ServiceResult<(PolyRef, [f32; 3])> {
        let query = self.queries.acquire();
        query.find_nearest_poly(pos, extents, &self.filter).map_err(not_found_at(pos))
    }

    /// Closest point on the walkable surface near `pos`
    pub fn nearest_point(&self, pos: &[f32; 3]) -> ServiceResult<[f32; 3]> {
        let (_, point) = self.find_nearest(pos, &self.config.nearest_extents)?;
        Ok(point)
    }

    /// True unless a wall blocks the straight line from `start` to `end`
    ///
    /// A start with no polygon nearby counts as visible.
    pub fn has_line_of_sight(&self, start: &[f32; 3], end: &[f32; 3]) -> bool {
        let query = self.queries.acquire();
        let (start_ref, start_pt) =
            match query.find_nearest_poly(start, &self.config.line_of_sight_extents, &self.filter) {
                Ok(found) => found,
                Err(e) => {
                    log::debug!("No polygon near line of sight start {:?}: {}", start, e);
                    return true;
                }
            };

        match query.raycast(start_ref, &start_pt, end, &self.filter, self.config.line_of_sight_max_polys) {
            Ok(hit) => hit.reaches_end(),
            Err(e) => {
                log::debug!("Line of sight raycast from {:?} failed: {}", start_pt, e);
                false
            }
        }
    }

    /// Straightened path from `start` to `end`
    ///
    /// Empty when either end has no polygon nearby or no corridor exists. When
    /// the end cannot be reached the path stops at the closest reachable point.
    pub fn find_path(&self, start: &[f32; 3], end: &[f32; 3]) -> Vec<[f32; 3]> {
        StatsCounters::bump(&self.stats.path_queries);
        match self.try_find_path(start, end) {
            Ok(points) => points,
            Err(e) => {
                e.log("find_path");
                Vec::new()
            }
        }
    }

    fn try_find_path(&self, start: &[f32; 3], end: &[f32; 3]) -> ServiceResult<Vec<[f32; 3]>> {
        let extents = &self.config.path_extents;
        let mut query = self.queries.acquire();
        let (start_ref, start_pt) = query
            .find_nearest_poly(start, extents, &self.filter)
            .map_err(not_found_at(start))?;
        let (end_ref, end_pt) = query
            .find_nearest_poly(end, extents, &self.filter)
            .map_err(not_found_at(end))?;

        let polys = query.find_path(
            start_ref,
            end_ref,
            &start_pt,
            &end_pt,
            &self.filter,
            self.config.max_path_polys,
        )?;
        if polys.is_empty() {
            return Ok(Vec::new());
        }

        let path = query.find_straight_path(&start_pt, &end_pt, &polys, self.config.max_straight_path_points)?;
        Ok(path.waypoints)
    }

    /// Adds an agent for `id` at the walkable point nearest `pos`
    pub fn add_agent(&self, id: &str, pos: &[f32; 3]) -> ServiceResult<()> {
        let (_, point) = self.find_nearest(pos, &self.config.nearest_extents)?;

        let mut state = self.lock()?;
        if state.agents.contains(id) {
            return Err(ServiceError::DuplicateAgent(id.to_string()));
        }

        let params = self.config.agent_profile.agent_params();
        let slot = state.crowd.add_agent(&point, &params).map_err(|e| match e.status() {
            Some(Status::CrowdFull) => ServiceError::CrowdFull(self.config.max_agents),
            _ => ServiceError::Internal(e),
        })?;
        state.agents.insert(id, slot)?;
        drop(state);

        StatsCounters::bump(&self.stats.agents_added);
        log::info!("Added agent {} at {:?} (slot {})", id, point, slot);
        Ok(())
    }

    /// Removes the agent and frees its crowd slot
    pub fn remove_agent(&self, id: &str) -> ServiceResult<()> {
        let mut state = self.lock()?;
        let slot = state.agents.remove(id)?;
        if let Err(e) = state.crowd.remove_agent(slot) {
            log::warn!("Agent {} had no active crowd slot {}: {}", id, slot, e);
        }
        drop(state);

        StatsCounters::bump(&self.stats.agents_removed);
        log::info!("Removed agent {}", id);
        Ok(())
    }

    /// Sends the agent towards the walkable point nearest `target`
    ///
    /// Any previous target is dropped first, even when no point is found near
    /// the new one.
    pub fn set_target(&self, id: &str, target: &[f32; 3]) -> ServiceResult<()> {
        let mut state = self.lock()?;
        let slot = state.active_slot(id)?;
        state.crowd.reset_move_target(slot)?;

        let (target_ref, point) = self.find_nearest(target, &self.config.target_extents)?;
        state.crowd.request_move_target(slot, target_ref, &point)?;
        drop(state);

        StatsCounters::bump(&self.stats.targets_set);
        log::debug!("Agent {} targeting {:?}", id, point);
        Ok(())
    }

    /// Drops the target and zeroes the agent's velocity
    pub fn stop(&self, id: &str) -> ServiceResult<()> {
        let mut state = self.lock()?;
        let slot = state.active_slot(id)?;
        state.crowd.reset_move_target(slot)?;

        let agent = state.active_agent_mut(id)?;
        agent.vel = [0.0; 3];
        agent.dvel = [0.0; 3];
        agent.nvel = [0.0; 3];
        drop(state);

        StatsCounters::bump(&self.stats.stops);
        Ok(())
    }

    /// Stops the agent hard
    ///
    /// Velocities are zeroed and the agent is held on a zero velocity request,
    /// so no pending path steers it on the next tick. Its max acceleration
    /// becomes `brake_force` times the configured brake multiplier and stays
    /// that way until parameters are changed again. A missing or non-positive
    /// brake force uses the configured default.
    pub fn force_stop(&self, id: &str, brake_force: Option<f32>) -> ServiceResult<()> {
        let brake_force = match brake_force {
            Some(force) if force.is_finite() && force > 0.0 => force,
            _ => self.config.default_brake_force,
        };

        let mut state = self.lock()?;
        let slot = state.active_slot(id)?;

        let agent = state.active_agent_mut(id)?;
        agent.vel = [0.0; 3];
        agent.dvel = [0.0; 3];
        agent.nvel = [0.0; 3];
        let mut params = agent.params;
        params.max_acceleration = brake_force * self.config.brake_multiplier;

        state.crowd.request_move_velocity(slot, &[0.0; 3])?;
        state.crowd.update_agent_parameters(slot, &params)?;
        drop(state);

        StatsCounters::bump(&self.stats.force_stops);
        log::info!(
            "Force stopped agent {} with brake force {} (max acceleration {})",
            id,
            brake_force,
            params.max_acceleration
        );
        Ok(())
    }

    /// True if the agent has a planned target within `threshold` on the XZ plane
    pub fn is_at_target(&self, id: &str, threshold: Option<f32>) -> bool {
        let threshold = threshold.unwrap_or(self.config.default_arrival_threshold);
        let state = match self.lock() {
            Ok(state) => state,
            Err(e) => {
                e.log("is_at_target");
                return false;
            }
        };
        match state.active_agent(id) {
            Ok(agent) => {
                agent.target_state == MoveRequestState::Valid
                    && dt_vdist_2d(&agent.npos, &agent.target_pos) <= threshold
            }
            Err(e) => {
                e.log("is_at_target");
                false
            }
        }
    }

    pub fn position(&self, id: &str) -> ServiceResult<[f32; 3]> {
        Ok(*self.lock()?.active_agent(id)?.position())
    }

    pub fn velocity(&self, id: &str) -> ServiceResult<[f32; 3]> {
        Ok(*self.lock()?.active_agent(id)?.velocity())
    }

    pub fn agent_snapshot(&self, id: &str) -> ServiceResult<AgentSnapshot> {
        let state = self.lock()?;
        let agent = state.active_agent(id)?;
        let target = matches!(
            agent.target_state,
            MoveRequestState::Requesting | MoveRequestState::Valid
        )
        .then_some(agent.target_pos);
        Ok(AgentSnapshot {
            id: id.to_string(),
            position: agent.npos,
            velocity: agent.vel,
            target_state: agent.target_state,
            target,
            max_acceleration: agent.params.max_acceleration,
        })
    }

    /// Registered agent ids in ascending order
    pub fn agent_ids(&self) -> Vec<NpcId> {
        match self.lock() {
            Ok(state) => state.agents.ids(),
            Err(e) => {
                e.log("agent_ids");
                Vec::new()
            }
        }
    }

    /// Advances the crowd by `dt` seconds
    pub fn tick(&self, dt: f32) -> ServiceResult<()> {
        let samples = {
            let mut state = self.lock()?;
            state.crowd.update(dt)?;
            state.crowd.velocity_sample_count()
        };
        StatsCounters::bump(&self.stats.ticks);
        log::trace!("Tick of {}s evaluated {} avoidance samples", dt, samples);
        Ok(())
    }

    pub fn health(&self) -> HealthReport {
        let (active_agents, max_agents) = self
            .lock()
            .map(|state| (state.crowd.active_agent_count(), state.crowd.agent_count()))
            .unwrap_or((0, self.config.max_agents));
        HealthReport {
            status: "ok".to_string(),
            service: SERVICE_NAME.to_string(),
            tiles: self.nav_mesh.tile_count(),
            polygons: self.nav_mesh.poly_count(),
            active_agents,
            max_agents,
        }
    }

    pub fn stats(&self) -> ServiceStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ServiceStats {
            agents_added: load(&self.stats.agents_added),
            agents_removed: load(&self.stats.agents_removed),
            targets_set: load(&self.stats.targets_set),
            stops: load(&self.stats.stops),
            force_stops: load(&self.stats.force_stops),
            path_queries: load(&self.stats.path_queries),
            ticks: load(&self.stats.ticks),
        }
    }
}
