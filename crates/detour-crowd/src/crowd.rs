//! Crowd management for Detour
//!
//! A [`Crowd`] owns a fixed table of agent slots on a shared navigation mesh.
//! Each [`Crowd::update`] plans pending move requests, keeps the corridors
//! short and straight, steers agents towards their next corners, keeps them
//! apart from each other and from walls, and finally moves them along the mesh
//! surface.

use std::sync::Arc;

use bitflags::bitflags;
use glam::Vec3;
use serde::{Deserialize, Serialize};

use super::local_boundary::DtLocalBoundary;
use super::obstacle_avoidance::{
    DtObstacleAvoidanceParams, DtObstacleAvoidanceQuery, DT_CROWD_MAX_OBSTAVOIDANCE_PARAMS,
};
use super::path_corridor::{PathCorridor, MAX_PATH_POLYS};
use super::proximity_grid::ProximityGrid;
use detour::{NavMesh, NavMeshQuery, Path, PolyRef, QueryContext, QueryFilter, StraightPathFlags};
use detour_common::{dt_sqr, dt_tri_area_2d, dt_vdist_2d, dt_vdist_2d_sqr, Error, Result, Status};

/// The maximum number of neighbors that a crowd agent can take into account
/// for steering decisions.
pub const DT_CROWDAGENT_MAX_NEIGHBOURS: usize = 6;

/// The maximum number of corners a crowd agent will look ahead in the path.
pub const DT_CROWDAGENT_MAX_CORNERS: usize = 4;

/// The maximum number of query filter types supported by the crowd manager.
pub const DT_CROWD_MAX_QUERY_FILTER_TYPE: usize = 16;

/// Wall segments fed to the avoidance query per agent
const MAX_AVOIDANCE_SEGMENTS: usize = 8;

/// Candidates fetched from the proximity grid before filtering
const MAX_NEIGHBOUR_QUERY: usize = 32;

/// Seconds an agent waits between corridor topology optimisations
const OPT_TIME_THR: f32 = 0.5;

const COLLISION_ITERATIONS: usize = 4;
const COLLISION_RESOLVE_FACTOR: f32 = 0.7;

/// Whether the agent stands on the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CrowdAgentState {
    /// The agent is not on any polygon and is left alone by the simulation
    #[default]
    Invalid,
    /// The agent is walking on the mesh
    Walking,
}

/// State of an agent's movement request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MoveRequestState {
    /// No target; the agent holds still
    #[default]
    None,
    /// The last path request found no corridor
    Failed,
    /// The agent follows a planned corridor
    Valid,
    /// A target was set and is planned on the next update
    Requesting,
    /// The agent follows a requested velocity instead of a path
    Velocity,
}

bitflags! {
    /// Crowd agent update flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct UpdateFlags: u8 {
        /// Steer through corners using the one after next as look-ahead
        const ANTICIPATE_TURNS = 0x01;
        /// Pick velocities that avoid neighbours and walls
        const OBSTACLE_AVOIDANCE = 0x02;
        /// Push away from nearby agents
        const SEPARATION = 0x04;
        /// Shortcut the corridor towards visible corners
        const OPTIMIZE_VIS = 0x08;
        /// Periodically replan the corridor start
        const OPTIMIZE_TOPO = 0x10;
    }
}

/// Configuration parameters for a crowd agent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgentParams {
    pub radius: f32,
    pub height: f32,
    pub max_acceleration: f32,
    pub max_speed: f32,
    /// Range within which neighbours and walls are considered
    pub collision_query_range: f32,
    /// Range of the corridor visibility shortcut
    pub path_optimization_range: f32,
    /// How strongly the agent keeps away from neighbours
    pub separation_weight: f32,
    pub update_flags: UpdateFlags,
    /// Index of the obstacle avoidance parameters to use
    pub obstacle_avoidance_type: u8,
    /// Index of the query filter to use
    pub query_filter_type: u8,
}

impl Default for AgentParams {
    fn default() -> Self {
        let radius = 0.6;
        Self {
            radius,
            height: 2.0,
            max_acceleration: 8.0,
            max_speed: 3.5,
            collision_query_range: radius * 12.0,
            path_optimization_range: radius * 30.0,
            separation_weight: 2.0,
            update_flags: UpdateFlags::all(),
            obstacle_avoidance_type: 3,
            query_filter_type: 0,
        }
    }
}

/// A neighbour of an agent, by squared distance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrowdNeighbour {
    pub idx: usize,
    pub dist: f32,
}

/// A crowd agent slot
#[derive(Debug, Clone)]
pub struct CrowdAgent {
    pub active: bool,
    pub state: CrowdAgentState,
    /// True if the planned corridor does not reach the requested target
    pub partial: bool,
    pub corridor: PathCorridor,
    pub boundary: DtLocalBoundary,
    pub topology_opt_time: f32,
    pub neis: Vec<CrowdNeighbour>,
    pub desired_speed: f32,
    /// Current position
    pub npos: [f32; 3],
    /// Displacement accumulated by collision resolution
    pub disp: [f32; 3],
    /// Desired velocity from steering
    pub dvel: [f32; 3],
    /// Velocity chosen by obstacle avoidance
    pub nvel: [f32; 3],
    /// Actual velocity
    pub vel: [f32; 3],
    pub params: AgentParams,
    /// Next corners along the corridor
    pub corners: Path,
    pub target_state: MoveRequestState,
    pub target_ref: PolyRef,
    /// Target position, or the velocity for velocity requests
    pub target_pos: [f32; 3],
}

impl CrowdAgent {
    fn new() -> Self {
        Self {
            active: false,
            state: CrowdAgentState::Invalid,
            partial: false,
            corridor: PathCorridor::new(MAX_PATH_POLYS),
            boundary: DtLocalBoundary::new(),
            topology_opt_time: 0.0,
            neis: Vec::with_capacity(DT_CROWDAGENT_MAX_NEIGHBOURS),
            desired_speed: 0.0,
            npos: [0.0; 3],
            disp: [0.0; 3],
            dvel: [0.0; 3],
            nvel: [0.0; 3],
            vel: [0.0; 3],
            params: AgentParams::default(),
            corners: Path::default(),
            target_state: MoveRequestState::None,
            target_ref: PolyRef::NULL,
            target_pos: [0.0; 3],
        }
    }

    pub fn position(&self) -> &[f32; 3] {
        &self.npos
    }

    pub fn velocity(&self) -> &[f32; 3] {
        &self.vel
    }

    fn is_walking(&self) -> bool {
        self.active && self.state == CrowdAgentState::Walking
    }

    fn follows_path(&self) -> bool {
        !matches!(self.target_state, MoveRequestState::None | MoveRequestState::Velocity)
    }
}

/// Crowd of agents sharing a navigation mesh
#[derive(Debug)]
pub struct Crowd {
    nav_mesh: Arc<NavMesh>,
    context: Option<QueryContext>,
    agents: Vec<CrowdAgent>,
    agent_placement_half_extents: [f32; 3],
    filters: Vec<QueryFilter>,
    obstacle_query: DtObstacleAvoidanceQuery,
    obstacle_query_params: [DtObstacleAvoidanceParams; DT_CROWD_MAX_OBSTAVOIDANCE_PARAMS],
    grid: ProximityGrid,
    velocity_sample_count: usize,
}

impl Crowd {
    /// Creates a crowd with `max_agents` slots
    ///
    /// `max_agent_radius` sizes the placement search box and the proximity grid.
    pub fn new(nav_mesh: Arc<NavMesh>, max_agents: usize, max_agent_radius: f32) -> Self {
        let r = max_agent_radius;
        Self {
            nav_mesh,
            context: Some(QueryContext::default()),
            agents: (0..max_agents).map(|_| CrowdAgent::new()).collect(),
            agent_placement_half_extents: [r * 2.0, r * 1.5, r * 2.0],
            filters: vec![QueryFilter::default(); DT_CROWD_MAX_QUERY_FILTER_TYPE],
            obstacle_query: DtObstacleAvoidanceQuery::new(DT_CROWDAGENT_MAX_NEIGHBOURS, MAX_AVOIDANCE_SEGMENTS),
            obstacle_query_params: [DtObstacleAvoidanceParams::default(); DT_CROWD_MAX_OBSTAVOIDANCE_PARAMS],
            grid: ProximityGrid::new(r * 3.0),
            velocity_sample_count: 0,
        }
    }

    pub fn nav_mesh(&self) -> &Arc<NavMesh> {
        &self.nav_mesh
    }

    /// Number of agent slots
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn active_agent_count(&self) -> usize {
        self.agents.iter().filter(|a| a.active).count()
    }

    /// Samples evaluated by obstacle avoidance during the last update
    pub fn velocity_sample_count(&self) -> usize {
        self.velocity_sample_count
    }

    pub fn set_obstacle_avoidance_params(&mut self, idx: usize, params: DtObstacleAvoidanceParams) -> Result<()> {
        let slot = self
            .obstacle_query_params
            .get_mut(idx)
            .ok_or(Error::Detour(Status::InvalidParam))?;
        *slot = params;
        Ok(())
    }

    /// Returns an active agent
    pub fn agent(&self, idx: usize) -> Option<&CrowdAgent> {
        self.agents.get(idx).filter(|a| a.active)
    }

    pub fn agent_mut(&mut self, idx: usize) -> Option<&mut CrowdAgent> {
        self.agents.get_mut(idx).filter(|a| a.active)
    }

    fn active_agent_mut(&mut self, idx: usize) -> Result<&mut CrowdAgent> {
        self.agent_mut(idx).ok_or(Error::Detour(Status::AgentNotFound))
    }

    /// Adds an agent at the first free slot and returns its index
    ///
    /// The position is snapped to the nearest polygon within the placement
    /// box. An agent with no polygon nearby is kept but stays
    /// [`CrowdAgentState::Invalid`].
    pub fn add_agent(&mut self, pos: &[f32; 3], params: &AgentParams) -> Result<usize> {
        let idx = self
            .agents
            .iter()
            .position(|a| !a.active)
            .ok_or(Error::Detour(Status::CrowdFull))?;

        let filter = &self.filters[filter_index(params.query_filter_type)];
        let query = NavMeshQuery::with_context(&self.nav_mesh, self.context.take().unwrap_or_default());
        let nearest = query.find_nearest_poly(pos, &self.agent_placement_half_extents, filter);
        self.context = Some(query.into_context());

        let (reference, nearest) = match nearest {
            Ok(found) => found,
            Err(e) => {
                log::warn!("No polygon near {:?} for agent {}: {}", pos, idx, e);
                (PolyRef::NULL, *pos)
            }
        };

        let ag = &mut self.agents[idx];
        *ag = CrowdAgent::new();
        ag.params = *params;
        ag.corridor.reset(reference, nearest);
        ag.npos = nearest;
        ag.state = if reference.is_valid() {
            CrowdAgentState::Walking
        } else {
            CrowdAgentState::Invalid
        };
        ag.active = true;

        Ok(idx)
    }

    /// Frees an agent slot
    pub fn remove_agent(&mut self, idx: usize) -> Result<()> {
        let ag = self.active_agent_mut(idx)?;
        ag.active = false;
        Ok(())
    }

    pub fn update_agent_parameters(&mut self, idx: usize, params: &AgentParams) -> Result<()> {
        self.active_agent_mut(idx)?.params = *params;
        Ok(())
    }

    /// Asks for a path to `pos` on polygon `reference`; planned on the next update
    pub fn request_move_target(&mut self, idx: usize, reference: PolyRef, pos: &[f32; 3]) -> Result<()> {
        if !reference.is_valid() {
            return Err(Error::Detour(Status::InvalidParam));
        }
        let ag = self.active_agent_mut(idx)?;
        ag.target_ref = reference;
        ag.target_pos = *pos;
        ag.target_state = MoveRequestState::Requesting;
        Ok(())
    }

    /// Makes the agent follow a velocity instead of a path
    pub fn request_move_velocity(&mut self, idx: usize, vel: &[f32; 3]) -> Result<()> {
        let ag = self.active_agent_mut(idx)?;
        ag.target_ref = PolyRef::NULL;
        ag.target_pos = *vel;
        ag.target_state = MoveRequestState::Velocity;
        Ok(())
    }

    /// Drops the current target; the corridor is collapsed on the next update
    pub fn reset_move_target(&mut self, idx: usize) -> Result<()> {
        let ag = self.active_agent_mut(idx)?;
        ag.target_ref = PolyRef::NULL;
        ag.target_pos = [0.0; 3];
        ag.dvel = [0.0; 3];
        ag.target_state = MoveRequestState::None;
        Ok(())
    }

    /// Advances the simulation by `dt` seconds
    ///
    /// Failures of individual agent queries are logged and leave that agent
    /// where it is; they do not fail the update.
    pub fn update(&mut self, dt: f32) -> Result<()> {
        if !dt.is_finite() || dt < 0.0 {
            return Err(Error::Detour(Status::InvalidParam));
        }

        let mesh = Arc::clone(&self.nav_mesh);
        let mut query = NavMeshQuery::with_context(&mesh, self.context.take().unwrap_or_default());

        self.velocity_sample_count = 0;
        self.update_move_requests(&mut query);
        self.update_topology_optimization(&mut query, dt);
        self.update_neighbourhood(&mut query);
        self.update_corners(&query);
        self.update_steering();
        self.plan_velocities();
        self.integrate(dt);
        self.resolve_collisions();
        self.move_along_mesh(&mut query);

        self.context = Some(query.into_context());
        Ok(())
    }

    fn update_move_requests(&mut self, query: &mut NavMeshQuery<'_>) {
        for (idx, ag) in self.agents.iter_mut().enumerate() {
            if !ag.is_walking() || ag.target_state != MoveRequestState::Requesting {
                continue;
            }

            let filter = &self.filters[filter_index(ag.params.query_filter_type)];
            let start = ag.corridor.first_poly();
            let found = query.find_path(start, ag.target_ref, &ag.npos, &ag.target_pos, filter, MAX_PATH_POLYS);

            match found {
                Ok(path) if !path.is_empty() => {
                    let last = path[path.len() - 1];
                    let partial = last != ag.target_ref;
                    let target = if partial {
                        // Aim for the point of the last polygon nearest the real target
                        query
                            .closest_point_on_poly(last, &ag.target_pos)
                            .map(|(p, _)| p)
                            .unwrap_or(ag.npos)
                    } else {
                        ag.target_pos
                    };

                    ag.corridor.set_corridor(target, &path);
                    ag.boundary.reset();
                    ag.partial = partial;
                    ag.topology_opt_time = 0.0;
                    ag.target_state = MoveRequestState::Valid;
                    log::debug!(
                        "Agent {} planned {} polygons{}",
                        idx,
                        path.len(),
                        if partial { " (partial)" } else { "" }
                    );
                }
                other => {
                    if let Err(e) = other {
                        log::debug!("Agent {} path request failed: {}", idx, e);
                    }
                    let pos = ag.npos;
                    ag.corridor.reset(start, pos);
                    ag.partial = false;
                    ag.target_state = MoveRequestState::Failed;
                }
            }
        }
    }

    /// Replans the corridor start of the agent that waited longest
    fn update_topology_optimization(&mut self, query: &mut NavMeshQuery<'_>, dt: f32) {
        let mut candidate: Option<(usize, f32)> = None;
        for (idx, ag) in self.agents.iter_mut().enumerate() {
            if !ag.is_walking() || !ag.follows_path() || !ag.params.update_flags.contains(UpdateFlags::OPTIMIZE_TOPO) {
                continue;
            }
            ag.topology_opt_time += dt;
            if ag.topology_opt_time >= OPT_TIME_THR && candidate.map_or(true, |(_, t)| ag.topology_opt_time > t) {
                candidate = Some((idx, ag.topology_opt_time));
            }
        }

        let Some((idx, _)) = candidate else {
            return;
        };
        let ag = &mut self.agents[idx];
        let filter = &self.filters[filter_index(ag.params.query_filter_type)];
        if let Err(e) = ag.corridor.optimize_path_topology(query, filter) {
            log::debug!("Agent {} topology optimisation failed: {}", idx, e);
        }
        ag.topology_opt_time = 0.0;
    }

    /// Rebuilds the proximity grid, refreshes wall boundaries and collects neighbours
    fn update_neighbourhood(&mut self, query: &mut NavMeshQuery<'_>) {
        self.grid.clear();
        for (idx, ag) in self.agents.iter().enumerate() {
            if !ag.is_walking() {
                continue;
            }
            let p = ag.npos;
            let r = ag.params.radius;
            self.grid.add_item(idx, p[0] - r, p[2] - r, p[0] + r, p[2] + r);
        }

        for idx in 0..self.agents.len() {
            if !self.agents[idx].is_walking() {
                continue;
            }

            let ag = &mut self.agents[idx];
            let filter = &self.filters[filter_index(ag.params.query_filter_type)];
            let range = ag.params.collision_query_range;

            let update_thr = range * 0.25;
            if dt_vdist_2d_sqr(&ag.npos, ag.boundary.center()) > dt_sqr(update_thr)
                || !ag.boundary.is_valid(query, filter)
            {
                let pos = ag.npos;
                if let Err(e) = ag.boundary.update(ag.corridor.first_poly(), &pos, range, query, filter) {
                    log::debug!("Agent {} boundary update failed: {}", idx, e);
                }
            }

            let (pos, height) = (ag.npos, ag.params.height);
            let neis = get_neighbours(&pos, height, range, idx, &self.agents, &self.grid);
            self.agents[idx].neis = neis;
        }
    }

    fn update_corners(&mut self, query: &NavMeshQuery<'_>) {
        for (idx, ag) in self.agents.iter_mut().enumerate() {
            if !ag.is_walking() {
                continue;
            }
            if !ag.follows_path() {
                ag.corners = Path::default();
                continue;
            }

            let filter = &self.filters[filter_index(ag.params.query_filter_type)];
            ag.corners = match ag.corridor.find_corners(DT_CROWDAGENT_MAX_CORNERS, query, filter) {
                Ok(corners) => corners,
                Err(e) => {
                    log::debug!("Agent {} corner search failed: {}", idx, e);
                    Path::default()
                }
            };

            // Shortcut towards the corner after next when it is in sight
            if ag.params.update_flags.contains(UpdateFlags::OPTIMIZE_VIS) && !ag.corners.is_empty() {
                let target = ag.corners.waypoints[1.min(ag.corners.len() - 1)];
                let range = ag.params.path_optimization_range;
                if let Err(e) = ag.corridor.optimize_path_visibility(&target, range, query, filter) {
                    log::debug!("Agent {} visibility optimisation failed: {}", idx, e);
                }
            }
        }
    }

    fn update_steering(&mut self) {
        for idx in 0..self.agents.len() {
            let ag = &self.agents[idx];
            if !ag.is_walking() || ag.target_state == MoveRequestState::None {
                continue;
            }

            let (mut dvel, desired_speed) = if ag.target_state == MoveRequestState::Velocity {
                let dvel = Vec3::from(ag.target_pos);
                (dvel, dvel.length())
            } else {
                let dir = if ag.params.update_flags.contains(UpdateFlags::ANTICIPATE_TURNS) {
                    calc_smooth_steer_direction(ag)
                } else {
                    calc_straight_steer_direction(ag)
                };
                // Slow down towards the end of the path
                let slow_down_radius = ag.params.radius * 2.0;
                let speed_scale = distance_to_goal(ag, slow_down_radius) / slow_down_radius;
                (dir * (ag.params.max_speed * speed_scale), ag.params.max_speed)
            };

            if ag.params.update_flags.contains(UpdateFlags::SEPARATION) {
                let separation_dist = ag.params.collision_query_range;
                let inv_separation_dist = 1.0 / separation_dist;
                let pos = Vec3::from(ag.npos);

                let mut w = 0.0;
                let mut disp = Vec3::ZERO;
                for nei in &ag.neis {
                    let other = &self.agents[nei.idx];
                    let mut diff = pos - Vec3::from(other.npos);
                    diff.y = 0.0;

                    let dist_sqr = diff.length_squared();
                    if dist_sqr < 0.00001 || dist_sqr > dt_sqr(separation_dist) {
                        continue;
                    }
                    let dist = dist_sqr.sqrt();
                    let weight = ag.params.separation_weight * (1.0 - dt_sqr(dist * inv_separation_dist));
                    disp += diff * (weight / dist);
                    w += 1.0;
                }

                if w > 0.0001 {
                    dvel += disp * (1.0 / w);
                    let speed_sqr = dvel.length_squared();
                    let desired_sqr = dt_sqr(desired_speed);
                    if speed_sqr > desired_sqr {
                        dvel *= desired_sqr / speed_sqr;
                    }
                }
            }

            let ag = &mut self.agents[idx];
            ag.dvel = dvel.to_array();
            ag.desired_speed = desired_speed;
        }
    }

    fn plan_velocities(&mut self) {
        for idx in 0..self.agents.len() {
            let ag = &self.agents[idx];
            if !ag.is_walking() {
                continue;
            }

            // Agents without a target hold still rather than dodge
            if !ag.params.update_flags.contains(UpdateFlags::OBSTACLE_AVOIDANCE)
                || ag.target_state == MoveRequestState::None
            {
                self.agents[idx].nvel = self.agents[idx].dvel;
                continue;
            }

            self.obstacle_query.reset();
            for nei in &ag.neis {
                let other = &self.agents[nei.idx];
                self.obstacle_query
                    .add_circle(&other.npos, other.params.radius, &other.vel, &other.dvel);
            }
            for s in ag.boundary.segments() {
                let p = [s[0], s[1], s[2]];
                let q = [s[3], s[4], s[5]];
                // Only walls facing the agent
                if dt_tri_area_2d(&ag.npos, &p, &q) < 0.0 {
                    continue;
                }
                self.obstacle_query.add_segment(&p, &q);
            }

            let params_idx = (ag.params.obstacle_avoidance_type as usize).min(DT_CROWD_MAX_OBSTAVOIDANCE_PARAMS - 1);
            let params = self.obstacle_query_params[params_idx];
            let (nvel, samples) = self.obstacle_query.sample_velocity_adaptive(
                &ag.npos,
                ag.params.radius,
                ag.desired_speed,
                &ag.vel,
                &ag.dvel,
                &params,
            );
            self.velocity_sample_count += samples;
            self.agents[idx].nvel = nvel;
        }
    }

    fn integrate(&mut self, dt: f32) {
        for ag in self.agents.iter_mut().filter(|a| a.is_walking()) {
            let max_delta = ag.params.max_acceleration * dt;
            let mut dv = Vec3::from(ag.nvel) - Vec3::from(ag.vel);
            let ds = dv.length();
            if ds > max_delta {
                dv *= max_delta / ds;
            }
            let vel = Vec3::from(ag.vel) + dv;

            if vel.length() > 0.0001 {
                ag.npos = (Vec3::from(ag.npos) + vel * dt).to_array();
                ag.vel = vel.to_array();
            } else {
                ag.vel = [0.0; 3];
            }
        }
    }

    /// Pushes overlapping agents apart
    fn resolve_collisions(&mut self) {
        let mut disps = vec![Vec3::ZERO; self.agents.len()];

        for _ in 0..COLLISION_ITERATIONS {
            for (idx, ag) in self.agents.iter().enumerate() {
                if !ag.is_walking() {
                    continue;
                }
                let pos = Vec3::from(ag.npos);
                let mut disp = Vec3::ZERO;
                let mut w = 0.0;

                for nei in &ag.neis {
                    let other = &self.agents[nei.idx];
                    let mut diff = pos - Vec3::from(other.npos);
                    diff.y = 0.0;

                    let combined = ag.params.radius + other.params.radius;
                    let dist_sqr = diff.length_squared();
                    if dist_sqr > dt_sqr(combined) {
                        continue;
                    }
                    let dist = dist_sqr.sqrt();
                    let pen = if dist < 0.0001 {
                        // On top of each other: pick diverging directions
                        diff = if idx > nei.idx {
                            Vec3::new(-ag.dvel[2], 0.0, ag.dvel[0])
                        } else {
                            Vec3::new(ag.dvel[2], 0.0, -ag.dvel[0])
                        };
                        0.01
                    } else {
                        (1.0 / dist) * ((combined - dist) * 0.5) * COLLISION_RESOLVE_FACTOR
                    };

                    disp += diff * pen;
                    w += 1.0;
                }

                if w > 0.0001 {
                    disp *= 1.0 / w;
                }
                disps[idx] = disp;
            }

            for (ag, disp) in self.agents.iter_mut().zip(&disps) {
                if !ag.is_walking() {
                    continue;
                }
                ag.disp = disp.to_array();
                ag.npos = (Vec3::from(ag.npos) + *disp).to_array();
            }
        }
    }

    fn move_along_mesh(&mut self, query: &mut NavMeshQuery<'_>) {
        for (idx, ag) in self.agents.iter_mut().enumerate() {
            if !ag.is_walking() {
                continue;
            }

            let filter = &self.filters[filter_index(ag.params.query_filter_type)];
            let npos = ag.npos;
            if let Err(e) = ag.corridor.move_position(&npos, query, filter) {
                log::debug!("Agent {} move failed: {}", idx, e);
            }
            ag.npos = *ag.corridor.pos();

            // Without a path the corridor is just the polygon under the agent
            if !ag.follows_path() {
                let first = ag.corridor.first_poly();
                ag.corridor.reset(first, ag.npos);
                ag.partial = false;
            }
        }
    }
}

#[inline]
fn filter_index(query_filter_type: u8) -> usize {
    (query_filter_type as usize).min(DT_CROWD_MAX_QUERY_FILTER_TYPE - 1)
}

/// Inserts a neighbour keeping the list sorted and bounded
fn add_neighbour(neis: &mut Vec<CrowdNeighbour>, idx: usize, dist: f32) {
    if neis.len() >= DT_CROWDAGENT_MAX_NEIGHBOURS {
        match neis.last() {
            Some(last) if dist >= last.dist => return,
            _ => {}
        }
    }
    let at = neis.iter().position(|n| dist <= n.dist).unwrap_or(neis.len());
    neis.insert(at, CrowdNeighbour { idx, dist });
    neis.truncate(DT_CROWDAGENT_MAX_NEIGHBOURS);
}

fn get_neighbours(
    pos: &[f32; 3],
    height: f32,
    range: f32,
    skip: usize,
    agents: &[CrowdAgent],
    grid: &ProximityGrid,
) -> Vec<CrowdNeighbour> {
    let ids = grid.query_items(pos[0] - range, pos[2] - range, pos[0] + range, pos[2] + range, MAX_NEIGHBOUR_QUERY);

    let mut neis = Vec::with_capacity(DT_CROWDAGENT_MAX_NEIGHBOURS);
    for id in ids {
        if id == skip {
            continue;
        }
        let Some(other) = agents.get(id) else {
            continue;
        };

        let dy = pos[1] - other.npos[1];
        if dy.abs() >= (height + other.params.height) / 2.0 {
            continue;
        }
        let dist_sqr = dt_vdist_2d_sqr(pos, &other.npos);
        if dist_sqr > dt_sqr(range) {
            continue;
        }
        add_neighbour(&mut neis, id, dist_sqr);
    }
    neis
}

fn calc_smooth_steer_direction(ag: &CrowdAgent) -> Vec3 {
    let n = ag.corners.len();
    if n == 0 {
        return Vec3::ZERO;
    }

    let pos = Vec3::from(ag.npos);
    let mut dir0 = Vec3::from(ag.corners.waypoints[0]) - pos;
    let mut dir1 = Vec3::from(ag.corners.waypoints[1.min(n - 1)]) - pos;
    dir0.y = 0.0;
    dir1.y = 0.0;

    let len0 = dir0.length();
    let len1 = dir1.length();
    if len1 > 0.001 {
        dir1 *= 1.0 / len1;
    }

    Vec3::new(dir0.x - dir1.x * len0 * 0.5, 0.0, dir0.z - dir1.z * len0 * 0.5).normalize_or_zero()
}

fn calc_straight_steer_direction(ag: &CrowdAgent) -> Vec3 {
    let Some(corner) = ag.corners.waypoints.first() else {
        return Vec3::ZERO;
    };
    let mut dir = Vec3::from(*corner) - Vec3::from(ag.npos);
    dir.y = 0.0;
    dir.normalize_or_zero()
}

/// Distance to the path end, capped at `range`; `range` if the end is not among the corners
fn distance_to_goal(ag: &CrowdAgent, range: f32) -> f32 {
    match (ag.corners.flags.last(), ag.corners.waypoints.last()) {
        (Some(flags), Some(end)) if flags.contains(StraightPathFlags::END) => dt_vdist_2d(&ag.npos, end).min(range),
        _ => range,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use detour::test_mesh_helpers::{create_grid_navmesh, test_params, GridTile};

    fn agent_params() -> AgentParams {
        let radius = 0.3;
        AgentParams {
            radius,
            height: 1.0,
            max_acceleration: 80.0,
            max_speed: 8.5,
            collision_query_range: radius * 10.0,
            path_optimization_range: radius * 20.0,
            separation_weight: 10.0,
            update_flags: UpdateFlags::all(),
            obstacle_avoidance_type: 3,
            query_filter_type: 0,
        }
    }

    fn open_crowd(max_agents: usize) -> Result<Crowd> {
        let nav_mesh = Arc::new(create_grid_navmesh(2, 2, 4)?);
        let mut crowd = Crowd::new(nav_mesh, max_agents, 0.6);
        for tier in 0..4u8 {
            crowd.set_obstacle_avoidance_params(tier as usize, DtObstacleAvoidanceParams::for_quality(tier))?;
        }
        Ok(crowd)
    }

    fn target_on_mesh(crowd: &Crowd, pos: &[f32; 3]) -> Result<(PolyRef, [f32; 3])> {
        let query = NavMeshQuery::new(crowd.nav_mesh());
        query.find_nearest_poly(pos, &[2.0, 2.0, 2.0], &QueryFilter::default())
    }

    #[test]
    fn test_slots_fill_and_reuse() -> Result<()> {
        let mut crowd = open_crowd(2)?;
        let a = crowd.add_agent(&[-5.0, 0.0, -5.0], &agent_params())?;
        let b = crowd.add_agent(&[-3.0, 0.0, -5.0], &agent_params())?;
        assert_eq!((a, b), (0, 1));
        assert_eq!(crowd.active_agent_count(), 2);

        let full = crowd.add_agent(&[0.0, 0.0, 0.0], &agent_params());
        assert_eq!(full.err().and_then(|e| e.status()), Some(Status::CrowdFull));

        crowd.remove_agent(a)?;
        assert!(crowd.agent(a).is_none());
        assert_eq!(crowd.add_agent(&[1.0, 0.0, 1.0], &agent_params())?, a);
        Ok(())
    }

    #[test]
    fn test_agent_snaps_to_mesh() -> Result<()> {
        let mut crowd = open_crowd(4)?;
        let idx = crowd.add_agent(&[-5.0, 0.5, -5.0], &agent_params())?;
        let ag = crowd.agent(idx).unwrap();
        assert_eq!(ag.state, CrowdAgentState::Walking);
        assert!(ag.npos[1].abs() < 1e-3);
        assert!(ag.corridor.first_poly().is_valid());

        let off = crowd.add_agent(&[100.0, 0.0, 100.0], &agent_params())?;
        assert_eq!(crowd.agent(off).unwrap().state, CrowdAgentState::Invalid);
        Ok(())
    }

    #[test]
    fn test_agent_reaches_target() -> Result<()> {
        let mut crowd = open_crowd(4)?;
        let idx = crowd.add_agent(&[-3.0, 0.0, 1.0], &agent_params())?;
        let (target_ref, target_pos) = target_on_mesh(&crowd, &[5.0, 0.0, 1.0])?;
        crowd.request_move_target(idx, target_ref, &target_pos)?;
        assert_eq!(crowd.agent(idx).unwrap().target_state, MoveRequestState::Requesting);

        crowd.update(0.025)?;
        assert_eq!(crowd.agent(idx).unwrap().target_state, MoveRequestState::Valid);
        assert!(!crowd.agent(idx).unwrap().partial);

        for _ in 0..200 {
            crowd.update(0.025)?;
        }
        let ag = crowd.agent(idx).unwrap();
        assert!(dt_vdist_2d(&ag.npos, &target_pos) < 1.0, "agent at {:?}", ag.npos);
        assert_eq!(ag.corridor.last_poly(), target_ref);
        Ok(())
    }

    #[test]
    fn test_unreachable_target_is_partial() -> Result<()> {
        let params = test_params(1);
        let mut nav_mesh = NavMesh::new(params.clone())?;
        let tile = GridTile::new(0, 0, 4).with_blocked(&[(2, 0), (2, 1), (2, 2), (2, 3)]);
        nav_mesh.add_tile(&tile.to_bytes(&params)?)?;
        let mut crowd = Crowd::new(Arc::new(nav_mesh), 2, 0.6);

        let idx = crowd.add_agent(&[-8.75, 0.0, -8.75], &agent_params())?;
        let (target_ref, target_pos) = target_on_mesh(&crowd, &[-1.25, 0.0, -8.75])?;
        crowd.request_move_target(idx, target_ref, &target_pos)?;
        crowd.update(0.025)?;

        let ag = crowd.agent(idx).unwrap();
        assert_eq!(ag.target_state, MoveRequestState::Valid);
        assert!(ag.partial);
        assert!(ag.corridor.target()[0] <= -5.0 + 1e-3);
        Ok(())
    }

    #[test]
    fn test_stale_target_fails_request() -> Result<()> {
        use detour::nav_mesh::{decode_poly_ref, encode_poly_ref};

        let mut crowd = open_crowd(2)?;
        let idx = crowd.add_agent(&[-5.0, 0.0, -5.0], &agent_params())?;
        let (target_ref, target_pos) = target_on_mesh(&crowd, &[5.0, 0.0, 5.0])?;

        // Same tile, but a polygon the tile does not have
        let (salt, tile, _) = decode_poly_ref(target_ref);
        let stale = encode_poly_ref(salt, tile, 0xFFFF);
        crowd.request_move_target(idx, stale, &target_pos)?;
        crowd.update(0.025)?;

        let ag = crowd.agent(idx).unwrap();
        assert_eq!(ag.target_state, MoveRequestState::Failed);
        assert_eq!(ag.corridor.path_count(), 1);
        assert!(dt_vdist_2d(&ag.npos, &[-5.0, 0.0, -5.0]) < 0.1);

        // A valid request replans from the failed state
        crowd.request_move_target(idx, target_ref, &target_pos)?;
        crowd.update(0.025)?;
        assert_eq!(crowd.agent(idx).unwrap().target_state, MoveRequestState::Valid);
        Ok(())
    }

    #[test]
    fn test_velocity_request_and_reset() -> Result<()> {
        let mut crowd = open_crowd(2)?;
        let idx = crowd.add_agent(&[-5.0, 0.0, 1.0], &agent_params())?;
        crowd.request_move_velocity(idx, &[2.0, 0.0, 0.0])?;
        for _ in 0..40 {
            crowd.update(0.025)?;
        }
        let ag = crowd.agent(idx).unwrap();
        assert!(ag.npos[0] > -4.0, "agent at {:?}", ag.npos);
        assert!((ag.npos[2] - 1.0).abs() < 0.5);

        crowd.reset_move_target(idx)?;
        for _ in 0..10 {
            crowd.update(0.025)?;
        }
        let ag = crowd.agent(idx).unwrap();
        assert_eq!(ag.target_state, MoveRequestState::None);
        assert!(Vec3::from(ag.vel).length() < 1e-3);
        assert_eq!(ag.corridor.path_count(), 1);
        Ok(())
    }

    #[test]
    fn test_overlapping_agents_separate() -> Result<()> {
        let mut crowd = open_crowd(2)?;
        let a = crowd.add_agent(&[-2.0, 0.0, 1.0], &agent_params())?;
        let b = crowd.add_agent(&[-1.8, 0.0, 1.0], &agent_params())?;
        for _ in 0..5 {
            crowd.update(0.025)?;
        }
        let pa = *crowd.agent(a).unwrap().position();
        let pb = *crowd.agent(b).unwrap().position();
        assert!(dt_vdist_2d(&pa, &pb) > 0.5);
        assert_eq!(crowd.agent(a).unwrap().neis.first().map(|n| n.idx), Some(b));
        Ok(())
    }

    #[test]
    fn test_request_errors() -> Result<()> {
        let mut crowd = open_crowd(2)?;
        let idx = crowd.add_agent(&[-5.0, 0.0, -5.0], &agent_params())?;

        let null = crowd.request_move_target(idx, PolyRef::NULL, &[0.0; 3]);
        assert_eq!(null.err().and_then(|e| e.status()), Some(Status::InvalidParam));

        crowd.remove_agent(idx)?;
        let gone = crowd.remove_agent(idx);
        assert_eq!(gone.err().and_then(|e| e.status()), Some(Status::AgentNotFound));
        let gone = crowd.request_move_velocity(idx, &[1.0, 0.0, 0.0]);
        assert_eq!(gone.err().and_then(|e| e.status()), Some(Status::AgentNotFound));

        assert!(crowd.update(-1.0).is_err());
        assert!(crowd.update(f32::NAN).is_err());
        Ok(())
    }

    #[test]
    fn test_neighbour_list_is_sorted_and_bounded() {
        let mut neis = Vec::new();
        for (i, d) in [5.0, 1.0, 3.0, 7.0, 2.0, 6.0, 4.0, 0.5].iter().enumerate() {
            add_neighbour(&mut neis, i, *d);
        }
        let dists: Vec<f32> = neis.iter().map(|n| n.dist).collect();
        assert_eq!(dists, vec![0.5, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }
}
