//! Service configuration
//!
//! Every field has a default matching the tuning the steering parameters were
//! made for, so a config file only needs the values it changes.

use std::time::Duration;

use detour_crowd::{AgentParams, UpdateFlags};
use serde::{Deserialize, Serialize};

/// Steering profile given to every agent the service adds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentProfile {
    pub radius: f32,
    pub height: f32,
    pub max_acceleration: f32,
    pub max_speed: f32,
    /// Multiplied by the radius to get the collision query range
    pub collision_range_factor: f32,
    /// Multiplied by the radius to get the path optimization range
    pub path_optimization_factor: f32,
    pub separation_weight: f32,
    /// Obstacle avoidance quality, 0 (low) to 3 (high)
    pub avoidance_tier: u8,
    pub behaviors: UpdateFlags,
}

impl Default for AgentProfile {
    fn default() -> Self {
        Self {
            radius: 0.3,
            height: 1.0,
            max_acceleration: 80.0,
            max_speed: 8.5,
            collision_range_factor: 10.0,
            path_optimization_factor: 20.0,
            separation_weight: 10.0,
            avoidance_tier: 3,
            behaviors: UpdateFlags::ANTICIPATE_TURNS
                | UpdateFlags::OPTIMIZE_VIS
                | UpdateFlags::OPTIMIZE_TOPO
                | UpdateFlags::SEPARATION
                | UpdateFlags::OBSTACLE_AVOIDANCE,
        }
    }
}

impl AgentProfile {
    /// Crowd parameters for an agent using this profile
    pub fn agent_params(&self) -> AgentParams {
        AgentParams {
            radius: self.radius,
            height: self.height,
            max_acceleration: self.max_acceleration,
            max_speed: self.max_speed,
            collision_query_range: self.radius * self.collision_range_factor,
            path_optimization_range: self.radius * self.path_optimization_factor,
            separation_weight: self.separation_weight,
            update_flags: self.behaviors,
            obstacle_avoidance_type: self.avoidance_tier,
            query_filter_type: 0,
        }
    }
}

/// Timing of the background crowd tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TickConfig {
    /// Wall-clock period between ticks
    pub interval_ms: u64,
    /// Simulated seconds advanced per tick
    pub step_seconds: f32,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            interval_ms: 33,
            step_seconds: 0.025,
        }
    }
}

impl TickConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Configuration of a [`crate::NavService`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub max_agents: usize,
    pub max_path_polys: usize,
    pub max_straight_path_points: usize,
    /// Search nodes per query context
    pub max_nodes: usize,
    /// Query contexts kept for request handlers
    pub query_pool_size: usize,
    pub nearest_extents: [f32; 3],
    pub path_extents: [f32; 3],
    pub line_of_sight_extents: [f32; 3],
    pub target_extents: [f32; 3],
    pub line_of_sight_max_polys: usize,
    pub agent_profile: AgentProfile,
    pub max_agent_radius: f32,
    pub default_brake_force: f32,
    pub brake_multiplier: f32,
    pub default_arrival_threshold: f32,
    pub tick: TickConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_agents: 50,
            max_path_polys: 256,
            max_straight_path_points: 256,
            max_nodes: 2048,
            query_pool_size: 4,
            nearest_extents: [10.0, 10.0, 10.0],
            path_extents: [20.0, 10.0, 20.0],
            line_of_sight_extents: [20.0, 10.0, 20.0],
            target_extents: [20.0, 10.0, 20.0],
            line_of_sight_max_polys: 32,
            agent_profile: AgentProfile::default(),
            max_agent_radius: 0.6,
            default_brake_force: 10.0,
            brake_multiplier: 100.0,
            default_arrival_threshold: 2.0,
            tick: TickConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn with_max_agents(mut self, max_agents: usize) -> Self {
        self.max_agents = max_agents;
        self
    }

    pub fn with_query_pool_size(mut self, query_pool_size: usize) -> Self {
        self.query_pool_size = query_pool_size;
        self
    }

    pub fn with_max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = max_nodes;
        self
    }

    pub fn with_agent_profile(mut self, agent_profile: AgentProfile) -> Self {
        self.agent_profile = agent_profile;
        self
    }

    pub fn with_tick(mut self, interval_ms: u64, step_seconds: f32) -> Self {
        self.tick = TickConfig {
            interval_ms,
            step_seconds,
        };
        self
    }

    pub fn with_default_brake_force(mut self, default_brake_force: f32) -> Self {
        self.default_brake_force = default_brake_force;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_agents == 0 {
            return Err("Max agents must be positive".to_string());
        }
        if self.max_path_polys == 0 || self.max_straight_path_points == 0 {
            return Err("Path limits must be positive".to_string());
        }
        if self.max_nodes == 0 {
            return Err("Max nodes must be positive".to_string());
        }
        if self.query_pool_size == 0 {
            return Err("Query pool size must be positive".to_string());
        }
        for (name, extents) in [
            ("nearest", &self.nearest_extents),
            ("path", &self.path_extents),
            ("line of sight", &self.line_of_sight_extents),
            ("target", &self.target_extents),
        ] {
            if extents.iter().any(|e| !e.is_finite() || *e <= 0.0) {
                return Err(format!("Search extents for {name} must be positive"));
            }
        }
        let profile = &self.agent_profile;
        if profile.radius <= 0.0 || profile.height <= 0.0 {
            return Err("Agent radius and height must be positive".to_string());
        }
        if profile.radius > self.max_agent_radius {
            return Err(format!(
                "Agent radius {} exceeds max agent radius {}",
                profile.radius, self.max_agent_radius
            ));
        }
        if profile.max_speed < 0.0 || profile.max_acceleration < 0.0 {
            return Err("Agent speed and acceleration cannot be negative".to_string());
        }
        if profile.avoidance_tier > 3 {
            return Err("Avoidance tier must be between 0 and 3".to_string());
        }
        if self.default_brake_force <= 0.0 || self.brake_multiplier <= 0.0 {
            return Err("Brake force and multiplier must be positive".to_string());
        }
        if self.default_arrival_threshold < 0.0 {
            return Err("Arrival threshold cannot be negative".to_string());
        }
        if self.tick.interval_ms == 0 {
            return Err("Tick interval must be positive".to_string());
        }
        if !self.tick.step_seconds.is_finite() || self.tick.step_seconds <= 0.0 {
            return Err("Tick step must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profile_params() {
        let params = AgentProfile::default().agent_params();
        assert_eq!(params.radius, 0.3);
        assert!((params.collision_query_range - 3.0).abs() < 1e-5);
        assert!((params.path_optimization_range - 6.0).abs() < 1e-5);
        assert_eq!(params.obstacle_avoidance_type, 3);
        assert!(params.update_flags.contains(UpdateFlags::SEPARATION | UpdateFlags::OBSTACLE_AVOIDANCE));
    }

    #[test]
    fn test_defaults_validate() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());
        // Path endpoints tolerate more horizontal than vertical error
        assert!(config.path_extents[0] > config.path_extents[1]);
        assert!(config.path_extents[2] > config.path_extents[1]);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(ServiceConfig::default().with_max_agents(0).validate().is_err());
        assert!(ServiceConfig::default().with_query_pool_size(0).validate().is_err());
        assert!(ServiceConfig::default().with_tick(0, 0.025).validate().is_err());
        assert!(ServiceConfig::default().with_max_nodes(0).validate().is_err());
        assert!(ServiceConfig::default().with_default_brake_force(0.0).validate().is_err());

        let mut config = ServiceConfig::default();
        config.target_extents = [20.0, 0.0, 20.0];
        assert!(config.validate().is_err());

        let profile = AgentProfile {
            radius: 1.0,
            ..AgentProfile::default()
        };
        assert!(ServiceConfig::default().with_agent_profile(profile).validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() -> serde_json::Result<()> {
        let config: ServiceConfig = serde_json::from_str(r#"{"max_agents": 8, "tick": {"interval_ms": 50}}"#)?;
        assert_eq!(config.max_agents, 8);
        assert_eq!(config.tick.interval_ms, 50);
        assert_eq!(config.tick.step_seconds, 0.025);
        assert_eq!(config.line_of_sight_extents, [20.0, 10.0, 20.0]);
        assert_eq!(config.agent_profile, AgentProfile::default());
        Ok(())
    }
}
