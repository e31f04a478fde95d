//! Request dispatch for a transport layer
//!
//! A transport decodes one [`NavRequest`] per game-facing call, hands it to
//! [`NavService::handle`] and encodes the [`NavResponse`]. Failures never
//! surface as errors here: they fold into `success: false` with a message.

use serde::{Deserialize, Serialize};

use crate::error::{ServiceError, ServiceResult};
use crate::service::{HealthReport, NavService, ServiceStats};

/// One request, tagged by `op`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum NavRequest {
    NearestPoint {
        position: [f32; 3],
    },
    HasLineOfSight {
        start: [f32; 3],
        end: [f32; 3],
    },
    #[serde(rename_all = "camelCase")]
    SetTarget {
        npc_id: String,
        target: [f32; 3],
    },
    #[serde(rename_all = "camelCase")]
    AddAgent {
        npc_id: String,
        position: [f32; 3],
    },
    #[serde(rename_all = "camelCase")]
    RemoveAgent {
        npc_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Stop {
        npc_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ForceStop {
        npc_id: String,
        #[serde(default)]
        brake_force: Option<f32>,
    },
    #[serde(rename_all = "camelCase")]
    IsAtTarget {
        npc_id: String,
        #[serde(default)]
        threshold: Option<f32>,
    },
    #[serde(rename_all = "camelCase")]
    Position {
        npc_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Velocity {
        npc_id: String,
    },
    FindPath {
        start: [f32; 3],
        end: [f32; 3],
    },
    /// Path query that reports success even when no path exists
    TestPath {
        start: [f32; 3],
        end: [f32; 3],
    },
    #[serde(rename_all = "camelCase")]
    Tick {
        delta_seconds: f32,
    },
    Health,
    Stats,
}

impl NavRequest {
    pub fn name(&self) -> &'static str {
        match self {
            NavRequest::NearestPoint { .. } => "nearestPoint",
            NavRequest::HasLineOfSight { .. } => "hasLineOfSight",
            NavRequest::SetTarget { .. } => "setTarget",
            NavRequest::AddAgent { .. } => "addAgent",
            NavRequest::RemoveAgent { .. } => "removeAgent",
            NavRequest::Stop { .. } => "stop",
            NavRequest::ForceStop { .. } => "forceStop",
            NavRequest::IsAtTarget { .. } => "isAtTarget",
            NavRequest::Position { .. } => "position",
            NavRequest::Velocity { .. } => "velocity",
            NavRequest::FindPath { .. } => "findPath",
            NavRequest::TestPath { .. } => "testPath",
            NavRequest::Tick { .. } => "tick",
            NavRequest::Health => "health",
            NavRequest::Stats => "stats",
        }
    }
}

/// Reply to a [`NavRequest`]; only the fields the operation produces are set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point: Option<[f32; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<[f32; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<[f32; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<[f32; 3]>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_line_of_sight: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_target: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<ServiceStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NavResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failed(error: &ServiceError) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::default()
        }
    }

    fn from_result(operation: &str, result: ServiceResult<()>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(e) => {
                e.log(operation);
                Self::failed(&e)
            }
        }
    }
}

impl NavService {
    /// Runs one request against the service
    pub fn handle(&self, request: NavRequest) -> NavResponse {
        let op = request.name();
        match request {
            NavRequest::NearestPoint { position } => match self.nearest_point(&position) {
                Ok(point) => NavResponse {
                    point: Some(point),
                    ..NavResponse::ok()
                },
                Err(e) => NavResponse::from_result(op, Err(e)),
            },
            NavRequest::HasLineOfSight { start, end } => NavResponse {
                has_line_of_sight: Some(self.has_line_of_sight(&start, &end)),
                ..NavResponse::ok()
            },
            NavRequest::SetTarget { npc_id, target } => NavResponse::from_result(op, self.set_target(&npc_id, &target)),
            NavRequest::AddAgent { npc_id, position } => {
                NavResponse::from_result(op, self.add_agent(&npc_id, &position))
            }
            NavRequest::RemoveAgent { npc_id } => NavResponse::from_result(op, self.remove_agent(&npc_id)),
            NavRequest::Stop { npc_id } => NavResponse::from_result(op, self.stop(&npc_id)),
            NavRequest::ForceStop { npc_id, brake_force } => {
                NavResponse::from_result(op, self.force_stop(&npc_id, brake_force))
            }
            NavRequest::IsAtTarget { npc_id, threshold } => NavResponse {
                at_target: Some(self.is_at_target(&npc_id, threshold)),
                ..NavResponse::ok()
            },
            NavRequest::Position { npc_id } => match self.position(&npc_id) {
                Ok(position) => NavResponse {
                    position: Some(position),
                    ..NavResponse::ok()
                },
                Err(e) => NavResponse::from_result(op, Err(e)),
            },
            NavRequest::Velocity { npc_id } => match self.velocity(&npc_id) {
                Ok(velocity) => NavResponse {
                    velocity: Some(velocity),
                    ..NavResponse::ok()
                },
                Err(e) => NavResponse::from_result(op, Err(e)),
            },
            NavRequest::FindPath { start, end } => {
                let path = self.find_path(&start, &end);
                NavResponse {
                    success: !path.is_empty(),
                    path: Some(path),
                    ..NavResponse::default()
                }
            }
            NavRequest::TestPath { start, end } => NavResponse {
                path: Some(self.find_path(&start, &end)),
                ..NavResponse::ok()
            },
            NavRequest::Tick { delta_seconds } => NavResponse::from_result(op, self.tick(delta_seconds)),
            NavRequest::Health => {
                let health = self.health();
                NavResponse {
                    status: Some(health.status.clone()),
                    health: Some(health),
                    ..NavResponse::ok()
                }
            }
            NavRequest::Stats => NavResponse {
                stats: Some(self.stats()),
                ..NavResponse::ok()
            },
        }
    }

    /// Decodes a JSON request, runs it and encodes the reply
    pub fn handle_json(&self, request: &str) -> String {
        let response = match serde_json::from_str::<NavRequest>(request) {
            Ok(request) => self.handle(request),
            Err(e) => {
                log::debug!("Rejected malformed request: {}", e);
                NavResponse {
                    success: false,
                    error: Some(format!("malformed request: {e}")),
                    ..NavResponse::default()
                }
            }
        };

        serde_json::to_string(&response).unwrap_or_else(|e| {
            log::error!("Failed to encode response: {}", e);
            r#"{"success":false,"error":"failed to encode response"}"#.to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use detour::test_mesh_helpers::create_grid_navmesh;

    fn service() -> ServiceResult<NavService> {
        NavService::from_mesh(create_grid_navmesh(2, 2, 4)?, ServiceConfig::default())
    }

    #[test]
    fn test_request_decoding() -> serde_json::Result<()> {
        let request: NavRequest = serde_json::from_str(r#"{"op": "forceStop", "npcId": "boar"}"#)?;
        assert_eq!(
            request,
            NavRequest::ForceStop {
                npc_id: "boar".to_string(),
                brake_force: None
            }
        );

        let request: NavRequest = serde_json::from_str(r#"{"op": "tick", "deltaSeconds": 0.025}"#)?;
        assert_eq!(request, NavRequest::Tick { delta_seconds: 0.025 });

        let request: NavRequest = serde_json::from_str(r#"{"op": "health"}"#)?;
        assert_eq!(request, NavRequest::Health);
        Ok(())
    }

    #[test]
    fn test_agent_lifecycle_through_requests() -> ServiceResult<()> {
        let service = service()?;
        let add = service.handle(NavRequest::AddAgent {
            npc_id: "kobold".to_string(),
            position: [1.0, 0.0, 1.0],
        });
        assert!(add.success);

        let position = service.handle(NavRequest::Position {
            npc_id: "kobold".to_string(),
        });
        assert!(position.success);
        assert!(position.position.is_some());

        let again = service.handle(NavRequest::AddAgent {
            npc_id: "kobold".to_string(),
            position: [1.0, 0.0, 1.0],
        });
        assert!(!again.success);
        assert!(again.error.is_some());

        let stop = service.handle(NavRequest::ForceStop {
            npc_id: "kobold".to_string(),
            brake_force: Some(0.0),
        });
        assert!(stop.success);
        assert_eq!(service.agent_snapshot("kobold")?.max_acceleration, 1000.0);

        assert!(
            service
                .handle(NavRequest::RemoveAgent {
                    npc_id: "kobold".to_string()
                })
                .success
        );
        let gone = service.handle(NavRequest::Velocity {
            npc_id: "kobold".to_string(),
        });
        assert!(!gone.success);
        assert!(gone.velocity.is_none());
        Ok(())
    }

    #[test]
    fn test_path_requests() -> ServiceResult<()> {
        let service = service()?;
        let found = service.handle(NavRequest::FindPath {
            start: [-8.0, 0.0, -8.0],
            end: [8.0, 0.0, 8.0],
        });
        assert!(found.success);
        assert!(found.path.as_ref().map_or(0, Vec::len) >= 2);

        // Far outside the mesh: no path, but the test query still succeeds
        let test = service.handle(NavRequest::TestPath {
            start: [500.0, 0.0, 500.0],
            end: [8.0, 0.0, 8.0],
        });
        assert!(test.success);
        assert_eq!(test.path, Some(Vec::new()));

        let missing = service.handle(NavRequest::FindPath {
            start: [500.0, 0.0, 500.0],
            end: [8.0, 0.0, 8.0],
        });
        assert!(!missing.success);
        Ok(())
    }

    #[test]
    fn test_json_round() -> ServiceResult<()> {
        let service = service()?;
        let reply = service.handle_json(r#"{"op": "health"}"#);
        let response: NavResponse = serde_json::from_str(&reply).map_err(|e| ServiceError::Config(e.to_string()))?;
        assert!(response.success);
        assert_eq!(response.status.as_deref(), Some("ok"));
        assert_eq!(response.health.map(|h| h.tiles), Some(4));

        let reply = service.handle_json(r#"{"op": "teleport"}"#);
        assert!(reply.contains(r#""success":false"#));

        let reply = service.handle_json(r#"{"op": "hasLineOfSight", "start": [900, 0, 900], "end": [0, 0, 0]}"#);
        assert!(reply.contains(r#""hasLineOfSight":true"#));
        Ok(())
    }
}
