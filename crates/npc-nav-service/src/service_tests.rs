//! Behaviour of the service operations over generated meshes

use std::io::Write;
use std::sync::Arc;

use detour::test_mesh_helpers::{create_grid_navmesh, create_mesh_set_bytes, test_params, GridTile};
use detour::NavMesh;
use detour_common::{dt_vlen, Error};
use detour_crowd::MoveRequestState;

use crate::config::ServiceConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::service::NavService;

const STEP: f32 = 0.025;

fn open_service() -> ServiceResult<NavService> {
    NavService::from_mesh(create_grid_navmesh(2, 2, 4)?, ServiceConfig::default())
}

fn io_error(e: std::io::Error) -> ServiceError {
    ServiceError::Internal(Error::Io(e))
}

#[test]
fn test_load_round_trip() -> ServiceResult<()> {
    let params = test_params(4);
    let tiles = [
        GridTile::new(0, 0, 2),
        GridTile::new(1, 0, 2),
        GridTile::new(0, 1, 2).with_height(1.0),
        GridTile::new(1, 1, 2),
    ];
    let bytes = create_mesh_set_bytes(&params, &tiles)?;

    let mut file = tempfile::NamedTempFile::new().map_err(io_error)?;
    file.write_all(&bytes).map_err(io_error)?;
    file.flush().map_err(io_error)?;

    let service = NavService::load(file.path(), ServiceConfig::default())?;
    assert_eq!(service.health().tiles, 4);

    // A point inside each tile resolves onto that tile's surface
    for (x, z, y) in [(-5.0, -5.0, 0.0), (5.0, -5.0, 0.0), (-5.0, 5.0, 1.0), (5.0, 5.0, 0.0)] {
        let point = service.nearest_point(&[x, 0.5, z])?;
        assert!((point[0] - x).abs() < 1e-3 && (point[2] - z).abs() < 1e-3);
        assert!((point[1] - y).abs() < 1e-3);
    }
    Ok(())
}

#[test]
fn test_load_failures() {
    assert!(matches!(
        NavService::load("/nonexistent/world.bin", ServiceConfig::default()),
        Err(ServiceError::Load(detour::LoadError::IoFailure(_)))
    ));
    assert!(matches!(
        NavService::from_bytes(b"not a mesh asset at all, just some text padding it out", ServiceConfig::default()),
        Err(ServiceError::Load(detour::LoadError::BadFormat(_)))
    ));
}

#[test]
fn test_invalid_config_rejected() -> ServiceResult<()> {
    let result = NavService::from_mesh(create_grid_navmesh(1, 1, 2)?, ServiceConfig::default().with_max_agents(0));
    assert!(matches!(result, Err(ServiceError::Config(_))));
    Ok(())
}

#[test]
fn test_nearest_point_not_found() -> ServiceResult<()> {
    let service = open_service()?;
    assert!(matches!(
        service.nearest_point(&[100.0, 0.0, 100.0]),
        Err(ServiceError::QueryNotFound(_))
    ));
    Ok(())
}

#[test]
fn test_stop_is_idempotent() -> ServiceResult<()> {
    let service = open_service()?;
    service.add_agent("boar", &[-5.0, 0.0, -5.0])?;
    service.set_target("boar", &[5.0, 0.0, 5.0])?;
    for _ in 0..20 {
        service.tick(STEP)?;
    }
    assert!(dt_vlen(&service.velocity("boar")?) > 0.1);

    service.stop("boar")?;
    assert_eq!(service.velocity("boar")?, [0.0; 3]);
    service.stop("boar")?;
    assert_eq!(service.velocity("boar")?, [0.0; 3]);

    // No residual steering once stopped
    service.tick(STEP)?;
    assert_eq!(service.velocity("boar")?, [0.0; 3]);
    assert_eq!(service.agent_snapshot("boar")?.target_state, MoveRequestState::None);
    Ok(())
}

#[test]
fn test_removed_agent_is_unknown() -> ServiceResult<()> {
    let service = open_service()?;
    service.add_agent("wolf", &[1.0, 0.0, 1.0])?;
    service.remove_agent("wolf")?;

    assert!(matches!(service.position("wolf"), Err(ServiceError::UnknownAgent(_))));
    assert!(matches!(
        service.set_target("wolf", &[2.0, 0.0, 2.0]),
        Err(ServiceError::UnknownAgent(_))
    ));
    assert!(matches!(service.stop("wolf"), Err(ServiceError::UnknownAgent(_))));
    assert!(matches!(service.remove_agent("wolf"), Err(ServiceError::UnknownAgent(_))));
    assert!(!service.is_at_target("wolf", None));

    // Re-adding makes the id usable again
    service.add_agent("wolf", &[1.0, 0.0, 1.0])?;
    assert!(service.position("wolf").is_ok());
    Ok(())
}

#[test]
fn test_agent_arrives_and_stays() -> ServiceResult<()> {
    let service = open_service()?;
    service.add_agent("scout", &[0.0, 0.0, 0.0])?;
    service.set_target("scout", &[5.0, 0.0, 0.0])?;
    assert!(!service.is_at_target("scout", Some(2.0)));

    let mut arrived_at = None;
    for i in 0..400 {
        service.tick(STEP)?;
        if service.is_at_target("scout", Some(2.0)) {
            arrived_at = Some(i);
            break;
        }
    }
    assert!(arrived_at.is_some(), "agent never reached its target");

    for _ in 0..200 {
        service.tick(STEP)?;
        assert!(service.is_at_target("scout", Some(2.0)));
    }

    let pos = service.position("scout")?;
    assert!((pos[0] - 5.0).abs() < 1.0 && pos[2].abs() < 1.0);
    Ok(())
}

#[test]
fn test_capacity() -> ServiceResult<()> {
    let service = NavService::from_mesh(create_grid_navmesh(2, 2, 4)?, ServiceConfig::default().with_max_agents(3))?;
    for (i, x) in [-6.0, 0.0, 6.0].into_iter().enumerate() {
        service.add_agent(&format!("npc-{i}"), &[x, 0.0, 0.0])?;
    }

    assert!(matches!(
        service.add_agent("npc-3", &[3.0, 0.0, 3.0]),
        Err(ServiceError::CrowdFull(3))
    ));
    assert_eq!(service.agent_ids().len(), 3);
    let health = service.health();
    assert_eq!((health.active_agents, health.max_agents), (3, 3));

    // A freed slot can be reused
    service.remove_agent("npc-1")?;
    service.add_agent("npc-3", &[3.0, 0.0, 3.0])?;
    assert_eq!(service.health().active_agents, 3);
    Ok(())
}

#[test]
fn test_duplicate_agent_rejected() -> ServiceResult<()> {
    let service = open_service()?;
    service.add_agent("imp", &[-2.0, 0.0, -2.0])?;
    let before = service.position("imp")?;

    assert!(matches!(
        service.add_agent("imp", &[4.0, 0.0, 4.0]),
        Err(ServiceError::DuplicateAgent(_))
    ));
    assert_eq!(service.position("imp")?, before);
    assert_eq!(service.health().active_agents, 1);
    Ok(())
}

#[test]
fn test_line_of_sight() -> ServiceResult<()> {
    let params = test_params(1);
    let mut nav_mesh = NavMesh::new(params.clone())?;
    nav_mesh.add_tile(&GridTile::new(0, 0, 4).with_blocked(&[(1, 1), (2, 1)]).to_bytes(&params)?)?;
    let service = NavService::from_mesh(nav_mesh, ServiceConfig::default())?;

    // Along the open first row
    assert!(service.has_line_of_sight(&[-8.75, 0.0, -8.75], &[-1.25, 0.0, -8.75]));
    // Across the blocked cells of the second row
    assert!(!service.has_line_of_sight(&[-8.75, 0.0, -6.25], &[-1.25, 0.0, -6.25]));
    Ok(())
}

#[test]
fn test_line_of_sight_fails_open() -> ServiceResult<()> {
    let service = open_service()?;
    assert!(service.has_line_of_sight(&[500.0, 0.0, 500.0], &[0.0, 0.0, 0.0]));
    Ok(())
}

#[test]
fn test_force_stop_dominates_pending_target() -> ServiceResult<()> {
    let service = open_service()?;
    service.add_agent("ogre", &[-6.0, 0.0, 0.0])?;
    service.set_target("ogre", &[6.0, 0.0, 0.0])?;
    for _ in 0..20 {
        service.tick(STEP)?;
    }
    assert!(dt_vlen(&service.velocity("ogre")?) > 0.1);

    // A fresh target is still waiting to be planned
    service.set_target("ogre", &[6.0, 0.0, 6.0])?;
    service.force_stop("ogre", None)?;
    service.tick(STEP)?;

    assert_eq!(service.velocity("ogre")?, [0.0; 3]);
    let snapshot = service.agent_snapshot("ogre")?;
    assert_eq!(snapshot.target_state, MoveRequestState::Velocity);
    assert_eq!(snapshot.max_acceleration, 1000.0);
    assert!(!service.is_at_target("ogre", None));

    // The brake stays until a new target moves the agent again
    service.set_target("ogre", &[6.0, 0.0, 0.0])?;
    for _ in 0..10 {
        service.tick(STEP)?;
    }
    assert!(dt_vlen(&service.velocity("ogre")?) > 0.1);
    assert_eq!(service.agent_snapshot("ogre")?.max_acceleration, 1000.0);
    Ok(())
}

#[test]
fn test_set_target_without_polygon_clears_target() -> ServiceResult<()> {
    let service = open_service()?;
    service.add_agent("bat", &[0.0, 0.0, 0.0])?;
    service.set_target("bat", &[5.0, 0.0, 5.0])?;

    assert!(matches!(
        service.set_target("bat", &[300.0, 0.0, 300.0]),
        Err(ServiceError::QueryNotFound(_))
    ));
    assert_eq!(service.agent_snapshot("bat")?.target_state, MoveRequestState::None);
    Ok(())
}

#[test]
fn test_find_path() -> ServiceResult<()> {
    let service = open_service()?;
    let path = service.find_path(&[-8.0, 0.0, -8.0], &[8.0, 0.0, 8.0]);
    assert!(path.len() >= 2);
    let first = path[0];
    let last = path[path.len() - 1];
    assert!((first[0] + 8.0).abs() < 1e-3 && (first[2] + 8.0).abs() < 1e-3);
    assert!((last[0] - 8.0).abs() < 1e-3 && (last[2] - 8.0).abs() < 1e-3);

    assert!(service.find_path(&[-8.0, 0.0, -8.0], &[80.0, 0.0, 80.0]).is_empty());
    assert_eq!(service.stats().path_queries, 2);
    Ok(())
}

#[test]
fn test_find_path_snaps_endpoint_beyond_mesh_edge() -> ServiceResult<()> {
    let service = open_service()?;
    // The mesh ends at x = -10; this start is 15 units past it
    let path = service.find_path(&[-25.0, 0.0, -5.0], &[5.0, 0.0, 5.0]);
    assert!(path.len() >= 2);
    assert!((path[0][0] + 10.0).abs() < 1e-3 && (path[0][2] + 5.0).abs() < 1e-3);

    let last = path[path.len() - 1];
    assert!((last[0] - 5.0).abs() < 1e-3 && (last[2] - 5.0).abs() < 1e-3);
    Ok(())
}

#[test]
fn test_concurrent_requests_and_ticks() -> ServiceResult<()> {
    let service = Arc::new(open_service()?);
    let ticker = {
        let service = Arc::clone(&service);
        std::thread::spawn(move || -> ServiceResult<()> {
            for _ in 0..100 {
                service.tick(STEP)?;
            }
            Ok(())
        })
    };

    let workers: Vec<_> = (0..4)
        .map(|w| {
            let service = Arc::clone(&service);
            std::thread::spawn(move || -> ServiceResult<()> {
                let id = format!("worker-{w}");
                let x = -6.0 + w as f32 * 4.0;
                service.add_agent(&id, &[x, 0.0, -6.0])?;
                for i in 0..25 {
                    service.set_target(&id, &[x, 0.0, -6.0 + (i % 5) as f32 * 3.0])?;
                    service.find_path(&[x, 0.0, -6.0], &[x, 0.0, 6.0]);
                    service.position(&id)?;
                }
                service.stop(&id)?;
                service.remove_agent(&id)
            })
        })
        .collect();

    let joined = |handle: std::thread::JoinHandle<ServiceResult<()>>| -> ServiceResult<()> {
        handle
            .join()
            .map_err(|_| ServiceError::Internal(Error::Crowd("thread panicked".to_string())))?
    };
    joined(ticker)?;
    for worker in workers {
        joined(worker)?;
    }

    assert!(service.agent_ids().is_empty());
    let stats = service.stats();
    assert_eq!(stats.agents_added, 4);
    assert_eq!(stats.agents_removed, 4);
    assert_eq!(stats.ticks, 100);
    Ok(())
}
