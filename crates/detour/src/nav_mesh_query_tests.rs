//! Query engine scenarios over generated grid meshes

use crate::test_mesh_helpers::{create_grid_navmesh, test_params, GridTile};
use crate::{NavMesh, NavMeshQuery, QueryContext, QueryFilter, Result, Status, StraightPathFlags};

const EXTENTS: [f32; 3] = [2.0, 4.0, 2.0];

/// One tile, 4x4 cells, with column 2 blocked except for the top row
fn walled_mesh() -> Result<NavMesh> {
    let params = test_params(1);
    let mut nav_mesh = NavMesh::new(params.clone())?;
    let tile = GridTile::new(0, 0, 4).with_blocked(&[(2, 0), (2, 1), (2, 2)]);
    nav_mesh.add_tile(&tile.to_bytes(&params)?)?;
    Ok(nav_mesh)
}

/// One tile, 4x4 cells, split in two by a fully blocked column
fn split_mesh() -> Result<NavMesh> {
    let params = test_params(1);
    let mut nav_mesh = NavMesh::new(params.clone())?;
    let tile = GridTile::new(0, 0, 4).with_blocked(&[(2, 0), (2, 1), (2, 2), (2, 3)]);
    nav_mesh.add_tile(&tile.to_bytes(&params)?)?;
    Ok(nav_mesh)
}

fn near(a: f32, b: f32) -> bool {
    (a - b).abs() < 1e-3
}

#[test]
fn test_find_nearest_poly_snaps_to_surface() -> Result<()> {
    let nav_mesh = create_grid_navmesh(2, 2, 4)?;
    let query = NavMeshQuery::new(&nav_mesh);
    let filter = QueryFilter::default();

    let (r, p) = query.find_nearest_poly(&[0.3, 0.5, 0.7], &EXTENTS, &filter)?;
    assert!(r.is_valid());
    assert!(near(p[0], 0.3) && near(p[1], 0.0) && near(p[2], 0.7));

    let err = query.find_nearest_poly(&[100.0, 0.0, 100.0], &EXTENTS, &filter).unwrap_err();
    assert_eq!(err.status(), Some(Status::NotFound));
    Ok(())
}

#[test]
fn test_find_nearest_poly_outside_clamps_to_edge() -> Result<()> {
    let nav_mesh = create_grid_navmesh(1, 1, 2)?;
    let query = NavMeshQuery::new(&nav_mesh);

    let (_, p) = query.find_nearest_poly(&[-11.0, 0.0, -6.0], &EXTENTS, &QueryFilter::default())?;
    assert!(near(p[0], -10.0));
    assert!(near(p[2], -6.0));
    Ok(())
}

#[test]
fn test_straight_corridor_across_tiles() -> Result<()> {
    let nav_mesh = create_grid_navmesh(2, 2, 4)?;
    let mut query = NavMeshQuery::new(&nav_mesh);
    let filter = QueryFilter::default();

    let start = [-8.75, 0.0, -8.75];
    let end = [8.75, 0.0, -8.75];
    let (start_ref, start) = query.find_nearest_poly(&start, &EXTENTS, &filter)?;
    let (end_ref, end) = query.find_nearest_poly(&end, &EXTENTS, &filter)?;

    let polys = query.find_path(start_ref, end_ref, &start, &end, &filter, 256)?;
    assert_eq!(polys.len(), 8);
    assert_eq!(polys[0], start_ref);
    assert_eq!(*polys.last().unwrap(), end_ref);

    let path = query.find_straight_path(&start, &end, &polys, 256)?;
    assert_eq!(path.len(), 2);
    assert_eq!(path.flags[0], StraightPathFlags::START);
    assert_eq!(path.flags[1], StraightPathFlags::END);
    assert!(near(path.waypoints[1][0], 8.75));
    Ok(())
}

#[test]
fn test_path_bends_around_wall() -> Result<()> {
    let nav_mesh = walled_mesh()?;
    let mut query = NavMeshQuery::new(&nav_mesh);
    let filter = QueryFilter::default();

    let (start_ref, start) = query.find_nearest_poly(&[-8.75, 0.0, -8.75], &EXTENTS, &filter)?;
    let (end_ref, end) = query.find_nearest_poly(&[-1.25, 0.0, -8.75], &EXTENTS, &filter)?;

    let polys = query.find_path(start_ref, end_ref, &start, &end, &filter, 256)?;
    assert_eq!(*polys.last().unwrap(), end_ref);

    let path = query.find_straight_path(&start, &end, &polys, 256)?;
    assert!(path.len() >= 4);
    let has_corner = |x: f32, z: f32| path.waypoints.iter().any(|w| near(w[0], x) && near(w[2], z));
    assert!(has_corner(-5.0, -2.5));
    assert!(has_corner(-2.5, -2.5));
    assert!(path.flags.last().unwrap().contains(StraightPathFlags::END));
    Ok(())
}

#[test]
fn test_unreachable_target_gives_partial_corridor() -> Result<()> {
    let nav_mesh = split_mesh()?;
    let mut query = NavMeshQuery::new(&nav_mesh);
    let filter = QueryFilter::default();

    let (start_ref, start) = query.find_nearest_poly(&[-8.75, 0.0, -8.75], &EXTENTS, &filter)?;
    let (end_ref, end) = query.find_nearest_poly(&[-1.25, 0.0, -8.75], &EXTENTS, &filter)?;

    let polys = query.find_path(start_ref, end_ref, &start, &end, &filter, 256)?;
    assert!(!polys.is_empty());
    assert_eq!(polys[0], start_ref);
    assert_ne!(*polys.last().unwrap(), end_ref);
    Ok(())
}

#[test]
fn test_find_path_limits() -> Result<()> {
    let nav_mesh = create_grid_navmesh(1, 1, 4)?;
    let mut query = NavMeshQuery::new(&nav_mesh);
    let filter = QueryFilter::default();

    let (a, pa) = query.find_nearest_poly(&[-8.75, 0.0, -8.75], &EXTENTS, &filter)?;
    let (b, pb) = query.find_nearest_poly(&[-1.25, 0.0, -1.25], &EXTENTS, &filter)?;

    assert_eq!(query.find_path(a, a, &pa, &pa, &filter, 256)?, vec![a]);

    let cut = query.find_path(a, b, &pa, &pb, &filter, 3)?;
    assert_eq!(cut.len(), 3);
    assert_eq!(cut[0], a);

    let err = query
        .find_path(crate::PolyRef::NULL, b, &pa, &pb, &filter, 256)
        .unwrap_err();
    assert_eq!(err.status(), Some(Status::InvalidParam));
    Ok(())
}

#[test]
fn test_find_path_partial_stops_early() -> Result<()> {
    let nav_mesh = create_grid_navmesh(1, 1, 4)?;
    let mut query = NavMeshQuery::new(&nav_mesh);
    let filter = QueryFilter::default();

    let (a, pa) = query.find_nearest_poly(&[-8.75, 0.0, -8.75], &EXTENTS, &filter)?;
    let (b, pb) = query.find_nearest_poly(&[-1.25, 0.0, -8.75], &EXTENTS, &filter)?;
    let full = query.find_path(a, b, &pa, &pb, &filter, 256)?;

    let partial = query.find_path_partial(a, b, &pa, &pb, &filter, 2, &full, 32)?;
    assert_eq!(partial[0], a);
    assert!(partial.len() < full.len());
    // The shortcut ends on the known corridor
    assert!(full.contains(partial.last().unwrap()));
    Ok(())
}

#[test]
fn test_straight_path_respects_max_points() -> Result<()> {
    let nav_mesh = walled_mesh()?;
    let mut query = NavMeshQuery::new(&nav_mesh);
    let filter = QueryFilter::default();

    let (a, pa) = query.find_nearest_poly(&[-8.75, 0.0, -8.75], &EXTENTS, &filter)?;
    let (b, pb) = query.find_nearest_poly(&[-1.25, 0.0, -8.75], &EXTENTS, &filter)?;
    let polys = query.find_path(a, b, &pa, &pb, &filter, 256)?;

    let path = query.find_straight_path(&pa, &pb, &polys, 2)?;
    assert_eq!(path.len(), 2);
    assert_eq!(path.flags[0], StraightPathFlags::START);
    Ok(())
}

#[test]
fn test_raycast_reaches_end() -> Result<()> {
    let nav_mesh = create_grid_navmesh(2, 1, 4)?;
    let query = NavMeshQuery::new(&nav_mesh);
    let filter = QueryFilter::default();

    let start = [-8.75, 0.0, -8.75];
    let (start_ref, _) = query.find_nearest_poly(&start, &EXTENTS, &filter)?;
    let hit = query.raycast(start_ref, &start, &[8.75, 0.0, -8.75], &filter, 32)?;
    assert!(!hit.hit_wall());
    assert!(hit.reaches_end());
    assert_eq!(hit.path.len(), 8);
    assert_eq!(hit.path[0], start_ref);
    Ok(())
}

#[test]
fn test_raycast_stops_at_mesh_border() -> Result<()> {
    let nav_mesh = create_grid_navmesh(1, 1, 4)?;
    let query = NavMeshQuery::new(&nav_mesh);
    let filter = QueryFilter::default();

    let start = [-8.75, 0.0, -8.75];
    let (start_ref, _) = query.find_nearest_poly(&start, &EXTENTS, &filter)?;
    let hit = query.raycast(start_ref, &start, &[-8.75, 0.0, -15.0], &filter, 32)?;
    assert!(hit.hit_wall());
    assert!((hit.t - 0.2).abs() < 1e-4);
    assert!(near(hit.hit_normal[2], 1.0));
    Ok(())
}

#[test]
fn test_raycast_blocked_by_wall() -> Result<()> {
    let nav_mesh = walled_mesh()?;
    let query = NavMeshQuery::new(&nav_mesh);
    let filter = QueryFilter::default();

    let start = [-8.75, 0.0, -8.75];
    let (start_ref, _) = query.find_nearest_poly(&start, &EXTENTS, &filter)?;
    let hit = query.raycast(start_ref, &start, &[-1.25, 0.0, -8.75], &filter, 32)?;
    assert!(!hit.reaches_end());
    assert!((hit.t - 0.5).abs() < 1e-4);
    assert_eq!(hit.path.len(), 2);
    Ok(())
}

#[test]
fn test_move_along_surface_slides_to_wall() -> Result<()> {
    let nav_mesh = create_grid_navmesh(1, 1, 4)?;
    let mut query = NavMeshQuery::new(&nav_mesh);
    let filter = QueryFilter::default();

    let start = [-8.75, 0.0, -8.75];
    let (start_ref, _) = query.find_nearest_poly(&start, &EXTENTS, &filter)?;

    let (pos, visited) = query.move_along_surface(start_ref, &start, &[-8.75, 0.0, -12.0], &filter, 16)?;
    assert!(near(pos[0], -8.75));
    assert!(near(pos[2], -10.0));
    assert_eq!(visited, vec![start_ref]);

    let (pos, visited) = query.move_along_surface(start_ref, &start, &[-6.25, 0.0, -8.75], &filter, 16)?;
    assert!(near(pos[0], -6.25));
    assert_eq!(visited.len(), 2);
    assert_eq!(visited[0], start_ref);
    Ok(())
}

#[test]
fn test_local_neighbourhood_within_radius() -> Result<()> {
    let nav_mesh = create_grid_navmesh(1, 1, 4)?;
    let mut query = NavMeshQuery::new(&nav_mesh);
    let filter = QueryFilter::default();

    let center = [-8.75, 0.0, -8.75];
    let (start_ref, _) = query.find_nearest_poly(&center, &EXTENTS, &filter)?;

    let polys = query.find_local_neighbourhood(start_ref, &center, 1.0, &filter, 16)?;
    assert_eq!(polys, vec![start_ref]);

    let polys = query.find_local_neighbourhood(start_ref, &center, 2.0, &filter, 16)?;
    assert_eq!(polys.len(), 4);
    assert_eq!(polys[0], start_ref);

    let capped = query.find_local_neighbourhood(start_ref, &center, 2.0, &filter, 2)?;
    assert_eq!(capped.len(), 2);
    Ok(())
}

#[test]
fn test_wall_segments() -> Result<()> {
    let nav_mesh = create_grid_navmesh(2, 1, 3)?;
    let query = NavMeshQuery::new(&nav_mesh);
    let filter = QueryFilter::default();

    // South-west corner cell: west and south edges are walls
    let (corner, _) = query.find_nearest_poly(&[-9.0, 0.0, -9.0], &EXTENTS, &filter)?;
    assert_eq!(query.get_poly_wall_segments(corner, &filter)?.len(), 2);

    // Centre cell of a tile has no walls
    let (centre, _) = query.find_nearest_poly(&[-5.0, 0.0, -5.0], &EXTENTS, &filter)?;
    assert!(query.get_poly_wall_segments(centre, &filter)?.is_empty());

    // Cell on the shared tile border only has the south wall
    let (border, _) = query.find_nearest_poly(&[-1.0, 0.0, -9.0], &EXTENTS, &filter)?;
    let walls = query.get_poly_wall_segments(border, &filter)?;
    assert_eq!(walls.len(), 1);
    assert!(near(walls[0].0[2], -10.0) && near(walls[0].1[2], -10.0));
    Ok(())
}

#[test]
fn test_context_round_trip() -> Result<()> {
    let nav_mesh = create_grid_navmesh(1, 1, 2)?;
    let query = NavMeshQuery::with_context(&nav_mesh, QueryContext::new(128));
    let context = query.into_context();
    assert_eq!(context.max_nodes(), 128);

    // A tiny pool still finds short paths
    let mut query = NavMeshQuery::with_context(&nav_mesh, context);
    let filter = QueryFilter::default();
    let (a, pa) = query.find_nearest_poly(&[-7.5, 0.0, -7.5], &EXTENTS, &filter)?;
    let (b, pb) = query.find_nearest_poly(&[-2.5, 0.0, -2.5], &EXTENTS, &filter)?;
    let polys = query.find_path(a, b, &pa, &pb, &filter, 16)?;
    assert_eq!(*polys.last().unwrap(), b);
    Ok(())
}
