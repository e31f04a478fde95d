//! Navigation mesh query implementation for Detour
//!
//! [`NavMeshQuery`] runs the spatial queries over an immutable [`NavMesh`]:
//! nearest polygon lookup, A* over polygon adjacency, funnel path
//! straightening, surface raycasts, constrained surface moves and the local
//! neighbourhood searches the crowd uses for its wall boundaries.
//!
//! The query owns its [`QueryContext`]. Callers that want to reuse scratch
//! memory across queries pass a context in with [`NavMeshQuery::with_context`]
//! and take it back with [`NavMeshQuery::into_context`].

use std::collections::VecDeque;

use detour_common::{
    dt_distance_pt_seg_sqr_2d, dt_intersect_segment_poly_2d, dt_point_in_polygon, dt_sqr, dt_tri_area_2d, dt_vdist,
    dt_vequal, dt_vlen_sqr, dt_vlerp, dt_vnormalize, dt_vsub, Error, Result, Status,
};

use super::nav_mesh::{MeshTile, Poly, DT_EXT_LINK, DT_INTERNAL_LINK_SIDE};
use super::node_pool::{NodeFlags, NodeIndex, OpenEntry, QueryContext, DT_NULL_IDX};
use super::raycast_hit::RaycastHit;
use super::{NavMesh, Path, PolyRef, QueryFilter, StraightPathFlags};

/// Heuristic scale, slightly under one so the search stays admissible
const H_SCALE: f32 = 0.999;

/// Limit of the breadth-first stacks used by local searches
const MAX_LOCAL_STACK: usize = 48;

/// Limit of neighbours gathered per edge during surface moves
const MAX_EDGE_NEIS: usize = 8;

/// Navigation mesh query structure
#[derive(Debug)]
pub struct NavMeshQuery<'a> {
    nav_mesh: &'a NavMesh,
    context: QueryContext,
}

impl<'a> NavMeshQuery<'a> {
    /// Creates a query with a freshly allocated context
    pub fn new(nav_mesh: &'a NavMesh) -> Self {
        Self::with_context(nav_mesh, QueryContext::default())
    }

    /// Creates a query that reuses an existing context
    pub fn with_context(nav_mesh: &'a NavMesh, context: QueryContext) -> Self {
        Self { nav_mesh, context }
    }

    /// Releases the context for reuse by a later query
    pub fn into_context(self) -> QueryContext {
        self.context
    }

    pub fn nav_mesh(&self) -> &'a NavMesh {
        self.nav_mesh
    }

    /// True if the reference resolves and the polygon passes the filter
    pub fn is_valid_poly_ref(&self, reference: PolyRef, filter: &QueryFilter) -> bool {
        self.nav_mesh
            .get_tile_and_poly_by_ref(reference)
            .map(|(_, poly)| filter.pass_filter(poly))
            .unwrap_or(false)
    }

    /// Finds the polygon nearest to `center` within the search box
    ///
    /// Points lying over a polygon measure only the height difference beyond the
    /// tile's walkable climb, so the polygon under a character wins over a closer
    /// polygon beside it. Returns [`Status::NotFound`] when no polygon overlaps
    /// the box.
    pub fn find_nearest_poly(
        &self,
        center: &[f32; 3],
        half_extents: &[f32; 3],
        filter: &QueryFilter,
    ) -> Result<(PolyRef, [f32; 3])> {
        let polys = self.nav_mesh.query_polygons(center, half_extents, filter);

        let mut nearest_ref = PolyRef::NULL;
        let mut nearest_point = *center;
        let mut nearest_distance_sqr = f32::MAX;

        for poly_ref in polys {
            let (closest, over_poly) = self.nav_mesh.closest_point_on_poly(poly_ref, center)?;
            let diff = dt_vsub(center, &closest);

            let d = if over_poly {
                let (tile, _) = self.nav_mesh.get_tile_and_poly_by_ref(poly_ref)?;
                let climb = diff[1].abs() - tile.header.walkable_climb;
                if climb > 0.0 {
                    climb * climb
                } else {
                    0.0
                }
            } else {
                dt_vlen_sqr(&diff)
            };

            if d < nearest_distance_sqr {
                nearest_distance_sqr = d;
                nearest_point = closest;
                nearest_ref = poly_ref;
            }
        }

        if !nearest_ref.is_valid() {
            return Err(Error::Detour(Status::NotFound));
        }

        Ok((nearest_ref, nearest_point))
    }

    /// Finds a polygon corridor from `start_ref` to `end_ref`
    ///
    /// When the end cannot be reached the corridor leads to the polygon closest
    /// to the end, so callers detect partial results by comparing the last
    /// polygon with `end_ref`. The corridor is cut to `max_path` polygons from
    /// the start.
    pub fn find_path(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &QueryFilter,
        max_path: usize,
    ) -> Result<Vec<PolyRef>> {
        self.check_endpoints(start_ref, end_ref, start_pos, end_pos, max_path)?;

        if start_ref == end_ref {
            return Ok(vec![start_ref]);
        }

        let best = self.search(start_ref, end_ref, start_pos, end_pos, filter, None)?;
        let mut path = self.context.node_pool.path_to(best);
        path.truncate(max_path);
        Ok(path)
    }

    /// Runs a bounded search and returns the corridor to the furthest polygon of
    /// `existing` the search reached
    ///
    /// Used to shortcut the start of a corridor. Falls back to the polygon closest
    /// to the end when the search touched none of `existing`.
    #[allow(clippy::too_many_arguments)]
    pub fn find_path_partial(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &QueryFilter,
        max_iter: usize,
        existing: &[PolyRef],
        max_path: usize,
    ) -> Result<Vec<PolyRef>> {
        self.check_endpoints(start_ref, end_ref, start_pos, end_pos, max_path)?;

        if start_ref == end_ref {
            return Ok(vec![start_ref]);
        }

        let best = self.search(start_ref, end_ref, start_pos, end_pos, filter, Some(max_iter))?;
        let pool = &self.context.node_pool;
        let target = existing
            .iter()
            .rev()
            .find_map(|&r| pool.find_first(r))
            .unwrap_or(best);

        let mut path = pool.path_to(target);
        path.truncate(max_path);
        Ok(path)
    }

    fn check_endpoints(
        &self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        max_path: usize,
    ) -> Result<()> {
        if !self.nav_mesh.is_valid_poly_ref(start_ref)
            || !self.nav_mesh.is_valid_poly_ref(end_ref)
            || !start_pos.iter().chain(end_pos.iter()).all(|v| v.is_finite())
            || max_path == 0
        {
            return Err(Error::Detour(Status::InvalidParam));
        }
        Ok(())
    }

    /// A* over polygon adjacency; returns the end node or the node closest to it
    fn search(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &QueryFilter,
        max_iter: Option<usize>,
    ) -> Result<NodeIndex> {
        let mesh = self.nav_mesh;
        let ctx = &mut self.context;
        ctx.reset();

        let start = ctx
            .node_pool
            .get_node(start_ref, 0)
            .ok_or(Error::Detour(Status::OutOfNodes))?;
        {
            let node = ctx.node_pool.node_mut(start);
            node.pos = *start_pos;
            node.parent = DT_NULL_IDX;
            node.cost = 0.0;
            node.total = dt_vdist(start_pos, end_pos) * H_SCALE;
            node.flags = NodeFlags::OPEN;
        }
        ctx.open_list.push(OpenEntry {
            total: ctx.node_pool.node(start).total,
            idx: start,
        });

        let mut last_best = start;
        let mut last_best_cost = ctx.node_pool.node(start).total;
        let mut out_of_nodes = false;
        let mut iterations = 0usize;

        while let Some(entry) = ctx.open_list.pop() {
            let best = entry.idx;
            {
                let node = ctx.node_pool.node(best);
                // Superseded entry
                if !node.flags.contains(NodeFlags::OPEN) || node.total != entry.total {
                    continue;
                }
            }

            if let Some(limit) = max_iter {
                if iterations >= limit {
                    break;
                }
            }
            iterations += 1;

            let (best_ref, best_pos, best_cost, parent_idx) = {
                let node = ctx.node_pool.node_mut(best);
                node.flags.remove(NodeFlags::OPEN);
                node.flags.insert(NodeFlags::CLOSED);
                (node.id, node.pos, node.cost, node.parent)
            };

            if best_ref == end_ref {
                last_best = best;
                break;
            }

            let parent_ref = if parent_idx != DT_NULL_IDX {
                ctx.node_pool.node(parent_idx).id
            } else {
                PolyRef::NULL
            };

            let (best_tile, best_poly) = mesh.get_tile_and_poly_by_ref(best_ref)?;

            for link in best_tile.poly_links(best_poly) {
                let neighbour_ref = link.reference;
                if !neighbour_ref.is_valid() || neighbour_ref == parent_ref {
                    continue;
                }

                let (_, neighbour_poly) = mesh.get_tile_and_poly_by_ref(neighbour_ref)?;
                if neighbour_poly.is_off_mesh_connection() || !filter.pass_filter(neighbour_poly) {
                    continue;
                }

                // Border polygons may be entered through several portals
                let cross_side = if link.side != DT_INTERNAL_LINK_SIDE { link.side >> 1 } else { 0 };

                let Some(neighbour) = ctx.node_pool.get_node(neighbour_ref, cross_side) else {
                    out_of_nodes = true;
                    continue;
                };

                if ctx.node_pool.node(neighbour).flags.is_empty() {
                    ctx.node_pool.node_mut(neighbour).pos = mesh.get_edge_mid_point(best_ref, neighbour_ref)?;
                }
                let neighbour_pos = ctx.node_pool.node(neighbour).pos;

                let (cost, heuristic) = if neighbour_ref == end_ref {
                    let cur_cost = filter.get_cost(&best_pos, &neighbour_pos, best_poly);
                    let end_cost = filter.get_cost(&neighbour_pos, end_pos, neighbour_poly);
                    (best_cost + cur_cost + end_cost, 0.0)
                } else {
                    let cur_cost = filter.get_cost(&best_pos, &neighbour_pos, best_poly);
                    (best_cost + cur_cost, dt_vdist(&neighbour_pos, end_pos) * H_SCALE)
                };
                let total = cost + heuristic;

                let node = ctx.node_pool.node_mut(neighbour);
                if node.flags.intersects(NodeFlags::OPEN | NodeFlags::CLOSED) && total >= node.total {
                    continue;
                }

                node.parent = best;
                node.flags.remove(NodeFlags::CLOSED);
                node.flags.insert(NodeFlags::OPEN);
                node.cost = cost;
                node.total = total;
                ctx.open_list.push(OpenEntry { total, idx: neighbour });

                if heuristic < last_best_cost {
                    last_best_cost = heuristic;
                    last_best = neighbour;
                }
            }
        }

        if out_of_nodes {
            log::debug!("Path search ran out of nodes ({} in pool)", ctx.node_pool.max_nodes());
        }

        Ok(last_best)
    }

    /// Contracts a polygon corridor into straight segments using the funnel algorithm
    ///
    /// The start and end points are clamped onto the first and last polygons.
    /// At most `max_points` points are produced.
    pub fn find_straight_path(
        &self,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        path: &[PolyRef],
        max_points: usize,
    ) -> Result<Path> {
        if path.is_empty() || max_points == 0 {
            return Err(Error::Detour(Status::InvalidParam));
        }

        let mesh = self.nav_mesh;
        let last = path.len() - 1;
        let start = mesh.closest_point_on_poly_boundary(path[0], start_pos)?;
        let mut end = mesh.closest_point_on_poly_boundary(path[last], end_pos)?;

        let mut result = Path::default();
        if !append_vertex(&mut result, start, StraightPathFlags::START, path[0], max_points) {
            return Ok(result);
        }

        if path.len() > 1 {
            let mut apex = start;
            let mut portal_left = apex;
            let mut portal_right = apex;
            let mut left_index = 0usize;
            let mut right_index = 0usize;
            let mut left_ref = path[0];
            let mut right_ref = path[0];

            let mut i = 0usize;
            while i < path.len() {
                let (left, right) = if i < last {
                    match mesh.get_portal_points(path[i], path[i + 1]) {
                        Ok(points) => points,
                        Err(_) => {
                            // Corridor is broken here; end at the closest point on the last good polygon
                            end = mesh.closest_point_on_poly_boundary(path[i], end_pos)?;
                            append_vertex(&mut result, end, StraightPathFlags::empty(), path[i], max_points);
                            return Ok(result);
                        }
                    }
                } else {
                    (end, end)
                };

                if i == 0 {
                    let (d, _) = dt_distance_pt_seg_sqr_2d(&apex, &left, &right);
                    if d < dt_sqr(0.001) {
                        i += 1;
                        continue;
                    }
                }

                let next_ref = if i < last { path[i + 1] } else { PolyRef::NULL };

                // Right side of the funnel
                if dt_tri_area_2d(&apex, &portal_right, &right) <= 0.0 {
                    if dt_vequal(&apex, &portal_right) || dt_tri_area_2d(&apex, &portal_left, &right) > 0.0 {
                        portal_right = right;
                        right_ref = next_ref;
                        right_index = i;
                    } else {
                        apex = portal_left;
                        let apex_index = left_index;
                        let flags = if left_ref.is_valid() {
                            StraightPathFlags::empty()
                        } else {
                            StraightPathFlags::END
                        };
                        if !append_vertex(&mut result, apex, flags, left_ref, max_points) {
                            return Ok(result);
                        }
                        portal_left = apex;
                        portal_right = apex;
                        left_index = apex_index;
                        right_index = apex_index;
                        i = apex_index + 1;
                        continue;
                    }
                }

                // Left side of the funnel
                if dt_tri_area_2d(&apex, &portal_left, &left) >= 0.0 {
                    if dt_vequal(&apex, &portal_left) || dt_tri_area_2d(&apex, &portal_right, &left) < 0.0 {
                        portal_left = left;
                        left_ref = next_ref;
                        left_index = i;
                    } else {
                        apex = portal_right;
                        let apex_index = right_index;
                        let flags = if right_ref.is_valid() {
                            StraightPathFlags::empty()
                        } else {
                            StraightPathFlags::END
                        };
                        if !append_vertex(&mut result, apex, flags, right_ref, max_points) {
                            return Ok(result);
                        }
                        portal_left = apex;
                        portal_right = apex;
                        left_index = apex_index;
                        right_index = apex_index;
                        i = apex_index + 1;
                        continue;
                    }
                }

                i += 1;
            }
        }

        append_vertex(&mut result, end, StraightPathFlags::END, PolyRef::NULL, max_points);
        Ok(result)
    }

    /// Casts a ray along the surface from `start_pos` towards `end_pos`
    ///
    /// The ray follows polygon links across edges and stops at the first wall.
    /// `t` is the hit parameter along the whole segment, or `f32::MAX` when the
    /// end point was reached. At most `max_path` visited polygons are recorded.
    pub fn raycast(
        &self,
        start_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &QueryFilter,
        max_path: usize,
    ) -> Result<RaycastHit> {
        if !self.nav_mesh.is_valid_poly_ref(start_ref)
            || !start_pos.iter().chain(end_pos.iter()).all(|v| v.is_finite())
        {
            return Err(Error::Detour(Status::InvalidParam));
        }

        let mesh = self.nav_mesh;
        let mut hit = RaycastHit::wall_hit(0.0, [0.0; 3], -1);
        let mut cur_ref = start_ref;

        // A straight line enters each convex polygon at most once
        for _ in 0..=mesh.poly_count() {
            let (tile, poly) = mesh.get_tile_and_poly_by_ref(cur_ref)?;
            let verts = tile.poly_verts(poly);

            let Some((_, tmax, _, seg_max)) = dt_intersect_segment_poly_2d(start_pos, end_pos, &verts) else {
                // Could not hit the polygon; keep the last t
                return Ok(hit);
            };

            hit.hit_edge_index = seg_max;
            if tmax > hit.t {
                hit.t = tmax;
            }
            if hit.path.len() < max_path {
                hit.path.push(cur_ref);
            }

            if seg_max == -1 {
                // Ray end lies inside this polygon
                hit.t = f32::MAX;
                return Ok(hit);
            }

            match self.next_poly_along_ray(tile, poly, seg_max as usize, start_pos, end_pos, tmax, filter)? {
                Some(next) => cur_ref = next,
                None => {
                    let nv = verts.len();
                    let va = &verts[seg_max as usize];
                    let vb = &verts[(seg_max as usize + 1) % nv];
                    let mut normal = [vb[2] - va[2], 0.0, -(vb[0] - va[0])];
                    dt_vnormalize(&mut normal);
                    hit.hit_normal = normal;
                    return Ok(hit);
                }
            }
        }

        Ok(hit)
    }

    #[allow(clippy::too_many_arguments)]
    fn next_poly_along_ray(
        &self,
        tile: &MeshTile,
        poly: &Poly,
        edge: usize,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        tmax: f32,
        filter: &QueryFilter,
    ) -> Result<Option<PolyRef>> {
        let nv = poly.vert_count as usize;
        for link in tile.poly_links(poly) {
            if link.edge as usize != edge {
                continue;
            }

            let (_, next_poly) = self.nav_mesh.get_tile_and_poly_by_ref(link.reference)?;
            if next_poly.is_off_mesh_connection() || !filter.pass_filter(next_poly) {
                continue;
            }

            if !link.is_tile_border() || (link.bmin == 0 && link.bmax == 255) {
                return Ok(Some(link.reference));
            }

            // Partial portal: check the crossing lies within the linked span
            let v0 = &tile.verts[poly.verts[edge] as usize];
            let v1 = &tile.verts[poly.verts[(edge + 1) % nv] as usize];
            let axis = match link.side {
                0 | 4 => 2,
                2 | 6 => 0,
                _ => continue,
            };
            let s = 1.0 / 255.0;
            let mut lmin = v0[axis] + (v1[axis] - v0[axis]) * (link.bmin as f32 * s);
            let mut lmax = v0[axis] + (v1[axis] - v0[axis]) * (link.bmax as f32 * s);
            if lmin > lmax {
                std::mem::swap(&mut lmin, &mut lmax);
            }
            let cross = start_pos[axis] + (end_pos[axis] - start_pos[axis]) * tmax;
            if cross >= lmin && cross <= lmax {
                return Ok(Some(link.reference));
            }
        }
        Ok(None)
    }

    /// Moves from `start_pos` towards `end_pos` while staying on the surface
    ///
    /// Searches the polygons around the movement segment breadth first and
    /// returns the reachable position closest to `end_pos` together with the
    /// polygons visited on the way there, start first.
    pub fn move_along_surface(
        &mut self,
        start_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &QueryFilter,
        max_visited: usize,
    ) -> Result<([f32; 3], Vec<PolyRef>)> {
        if !self.nav_mesh.is_valid_poly_ref(start_ref)
            || !start_pos.iter().chain(end_pos.iter()).all(|v| v.is_finite())
        {
            return Err(Error::Detour(Status::InvalidParam));
        }

        let mesh = self.nav_mesh;
        let pool = &mut self.context.tiny_pool;
        pool.clear();

        let start = pool.get_node(start_ref, 0).ok_or(Error::Detour(Status::OutOfNodes))?;
        pool.node_mut(start).flags = NodeFlags::CLOSED;

        let mut stack = VecDeque::with_capacity(MAX_LOCAL_STACK);
        stack.push_back(start);

        let mut best_pos = *start_pos;
        let mut best_dist = f32::MAX;
        let mut best_node = None;

        let search_pos = dt_vlerp(start_pos, end_pos, 0.5);
        let search_rad_sqr = dt_sqr(dt_vdist(start_pos, end_pos) / 2.0 + 0.001);

        while let Some(cur) = stack.pop_front() {
            let cur_ref = pool.node(cur).id;
            let (tile, poly) = mesh.get_tile_and_poly_by_ref(cur_ref)?;
            let verts = tile.poly_verts(poly);
            let nv = verts.len();

            if dt_point_in_polygon(end_pos, &verts) {
                best_node = Some(cur);
                best_pos = *end_pos;
                break;
            }

            for j in 0..nv {
                let vj = &verts[j];
                let vi = &verts[(j + 1) % nv];
                let neis = edge_neighbours(mesh, tile, poly, j, filter)?;

                if neis.is_empty() {
                    // Wall edge
                    let (d, t) = dt_distance_pt_seg_sqr_2d(end_pos, vj, vi);
                    if d < best_dist {
                        best_pos = dt_vlerp(vj, vi, t);
                        best_dist = d;
                        best_node = Some(cur);
                    }
                    continue;
                }

                for nei in neis {
                    let Some(node) = pool.get_node(nei, 0) else {
                        continue;
                    };
                    if pool.node(node).flags.contains(NodeFlags::CLOSED) {
                        continue;
                    }

                    // Stay within the circle around the movement segment
                    let (d, _) = dt_distance_pt_seg_sqr_2d(&search_pos, vj, vi);
                    if d > search_rad_sqr {
                        continue;
                    }

                    if stack.len() < MAX_LOCAL_STACK {
                        let n = pool.node_mut(node);
                        n.parent = cur;
                        n.flags.insert(NodeFlags::CLOSED);
                        stack.push_back(node);
                    }
                }
            }
        }

        let mut visited = best_node.map(|n| pool.path_to(n)).unwrap_or_default();
        visited.truncate(max_visited);
        Ok((best_pos, visited))
    }

    /// Collects polygons around `center` reachable without leaving `radius`
    ///
    /// The start polygon is always first. At most `max_result` polygons are returned.
    pub fn find_local_neighbourhood(
        &mut self,
        start_ref: PolyRef,
        center: &[f32; 3],
        radius: f32,
        filter: &QueryFilter,
        max_result: usize,
    ) -> Result<Vec<PolyRef>> {
        if !self.nav_mesh.is_valid_poly_ref(start_ref) || !center.iter().all(|v| v.is_finite()) || radius < 0.0 {
            return Err(Error::Detour(Status::InvalidParam));
        }

        let mesh = self.nav_mesh;
        let pool = &mut self.context.tiny_pool;
        pool.clear();

        let start = pool.get_node(start_ref, 0).ok_or(Error::Detour(Status::OutOfNodes))?;
        pool.node_mut(start).flags = NodeFlags::CLOSED;

        let mut stack = VecDeque::with_capacity(MAX_LOCAL_STACK);
        stack.push_back(start);

        let radius_sqr = dt_sqr(radius);
        let mut result = vec![start_ref];

        while let Some(cur) = stack.pop_front() {
            let cur_ref = pool.node(cur).id;
            let (tile, poly) = mesh.get_tile_and_poly_by_ref(cur_ref)?;

            for link in tile.poly_links(poly) {
                let neighbour_ref = link.reference;
                if !neighbour_ref.is_valid() {
                    continue;
                }
                let Some(node) = pool.get_node(neighbour_ref, 0) else {
                    continue;
                };
                if pool.node(node).flags.contains(NodeFlags::CLOSED) {
                    continue;
                }

                let (_, neighbour_poly) = mesh.get_tile_and_poly_by_ref(neighbour_ref)?;
                if neighbour_poly.is_off_mesh_connection() || !filter.pass_filter(neighbour_poly) {
                    continue;
                }

                let (va, vb) = mesh.get_portal_points(cur_ref, neighbour_ref)?;
                let (d, _) = dt_distance_pt_seg_sqr_2d(center, &va, &vb);
                if d > radius_sqr {
                    continue;
                }

                let n = pool.node_mut(node);
                n.flags.insert(NodeFlags::CLOSED);
                n.parent = cur;

                if result.len() < max_result {
                    result.push(neighbour_ref);
                }
                if stack.len() < MAX_LOCAL_STACK {
                    stack.push_back(node);
                }
            }
        }

        Ok(result)
    }

    /// Returns the wall segments of a polygon
    ///
    /// Edges leading to polygons that fail the filter count as walls, as do the
    /// parts of tile border edges not covered by any link.
    pub fn get_poly_wall_segments(&self, reference: PolyRef, filter: &QueryFilter) -> Result<Vec<([f32; 3], [f32; 3])>> {
        let (tile, poly) = self.nav_mesh.get_tile_and_poly_by_ref(reference)?;
        let verts = tile.poly_verts(poly);
        let nv = verts.len();
        let mut segments = Vec::new();

        for j in 0..nv {
            let vj = &verts[j];
            let vi = &verts[(j + 1) % nv];
            let nei = poly.neis[j];

            if nei & DT_EXT_LINK != 0 {
                // Covered spans along the edge, in 0..=255 units
                let mut spans: Vec<(i32, i32)> = vec![(-1, 0), (255, 256)];
                for link in tile.poly_links(poly) {
                    if link.edge as usize != j || !link.reference.is_valid() {
                        continue;
                    }
                    let (_, nei_poly) = self.nav_mesh.get_tile_and_poly_by_ref(link.reference)?;
                    if filter.pass_filter(nei_poly) {
                        spans.push((link.bmin as i32, link.bmax as i32));
                    }
                }
                spans.sort_unstable();

                for pair in spans.windows(2) {
                    let (lo, hi) = (pair[0].1, pair[1].0);
                    if hi > lo {
                        let tmin = lo as f32 / 255.0;
                        let tmax = hi as f32 / 255.0;
                        segments.push((dt_vlerp(vj, vi, tmin), dt_vlerp(vj, vi, tmax)));
                    }
                }
                continue;
            }

            let passable = nei != 0
                && tile
                    .polys
                    .get(nei as usize - 1)
                    .map(|p| filter.pass_filter(p))
                    .unwrap_or(false);
            if !passable {
                segments.push((*vj, *vi));
            }
        }

        Ok(segments)
    }

    /// Height of the surface at `pos` over a polygon
    pub fn get_poly_height(&self, reference: PolyRef, pos: &[f32; 3]) -> Result<Option<f32>> {
        self.nav_mesh.get_poly_height(reference, pos)
    }

    pub fn closest_point_on_poly(&self, reference: PolyRef, pos: &[f32; 3]) -> Result<([f32; 3], bool)> {
        self.nav_mesh.closest_point_on_poly(reference, pos)
    }
}

/// Polygons reachable across edge `edge` of `poly` that pass the filter
fn edge_neighbours(
    mesh: &NavMesh,
    tile: &MeshTile,
    poly: &Poly,
    edge: usize,
    filter: &QueryFilter,
) -> Result<Vec<PolyRef>> {
    let nei = poly.neis[edge];
    let mut result = Vec::new();

    if nei & DT_EXT_LINK != 0 {
        for link in tile.poly_links(poly) {
            if link.edge as usize != edge || !link.reference.is_valid() {
                continue;
            }
            let (_, nei_poly) = mesh.get_tile_and_poly_by_ref(link.reference)?;
            if filter.pass_filter(nei_poly) && result.len() < MAX_EDGE_NEIS {
                result.push(link.reference);
            }
        }
    } else if nei != 0 {
        // Internal neighbours are found through the link list
        if let Some(link) = tile
            .poly_links(poly)
            .find(|l| l.edge as usize == edge && !l.is_tile_border())
        {
            let (_, nei_poly) = mesh.get_tile_and_poly_by_ref(link.reference)?;
            if filter.pass_filter(nei_poly) {
                result.push(link.reference);
            }
        }
    }

    Ok(result)
}

/// Appends a point to a straight path; returns false once the path is complete
fn append_vertex(path: &mut Path, pos: [f32; 3], flags: StraightPathFlags, reference: PolyRef, max_points: usize) -> bool {
    if let Some(last) = path.waypoints.last() {
        if dt_vequal(last, &pos) {
            // Same point: the newer flags and polygon win
            let n = path.len() - 1;
            path.flags[n] = flags;
            path.poly_refs[n] = reference;
            return true;
        }
    }

    path.waypoints.push(pos);
    path.flags.push(flags);
    path.poly_refs.push(reference);

    path.len() < max_points && !flags.contains(StraightPathFlags::END)
}
