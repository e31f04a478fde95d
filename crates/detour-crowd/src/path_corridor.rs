//! Path corridor for Detour crowds
//!
//! A [`PathCorridor`] keeps the polygon corridor an agent follows together
//! with its current position and target. The position is moved with
//! constrained surface moves and the corridor start is patched up with the
//! polygons visited on the way, so the corridor stays valid without replanning
//! every frame.

use detour::{NavMeshQuery, Path, PolyRef, QueryFilter, StraightPathFlags};
use detour_common::{dt_sqr, dt_vdist_2d, dt_vdist_2d_sqr, dt_vmad, dt_vsub, Error, Result, Status};

/// Maximum number of polygons in a path corridor
pub const MAX_PATH_POLYS: usize = 256;

/// Corners closer than this to the position are dropped
const MIN_TARGET_DIST: f32 = 0.01;

/// Polygons recorded by one constrained move
const MAX_VISITED: usize = 16;

/// Path corridor for smooth path following
#[derive(Debug, Clone)]
pub struct PathCorridor {
    pos: [f32; 3],
    target: [f32; 3],
    path: Vec<PolyRef>,
    max_path: usize,
}

impl Default for PathCorridor {
    fn default() -> Self {
        Self::new(MAX_PATH_POLYS)
    }
}

impl PathCorridor {
    pub fn new(max_path: usize) -> Self {
        Self {
            pos: [0.0; 3],
            target: [0.0; 3],
            path: Vec::with_capacity(max_path),
            max_path: max_path.max(1),
        }
    }

    /// Collapses the corridor to a single polygon at `pos`
    pub fn reset(&mut self, reference: PolyRef, pos: [f32; 3]) {
        self.pos = pos;
        self.target = pos;
        self.path.clear();
        if reference.is_valid() {
            self.path.push(reference);
        }
    }

    /// Replaces the corridor with a planned path to `target`
    pub fn set_corridor(&mut self, target: [f32; 3], path: &[PolyRef]) {
        self.target = target;
        self.path.clear();
        self.path
            .extend_from_slice(&path[..path.len().min(self.max_path)]);
    }

    /// Finds the next corners to steer towards
    ///
    /// Corners too close to the current position are pruned, as is everything
    /// after an off-mesh connection.
    pub fn find_corners(&self, max_corners: usize, query: &NavMeshQuery, _filter: &QueryFilter) -> Result<Path> {
        if self.path.is_empty() {
            return Err(Error::Detour(Status::InvalidParam));
        }

        let mut corners = query.find_straight_path(&self.pos, &self.target, &self.path, max_corners)?;

        let mut skip = 0;
        while skip < corners.len() {
            if corners.flags[skip].contains(StraightPathFlags::OFFMESH_CONNECTION)
                || dt_vdist_2d_sqr(&corners.waypoints[skip], &self.pos) > dt_sqr(MIN_TARGET_DIST)
            {
                break;
            }
            skip += 1;
        }
        if skip > 0 {
            corners.waypoints.drain(..skip);
            corners.flags.drain(..skip);
            corners.poly_refs.drain(..skip);
        }

        if let Some(i) = corners
            .flags
            .iter()
            .position(|f| f.contains(StraightPathFlags::OFFMESH_CONNECTION))
        {
            corners.waypoints.truncate(i + 1);
            corners.flags.truncate(i + 1);
            corners.poly_refs.truncate(i + 1);
        }

        Ok(corners)
    }

    /// Shortcuts the corridor start towards `next` if it is directly visible
    ///
    /// A ray is cast from the current position towards `next`, extended to
    /// `path_optimization_range`. If it travels most of that distance, the
    /// polygons it crossed replace the start of the corridor.
    pub fn optimize_path_visibility(
        &mut self,
        next: &[f32; 3],
        path_optimization_range: f32,
        query: &NavMeshQuery,
        filter: &QueryFilter,
    ) -> Result<()> {
        const MAX_RES: usize = 32;

        let first = self.first_poly();
        if !first.is_valid() {
            return Ok(());
        }

        let mut dist = dt_vdist_2d(&self.pos, next);
        if dist < 0.01 {
            return Ok(());
        }
        dist = (dist + 0.01).min(path_optimization_range);

        let delta = dt_vsub(next, &self.pos);
        let goal = dt_vmad(&self.pos, &delta, path_optimization_range / dist);

        let hit = query.raycast(first, &self.pos, &goal, filter, MAX_RES)?;
        if hit.path.len() > 1 && hit.t > 0.99 {
            merge_corridor_start_shortcut(&mut self.path, self.max_path, &hit.path);
        }
        Ok(())
    }

    /// Replans the corridor start with a short bounded search
    ///
    /// Returns true if the corridor changed.
    pub fn optimize_path_topology(&mut self, query: &mut NavMeshQuery, filter: &QueryFilter) -> Result<bool> {
        const MAX_ITER: usize = 32;
        const MAX_RES: usize = 32;

        if self.path.len() < 3 {
            return Ok(false);
        }

        let res = query.find_path_partial(
            self.first_poly(),
            self.last_poly(),
            &self.pos,
            &self.target,
            filter,
            MAX_ITER,
            &self.path,
            MAX_RES,
        )?;

        if res.is_empty() {
            return Ok(false);
        }
        Ok(merge_corridor_start_shortcut(&mut self.path, self.max_path, &res))
    }

    /// Moves the position towards `npos` along the surface
    ///
    /// The corridor start is updated with the polygons the move visited and
    /// the height is snapped onto the first polygon.
    pub fn move_position(&mut self, npos: &[f32; 3], query: &mut NavMeshQuery, filter: &QueryFilter) -> Result<()> {
        let first = self.first_poly();
        if !first.is_valid() {
            return Err(Error::Detour(Status::InvalidParam));
        }

        let (mut result, visited) = query.move_along_surface(first, &self.pos, npos, filter, MAX_VISITED)?;
        merge_corridor_start_moved(&mut self.path, self.max_path, &visited);

        if let Some(h) = query.get_poly_height(self.first_poly(), &result)? {
            result[1] = h;
        }
        self.pos = result;
        Ok(())
    }

    pub fn pos(&self) -> &[f32; 3] {
        &self.pos
    }

    pub fn target(&self) -> &[f32; 3] {
        &self.target
    }

    pub fn path(&self) -> &[PolyRef] {
        &self.path
    }

    pub fn path_count(&self) -> usize {
        self.path.len()
    }

    pub fn first_poly(&self) -> PolyRef {
        self.path.first().copied().unwrap_or(PolyRef::NULL)
    }

    pub fn last_poly(&self) -> PolyRef {
        self.path.last().copied().unwrap_or(PolyRef::NULL)
    }
}

/// Index pair of the furthest polygon `path` and `visited` share
fn furthest_common(path: &[PolyRef], visited: &[PolyRef]) -> Option<(usize, usize)> {
    path.iter()
        .enumerate()
        .rev()
        .find_map(|(i, p)| visited.iter().rposition(|v| v == p).map(|j| (i, j)))
}

/// Patches the corridor start after a surface move
///
/// `visited` runs from the old first polygon to the polygon the agent ended
/// in. The corridor is rejoined at the furthest polygon both share. Returns
/// false if they share none and the corridor is left as it was.
pub fn merge_corridor_start_moved(path: &mut Vec<PolyRef>, max_path: usize, visited: &[PolyRef]) -> bool {
    let Some((furthest_path, furthest_visited)) = furthest_common(path, visited) else {
        return false;
    };

    let mut merged: Vec<PolyRef> = visited[furthest_visited..].iter().rev().copied().collect();
    merged.extend_from_slice(&path[(furthest_path + 1).min(path.len())..]);
    merged.truncate(max_path);
    *path = merged;
    true
}

/// Replaces the corridor start with a shortcut corridor
///
/// The shortcut must lead into the existing corridor; everything before the
/// furthest shared polygon is swapped for the shortcut polygons.
pub fn merge_corridor_start_shortcut(path: &mut Vec<PolyRef>, max_path: usize, visited: &[PolyRef]) -> bool {
    let Some((furthest_path, furthest_visited)) = furthest_common(path, visited) else {
        return false;
    };
    if furthest_visited == 0 {
        return false;
    }

    let mut merged: Vec<PolyRef> = visited[..furthest_visited].to_vec();
    merged.extend_from_slice(&path[furthest_path..]);
    merged.truncate(max_path);
    *path = merged;
    true
}
