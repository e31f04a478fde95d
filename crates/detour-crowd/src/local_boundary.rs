use detour::{NavMeshQuery, PolyRef, QueryFilter};
use detour_common::{dt_distance_pt_seg_sqr_2d, dt_sqr, Result};

const MAX_LOCAL_SEGS: usize = 8;
const MAX_LOCAL_POLYS: usize = 16;

#[derive(Debug, Clone, Copy)]
struct Segment {
    s: [f32; 6], // start_x, start_y, start_z, end_x, end_y, end_z
    d: f32,      // squared distance from the center, for pruning
}

/// Wall segments near an agent, nearest first
#[derive(Debug, Clone)]
pub struct DtLocalBoundary {
    center: [f32; 3],
    segs: Vec<Segment>,
    polys: Vec<PolyRef>,
}

impl Default for DtLocalBoundary {
    fn default() -> Self {
        Self::new()
    }
}

impl DtLocalBoundary {
    pub fn new() -> Self {
        Self {
            center: [f32::MAX; 3],
            segs: Vec::with_capacity(MAX_LOCAL_SEGS),
            polys: Vec::with_capacity(MAX_LOCAL_POLYS),
        }
    }

    /// Forgets the boundary so the next update rebuilds it
    pub fn reset(&mut self) {
        self.center = [f32::MAX; 3];
        self.segs.clear();
        self.polys.clear();
    }

    /// Keeps the nearest segments, sorted by distance
    fn add_segment(&mut self, dist: f32, s: [f32; 6]) {
        if self.segs.len() >= MAX_LOCAL_SEGS {
            match self.segs.last() {
                Some(last) if dist >= last.d => return,
                _ => {}
            }
        }

        let at = self.segs.iter().position(|seg| dist <= seg.d).unwrap_or(self.segs.len());
        self.segs.insert(at, Segment { s, d: dist });
        self.segs.truncate(MAX_LOCAL_SEGS);
    }

    /// Collects the walls of the polygons around `pos`
    ///
    /// Only segments within `collision_query_range` of `pos` are kept.
    pub fn update(
        &mut self,
        poly_ref: PolyRef,
        pos: &[f32; 3],
        collision_query_range: f32,
        navquery: &mut NavMeshQuery,
        filter: &QueryFilter,
    ) -> Result<()> {
        if !poly_ref.is_valid() {
            self.reset();
            return Ok(());
        }

        self.center = *pos;
        self.segs.clear();
        self.polys =
            navquery.find_local_neighbourhood(poly_ref, pos, collision_query_range, filter, MAX_LOCAL_POLYS)?;

        let range_sqr = dt_sqr(collision_query_range);
        for i in 0..self.polys.len() {
            for (p, q) in navquery.get_poly_wall_segments(self.polys[i], filter)? {
                let (dist_sqr, _) = dt_distance_pt_seg_sqr_2d(pos, &p, &q);
                if dist_sqr > range_sqr {
                    continue;
                }
                self.add_segment(dist_sqr, [p[0], p[1], p[2], q[0], q[1], q[2]]);
            }
        }

        Ok(())
    }

    /// False if the boundary is empty or one of its polygons no longer passes the filter
    pub fn is_valid(&self, navquery: &NavMeshQuery, filter: &QueryFilter) -> bool {
        !self.polys.is_empty() && self.polys.iter().all(|&p| navquery.is_valid_poly_ref(p, filter))
    }

    pub fn center(&self) -> &[f32; 3] {
        &self.center
    }

    pub fn segment_count(&self) -> usize {
        self.segs.len()
    }

    pub fn segment(&self, i: usize) -> Option<&[f32; 6]> {
        self.segs.get(i).map(|seg| &seg.s)
    }

    pub fn segments(&self) -> impl Iterator<Item = &[f32; 6]> {
        self.segs.iter().map(|seg| &seg.s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use detour::test_mesh_helpers::{create_grid_navmesh, test_params, GridTile};
    use detour::NavMesh;

    #[test]
    fn test_segments_sorted_and_capped() {
        let mut boundary = DtLocalBoundary::new();
        for i in (0..12).rev() {
            boundary.add_segment(i as f32, [i as f32; 6]);
        }
        assert_eq!(boundary.segment_count(), MAX_LOCAL_SEGS);
        let dists: Vec<f32> = boundary.segs.iter().map(|s| s.d).collect();
        assert_eq!(dists, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);

        // Further than everything kept when full
        boundary.add_segment(20.0, [0.0; 6]);
        assert_eq!(boundary.segs.last().map(|s| s.d), Some(7.0));
    }

    #[test]
    fn test_update_collects_nearby_walls() -> Result<()> {
        let nav_mesh = create_grid_navmesh(1, 1, 4)?;
        let mut query = NavMeshQuery::new(&nav_mesh);
        let filter = QueryFilter::default();
        let (r, pos) = query.find_nearest_poly(&[-9.0, 0.0, -9.0], &[1.0, 1.0, 1.0], &filter)?;

        let mut boundary = DtLocalBoundary::new();
        boundary.update(r, &pos, 1.2, &mut query, &filter)?;
        assert_eq!(boundary.center(), &pos);
        // The west and south tile borders of the corner cell
        assert_eq!(boundary.segment_count(), 2);
        assert!(boundary.is_valid(&query, &filter));

        // Far from every wall
        let (r, pos) = query.find_nearest_poly(&[-6.25, 0.0, -6.25], &[1.0, 1.0, 1.0], &filter)?;
        boundary.update(r, &pos, 1.0, &mut query, &filter)?;
        assert_eq!(boundary.segment_count(), 0);
        Ok(())
    }

    #[test]
    fn test_blocked_cell_adds_wall() -> Result<()> {
        let params = test_params(1);
        let mut nav_mesh = NavMesh::new(params.clone())?;
        nav_mesh.add_tile(&GridTile::new(0, 0, 4).with_blocked(&[(2, 1)]).to_bytes(&params)?)?;
        let mut query = NavMeshQuery::new(&nav_mesh);
        let filter = QueryFilter::default();

        // Cell (1, 1) spans x in [-7.5, -5]; the blocked cell is east of it
        let (r, pos) = query.find_nearest_poly(&[-5.5, 0.0, -6.25], &[1.0, 1.0, 1.0], &filter)?;
        let mut boundary = DtLocalBoundary::new();
        boundary.update(r, &pos, 1.0, &mut query, &filter)?;
        assert_eq!(boundary.segment_count(), 1);
        let seg = boundary.segment(0).copied().unwrap_or([0.0; 6]);
        assert!((seg[0] + 5.0).abs() < 1e-3 && (seg[3] + 5.0).abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn test_null_ref_resets() -> Result<()> {
        let nav_mesh = create_grid_navmesh(1, 1, 2)?;
        let mut query = NavMeshQuery::new(&nav_mesh);
        let mut boundary = DtLocalBoundary::new();
        boundary.update(PolyRef::NULL, &[0.0; 3], 1.0, &mut query, &QueryFilter::default())?;
        assert_eq!(boundary.segment_count(), 0);
        assert!(!boundary.is_valid(&query, &QueryFilter::default()));
        Ok(())
    }
}
