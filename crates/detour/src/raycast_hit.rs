//! Raycast hit information

use super::PolyRef;

/// Result of casting a ray along the mesh surface
#[derive(Debug, Clone)]
pub struct RaycastHit {
    /// Hit parameter along the segment, `f32::MAX` if the end was reached
    pub t: f32,
    /// Normal of the wall that stopped the ray
    pub hit_normal: [f32; 3],
    /// Edge of the last polygon the ray left through, -1 if none
    pub hit_edge_index: i32,
    /// Polygons visited by the ray, in order
    pub path: Vec<PolyRef>,
}

impl RaycastHit {
    pub fn wall_hit(t: f32, normal: [f32; 3], edge_index: i32) -> Self {
        Self {
            t,
            hit_normal: normal,
            hit_edge_index: edge_index,
            path: Vec::new(),
        }
    }

    pub fn hit_wall(&self) -> bool {
        self.t < f32::MAX
    }

    /// True if nothing blocked the ray before its end point
    pub fn reaches_end(&self) -> bool {
        self.t >= 1.0
    }

    /// Last polygon the ray was in
    pub fn last_poly(&self) -> PolyRef {
        self.path.last().copied().unwrap_or(PolyRef::NULL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_hit_is_blocked_at_start() {
        let hit = RaycastHit::wall_hit(0.0, [0.0; 3], -1);
        assert!(hit.hit_wall());
        assert!(!hit.reaches_end());
        assert_eq!(hit.last_poly(), PolyRef::NULL);
    }

    #[test]
    fn test_end_reached() {
        let mut hit = RaycastHit::wall_hit(0.4, [1.0, 0.0, 0.0], 2);
        hit.path.extend([PolyRef::new(1), PolyRef::new(2)]);
        assert!(!hit.reaches_end());
        assert_eq!(hit.last_poly(), PolyRef::new(2));

        hit.t = f32::MAX;
        assert!(!hit.hit_wall());
        assert!(hit.reaches_end());
    }
}
