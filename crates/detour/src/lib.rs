//! Tiled navigation meshes and spatial queries
//!
//! This crate owns the immutable navigation mesh loaded from Detour tile data
//! and the query engine that runs nearest-polygon, raycast, path search and
//! path straightening over it.
//!
//! # Example
//!
//! ```rust,ignore
//! use detour::{load_mesh_set_file, NavMeshQuery, QueryFilter};
//!
//! let nav_mesh = load_mesh_set_file("world.bin")?;
//! let mut query = NavMeshQuery::new(&nav_mesh);
//! let filter = QueryFilter::default();
//!
//! let (start_ref, start) = query.find_nearest_poly(&[0.0, 0.0, 0.0], &[10.0, 10.0, 10.0], &filter)?;
//! let (end_ref, end) = query.find_nearest_poly(&[25.0, 0.0, 4.0], &[10.0, 10.0, 10.0], &filter)?;
//! let polys = query.find_path(start_ref, end_ref, &start, &end, &filter, 256)?;
//! let path = query.find_straight_path(&start, &end, &polys, 256)?;
//! ```

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

pub mod binary_format;
pub mod mesh_set;
pub mod nav_mesh;
pub mod nav_mesh_query;
pub mod node_pool;
pub mod raycast_hit;
pub mod test_mesh_helpers;

pub use detour_common::{Error, Result, Status};
pub use mesh_set::{load_mesh_set, load_mesh_set_file, write_mesh_set, LoadError, MeshSetHeader};
pub use nav_mesh::{Link, MeshTile, NavMesh, Poly, TileHeader};
pub use nav_mesh_query::NavMeshQuery;
pub use node_pool::QueryContext;
pub use raycast_hit::RaycastHit;

#[cfg(test)]
mod nav_mesh_query_tests;

/// Maximum number of vertices per navigation polygon
pub const MAX_VERTS_PER_POLY: usize = 6;

/// Number of area ids a filter can weigh
pub const MAX_AREAS: usize = 64;

/// Reference to a polygon within a navigation mesh
///
/// Zero is the "no polygon" sentinel. A reference is only meaningful against the
/// [`NavMesh`] that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct PolyRef(u64);

impl PolyRef {
    /// The null reference
    pub const NULL: PolyRef = PolyRef(0);

    /// Creates a new polygon reference
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw reference value
    pub fn id(&self) -> u64 {
        self.0
    }

    /// Checks if the reference names a polygon at all
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl From<u64> for PolyRef {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for PolyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Parameters used to initialize a tiled navigation mesh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavMeshParams {
    /// World-space origin of the tile grid
    pub origin: [f32; 3],
    /// Width of each tile along x
    pub tile_width: f32,
    /// Depth of each tile along z
    pub tile_height: f32,
    /// Maximum number of tiles the mesh can hold
    pub max_tiles: i32,
    /// Maximum number of polygons per tile
    pub max_polys_per_tile: i32,
}

bitflags! {
    /// Polygon flags used by query filters
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PolyFlags: u16 {
        const WALK = 0x01;
        const SWIM = 0x02;
        const DOOR = 0x04;
        const JUMP = 0x08;
        const DISABLED = 0x10;
        const ALL = 0xffff;
    }
}

bitflags! {
    /// Flags attached to each point of a straightened path
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct StraightPathFlags: u8 {
        /// The point is the start position
        const START = 0x01;
        /// The point is the end position
        const END = 0x02;
        /// The point is the start of an off-mesh connection
        const OFFMESH_CONNECTION = 0x04;
    }
}

/// Polygon type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolyType {
    /// Regular walkable polygon
    Ground = 0,
    /// Off-mesh connection, two vertices and no area
    OffMeshConnection = 1,
}

/// Decides which polygons a query may visit and what crossing them costs
#[derive(Debug, Clone)]
pub struct QueryFilter {
    /// Polygons must have at least one of these flags
    pub include_flags: PolyFlags,
    /// Polygons must have none of these flags
    pub exclude_flags: PolyFlags,
    /// Cost multiplier per area id
    pub area_cost: [f32; MAX_AREAS],
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            include_flags: PolyFlags::ALL,
            exclude_flags: PolyFlags::empty(),
            area_cost: [1.0; MAX_AREAS],
        }
    }
}

impl QueryFilter {
    /// Returns true if a polygon with these flags may be visited
    pub fn pass_filter(&self, poly: &Poly) -> bool {
        poly.flags.intersects(self.include_flags) && !poly.flags.intersects(self.exclude_flags)
    }

    /// Cost of moving from `pa` to `pb` across `poly`
    pub fn get_cost(&self, pa: &[f32; 3], pb: &[f32; 3], poly: &Poly) -> f32 {
        let cost = self.area_cost.get(poly.area as usize).copied().unwrap_or(1.0);
        detour_common::dt_vdist(pa, pb) * cost
    }
}

/// A straightened path through a polygon corridor
#[derive(Debug, Clone, Default)]
pub struct Path {
    /// Path points from start to end
    pub waypoints: Vec<[f32; 3]>,
    /// Flags for each waypoint
    pub flags: Vec<StraightPathFlags>,
    /// Polygon entered at each waypoint; null for the end point
    pub poly_refs: Vec<PolyRef>,
}

impl Path {
    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }
}
