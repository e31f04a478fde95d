//! Test mesh creation helpers
//!
//! Builds flat grid tiles in Detour tile layout so the loader, queries, crowd
//! and service can be exercised without external asset files. A tile is split
//! into `cells x cells` square polygons; cells on the tile border get portal
//! edges so adjacent tiles link up when registered together.

use crate::binary_format::save_tile_to_binary;
use crate::mesh_set::write_mesh_set;
use crate::nav_mesh::{BVNode, MeshTile, Poly, PolyDetail, TileHeader, DT_EXT_LINK};
use crate::{NavMesh, NavMeshParams, PolyFlags, PolyType};
use detour_common::Result;

/// Quantization factor used for generated BV trees
const TEST_QUANT_FACTOR: f32 = 4.0;

/// Mesh parameters used by the tests: 10x10 tiles with the grid origin at (-10, 0, -10)
pub fn test_params(max_tiles: i32) -> NavMeshParams {
    NavMeshParams {
        origin: [-10.0, 0.0, -10.0],
        tile_width: 10.0,
        tile_height: 10.0,
        max_tiles,
        max_polys_per_tile: 256,
    }
}

/// Description of one flat grid tile
#[derive(Debug, Clone)]
pub struct GridTile {
    pub x: i32,
    pub y: i32,
    pub cells: usize,
    pub height: f32,
    /// Cells (column, row) left out of the tile
    pub blocked: Vec<(usize, usize)>,
}

impl GridTile {
    pub fn new(x: i32, y: i32, cells: usize) -> Self {
        Self {
            x,
            y,
            cells: cells.max(1),
            height: 0.0,
            blocked: Vec::new(),
        }
    }

    pub fn with_height(mut self, height: f32) -> Self {
        self.height = height;
        self
    }

    pub fn with_blocked(mut self, cells: &[(usize, usize)]) -> Self {
        self.blocked.extend_from_slice(cells);
        self
    }

    /// Builds the tile in memory
    pub fn build(&self, params: &NavMeshParams) -> MeshTile {
        let n = self.cells;
        let x0 = params.origin[0] + self.x as f32 * params.tile_width;
        let z0 = params.origin[2] + self.y as f32 * params.tile_height;
        let cw = params.tile_width / n as f32;
        let ch = params.tile_height / n as f32;

        let mut verts = Vec::with_capacity((n + 1) * (n + 1));
        for k in 0..=n {
            for i in 0..=n {
                verts.push([x0 + i as f32 * cw, self.height, z0 + k as f32 * ch]);
            }
        }
        let vid = |i: usize, k: usize| (k * (n + 1) + i) as u16;

        let mut cell_poly = vec![None; n * n];
        let mut next = 0usize;
        for k in 0..n {
            for i in 0..n {
                if !self.blocked.contains(&(i, k)) {
                    cell_poly[k * n + i] = Some(next);
                    next += 1;
                }
            }
        }
        let nei = |i: usize, k: usize| cell_poly[k * n + i].map(|p| p as u16 + 1).unwrap_or(0);

        let bmin = [x0, self.height - 1.0, z0];
        let bmax = [x0 + params.tile_width, self.height + 1.0, z0 + params.tile_height];

        let mut tile = MeshTile::default();
        for k in 0..n {
            for i in 0..n {
                let Some(p) = cell_poly[k * n + i] else {
                    continue;
                };

                // Clockwise seen from above: west, north, east, south edges
                let mut poly = Poly::new(0, PolyType::Ground, PolyFlags::WALK);
                poly.vert_count = 4;
                poly.verts[..4].copy_from_slice(&[vid(i, k), vid(i, k + 1), vid(i + 1, k + 1), vid(i + 1, k)]);
                poly.neis[0] = if i > 0 { nei(i - 1, k) } else { DT_EXT_LINK | 4 };
                poly.neis[1] = if k + 1 < n { nei(i, k + 1) } else { DT_EXT_LINK | 2 };
                poly.neis[2] = if i + 1 < n { nei(i + 1, k) } else { DT_EXT_LINK };
                poly.neis[3] = if k > 0 { nei(i, k - 1) } else { DT_EXT_LINK | 6 };
                tile.polys.push(poly);

                tile.detail_meshes.push(PolyDetail {
                    vert_base: 0,
                    tri_base: (p * 2) as u32,
                    vert_count: 0,
                    tri_count: 2,
                });
                tile.detail_tris.push([0, 1, 2, 0]);
                tile.detail_tris.push([0, 2, 3, 0]);

                let quant = |v: f32, lo: f32| ((v - lo) * TEST_QUANT_FACTOR).max(0.0);
                let px0 = x0 + i as f32 * cw;
                let pz0 = z0 + k as f32 * ch;
                tile.bv_tree.push(BVNode {
                    bmin: [
                        quant(px0, bmin[0]).floor() as u16,
                        quant(self.height, bmin[1]).floor() as u16,
                        quant(pz0, bmin[2]).floor() as u16,
                    ],
                    bmax: [
                        quant(px0 + cw, bmin[0]).ceil() as u16,
                        quant(self.height, bmin[1]).ceil() as u16,
                        quant(pz0 + ch, bmin[2]).ceil() as u16,
                    ],
                    i: p as i32,
                });
            }
        }

        tile.header = TileHeader {
            x: self.x,
            y: self.y,
            layer: 0,
            poly_count: tile.polys.len() as i32,
            vert_count: verts.len() as i32,
            max_link_count: (tile.polys.len() * 4) as i32,
            walkable_height: 2.0,
            walkable_radius: 0.6,
            walkable_climb: 0.9,
            bmin,
            bmax,
            bv_quant_factor: TEST_QUANT_FACTOR,
            ..Default::default()
        };
        tile.verts = verts;
        tile
    }

    /// Builds the tile and encodes it as Detour tile data
    pub fn to_bytes(&self, params: &NavMeshParams) -> Result<Vec<u8>> {
        save_tile_to_binary(&self.build(params))
    }
}

/// Creates a mesh of `tiles_x * tiles_y` connected grid tiles
pub fn create_grid_navmesh(tiles_x: i32, tiles_y: i32, cells: usize) -> Result<NavMesh> {
    let params = test_params(tiles_x * tiles_y);
    let mut nav_mesh = NavMesh::new(params.clone())?;
    for y in 0..tiles_y {
        for x in 0..tiles_x {
            nav_mesh.add_tile(&GridTile::new(x, y, cells).to_bytes(&params)?)?;
        }
    }
    Ok(nav_mesh)
}

/// Encodes grid tiles into a complete mesh-set asset
pub fn create_mesh_set_bytes(params: &NavMeshParams, tiles: &[GridTile]) -> Result<Vec<u8>> {
    let blocks = tiles
        .iter()
        .map(|t| t.to_bytes(params))
        .collect::<Result<Vec<_>>>()?;
    write_mesh_set(params, &blocks)
}
