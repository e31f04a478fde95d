//! Navigation mesh implementation for Detour
//!
//! The navigation mesh is a set of independently addressed tiles laid out on a
//! horizontal grid. Each tile holds convex polygons whose shared edges are
//! turned into links when the tile is registered, including links across tile
//! borders. Once every tile is registered the mesh is treated as read-only.

use std::collections::HashMap;

use detour_common::{
    dt_clamp, dt_closest_height_point_triangle, dt_distance_pt_poly_edges_sqr, dt_distance_pt_seg_sqr_2d,
    dt_overlap_bounds, dt_overlap_quant_bounds, dt_point_in_polygon, dt_sqr, dt_vlerp, dt_visfinite, Error, Result,
    Status,
};

use super::binary_format::load_tile_from_binary;
use super::{NavMeshParams, PolyFlags, PolyRef, PolyType, QueryFilter, MAX_VERTS_PER_POLY};

/// Number of bits for salt
const DT_SALT_BITS: u32 = 16;
/// Number of bits for tile index
const DT_TILE_BITS: u32 = 28;
/// Number of bits for polygon index
const DT_POLY_BITS: u32 = 20;

const DT_SALT_MASK: u64 = (1 << DT_SALT_BITS) - 1;
const DT_TILE_MASK: u64 = (1 << DT_TILE_BITS) - 1;
const DT_POLY_MASK: u64 = (1 << DT_POLY_BITS) - 1;

/// Edge flag marking a portal to a neighbouring tile; the low byte holds the side
pub const DT_EXT_LINK: u16 = 0x8000;

/// Null link index
pub const DT_NULL_LINK: u32 = u32::MAX;

/// Side value of links that stay inside their tile
pub const DT_INTERNAL_LINK_SIDE: u8 = 0xff;

/// Off-mesh connection can be traversed both ways
pub const DT_OFFMESH_CON_BIDIR: u8 = 1;

/// Creates a PolyRef from salt, tile index and polygon index
#[inline]
pub fn encode_poly_ref(salt: u32, tile_index: u32, poly_index: u32) -> PolyRef {
    PolyRef::new(
        ((salt as u64 & DT_SALT_MASK) << (DT_POLY_BITS + DT_TILE_BITS))
            | ((tile_index as u64 & DT_TILE_MASK) << DT_POLY_BITS)
            | (poly_index as u64 & DT_POLY_MASK),
    )
}

/// Decodes a PolyRef into salt, tile index and polygon index
#[inline]
pub fn decode_poly_ref(reference: PolyRef) -> (u32, u32, u32) {
    let id = reference.id();
    let salt = (id >> (DT_POLY_BITS + DT_TILE_BITS)) & DT_SALT_MASK;
    let tile = (id >> DT_POLY_BITS) & DT_TILE_MASK;
    let poly = id & DT_POLY_MASK;
    (salt as u32, tile as u32, poly as u32)
}

/// Returns the tile coordinates of the neighbour on the given side
///
/// Sides count counter-clockwise from +x: 0 = +x, 2 = +z, 4 = -x, 6 = -z.
pub fn neighbour_tile_coords(x: i32, y: i32, side: u8) -> (i32, i32) {
    match side & 7 {
        0 => (x + 1, y),
        1 => (x + 1, y + 1),
        2 => (x, y + 1),
        3 => (x - 1, y + 1),
        4 => (x - 1, y),
        5 => (x - 1, y - 1),
        6 => (x, y - 1),
        _ => (x + 1, y - 1),
    }
}

/// Returns the side facing back from a neighbour
#[inline]
pub fn opposite_tile_side(side: u8) -> u8 {
    (side + 4) & 7
}

/// Link between two polygons
#[derive(Debug, Clone, Copy)]
pub struct Link {
    /// Reference to the connected polygon
    pub reference: PolyRef,
    /// Index of the next link of the same polygon
    pub next: u32,
    /// Edge of the owning polygon the link crosses
    pub edge: u8,
    /// Tile side for border links, [`DT_INTERNAL_LINK_SIDE`] otherwise
    pub side: u8,
    /// Start of the portal along the edge, 0..=255
    pub bmin: u8,
    /// End of the portal along the edge, 0..=255
    pub bmax: u8,
}

impl Link {
    /// True if the link crosses into a neighbouring tile
    pub fn is_tile_border(&self) -> bool {
        self.side != DT_INTERNAL_LINK_SIDE
    }
}

/// Polygon within a tile
#[derive(Debug, Clone)]
pub struct Poly {
    /// Index of the first link, [`DT_NULL_LINK`] if none
    pub first_link: u32,
    /// Vertex indices into the tile vertex array
    pub verts: [u16; MAX_VERTS_PER_POLY],
    /// Per-edge adjacency: 0 = wall, n = internal polygon n-1, DT_EXT_LINK|side = tile portal
    pub neis: [u16; MAX_VERTS_PER_POLY],
    /// Flags for query filters
    pub flags: PolyFlags,
    /// Number of vertices in use
    pub vert_count: u8,
    /// Area id (0..63)
    pub area: u8,
    /// Polygon type
    pub poly_type: PolyType,
}

impl Poly {
    pub fn new(area: u8, poly_type: PolyType, flags: PolyFlags) -> Self {
        Self {
            first_link: DT_NULL_LINK,
            verts: [0; MAX_VERTS_PER_POLY],
            neis: [0; MAX_VERTS_PER_POLY],
            flags,
            vert_count: 0,
            area,
            poly_type,
        }
    }

    pub fn is_off_mesh_connection(&self) -> bool {
        self.poly_type == PolyType::OffMeshConnection
    }
}

/// Detail sub-mesh of a polygon
#[derive(Debug, Clone, Default)]
pub struct PolyDetail {
    /// Offset of the first detail vertex
    pub vert_base: u32,
    /// Offset of the first detail triangle
    pub tri_base: u32,
    pub vert_count: u8,
    pub tri_count: u8,
}

/// Quantized bounding volume tree node
#[derive(Debug, Clone, Default)]
pub struct BVNode {
    pub bmin: [u16; 3],
    pub bmax: [u16; 3],
    /// Polygon index for leaves, negative escape offset for internal nodes
    pub i: i32,
}

/// Off-mesh connection endpoints as stored in tile data
#[derive(Debug, Clone, Default)]
pub struct OffMeshConnection {
    /// Start and end positions
    pub pos: [f32; 6],
    pub rad: f32,
    /// Polygon index of the connection within its tile
    pub poly: u16,
    pub flags: u8,
    pub side: u8,
    pub user_id: u32,
}

/// Tile header information
#[derive(Debug, Clone, Default)]
pub struct TileHeader {
    pub x: i32,
    pub y: i32,
    pub layer: i32,
    pub user_id: u32,
    pub poly_count: i32,
    pub vert_count: i32,
    pub max_link_count: i32,
    pub detail_mesh_count: i32,
    pub detail_vert_count: i32,
    pub detail_tri_count: i32,
    pub bv_node_count: i32,
    pub off_mesh_con_count: i32,
    pub off_mesh_base: i32,
    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,
    pub bmin: [f32; 3],
    pub bmax: [f32; 3],
    pub bv_quant_factor: f32,
}

/// Mesh tile in the navigation mesh
#[derive(Debug, Clone, Default)]
pub struct MeshTile {
    /// Salt used when encoding references into this tile
    pub salt: u32,
    pub header: TileHeader,
    pub polys: Vec<Poly>,
    pub verts: Vec<[f32; 3]>,
    pub links: Vec<Link>,
    pub detail_meshes: Vec<PolyDetail>,
    pub detail_verts: Vec<[f32; 3]>,
    /// Detail triangles: three vertex indices plus edge flags
    pub detail_tris: Vec<[u8; 4]>,
    pub bv_tree: Vec<BVNode>,
    pub off_mesh_cons: Vec<OffMeshConnection>,
}

impl MeshTile {
    /// Returns the vertices of a polygon in winding order
    pub fn poly_verts(&self, poly: &Poly) -> Vec<[f32; 3]> {
        poly.verts[..poly.vert_count as usize]
            .iter()
            .map(|&v| self.verts[v as usize])
            .collect()
    }

    /// Iterates over the links of a polygon
    pub fn poly_links<'a>(&'a self, poly: &Poly) -> PolyLinks<'a> {
        PolyLinks {
            links: &self.links,
            current: poly.first_link,
        }
    }

    /// Returns the xz/y bounds of a polygon
    pub fn poly_bounds(&self, poly: &Poly) -> ([f32; 3], [f32; 3]) {
        let mut bmin = [f32::MAX; 3];
        let mut bmax = [f32::MIN; 3];
        for &v in &poly.verts[..poly.vert_count as usize] {
            let p = &self.verts[v as usize];
            for k in 0..3 {
                bmin[k] = bmin[k].min(p[k]);
                bmax[k] = bmax[k].max(p[k]);
            }
        }
        (bmin, bmax)
    }

    fn alloc_link(&mut self, poly_index: usize, mut link: Link) {
        let idx = self.links.len() as u32;
        link.next = self.polys[poly_index].first_link;
        self.links.push(link);
        self.polys[poly_index].first_link = idx;
    }

    /// Checks every index stored in the tile against the section sizes
    pub fn validate(&self) -> Result<()> {
        let corrupted = || Error::Detour(Status::DataCorrupted);
        let nverts = self.verts.len();
        let npolys = self.polys.len();

        if self.verts.iter().any(|v| !dt_visfinite(v)) {
            return Err(corrupted());
        }

        for poly in &self.polys {
            let nv = poly.vert_count as usize;
            let min_verts = if poly.is_off_mesh_connection() { 2 } else { 3 };
            if nv < min_verts || nv > MAX_VERTS_PER_POLY {
                return Err(corrupted());
            }
            if poly.verts[..nv].iter().any(|&v| v as usize >= nverts) {
                return Err(corrupted());
            }
            for &nei in &poly.neis[..nv] {
                if nei != 0 && nei & DT_EXT_LINK == 0 && nei as usize > npolys {
                    return Err(corrupted());
                }
            }
        }

        for (i, pd) in self.detail_meshes.iter().enumerate() {
            let poly = self.polys.get(i).ok_or_else(corrupted)?;
            let vert_end = pd.vert_base as usize + pd.vert_count as usize;
            let tri_end = pd.tri_base as usize + pd.tri_count as usize;
            if vert_end > self.detail_verts.len() || tri_end > self.detail_tris.len() {
                return Err(corrupted());
            }
            let nv = poly.vert_count as usize;
            for tri in &self.detail_tris[pd.tri_base as usize..tri_end] {
                if tri[..3].iter().any(|&k| k as usize >= nv + pd.vert_count as usize) {
                    return Err(corrupted());
                }
            }
        }

        if self.bv_tree.iter().any(|n| n.i >= 0 && n.i as usize >= npolys) {
            return Err(corrupted());
        }

        if self.off_mesh_cons.iter().any(|c| c.poly as usize >= npolys) {
            return Err(corrupted());
        }

        Ok(())
    }
}

/// Iterator over the linked list of a polygon's links
pub struct PolyLinks<'a> {
    links: &'a [Link],
    current: u32,
}

impl<'a> Iterator for PolyLinks<'a> {
    type Item = &'a Link;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current == DT_NULL_LINK {
            return None;
        }
        let link = self.links.get(self.current as usize)?;
        self.current = link.next;
        Some(link)
    }
}

/// Navigation mesh structure
#[derive(Debug)]
pub struct NavMesh {
    params: NavMeshParams,
    tiles: Vec<MeshTile>,
    /// Tile lookup by grid location and layer
    pos_lookup: HashMap<(i32, i32, i32), usize>,
    /// Tile indices per grid column, any layer
    column_lookup: HashMap<(i32, i32), Vec<usize>>,
}

impl NavMesh {
    /// Creates a new, empty navigation mesh
    pub fn new(params: NavMeshParams) -> Result<Self> {
        if !dt_visfinite(&params.origin) {
            return Err(Error::Detour(Status::InvalidParam));
        }

        if !(params.tile_width > 0.0 && params.tile_height > 0.0) {
            return Err(Error::Detour(Status::InvalidParam));
        }

        if params.max_tiles <= 0 || params.max_polys_per_tile <= 0 {
            return Err(Error::Detour(Status::InvalidParam));
        }

        if params.max_tiles as u64 > DT_TILE_MASK + 1 || params.max_polys_per_tile as u64 > DT_POLY_MASK + 1 {
            return Err(Error::Detour(Status::InvalidParam));
        }

        Ok(Self {
            params,
            tiles: Vec::new(),
            pos_lookup: HashMap::new(),
            column_lookup: HashMap::new(),
        })
    }

    pub fn params(&self) -> &NavMeshParams {
        &self.params
    }

    pub fn max_tiles(&self) -> i32 {
        self.params.max_tiles
    }

    /// Number of tiles registered so far
    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Number of polygons across all tiles
    pub fn poly_count(&self) -> usize {
        self.tiles.iter().map(|t| t.polys.len()).sum()
    }

    pub fn tiles(&self) -> impl Iterator<Item = &MeshTile> {
        self.tiles.iter()
    }

    /// Parses Detour tile data and registers the tile
    ///
    /// Returns the base reference of the new tile.
    pub fn add_tile(&mut self, data: &[u8]) -> Result<PolyRef> {
        let tile = load_tile_from_binary(data)?;
        self.add_mesh_tile(tile)
    }

    /// Registers an already parsed tile and links it with its neighbours
    pub fn add_mesh_tile(&mut self, mut tile: MeshTile) -> Result<PolyRef> {
        tile.validate()?;

        if tile.polys.len() > self.params.max_polys_per_tile as usize {
            return Err(Error::Detour(Status::InvalidParam));
        }

        let key = (tile.header.x, tile.header.y, tile.header.layer);
        if self.pos_lookup.contains_key(&key) {
            return Err(Error::Detour(Status::AlreadyOccupied));
        }

        if self.tiles.len() >= self.params.max_tiles as usize {
            return Err(Error::Detour(Status::OutOfMemory));
        }

        let tile_index = self.tiles.len();
        tile.salt = 1;
        tile.links.clear();
        for poly in &mut tile.polys {
            poly.first_link = DT_NULL_LINK;
        }
        self.tiles.push(tile);
        self.pos_lookup.insert(key, tile_index);
        self.column_lookup.entry((key.0, key.1)).or_default().push(tile_index);

        self.connect_int_links(tile_index);

        for side in 0..8u8 {
            let (nx, ny) = neighbour_tile_coords(key.0, key.1, side);
            let neighbours = self.tiles_at(nx, ny);
            for nei in neighbours {
                self.connect_ext_links(tile_index, nei, side);
                self.connect_ext_links(nei, tile_index, opposite_tile_side(side));
            }
        }

        Ok(self.get_poly_ref_base(tile_index))
    }

    /// Tile indices at a grid location, across layers
    fn tiles_at(&self, x: i32, y: i32) -> Vec<usize> {
        self.column_lookup.get(&(x, y)).cloned().unwrap_or_default()
    }

    pub fn get_tile_at(&self, x: i32, y: i32, layer: i32) -> Option<&MeshTile> {
        self.pos_lookup.get(&(x, y, layer)).map(|&i| &self.tiles[i])
    }

    /// Computes the grid location of the tile containing a position
    pub fn calc_tile_loc(&self, pos: &[f32; 3]) -> (i32, i32) {
        let tx = ((pos[0] - self.params.origin[0]) / self.params.tile_width).floor() as i32;
        let ty = ((pos[2] - self.params.origin[2]) / self.params.tile_height).floor() as i32;
        (tx, ty)
    }

    /// Returns the reference of polygon 0 of a tile
    pub fn get_poly_ref_base(&self, tile_index: usize) -> PolyRef {
        let salt = self.tiles.get(tile_index).map(|t| t.salt).unwrap_or(0);
        encode_poly_ref(salt, tile_index as u32, 0)
    }

    fn tile_index_of(&self, reference: PolyRef) -> Option<(usize, usize)> {
        if !reference.is_valid() {
            return None;
        }
        let (salt, it, ip) = decode_poly_ref(reference);
        let tile = self.tiles.get(it as usize)?;
        if tile.salt != salt || ip as usize >= tile.polys.len() {
            return None;
        }
        Some((it as usize, ip as usize))
    }

    /// Resolves a reference into its tile and polygon
    pub fn get_tile_and_poly_by_ref(&self, reference: PolyRef) -> Result<(&MeshTile, &Poly)> {
        let (it, ip) = self
            .tile_index_of(reference)
            .ok_or(Error::Detour(Status::InvalidParam))?;
        let tile = &self.tiles[it];
        Ok((tile, &tile.polys[ip]))
    }

    pub fn is_valid_poly_ref(&self, reference: PolyRef) -> bool {
        self.tile_index_of(reference).is_some()
    }

    /// Finds polygons whose bounds overlap the query box
    pub fn query_polygons(&self, center: &[f32; 3], half_extents: &[f32; 3], filter: &QueryFilter) -> Vec<PolyRef> {
        let bmin = [
            center[0] - half_extents[0],
            center[1] - half_extents[1],
            center[2] - half_extents[2],
        ];
        let bmax = [
            center[0] + half_extents[0],
            center[1] + half_extents[1],
            center[2] + half_extents[2],
        ];

        let (minx, miny) = self.calc_tile_loc(&bmin);
        let (maxx, maxy) = self.calc_tile_loc(&bmax);

        let mut result = Vec::new();
        for y in miny..=maxy {
            for x in minx..=maxx {
                if let Some(indices) = self.column_lookup.get(&(x, y)) {
                    for &ti in indices {
                        self.query_polygons_in_tile(ti, &bmin, &bmax, filter, &mut result);
                    }
                }
            }
        }
        result
    }

    fn query_polygons_in_tile(
        &self,
        tile_index: usize,
        qmin: &[f32; 3],
        qmax: &[f32; 3],
        filter: &QueryFilter,
        result: &mut Vec<PolyRef>,
    ) {
        let tile = &self.tiles[tile_index];
        let base = self.get_poly_ref_base(tile_index).id();

        if !tile.bv_tree.is_empty() {
            let tbmin = &tile.header.bmin;
            let tbmax = &tile.header.bmax;
            let qfac = tile.header.bv_quant_factor;

            let mut bmin = [0u16; 3];
            let mut bmax = [0u16; 3];
            for k in 0..3 {
                let lo = dt_clamp(qmin[k], tbmin[k], tbmax[k]) - tbmin[k];
                let hi = dt_clamp(qmax[k], tbmin[k], tbmax[k]) - tbmin[k];
                bmin[k] = ((qfac * lo) as u16) & 0xfffe;
                bmax[k] = ((qfac * hi + 1.0) as u16) | 1;
            }

            let mut i = 0usize;
            while i < tile.bv_tree.len() {
                let node = &tile.bv_tree[i];
                let overlap = dt_overlap_quant_bounds(&bmin, &bmax, &node.bmin, &node.bmax);
                let is_leaf = node.i >= 0;

                if is_leaf && overlap {
                    let poly = &tile.polys[node.i as usize];
                    if filter.pass_filter(poly) {
                        result.push(PolyRef::new(base | node.i as u64));
                    }
                }

                if overlap || is_leaf {
                    i += 1;
                } else {
                    let escape = node.i.unsigned_abs() as usize;
                    i += escape.max(1);
                }
            }
            return;
        }

        for (ip, poly) in tile.polys.iter().enumerate() {
            if poly.is_off_mesh_connection() || !filter.pass_filter(poly) {
                continue;
            }
            let (pmin, pmax) = tile.poly_bounds(poly);
            if dt_overlap_bounds(qmin, qmax, &pmin, &pmax) {
                result.push(PolyRef::new(base | ip as u64));
            }
        }
    }

    /// Height of the surface at `pos` if `pos` lies over the polygon
    pub fn get_poly_height(&self, reference: PolyRef, pos: &[f32; 3]) -> Result<Option<f32>> {
        let (it, ip) = self
            .tile_index_of(reference)
            .ok_or(Error::Detour(Status::InvalidParam))?;
        Ok(poly_height(&self.tiles[it], ip, pos))
    }

    /// Closest point on a polygon, and whether `pos` lies over it
    pub fn closest_point_on_poly(&self, reference: PolyRef, pos: &[f32; 3]) -> Result<([f32; 3], bool)> {
        let (it, ip) = self
            .tile_index_of(reference)
            .ok_or(Error::Detour(Status::InvalidParam))?;
        let tile = &self.tiles[it];
        let poly = &tile.polys[ip];

        if let Some(h) = poly_height(tile, ip, pos) {
            return Ok(([pos[0], h, pos[2]], true));
        }

        let verts = tile.poly_verts(poly);
        if poly.is_off_mesh_connection() {
            let (_, t) = dt_distance_pt_seg_sqr_2d(pos, &verts[0], &verts[1]);
            return Ok((dt_vlerp(&verts[0], &verts[1], t), false));
        }

        Ok((closest_point_on_edges(pos, &verts), false))
    }

    /// Closest point on the boundary of a polygon, or `pos` itself when inside
    pub fn closest_point_on_poly_boundary(&self, reference: PolyRef, pos: &[f32; 3]) -> Result<[f32; 3]> {
        let (tile, poly) = self.get_tile_and_poly_by_ref(reference)?;
        let verts = tile.poly_verts(poly);

        let (inside, edged, edget) = dt_distance_pt_poly_edges_sqr(pos, &verts);
        if inside {
            return Ok(*pos);
        }

        let mut imin = 0;
        for i in 1..edged.len() {
            if edged[i] < edged[imin] {
                imin = i;
            }
        }
        let va = &verts[imin];
        let vb = &verts[(imin + 1) % verts.len()];
        Ok(dt_vlerp(va, vb, edget[imin]))
    }

    /// Returns the left and right portal points of the edge shared by two polygons
    pub fn get_portal_points(&self, from: PolyRef, to: PolyRef) -> Result<([f32; 3], [f32; 3])> {
        let (from_tile, from_poly) = self.get_tile_and_poly_by_ref(from)?;
        let (to_tile, to_poly) = self.get_tile_and_poly_by_ref(to)?;

        let link = from_tile
            .poly_links(from_poly)
            .find(|l| l.reference == to)
            .ok_or(Error::Detour(Status::InvalidParam))?;

        if from_poly.is_off_mesh_connection() {
            let v = from_tile.verts[from_poly.verts[link.edge as usize] as usize];
            return Ok((v, v));
        }

        if to_poly.is_off_mesh_connection() {
            let back = to_tile
                .poly_links(to_poly)
                .find(|l| l.reference == from)
                .ok_or(Error::Detour(Status::InvalidParam))?;
            let v = to_tile.verts[to_poly.verts[back.edge as usize] as usize];
            return Ok((v, v));
        }

        let nv = from_poly.vert_count as usize;
        let v0 = from_tile.verts[from_poly.verts[link.edge as usize] as usize];
        let v1 = from_tile.verts[from_poly.verts[(link.edge as usize + 1) % nv] as usize];

        if link.is_tile_border() && (link.bmin != 0 || link.bmax != 255) {
            let s = 1.0 / 255.0;
            let left = dt_vlerp(&v0, &v1, link.bmin as f32 * s);
            let right = dt_vlerp(&v0, &v1, link.bmax as f32 * s);
            return Ok((left, right));
        }

        Ok((v0, v1))
    }

    /// Midpoint of the portal between two polygons
    pub fn get_edge_mid_point(&self, from: PolyRef, to: PolyRef) -> Result<[f32; 3]> {
        let (left, right) = self.get_portal_points(from, to)?;
        Ok(dt_vlerp(&left, &right, 0.5))
    }

    /// Builds links for edges shared by polygons of the same tile
    fn connect_int_links(&mut self, tile_index: usize) {
        let base = self.get_poly_ref_base(tile_index).id();
        let tile = &mut self.tiles[tile_index];

        for ip in 0..tile.polys.len() {
            if tile.polys[ip].is_off_mesh_connection() {
                continue;
            }
            let nv = tile.polys[ip].vert_count as usize;
            // Built backwards so the list reads from lowest edge to highest
            for j in (0..nv).rev() {
                let nei = tile.polys[ip].neis[j];
                if nei == 0 || nei & DT_EXT_LINK != 0 {
                    continue;
                }
                let link = Link {
                    reference: PolyRef::new(base | (nei - 1) as u64),
                    next: DT_NULL_LINK,
                    edge: j as u8,
                    side: DT_INTERNAL_LINK_SIDE,
                    bmin: 0,
                    bmax: 0,
                };
                tile.alloc_link(ip, link);
            }
        }
    }

    /// Builds links from portal edges of `tile_index` facing `side` into `target_index`
    fn connect_ext_links(&mut self, tile_index: usize, target_index: usize, side: u8) {
        let mut new_links = Vec::new();
        {
            let tile = &self.tiles[tile_index];
            let target = &self.tiles[target_index];
            let target_base = self.get_poly_ref_base(target_index).id();

            for (ip, poly) in tile.polys.iter().enumerate() {
                let nv = poly.vert_count as usize;
                for j in 0..nv {
                    if poly.neis[j] & DT_EXT_LINK == 0 {
                        continue;
                    }
                    let dir = (poly.neis[j] & 0xff) as u8;
                    if dir != side {
                        continue;
                    }

                    let va = tile.verts[poly.verts[j] as usize];
                    let vb = tile.verts[poly.verts[(j + 1) % nv] as usize];
                    let connections = find_connecting_polys(&va, &vb, target, opposite_tile_side(dir));

                    for (nei_index, (cmin, cmax)) in connections {
                        let (lo, hi) = match dir {
                            0 | 4 => (va[2], vb[2]),
                            _ => (va[0], vb[0]),
                        };
                        let span = hi - lo;
                        let (mut tmin, mut tmax) = if span.abs() > f32::EPSILON {
                            ((cmin - lo) / span, (cmax - lo) / span)
                        } else {
                            (0.0, 1.0)
                        };
                        if tmin > tmax {
                            std::mem::swap(&mut tmin, &mut tmax);
                        }
                        let link = Link {
                            reference: PolyRef::new(target_base | nei_index as u64),
                            next: DT_NULL_LINK,
                            edge: j as u8,
                            side: dir,
                            bmin: (dt_clamp(tmin, 0.0, 1.0) * 255.0).round() as u8,
                            bmax: (dt_clamp(tmax, 0.0, 1.0) * 255.0).round() as u8,
                        };
                        new_links.push((ip, link));
                    }
                }
            }
        }

        let tile = &mut self.tiles[tile_index];
        for (ip, link) in new_links {
            tile.alloc_link(ip, link);
        }
    }
}

/// Height of the detail surface under `pos`, if `pos` lies over polygon `ip`
fn poly_height(tile: &MeshTile, ip: usize, pos: &[f32; 3]) -> Option<f32> {
    let poly = &tile.polys[ip];
    if poly.is_off_mesh_connection() {
        return None;
    }

    let verts = tile.poly_verts(poly);
    if !dt_point_in_polygon(pos, &verts) {
        return None;
    }

    if let Some(pd) = tile.detail_meshes.get(ip).filter(|pd| pd.tri_count > 0) {
        let nv = poly.vert_count as usize;
        for j in 0..pd.tri_count as usize {
            let tri = &tile.detail_tris[pd.tri_base as usize + j];
            let mut v = [[0.0f32; 3]; 3];
            for k in 0..3 {
                let idx = tri[k] as usize;
                v[k] = if idx < nv {
                    verts[idx]
                } else {
                    tile.detail_verts[pd.vert_base as usize + (idx - nv)]
                };
            }
            if let Some(h) = dt_closest_height_point_triangle(pos, &v[0], &v[1], &v[2]) {
                return Some(h);
            }
        }
    } else {
        for k in 1..verts.len() - 1 {
            if let Some(h) = dt_closest_height_point_triangle(pos, &verts[0], &verts[k], &verts[k + 1]) {
                return Some(h);
            }
        }
    }

    // Degenerate triangles: the point sits on an edge
    Some(closest_point_on_edges(pos, &verts)[1])
}

/// Closest point on any polygon edge, interpolated in 3D
fn closest_point_on_edges(pos: &[f32; 3], verts: &[[f32; 3]]) -> [f32; 3] {
    let n = verts.len();
    let mut best = f32::MAX;
    let mut closest = *pos;
    for j in 0..n {
        let va = &verts[j];
        let vb = &verts[(j + 1) % n];
        let (d, t) = dt_distance_pt_seg_sqr_2d(pos, va, vb);
        if d < best {
            best = d;
            closest = dt_vlerp(va, vb, t);
        }
    }
    closest
}

/// Coordinate along which portals facing `side` line up
fn slab_coord(v: &[f32; 3], side: u8) -> f32 {
    match side {
        0 | 4 => v[0],
        2 | 6 => v[2],
        _ => 0.0,
    }
}

/// Portal end points in (along-edge, height) space
fn slab_end_points(va: &[f32; 3], vb: &[f32; 3], side: u8) -> ([f32; 2], [f32; 2]) {
    let axis = if side == 0 || side == 4 { 2 } else { 0 };
    if va[axis] < vb[axis] {
        ([va[axis], va[1]], [vb[axis], vb[1]])
    } else {
        ([vb[axis], vb[1]], [va[axis], va[1]])
    }
}

fn overlap_slabs(amin: &[f32; 2], amax: &[f32; 2], bmin: &[f32; 2], bmax: &[f32; 2], px: f32, py: f32) -> bool {
    // Shrink a little so slabs touching only at their end points stay apart
    let minx = (amin[0] + px).max(bmin[0] + px);
    let maxx = (amax[0] - px).min(bmax[0] - px);
    if minx > maxx {
        return false;
    }

    let slope = |lo: &[f32; 2], hi: &[f32; 2]| {
        let dx = hi[0] - lo[0];
        if dx.abs() > f32::EPSILON {
            (hi[1] - lo[1]) / dx
        } else {
            0.0
        }
    };
    let ad = slope(amin, amax);
    let ak = amin[1] - ad * amin[0];
    let bd = slope(bmin, bmax);
    let bk = bmin[1] - bd * bmin[0];
    let aminy = ad * minx + ak;
    let amaxy = ad * maxx + ak;
    let bminy = bd * minx + bk;
    let bmaxy = bd * maxx + bk;
    let dmin = bminy - aminy;
    let dmax = bmaxy - amaxy;

    // Crossing segments always overlap
    if dmin * dmax < 0.0 {
        return true;
    }

    let thr = dt_sqr(py * 2.0);
    dmin * dmin <= thr || dmax * dmax <= thr
}

/// Finds polygons of `tile` whose portal edges on `side` touch the segment `va..vb`
///
/// Returns polygon indices with the overlapping range along the edge.
fn find_connecting_polys(va: &[f32; 3], vb: &[f32; 3], tile: &MeshTile, side: u8) -> Vec<(usize, (f32, f32))> {
    const MAX_CONNECTIONS: usize = 4;

    let (amin, amax) = slab_end_points(va, vb, side);
    let apos = slab_coord(va, side);
    let wanted = DT_EXT_LINK | side as u16;

    let mut result = Vec::new();
    for (ip, poly) in tile.polys.iter().enumerate() {
        let nv = poly.vert_count as usize;
        for j in 0..nv {
            if poly.neis[j] != wanted {
                continue;
            }
            let vc = &tile.verts[poly.verts[j] as usize];
            let vd = &tile.verts[poly.verts[(j + 1) % nv] as usize];
            if (apos - slab_coord(vc, side)).abs() > 0.01 {
                continue;
            }
            let (bmin, bmax) = slab_end_points(vc, vd, side);
            if !overlap_slabs(&amin, &amax, &bmin, &bmax, 0.01, tile.header.walkable_climb) {
                continue;
            }
            if result.len() < MAX_CONNECTIONS {
                result.push((ip, (amin[0].max(bmin[0]), amax[0].min(bmax[0]))));
            }
            break;
        }
    }
    result
}
