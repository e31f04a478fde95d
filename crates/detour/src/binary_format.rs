//! Detour tile binary layout
//!
//! Reads and writes single navigation mesh tiles in the layout produced by
//! Detour's `dtCreateNavMeshData` with 64-bit polygon references. All fields are
//! little endian. The link section is reserved space only; links are rebuilt from
//! polygon adjacency when the tile is registered.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use super::nav_mesh::{BVNode, MeshTile, OffMeshConnection, Poly, PolyDetail, TileHeader};
use super::{PolyFlags, PolyType, MAX_VERTS_PER_POLY};
use detour_common::{Error, Result, Status};

/// Magic number of tile data ('D' << 24 | 'N' << 16 | 'A' << 8 | 'V')
pub const DT_NAVMESH_MAGIC: u32 = 0x444E_4156;

/// Tile data version
pub const DT_NAVMESH_VERSION: u32 = 7;

/// Size of the tile header
pub const MESH_HEADER_SIZE: usize = 100;
const VERT_SIZE: usize = 12;
const POLY_SIZE: usize = 32;
/// dtLink with a 64-bit polygon reference, padded to 8 bytes
const LINK_SIZE: usize = 16;
const DETAIL_MESH_SIZE: usize = 12;
const DETAIL_TRI_SIZE: usize = 4;
const BV_NODE_SIZE: usize = 16;
const OFF_MESH_CON_SIZE: usize = 36;

/// Null link value as stored on disk
const DT_NULL_LINK: u32 = 0xffff_ffff;

/// Mesh header structure matching dtMeshHeader
#[derive(Debug, Clone)]
struct MeshHeader {
    magic: u32,
    version: u32,
    tile: TileHeader,
}

impl MeshHeader {
    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let magic = reader.read_u32::<LittleEndian>()?;
        let version = reader.read_u32::<LittleEndian>()?;
        let tile = TileHeader {
            x: reader.read_i32::<LittleEndian>()?,
            y: reader.read_i32::<LittleEndian>()?,
            layer: reader.read_i32::<LittleEndian>()?,
            user_id: reader.read_u32::<LittleEndian>()?,
            poly_count: reader.read_i32::<LittleEndian>()?,
            vert_count: reader.read_i32::<LittleEndian>()?,
            max_link_count: reader.read_i32::<LittleEndian>()?,
            detail_mesh_count: reader.read_i32::<LittleEndian>()?,
            detail_vert_count: reader.read_i32::<LittleEndian>()?,
            detail_tri_count: reader.read_i32::<LittleEndian>()?,
            bv_node_count: reader.read_i32::<LittleEndian>()?,
            off_mesh_con_count: reader.read_i32::<LittleEndian>()?,
            off_mesh_base: reader.read_i32::<LittleEndian>()?,
            walkable_height: reader.read_f32::<LittleEndian>()?,
            walkable_radius: reader.read_f32::<LittleEndian>()?,
            walkable_climb: reader.read_f32::<LittleEndian>()?,
            bmin: read_vec3(reader)?,
            bmax: read_vec3(reader)?,
            bv_quant_factor: reader.read_f32::<LittleEndian>()?,
        };
        Ok(Self { magic, version, tile })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let h = &self.tile;
        writer.write_u32::<LittleEndian>(self.magic)?;
        writer.write_u32::<LittleEndian>(self.version)?;
        writer.write_i32::<LittleEndian>(h.x)?;
        writer.write_i32::<LittleEndian>(h.y)?;
        writer.write_i32::<LittleEndian>(h.layer)?;
        writer.write_u32::<LittleEndian>(h.user_id)?;
        writer.write_i32::<LittleEndian>(h.poly_count)?;
        writer.write_i32::<LittleEndian>(h.vert_count)?;
        writer.write_i32::<LittleEndian>(h.max_link_count)?;
        writer.write_i32::<LittleEndian>(h.detail_mesh_count)?;
        writer.write_i32::<LittleEndian>(h.detail_vert_count)?;
        writer.write_i32::<LittleEndian>(h.detail_tri_count)?;
        writer.write_i32::<LittleEndian>(h.bv_node_count)?;
        writer.write_i32::<LittleEndian>(h.off_mesh_con_count)?;
        writer.write_i32::<LittleEndian>(h.off_mesh_base)?;
        writer.write_f32::<LittleEndian>(h.walkable_height)?;
        writer.write_f32::<LittleEndian>(h.walkable_radius)?;
        writer.write_f32::<LittleEndian>(h.walkable_climb)?;
        write_vec3(writer, &h.bmin)?;
        write_vec3(writer, &h.bmax)?;
        writer.write_f32::<LittleEndian>(h.bv_quant_factor)?;
        Ok(())
    }

    /// Total payload size implied by the section counts
    fn data_size(&self) -> Option<usize> {
        let h = &self.tile;
        let count = |n: i32, size: usize| usize::try_from(n).ok()?.checked_mul(size);
        let sections = [
            count(h.vert_count, VERT_SIZE)?,
            count(h.poly_count, POLY_SIZE)?,
            count(h.max_link_count, LINK_SIZE)?,
            count(h.detail_mesh_count, DETAIL_MESH_SIZE)?,
            count(h.detail_vert_count, VERT_SIZE)?,
            count(h.detail_tri_count, DETAIL_TRI_SIZE)?,
            count(h.bv_node_count, BV_NODE_SIZE)?,
            count(h.off_mesh_con_count, OFF_MESH_CON_SIZE)?,
        ];
        sections
            .iter()
            .try_fold(MESH_HEADER_SIZE, |acc, &s| acc.checked_add(s))
    }
}

fn read_vec3<R: Read>(reader: &mut R) -> Result<[f32; 3]> {
    Ok([
        reader.read_f32::<LittleEndian>()?,
        reader.read_f32::<LittleEndian>()?,
        reader.read_f32::<LittleEndian>()?,
    ])
}

fn write_vec3<W: Write>(writer: &mut W, v: &[f32; 3]) -> Result<()> {
    for &c in v {
        writer.write_f32::<LittleEndian>(c)?;
    }
    Ok(())
}

fn read_poly<R: Read>(reader: &mut R) -> Result<Poly> {
    // first_link is runtime state; links are rebuilt on registration
    let _first_link = reader.read_u32::<LittleEndian>()?;

    let mut verts = [0u16; MAX_VERTS_PER_POLY];
    for v in &mut verts {
        *v = reader.read_u16::<LittleEndian>()?;
    }
    let mut neis = [0u16; MAX_VERTS_PER_POLY];
    for n in &mut neis {
        *n = reader.read_u16::<LittleEndian>()?;
    }
    let flags = reader.read_u16::<LittleEndian>()?;
    let vert_count = reader.read_u8()?;
    let area_and_type = reader.read_u8()?;

    let poly_type = if area_and_type >> 6 == 1 {
        PolyType::OffMeshConnection
    } else {
        PolyType::Ground
    };
    let mut poly = Poly::new(area_and_type & 0x3f, poly_type, PolyFlags::from_bits_retain(flags));
    poly.verts = verts;
    poly.neis = neis;
    poly.vert_count = vert_count;
    Ok(poly)
}

fn write_poly<W: Write>(writer: &mut W, poly: &Poly) -> Result<()> {
    writer.write_u32::<LittleEndian>(DT_NULL_LINK)?;
    for &v in &poly.verts {
        writer.write_u16::<LittleEndian>(v)?;
    }
    for &n in &poly.neis {
        writer.write_u16::<LittleEndian>(n)?;
    }
    writer.write_u16::<LittleEndian>(poly.flags.bits())?;
    writer.write_u8(poly.vert_count)?;
    writer.write_u8((poly.area & 0x3f) | ((poly.poly_type as u8) << 6))?;
    Ok(())
}

/// Loads a navigation mesh tile from Detour binary data
///
/// Trailing bytes after the last section are ignored.
pub fn load_tile_from_binary(data: &[u8]) -> Result<MeshTile> {
    read_tile(data).map_err(|e| match e {
        Error::Io(_) => Error::Detour(Status::DataCorrupted),
        other => other,
    })
}

fn read_tile(data: &[u8]) -> Result<MeshTile> {
    let mut cursor = Cursor::new(data);
    let header = MeshHeader::read_from(&mut cursor)?;

    if header.magic != DT_NAVMESH_MAGIC {
        return Err(Error::Detour(Status::WrongMagic));
    }
    if header.version != DT_NAVMESH_VERSION {
        return Err(Error::Detour(Status::WrongVersion));
    }

    // Reject counts that do not fit the buffer before allocating anything
    match header.data_size() {
        Some(size) if size <= data.len() => {}
        _ => return Err(Error::Detour(Status::DataCorrupted)),
    }

    let h = &header.tile;
    let mut tile = MeshTile {
        header: h.clone(),
        ..Default::default()
    };

    tile.verts = (0..h.vert_count)
        .map(|_| read_vec3(&mut cursor))
        .collect::<Result<_>>()?;

    tile.polys = (0..h.poly_count)
        .map(|_| read_poly(&mut cursor))
        .collect::<Result<_>>()?;

    cursor.set_position(cursor.position() + (h.max_link_count as usize * LINK_SIZE) as u64);

    for _ in 0..h.detail_mesh_count {
        let vert_base = cursor.read_u32::<LittleEndian>()?;
        let tri_base = cursor.read_u32::<LittleEndian>()?;
        let vert_count = cursor.read_u8()?;
        let tri_count = cursor.read_u8()?;
        cursor.read_u16::<LittleEndian>()?;
        tile.detail_meshes.push(PolyDetail {
            vert_base,
            tri_base,
            vert_count,
            tri_count,
        });
    }

    tile.detail_verts = (0..h.detail_vert_count)
        .map(|_| read_vec3(&mut cursor))
        .collect::<Result<_>>()?;

    for _ in 0..h.detail_tri_count {
        let mut tri = [0u8; 4];
        cursor.read_exact(&mut tri)?;
        tile.detail_tris.push(tri);
    }

    for _ in 0..h.bv_node_count {
        let mut node = BVNode::default();
        for k in 0..3 {
            node.bmin[k] = cursor.read_u16::<LittleEndian>()?;
        }
        for k in 0..3 {
            node.bmax[k] = cursor.read_u16::<LittleEndian>()?;
        }
        node.i = cursor.read_i32::<LittleEndian>()?;
        tile.bv_tree.push(node);
    }

    for _ in 0..h.off_mesh_con_count {
        let mut pos = [0.0f32; 6];
        for p in &mut pos {
            *p = cursor.read_f32::<LittleEndian>()?;
        }
        let rad = cursor.read_f32::<LittleEndian>()?;
        let poly = cursor.read_u16::<LittleEndian>()?;
        let flags = cursor.read_u8()?;
        let side = cursor.read_u8()?;
        let user_id = cursor.read_u32::<LittleEndian>()?;
        tile.off_mesh_cons.push(OffMeshConnection {
            pos,
            rad,
            poly,
            flags,
            side,
            user_id,
        });
    }

    Ok(tile)
}

/// Saves a navigation mesh tile to Detour binary data
///
/// Section counts in the written header are taken from the tile contents.
pub fn save_tile_to_binary(tile: &MeshTile) -> Result<Vec<u8>> {
    let mut tile_header = tile.header.clone();
    tile_header.vert_count = tile.verts.len() as i32;
    tile_header.poly_count = tile.polys.len() as i32;
    tile_header.detail_mesh_count = tile.detail_meshes.len() as i32;
    tile_header.detail_vert_count = tile.detail_verts.len() as i32;
    tile_header.detail_tri_count = tile.detail_tris.len() as i32;
    tile_header.bv_node_count = tile.bv_tree.len() as i32;
    tile_header.off_mesh_con_count = tile.off_mesh_cons.len() as i32;
    tile_header.max_link_count = tile_header.max_link_count.max(0);

    let header = MeshHeader {
        magic: DT_NAVMESH_MAGIC,
        version: DT_NAVMESH_VERSION,
        tile: tile_header,
    };
    let size = header
        .data_size()
        .ok_or(Error::Detour(Status::InvalidParam))?;

    let mut out = Vec::with_capacity(size);
    header.write_to(&mut out)?;

    for v in &tile.verts {
        write_vec3(&mut out, v)?;
    }
    for poly in &tile.polys {
        write_poly(&mut out, poly)?;
    }
    out.resize(out.len() + header.tile.max_link_count as usize * LINK_SIZE, 0);

    for pd in &tile.detail_meshes {
        out.write_u32::<LittleEndian>(pd.vert_base)?;
        out.write_u32::<LittleEndian>(pd.tri_base)?;
        out.write_u8(pd.vert_count)?;
        out.write_u8(pd.tri_count)?;
        out.write_u16::<LittleEndian>(0)?;
    }
    for v in &tile.detail_verts {
        write_vec3(&mut out, v)?;
    }
    for tri in &tile.detail_tris {
        out.write_all(tri)?;
    }
    for node in &tile.bv_tree {
        for &b in &node.bmin {
            out.write_u16::<LittleEndian>(b)?;
        }
        for &b in &node.bmax {
            out.write_u16::<LittleEndian>(b)?;
        }
        out.write_i32::<LittleEndian>(node.i)?;
    }
    for con in &tile.off_mesh_cons {
        for &p in &con.pos {
            out.write_f32::<LittleEndian>(p)?;
        }
        out.write_f32::<LittleEndian>(con.rad)?;
        out.write_u16::<LittleEndian>(con.poly)?;
        out.write_u8(con.flags)?;
        out.write_u8(con.side)?;
        out.write_u32::<LittleEndian>(con.user_id)?;
    }

    debug_assert_eq!(out.len(), size);
    Ok(out)
}
