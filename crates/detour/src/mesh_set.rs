//! Mesh-set asset container
//!
//! An asset is a small header followed by Detour tiles laid end to end. Tile
//! blocks carry no length; each one runs until the next tile tag or the end of
//! the buffer. Blocks that fail to register are skipped so a partially corrupt
//! asset still loads whatever tiles survive.

use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use super::binary_format::DT_NAVMESH_MAGIC;
use super::{NavMesh, NavMeshParams};
use detour_common::{Error, Result};

/// Magic number of a mesh-set asset ("TESM" read little endian)
pub const MESH_SET_MAGIC: u32 = 0x4D53_4554;

/// Bytes before the first tile block: magic, two reserved words and the parameter record
pub const MESH_SET_HEADER_SIZE: usize = 40;

/// Errors that prevent a mesh from loading at all
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read mesh asset: {0}")]
    IoFailure(#[from] std::io::Error),
    #[error("bad mesh asset format: {0}")]
    BadFormat(String),
    #[error("navigation mesh initialization failed: {0}")]
    InitFailed(#[source] Error),
    #[error("mesh asset contains no loadable tiles")]
    NoTiles,
}

/// Parsed asset header
#[derive(Debug, Clone, PartialEq)]
pub struct MeshSetHeader {
    pub magic: u32,
    pub reserved: [i32; 2],
    pub params: NavMeshParams,
}

impl MeshSetHeader {
    /// Parses the header from the start of an asset
    pub fn parse(data: &[u8]) -> std::result::Result<Self, LoadError> {
        if data.len() < MESH_SET_HEADER_SIZE {
            return Err(LoadError::BadFormat(format!(
                "asset is {} bytes, header needs {}",
                data.len(),
                MESH_SET_HEADER_SIZE
            )));
        }

        let mut cursor = Cursor::new(data);
        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != MESH_SET_MAGIC {
            return Err(LoadError::BadFormat(format!("unexpected magic {magic:#010x}")));
        }

        let reserved = [cursor.read_i32::<LittleEndian>()?, cursor.read_i32::<LittleEndian>()?];
        let params = NavMeshParams {
            origin: [
                cursor.read_f32::<LittleEndian>()?,
                cursor.read_f32::<LittleEndian>()?,
                cursor.read_f32::<LittleEndian>()?,
            ],
            tile_width: cursor.read_f32::<LittleEndian>()?,
            tile_height: cursor.read_f32::<LittleEndian>()?,
            max_tiles: cursor.read_i32::<LittleEndian>()?,
            max_polys_per_tile: cursor.read_i32::<LittleEndian>()?,
        };

        Ok(Self { magic, reserved, params })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let p = &self.params;
        writer.write_u32::<LittleEndian>(self.magic)?;
        writer.write_i32::<LittleEndian>(self.reserved[0])?;
        writer.write_i32::<LittleEndian>(self.reserved[1])?;
        for v in p.origin {
            writer.write_f32::<LittleEndian>(v)?;
        }
        writer.write_f32::<LittleEndian>(p.tile_width)?;
        writer.write_f32::<LittleEndian>(p.tile_height)?;
        writer.write_i32::<LittleEndian>(p.max_tiles)?;
        writer.write_i32::<LittleEndian>(p.max_polys_per_tile)?;
        Ok(())
    }
}

#[inline]
fn has_tile_tag(data: &[u8], offset: usize) -> bool {
    data.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) == DT_NAVMESH_MAGIC)
        .unwrap_or(false)
}

/// Loads a navigation mesh from an in-memory asset
pub fn load_mesh_set(data: &[u8]) -> std::result::Result<NavMesh, LoadError> {
    let header = MeshSetHeader::parse(data)?;
    log::info!(
        "Mesh asset: origin {:?}, tile size {}x{}, max tiles {}, max polys per tile {}",
        header.params.origin,
        header.params.tile_width,
        header.params.tile_height,
        header.params.max_tiles,
        header.params.max_polys_per_tile
    );

    let mut nav_mesh = NavMesh::new(header.params).map_err(LoadError::InitFailed)?;

    let len = data.len();
    let mut tiles_loaded = 0usize;
    let mut tiles_skipped = 0usize;
    let mut d = MESH_SET_HEADER_SIZE;

    while d + 8 < len {
        if !has_tile_tag(data, d) {
            d += 1;
            continue;
        }

        let mut next = d + 8;
        while next + 4 < len && !has_tile_tag(data, next) {
            next += 1;
        }
        let end = if next + 4 < len { next } else { len };

        // The block is copied so the tile owns its data independently of the asset buffer
        let block = data[d..end].to_vec();
        match nav_mesh.add_tile(&block) {
            Ok(base) => {
                tiles_loaded += 1;
                log::debug!("Loaded tile at offset {} ({} bytes), base ref {}", d, block.len(), base);
            }
            Err(e) => {
                tiles_skipped += 1;
                log::warn!("Skipping tile at offset {} ({} bytes): {}", d, block.len(), e);
            }
        }

        d = end;
    }

    if tiles_loaded == 0 {
        log::error!("Mesh asset yielded no tiles ({} skipped)", tiles_skipped);
        return Err(LoadError::NoTiles);
    }

    log::info!(
        "Loaded {} tiles ({} polygons), skipped {}",
        tiles_loaded,
        nav_mesh.poly_count(),
        tiles_skipped
    );
    Ok(nav_mesh)
}

/// Reads and loads a mesh asset from disk
pub fn load_mesh_set_file<P: AsRef<Path>>(path: P) -> std::result::Result<NavMesh, LoadError> {
    let path = path.as_ref();
    let data = fs::read(path).map_err(|e| {
        log::error!("Failed to read mesh asset {}: {}", path.display(), e);
        LoadError::IoFailure(e)
    })?;
    load_mesh_set(&data)
}

/// Writes a mesh-set asset from encoded tile blocks
pub fn write_mesh_set(params: &NavMeshParams, tiles: &[Vec<u8>]) -> Result<Vec<u8>> {
    let header = MeshSetHeader {
        magic: MESH_SET_MAGIC,
        reserved: [0, 0],
        params: params.clone(),
    };

    let total = MESH_SET_HEADER_SIZE + tiles.iter().map(Vec::len).sum::<usize>();
    let mut out = Vec::with_capacity(total);
    header.write_to(&mut out)?;
    for tile in tiles {
        out.extend_from_slice(tile);
    }
    Ok(out)
}
