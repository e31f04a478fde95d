//! Command line tools for NPC navigation assets and the crowd service

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use glam::Vec3;
use std::fs::{self, File};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use detour::test_mesh_helpers::{create_mesh_set_bytes, test_params, GridTile};
use detour::{load_mesh_set_file, MeshSetHeader};
use npc_nav_service::{NavService, ServiceConfig, TickScheduler};

/// Agent id used by the simulate command
const SIM_AGENT: &str = "sim-agent";

/// Inspect navigation assets, query paths and run the NPC crowd service
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Service configuration file (JSON); missing fields use defaults
    #[clap(long, global = true, value_parser)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[clap(short, long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the header and tiles of a mesh-set asset
    Inspect {
        /// Mesh-set asset file
        #[clap(long, value_parser)]
        mesh: PathBuf,
    },

    /// Find a straightened path on a mesh-set asset
    FindPath {
        /// Mesh-set asset file
        #[clap(long, value_parser)]
        mesh: PathBuf,

        /// Start position (x,y,z)
        #[clap(long, value_parser = parse_vector, allow_hyphen_values = true)]
        start: Vec3,

        /// End position (x,y,z)
        #[clap(long, value_parser = parse_vector, allow_hyphen_values = true)]
        end: Vec3,

        /// Output path file
        #[clap(long, value_parser)]
        output: Option<PathBuf>,
    },

    /// Walk one agent to a target and report its progress
    Simulate {
        /// Mesh-set asset file
        #[clap(long, value_parser)]
        mesh: PathBuf,

        /// Start position (x,y,z)
        #[clap(long, value_parser = parse_vector, allow_hyphen_values = true)]
        start: Vec3,

        /// Target position (x,y,z)
        #[clap(long, value_parser = parse_vector, allow_hyphen_values = true)]
        target: Vec3,

        /// Maximum number of ticks to run
        #[clap(long, default_value = "400")]
        ticks: u32,

        /// Print the agent state every this many ticks
        #[clap(long, default_value = "20")]
        report_every: u32,
    },

    /// Write a flat grid mesh-set asset for trying the tools out
    DemoAsset {
        /// Output asset file
        #[clap(long, value_parser)]
        output: PathBuf,

        /// Tiles along x
        #[clap(long, default_value = "2")]
        tiles_x: i32,

        /// Tiles along z
        #[clap(long, default_value = "2")]
        tiles_z: i32,

        /// Grid cells per tile side
        #[clap(long, default_value = "4")]
        cells: usize,
    },

    /// Run the crowd tick and answer JSON requests read line by line from stdin
    Serve {
        /// Mesh-set asset file
        #[clap(long, value_parser)]
        mesh: PathBuf,
    },
}

/// Parse a comma-separated vector
fn parse_vector(s: &str) -> Result<Vec3, String> {
    let parts: Vec<&str> = s.split(',').collect();

    if parts.len() != 3 {
        return Err(format!("Vector must have 3 components, got {}", parts.len()));
    }

    let x = parts[0].trim().parse::<f32>().map_err(|e| e.to_string())?;
    let y = parts[1].trim().parse::<f32>().map_err(|e| e.to_string())?;
    let z = parts[2].trim().parse::<f32>().map_err(|e| e.to_string())?;

    Ok(Vec3::new(x, y, z))
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let config = load_config(args.config.as_deref())?;

    match args.command {
        Commands::Inspect { mesh } => inspect(&mesh),
        Commands::FindPath {
            mesh,
            start,
            end,
            output,
        } => find_path(&mesh, config, start, end, output.as_deref()),
        Commands::Simulate {
            mesh,
            start,
            target,
            ticks,
            report_every,
        } => simulate(&mesh, config, start, target, ticks, report_every),
        Commands::DemoAsset {
            output,
            tiles_x,
            tiles_z,
            cells,
        } => demo_asset(&output, tiles_x, tiles_z, cells),
        Commands::Serve { mesh } => serve(&mesh, config),
    }
}

fn load_config(path: Option<&Path>) -> Result<ServiceConfig> {
    let Some(path) = path else {
        return Ok(ServiceConfig::default());
    };

    let text = fs::read_to_string(path).with_context(|| format!("Failed to read config {}", path.display()))?;
    let config: ServiceConfig =
        serde_json::from_str(&text).with_context(|| format!("Failed to parse config {}", path.display()))?;
    config
        .validate()
        .map_err(|e| anyhow!("Invalid config {}: {}", path.display(), e))?;
    log::debug!("Loaded config from {}", path.display());
    Ok(config)
}

fn open_service(mesh: &Path, config: ServiceConfig) -> Result<NavService> {
    NavService::load(mesh, config).map_err(|e| anyhow!("Failed to start navigation service: {}", e))
}

/// Print the header and tiles of a mesh-set asset
fn inspect(mesh_path: &Path) -> Result<()> {
    let data = fs::read(mesh_path).with_context(|| format!("Failed to read {}", mesh_path.display()))?;
    let header = MeshSetHeader::parse(&data).map_err(|e| anyhow!("Failed to parse header: {}", e))?;

    println!("Asset: {} ({} bytes)", mesh_path.display(), data.len());
    println!("Magic: {:#010x}", header.magic);
    println!("Origin: {:?}", header.params.origin);
    println!(
        "Tile size: {} x {}, max tiles {}, max polygons per tile {}",
        header.params.tile_width, header.params.tile_height, header.params.max_tiles, header.params.max_polys_per_tile
    );

    let nav_mesh = load_mesh_set_file(mesh_path).map_err(|e| anyhow!("Failed to load mesh: {}", e))?;
    println!("Loaded {} tiles, {} polygons", nav_mesh.tile_count(), nav_mesh.poly_count());

    for tile in nav_mesh.tiles() {
        let h = &tile.header;
        println!(
            "  tile ({}, {}) layer {}: {} polys, {} verts, {} off-mesh connections, bounds {:?} - {:?}",
            h.x,
            h.y,
            h.layer,
            tile.polys.len(),
            tile.verts.len(),
            tile.off_mesh_cons.len(),
            h.bmin,
            h.bmax
        );
    }

    Ok(())
}

/// Find a straightened path on a mesh-set asset
fn find_path(mesh_path: &Path, config: ServiceConfig, start: Vec3, end: Vec3, output: Option<&Path>) -> Result<()> {
    let service = open_service(mesh_path, config)?;

    println!("Finding path from {:?} to {:?}...", start, end);
    let waypoints = service.find_path(&start.to_array(), &end.to_array());
    if waypoints.is_empty() {
        return Err(anyhow!("No path from {:?} to {:?}", start, end));
    }
    println!("Generated straight path with {} waypoints", waypoints.len());

    if let Some(output_path) = output {
        println!("Saving path to {}...", output_path.display());

        let mut file = File::create(output_path)
            .with_context(|| format!("Failed to create output file: {}", output_path.display()))?;

        writeln!(file, "# Path from {:?} to {:?}", start, end)?;
        writeln!(file, "# {} waypoints", waypoints.len())?;
        for waypoint in &waypoints {
            writeln!(file, "{},{},{}", waypoint[0], waypoint[1], waypoint[2])?;
        }
    } else {
        println!("Path:");
        for (i, waypoint) in waypoints.iter().enumerate() {
            println!("{}: {},{},{}", i, waypoint[0], waypoint[1], waypoint[2]);
        }
    }

    Ok(())
}

/// Walk one agent to a target
fn simulate(
    mesh_path: &Path,
    config: ServiceConfig,
    start: Vec3,
    target: Vec3,
    ticks: u32,
    report_every: u32,
) -> Result<()> {
    let step = config.tick.step_seconds;
    let service = open_service(mesh_path, config)?;

    service
        .add_agent(SIM_AGENT, &start.to_array())
        .map_err(|e| anyhow!("Failed to add agent at {:?}: {}", start, e))?;
    service
        .set_target(SIM_AGENT, &target.to_array())
        .map_err(|e| anyhow!("Failed to target {:?}: {}", target, e))?;

    let report_every = report_every.max(1);
    for tick in 1..=ticks {
        service.tick(step).map_err(|e| anyhow!("Tick {} failed: {}", tick, e))?;

        let snapshot = service.agent_snapshot(SIM_AGENT).map_err(|e| anyhow!("{}", e))?;
        if tick % report_every == 0 {
            println!(
                "tick {:4}: pos {:?} vel {:?} {:?}",
                tick, snapshot.position, snapshot.velocity, snapshot.target_state
            );
        }

        if service.is_at_target(SIM_AGENT, None) {
            println!(
                "Arrived after {} ticks ({:.2}s) at {:?}",
                tick,
                tick as f32 * step,
                snapshot.position
            );
            return Ok(());
        }
    }

    let snapshot = service.agent_snapshot(SIM_AGENT).map_err(|e| anyhow!("{}", e))?;
    Err(anyhow!(
        "Agent did not arrive within {} ticks; stopped at {:?} ({:?})",
        ticks,
        snapshot.position,
        snapshot.target_state
    ))
}

/// Write a flat grid mesh-set asset
fn demo_asset(output: &Path, tiles_x: i32, tiles_z: i32, cells: usize) -> Result<()> {
    if tiles_x <= 0 || tiles_z <= 0 {
        return Err(anyhow!("Tile counts must be positive"));
    }

    let params = test_params(tiles_x * tiles_z);
    let tiles: Vec<GridTile> = (0..tiles_z)
        .flat_map(|y| (0..tiles_x).map(move |x| GridTile::new(x, y, cells)))
        .collect();
    let bytes = create_mesh_set_bytes(&params, &tiles).map_err(|e| anyhow!("Failed to encode tiles: {}", e))?;

    fs::write(output, &bytes).with_context(|| format!("Failed to write {}", output.display()))?;
    println!(
        "Wrote {} tiles ({} bytes) to {}, origin {:?}, tile size {}",
        tiles.len(),
        bytes.len(),
        output.display(),
        params.origin,
        params.tile_width
    );
    Ok(())
}

/// Run the service until stdin closes or Ctrl+C
fn serve(mesh_path: &Path, config: ServiceConfig) -> Result<()> {
    let tick = config.tick.clone();
    let service = Arc::new(open_service(mesh_path, config)?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start tokio runtime")?;

    let result = runtime.block_on(async move {
        let scheduler = TickScheduler::start(Arc::clone(&service), &tick);

        let requests = {
            let service = Arc::clone(&service);
            tokio::task::spawn_blocking(move || -> Result<()> {
                let stdin = std::io::stdin();
                let mut stdout = std::io::stdout();
                for line in stdin.lock().lines() {
                    let line = line.context("Failed to read request")?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    writeln!(stdout, "{}", service.handle_json(&line))?;
                    stdout.flush()?;
                }
                Ok(())
            })
        };

        log::info!("Serving requests on stdin; Ctrl+C to stop");
        let result: Result<()> = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down");
                Ok(())
            }
            finished = requests => {
                log::info!("Request stream closed, shutting down");
                match finished {
                    Ok(read) => read,
                    Err(e) => Err(anyhow!("Request reader failed: {}", e)),
                }
            }
        };

        let ticks = scheduler.shutdown().await;
        log::info!("Served {} ticks; {:?}", ticks, service.stats());
        result
    });

    // The stdin reader may still be blocked on a read
    runtime.shutdown_timeout(Duration::from_millis(500));
    result
}
