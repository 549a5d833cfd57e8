use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use placement::asset::{self, AssetSource, DesignAsset};
use placement::config::SurfaceConfig;
use placement::consts::MAX_SURFACE_SIDE_PX;
use placement::error::{AssetError, ConfigError};
use placement::input::SurfaceEvent;
use placement::raster;
use placement::surface::{Action, SurfaceCore};
use placement::transform::Placement;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("invalid surface configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid surface size {width}x{height}; each side must be in (0, {max}]", max = MAX_SURFACE_SIDE_PX)]
    InvalidSurface { width: f64, height: f64 },
    #[error("asset rejected: {0}")]
    Asset(#[from] AssetError),
    #[error("decode task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("failed to write preview: {0}")]
    Write(#[from] image::ImageError),
}

#[derive(Parser, Debug)]
#[command(name = "placement-cli", about = "Preview design placement on a product surface")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load a design, replay an event script and write a PNG preview.
    Render(RenderArgs),
    /// Load a design and print its fitted placement.
    Inspect(InspectArgs),
}

#[derive(Args, Debug)]
struct SurfaceArgs {
    #[arg(long, default_value_t = 300.0)]
    width: f64,

    #[arg(long, default_value_t = 300.0)]
    height: f64,

    #[arg(long, env = "PLACEMENT_HANDLE_SIZE")]
    handle_size: Option<f64>,

    #[arg(long, env = "PLACEMENT_MIN_SIZE")]
    min_size: Option<f64>,

    #[arg(long, env = "PLACEMENT_GRID_SIZE")]
    grid_size: Option<f64>,

    #[arg(long, env = "PLACEMENT_FIT_RATIO")]
    fit_ratio: Option<f64>,

    #[arg(long, env = "PLACEMENT_MAX_UPLOAD_BYTES")]
    max_upload_bytes: Option<usize>,
}

impl SurfaceArgs {
    /// Route the flags through the same validation as the environment overrides.
    fn config(&self) -> Result<SurfaceConfig, ConfigError> {
        SurfaceConfig::from_lookup(|key| match key {
            "PLACEMENT_HANDLE_SIZE" => self.handle_size.map(|v| v.to_string()),
            "PLACEMENT_MIN_SIZE" => self.min_size.map(|v| v.to_string()),
            "PLACEMENT_GRID_SIZE" => self.grid_size.map(|v| v.to_string()),
            "PLACEMENT_FIT_RATIO" => self.fit_ratio.map(|v| v.to_string()),
            "PLACEMENT_MAX_UPLOAD_BYTES" => self.max_upload_bytes.map(|v| v.to_string()),
            _ => None,
        })
    }
}

#[derive(Args, Debug)]
struct RenderArgs {
    #[command(flatten)]
    surface: SurfaceArgs,

    #[arg(long, help = "Design image (PNG, JPEG or GIF)")]
    image: PathBuf,

    #[arg(long, help = "JSON array of surface events to replay after loading")]
    script: Option<PathBuf>,

    #[arg(long, help = "Rotation in degrees, applied after the script")]
    rotation: Option<f64>,

    #[arg(long, help = "Opacity in [0, 1], applied after the script")]
    opacity: Option<f64>,

    #[arg(long, default_value_t = false, help = "Hide the selection outline and handles")]
    deselect: bool,

    #[arg(long, default_value = "preview.png")]
    out: PathBuf,
}

#[derive(Args, Debug)]
struct InspectArgs {
    #[command(flatten)]
    surface: SurfaceArgs,

    #[arg(long)]
    image: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Render(args) => run_render(args).await,
        Command::Inspect(args) => run_inspect(args).await,
    }
}

async fn run_render(args: RenderArgs) -> Result<(), CliError> {
    let mut core = surface(&args.surface)?;
    load(&mut core, &args.image).await?;

    if let Some(script) = &args.script {
        let events = read_script(script).await?;
        let mut synced = 0usize;
        for event in &events {
            synced += core.handle(event).iter().filter(|a| matches!(a, Action::Synced(_))).count();
        }
        info!(events = events.len(), synced, "script replayed");
    }
    if let Some(degrees) = args.rotation {
        core.set_rotation(degrees);
    }
    if let Some(opacity) = args.opacity {
        core.set_opacity(opacity);
    }
    if args.deselect {
        core.set_selected(false);
    }

    let preview = raster::rasterize(&core.scene(), core.asset().map(DesignAsset::pixels));
    preview.save(&args.out)?;
    info!(path = %args.out.display(), "preview written");

    print_placement(&core.placement())
}

async fn run_inspect(args: InspectArgs) -> Result<(), CliError> {
    let mut core = surface(&args.surface)?;
    load(&mut core, &args.image).await?;
    print_placement(&core.placement())
}

fn surface(args: &SurfaceArgs) -> Result<SurfaceCore, CliError> {
    let config = args.config()?;
    let mut core = SurfaceCore::with_config(config)
        .with_listener(|placement: &Placement| debug!(?placement, "placement synced"));
    if core.attach(args.width, args.height).is_empty() {
        return Err(CliError::InvalidSurface { width: args.width, height: args.height });
    }
    Ok(core)
}

/// Read and decode off the runtime threads, then hand the result back to the
/// surface under the ticket issued before the decode started.
async fn load(core: &mut SurfaceCore, path: &Path) -> Result<(), CliError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| CliError::Read { path: path.to_owned(), source })?;
    let source = AssetSource::Bytes {
        bytes,
        mime: mime_for(path).map(str::to_owned),
        name: path.file_name().map(|n| n.to_string_lossy().into_owned()),
    };

    let max_bytes = core.config().max_upload_bytes;
    let ticket = core.begin_load();
    let result = tokio::task::spawn_blocking(move || asset::decode(source, max_bytes)).await?;
    core.complete_load(ticket, result)?;
    Ok(())
}

async fn read_script(path: &Path) -> Result<Vec<SurfaceEvent>, CliError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| CliError::Read { path: path.to_owned(), source })?;
    Ok(serde_json::from_str(&raw)?)
}

/// MIME type implied by the file extension. Unknown extensions skip the type
/// check and leave format detection to the decoder.
fn mime_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_string_lossy().to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "svg" => Some("image/svg+xml"),
        _ => None,
    }
}

fn print_placement(placement: &Placement) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(placement)?;
    println!("{rendered}");
    Ok(())
}
