//! crack_relay - crack capture-and-upload daemon
//!
//! Runs in one of two modes:
//! 1. `--source <dir>`: process a folder of images once, in sorted order
//! 2. `--camera <device>`: capture live until Ctrl-C
//!
//! Every completed crack observation is saved locally as `<id>.jpg` and
//! `<id>.json`, then uploaded when an endpoint is configured.

use anyhow::Result;
use clap::{ArgGroup, Parser};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crack_relay::config::{ConfigOverrides, LocationPolicy, RunConfig, SourceSelection};
use crack_relay::detect::backend_from_settings;
use crack_relay::driver::{CameraDriver, FolderDriver, Pipeline};
use crack_relay::ingest::{open_capture_device, CameraConfig, FolderSource};
use crack_relay::pacing::{Pacer, Sleeper, ThreadSleeper};
use crack_relay::ui::Ui;

#[derive(Parser, Debug)]
#[command(
    name = "crack_relay",
    version,
    about = "Realtime crack detection with local capture and presigned upload"
)]
#[command(group(ArgGroup::new("mode").required(true).args(["source", "camera"])))]
struct Args {
    /// Folder with images for batch processing.
    #[arg(long, value_name = "DIR")]
    source: Option<PathBuf>,

    /// Capture device (e.g. /dev/video0, or stub://<label> for a synthetic camera).
    #[arg(long, value_name = "DEVICE")]
    camera: Option<String>,

    /// JSON run configuration file.
    #[arg(long, env = "CRACK_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Output directory for local copies.
    #[arg(long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Detector confidence threshold.
    #[arg(long)]
    conf: Option<f32>,

    /// Pixel x-coordinate of the leading margin.
    #[arg(long)]
    left_threshold: Option<u32>,

    /// Pixels per physical unit (e.g. per cm).
    #[arg(long)]
    pixels_per_unit: Option<f64>,

    /// Physical position label recorded with each measurement.
    #[arg(long)]
    position: Option<String>,

    /// Surface material label recorded with each measurement.
    #[arg(long)]
    material: Option<String>,

    /// crack_location policy: random | fixed:<label>.
    #[arg(long, value_name = "POLICY")]
    location: Option<String>,

    /// Ingestion endpoint; uploads are disabled without one.
    #[arg(long, value_name = "URL")]
    endpoint: Option<String>,

    /// API key sent as x-api-gateway-auth.
    #[arg(long, env = "CRACK_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// HTTP method for the image upload (POST or PUT).
    #[arg(long, value_name = "METHOD")]
    image_method: Option<String>,

    /// ONNX detector model (requires the backend-tract feature).
    #[arg(long, value_name = "PATH")]
    model: Option<PathBuf>,

    /// Comma-separated class names, in class-id order.
    #[arg(long, value_name = "LIST")]
    names: Option<String>,

    /// Detection script to replay instead of running a model.
    #[arg(long, value_name = "PATH")]
    detections: Option<PathBuf>,

    /// Upload on a worker thread while capture continues.
    #[arg(long)]
    background_upload: bool,

    /// Stop camera mode after this many frames.
    #[arg(long, value_name = "N")]
    max_frames: Option<u64>,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let source = SourceSelection::from_parts(args.source.clone(), args.camera.clone())?;
    let cfg = RunConfig::resolve(args.config.as_deref(), &overrides(&args))?;

    if cfg.location_policy == LocationPolicy::Random {
        log::warn!("crack_location is a random placeholder letter, not a measured position");
    }

    let sleeper: Arc<dyn Sleeper> = Arc::new(ThreadSleeper);
    let detector = backend_from_settings(&cfg.detector)?;
    let pipeline = Pipeline::from_config(&cfg, sleeper.clone())?;
    let pacer = Pacer::new(cfg.frame_interval, sleeper);
    log::info!(
        "crack_relay {} writing to {}",
        env!("CARGO_PKG_VERSION"),
        cfg.output_dir.display()
    );

    let summary = match source {
        SourceSelection::Folder(dir) => {
            let folder = FolderSource::open(&dir)?;
            let ui = Ui::from_args(Some(&args.ui), std::io::stderr().is_terminal());
            let progress = ui.progress(folder.len());
            FolderDriver::new(folder, detector, pipeline, pacer, progress).run()?
        }
        SourceSelection::Camera(device) => {
            let shutdown = Arc::new(AtomicBool::new(false));
            let flag = shutdown.clone();
            ctrlc::set_handler(move || {
                flag.store(true, Ordering::SeqCst);
            })
            .expect("error setting Ctrl-C handler");

            let device = open_capture_device(CameraConfig {
                device,
                ..CameraConfig::default()
            })?;
            let mut driver = CameraDriver::new(device, detector, pipeline, pacer);
            if let Some(limit) = args.max_frames {
                driver = driver.with_frame_limit(limit);
            }
            driver.run(&shutdown)?
        }
    };

    if summary.uploads_degraded > 0 {
        log::warn!(
            "{} upload(s) incomplete; local copies are in {}",
            summary.uploads_degraded,
            cfg.output_dir.display()
        );
    }
    Ok(())
}

fn overrides(args: &Args) -> ConfigOverrides {
    ConfigOverrides {
        output_dir: args.output.clone(),
        confidence: args.conf,
        left_threshold: args.left_threshold,
        pixels_per_unit: args.pixels_per_unit,
        position: args.position.clone(),
        material: args.material.clone(),
        location: args.location.clone(),
        endpoint: args.endpoint.clone(),
        api_key: args.api_key.clone(),
        image_method: args.image_method.clone(),
        background_upload: args.background_upload,
        model_path: args.model.clone(),
        class_names: args.names.clone(),
        script_path: args.detections.clone(),
    }
}
