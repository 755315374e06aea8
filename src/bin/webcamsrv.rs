//! webcamsrv - webcam snapshot server
//!
//! This daemon:
//! 1. Resolves configuration (CLI > environment > config file > defaults)
//! 2. Loads the region classifier (fatal on failure)
//! 3. Starts the capture supervisor on the configured video source
//! 4. Serves snapshots over HTTP until Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;

use webcam_server::{
    api::ApiServer, load_classifier, pipeline::build_recognizer, CaptureSupervisor,
    ConfigOverrides, FrameCache, Orchestrator, ServerConfig, VideoSource,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve webcam snapshots with optional detect/crop/OCR")]
struct Args {
    /// TOML configuration file.
    #[arg(long, env = "WEBCAM_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (e.g. 0.0.0.0:8888).
    #[arg(long)]
    listen: Option<String>,

    /// Local capture device index (/dev/video<N>).
    #[arg(long)]
    camera_index: Option<u32>,

    /// Requested capture width.
    #[arg(long)]
    width: Option<u32>,

    /// Requested capture height.
    #[arg(long)]
    height: Option<u32>,

    /// Remote stream URI; replaces the local device. `stub://name` for a synthetic source.
    #[arg(long)]
    uri: Option<String>,

    /// Detection model path (`stub://...` for the built-in classifier).
    #[arg(long)]
    model: Option<String>,

    /// Give up after this many consecutive failed reconnects (0 = never).
    #[arg(long)]
    max_reconnect_attempts: Option<u32>,
}

impl From<Args> for ConfigOverrides {
    fn from(args: Args) -> Self {
        Self {
            config_path: args.config,
            listen_addr: args.listen,
            camera_index: args.camera_index,
            camera_width: args.width,
            camera_height: args.height,
            camera_uri: args.uri,
            model_path: args.model,
            max_reconnect_attempts: args.max_reconnect_attempts,
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = ServerConfig::load(&Args::parse().into())?;
    log::info!(
        "webcamsrv {} starting: source {}, listen {}",
        env!("CARGO_PKG_VERSION"),
        cfg.descriptor(),
        cfg.listen_addr
    );

    let classifier = load_classifier(
        &cfg.detection.model_path,
        cfg.detection.window,
        cfg.detection.score_threshold,
    )?;
    let recognizer = build_recognizer(&cfg.ocr.language, cfg.ocr.datapath.clone());

    let cache = FrameCache::new();
    let source = VideoSource::new(cfg.descriptor(), cfg.source_options());
    let supervisor =
        CaptureSupervisor::new(source, cache.clone(), cfg.supervisor_config()).spawn()?;

    let orchestrator = Orchestrator::new(cache, classifier, recognizer, cfg.pipeline_settings());
    let api_server = ApiServer::new(cfg.api_config(), orchestrator, supervisor.status());
    let api_handle = match api_server.spawn() {
        Ok(handle) => handle,
        Err(err) => {
            supervisor.stop()?;
            return Err(err);
        }
    };

    let (tx, rx) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|err| anyhow!("error setting Ctrl-C handler: {err}"))?;

    log::info!("webcamsrv waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");
    api_handle.stop()?;
    supervisor.stop()?;
    log::info!("webcamsrv stopped");

    Ok(())
}
