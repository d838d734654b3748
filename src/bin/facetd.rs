//! facetd - multi-camera pipeline daemon
//!
//! This daemon:
//! 1. Discovers capture devices (plus any configured stub sources)
//! 2. Runs one processing graph per camera with mode-routed stages
//! 3. Serves an MJPEG debug stream per camera
//! 4. Synchronizes controls, mode, and video format with the remote table
//! 5. Hands finished calibration sessions to the external solver

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use facet_vision::{CameraManager, FacetdConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-camera pipeline daemon")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long, env = "FACET_CONFIG")]
    config: Option<PathBuf>,

    /// Extra camera source to open in addition to discovery, e.g.
    /// stub://checker or /dev/video2. May be given more than once.
    #[arg(long = "source")]
    sources: Vec<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = FacetdConfig::load_from(args.config.as_deref())?;
    for source in args.sources {
        if !cfg.sources.contains(&source) {
            cfg.sources.push(source);
        }
    }

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        handler_stop.store(true, Ordering::Relaxed);
    })
    .context("install Ctrl-C handler")?;

    log::info!(
        "facetd running. namespace {}, debug streams from port {}",
        cfg.namespace,
        cfg.stream.base_port
    );
    match cfg.broker.as_deref() {
        Some(broker) => log::info!("remote table broker: {broker}"),
        None => log::warn!("no broker configured; table state stays in-process"),
    }

    let mut manager = CameraManager::new(cfg)?;
    manager.run(&stop);
    log::info!("all cameras closed, disconnecting");
    manager.shutdown()?;
    Ok(())
}
