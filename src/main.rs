//! Acquisition demo against the in-process camera

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use acqview::capture::{PixelFormat, SimulatedConfig, SimulatedDriver};
use acqview::display::{ChannelRenderer, OutputSize};
use acqview::{utils, AcquisitionManager, Config};
use clap::Parser;
use color_eyre::Result;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "acqview")]
#[command(about = "Stream a camera through the transcode pipeline")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Camera id, overrides the configuration
    #[arg(short, long)]
    device: Option<String>,

    /// Frames per second produced by the simulated camera
    #[arg(long, default_value = "30")]
    fps: u32,

    /// Sensor size of the simulated camera
    #[arg(long, default_value = "640x480", value_parser = utils::parse_size)]
    sensor: OutputSize,

    /// Output width, overrides the configuration
    #[arg(long)]
    width: Option<u32>,

    /// Output height, overrides the configuration
    #[arg(long)]
    height: Option<u32>,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    duration: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    utils::init_tracing("acqview=debug");

    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(device) = args.device {
        config.acquisition.device_id = device;
    }
    if let Some(width) = args.width {
        config.display.width = width;
    }
    if let Some(height) = args.height {
        config.display.height = height;
    }
    acqview::CONFIG.store(Arc::new(config.clone()));

    info!("acqview launching...");

    let driver = Arc::new(SimulatedDriver::new(SimulatedConfig {
        devices: vec![config.acquisition.device_id.clone()],
        width: args.sensor.width,
        height: args.sensor.height,
        format: PixelFormat::BayerRg8,
        ..SimulatedConfig::default()
    }));
    let (renderer, bitmaps) = ChannelRenderer::bounded(4);

    let mut manager = AcquisitionManager::new(driver.clone(), Arc::new(renderer), &config);
    manager.start_acquisition(&config.acquisition.device_id)?;

    // Simulated sensor
    let period = Duration::from_secs_f64(1.0 / f64::from(args.fps.max(1)));
    let sensor = tokio::spawn({
        let driver = driver.clone();
        async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let driver = driver.clone();
                // callbacks may block briefly on the transcode slot
                if !tokio::task::spawn_blocking(move || driver.deliver_next())
                    .await
                    .unwrap_or(false)
                {
                    debug!("No buffer queued, frame skipped");
                }
            }
        }
    });

    let display = tokio::spawn(async move {
        let mut shown = 0u64;
        while let Ok(bitmap) = bitmaps.recv_async().await {
            shown += 1;
            if shown % 30 == 0 {
                info!(shown, width = bitmap.width, height = bitmap.height, "Frames displayed");
            }
        }
        shown
    });

    match args.duration {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => tokio::signal::ctrl_c().await?,
    }

    info!("acqview shutting down");
    sensor.abort();
    manager.stop_acquisition();
    drop(manager);

    let shown = display.await?;
    info!(shown, "Done");
    Ok(())
}
