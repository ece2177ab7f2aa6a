//! BrewOS bridge service.
//!
//! This service:
//! - Opens the UART to the control board
//! - Runs the reliable link task (handshake, retries, backpressure)
//! - Fans decoded telemetry out to the structured log
//! - Streams OTA images in `ota` mode
//!
//! Architecture: serial port → link task → channel → telemetry processor

use anyhow::{bail, Context, Result};
use tokio::io::split;
use tokio_serial::SerialPortBuilderExt;
use tracing::{info, warn};

use brewos_bridge::link::Link;
use brewos_bridge::{ota, telemetry};

const DEFAULT_PORT: &str = "/dev/ttyUSB0";
const BAUD_RATE: u32 = 115_200;

#[tokio::main]
async fn main() -> Result<()> {
    // Structured logging, env-filtered, info by default.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let port_path = std::env::var("BREWOS_PORT").unwrap_or_else(|_| DEFAULT_PORT.to_string());
    let args: Vec<String> = std::env::args().skip(1).collect();

    info!(port = %port_path, baud = BAUD_RATE, "BrewOS bridge starting");

    let port = tokio_serial::new(&port_path, BAUD_RATE)
        .open_native_async()
        .with_context(|| format!("failed to open {port_path}"))?;

    match args.first().map(String::as_str) {
        Some("ota") => {
            let image_path = args
                .get(1)
                .context("usage: brewos-bridge ota <image.bin>")?;
            let image = std::fs::read(image_path)
                .with_context(|| format!("failed to read {image_path}"))?;
            info!(image = %image_path, bytes = image.len(), "starting firmware update");

            // OTA owns the port exclusively; no link task is running.
            let (reader, writer) = split(port);
            ota::stream_image(reader, writer, &image).await?;
            info!("firmware update complete");
            Ok(())
        }
        Some(other) => bail!("unknown mode {other:?} (expected: ota <image.bin>)"),
        None => {
            let (reader, writer) = split(port);
            let link = Link::spawn(reader, writer);

            // Telemetry processor task, fed by the link's event channel.
            let processor = tokio::spawn(telemetry::process_events(link.events));

            info!("service running, press Ctrl+C to stop");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("received Ctrl+C, shutting down");
                }
                result = link.task => {
                    match result {
                        Ok(Ok(())) => warn!("link task ended"),
                        Ok(Err(error)) => warn!(%error, "link task failed"),
                        Err(error) => warn!(%error, "link task panicked"),
                    }
                }
            }

            processor.abort();
            info!("BrewOS bridge stopped");
            Ok(())
        }
    }
}
