//! Run a MethodSCRIPT file on an EmStat Pico.
//!
//! ```text
//! pico_run --config config/pico.toml --script cv.mscr --output cv.json
//! ```
//!
//! The serial port can be overridden with `PICO_SERIAL__PORT`. Ctrl-C cancels
//! the running measurement and releases the port.

use anyhow::{Context, Result};
use clap::Parser;
use pico_daq::config::Settings;
use pico_daq::instrument::Instrument;
use pico_daq::logging;
use pico_daq::mscript::techniques;
use std::path::PathBuf;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "pico_run", version, about = "Run a MethodSCRIPT on an EmStat Pico")]
struct Args {
    /// Settings file (TOML)
    #[arg(short, long, default_value = "config/pico.toml")]
    config: PathBuf,

    /// MethodSCRIPT file to execute
    #[arg(short, long)]
    script: PathBuf,

    /// Write the measurement record as JSON
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let settings = Settings::load_from(&args.config)
        .with_context(|| format!("Failed to load settings from {}", args.config.display()))?;
    logging::init(&settings.logging)?;

    let command = techniques::custom_from_file(&args.script)?;
    let port = settings.serial.port.clone();
    let mut pico = Instrument::connect(settings)
        .await
        .with_context(|| format!("Failed to connect to {}", port))?;
    println!(
        "Connected to {} (firmware: {})",
        port,
        pico.firmware_version().unwrap_or("unknown")
    );

    let cancel = pico.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, cancelling measurement");
            cancel.cancel();
        }
    });

    let record = pico.run(&command).await.context("Measurement failed")?;

    for (i, curve) in record.curves.iter().enumerate() {
        let channels = curve
            .samples()
            .first()
            .map(|s| {
                s.values()
                    .iter()
                    .map(|v| format!("{} [{}]", v.channel, v.unit))
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();
        println!("Curve {}: {} samples  {}", i + 1, curve.len(), channels);
    }

    if let Some(path) = &args.output {
        let json = serde_json::to_string_pretty(&record)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Saved {} samples to {}", record.sample_count(), path.display());
    }

    pico.disconnect().await?;
    Ok(())
}
