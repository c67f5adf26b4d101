use meshota_ble::driver;
use meshota_ble::image;
use meshota_ble::protocol::{self, DEFAULT_BLOCK_SIZE};
use meshota_ble::transport_btleplug::UpdateTransportManagerBtleplug;
use meshota_ble::{ResultMode, SessionState, UpdateConfig};

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Update firmware over the mesh software update BLE service
#[derive(clap::Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Firmware image (.bin)
    image: PathBuf,

    /// Device name or address; defaults to the first device advertising the update service
    #[arg(short, long)]
    target: Option<String>,

    /// Image bytes per Data write
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: usize,

    /// Timeout for each GATT operation, in milliseconds
    #[arg(long, default_value_t = 5_000)]
    timeout_ms: u64,

    /// Timeout for the final result, in milliseconds
    #[arg(long, default_value_t = 30_000)]
    result_timeout_ms: u64,

    /// Only read the result, do not subscribe to its notifications
    #[arg(long)]
    no_notify: bool,

    /// Run up to this many sessions when a transfer fails on a transient error
    #[arg(long, default_value_t = 1)]
    attempts: u32,

    /// Increase log verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn config(&self) -> UpdateConfig {
        UpdateConfig {
            block_size: self.block_size,
            op_timeout: Duration::from_millis(self.timeout_ms),
            result_timeout: Duration::from_millis(self.result_timeout_ms),
            result_mode: if self.no_notify {
                ResultMode::Read
            } else {
                ResultMode::ReadAndNotify
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("meshota={log_level},meshota_ble={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = args.config();
    config.validate()?;
    let image = image::load_image(&args.image)?;
    info!(bytes = image.len(), crc32 = format_args!("{:#010x}", protocol::crc32(&image)), "firmware image loaded");

    let manager = UpdateTransportManagerBtleplug::new().await?;
    let attempts = args.attempts.max(1);
    let mut attempt = 1;
    loop {
        let pb = ProgressBar::new(image.len() as u64);
        pb.set_style(
            ProgressStyle::with_template("{msg} [{elapsed}] [{wide_bar:.blue/white}] {bytes}/{total_bytes} ({bytes_per_sec})")?
                .progress_chars("#> "),
        );
        pb.set_message("Connecting...");

        let outcome = driver::update_device(&manager, args.target.as_deref(), image.clone(), &config, |progress| {
            pb.set_position(u64::from(progress.bytes_sent));
            let msg = match progress.state {
                SessionState::SizeProposed => "Proposing size...",
                SessionState::Streaming => "Uploading...",
                SessionState::ChecksumSent | SessionState::AwaitingResult => "Verifying...",
                _ => return,
            };
            pb.set_message(msg);
        })
        .await?;

        match outcome.into_result() {
            Ok(()) => {
                pb.finish_with_message("Done");
                return Ok(());
            }
            Err(err) => {
                pb.abandon_with_message("Failed");
                if err.is_retriable() && attempt < attempts {
                    warn!(attempt, error = %err, "update attempt failed, starting over");
                    attempt += 1;
                    continue;
                }
                return Err(err.into());
            }
        }
    }
}
