//! # Compiler Worker
//!
//! Runs the entitlement compiler out of process. Reads one JSON envelope
//! per line on stdin (`{"event": "PROCESS", "data": {...}}`) and writes
//! replies the same way on stdout. Logs go to stderr.
//!
//! ## Configuration
//!
//! Environment variables:
//! - `RUST_LOG` - Log level (default: info)

use anyhow::Context;
use permit_engine::compiler::remote::{CompilerService, Envelope};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; stdout carries the protocol
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Starting compiler worker v{}", permit_engine::VERSION);

    let service = CompilerService::new();
    let mut lines = BufReader::new(io::stdin()).lines();
    let mut stdout = io::stdout();
    let mut handled = 0u64;

    while let Some(line) = lines.next_line().await.context("reading request")? {
        if line.trim().is_empty() {
            continue;
        }

        let envelope: Envelope = match serde_json::from_str(&line) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("Skipping malformed request: {}", err);
                continue;
            }
        };

        match service.handle(envelope) {
            Ok(Some(reply)) => {
                let mut encoded = serde_json::to_string(&reply).context("encoding reply")?;
                encoded.push('\n');
                stdout
                    .write_all(encoded.as_bytes())
                    .await
                    .context("writing reply")?;
                stdout.flush().await.context("flushing reply")?;
            }
            Ok(None) => {}
            Err(err) => warn!("Rejected request: {}", err),
        }

        handled += 1;
        debug!("Handled {} requests", handled);
    }

    let stats = service.compiler().stats();
    info!(
        "Input closed after {} requests ({} compilations, {} failures)",
        handled, stats.compilations, stats.failures
    );
    Ok(())
}
