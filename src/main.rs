//! Partition Archiver CLI
//!
//! Reads newline-delimited events from stdin and archives them until EOF or
//! Ctrl+C, then closes every partition.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | ARCHIVER_CONFIG | - | TOML config file |
//! | ARCHIVER_KEY_FIELD | - | Partition by this top-level JSON field |
//! | ARCHIVER_KEY | events.log | Constant partition key when no field is set |
//! | ARCHIVER_DEDUPE | false | Drop lines already present in the partition |
//! | ARCHIVER_LOG_JSON | false | JSON log output |
//! | RUST_LOG | info | Log filter |
//!
//! Every `ARCHIVER_*` override understood by `ArchiverConfig::apply_env` also applies.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use bytes::Bytes;
use futures::StreamExt;
use partition_archiver::{ArchiverConfig, PartitionKeyError, Router};
use std::path::PathBuf;
use tokio::signal;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_KEY: &str = "events.log";

// Longest accepted input line
const LINE_LENGTH_MAX: usize = 16 * 1024 * 1024;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("ARCHIVER_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config() -> Result<ArchiverConfig, Box<dyn std::error::Error + Send + Sync>> {
    let mut config = match std::env::var("ARCHIVER_CONFIG") {
        Ok(path) => ArchiverConfig::from_file(&PathBuf::from(path))?,
        Err(_) => ArchiverConfig::default(),
    };
    config.apply_env()?;
    Ok(config)
}

/// Key from a top-level JSON field; strings are used as is, other scalars
/// by their JSON text
fn json_field_key(field: &str, event: &[u8]) -> Result<String, PartitionKeyError> {
    let value: serde_json::Value = serde_json::from_slice(event)?;
    match value.get(field) {
        Some(serde_json::Value::String(s)) => Ok(s.clone()),
        Some(v @ (serde_json::Value::Number(_) | serde_json::Value::Bool(_))) => Ok(v.to_string()),
        Some(_) => Err(format!("field {:?} is not a scalar", field).into()),
        None => Err(format!("field {:?} missing", field).into()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let config = load_config()?;
    let dedupe = std::env::var("ARCHIVER_DEDUPE")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let mut builder = Router::builder(config.clone());
    builder = match std::env::var("ARCHIVER_KEY_FIELD") {
        Ok(field) => {
            info!(field = %field, "Partitioning by JSON field");
            builder.partition_key(move |event| json_field_key(&field, event))
        }
        Err(_) => {
            let key = std::env::var("ARCHIVER_KEY").unwrap_or_else(|_| DEFAULT_KEY.to_string());
            info!(key = %key, "Using a single partition");
            builder.partition_key(move |_| Ok(key.clone()))
        }
    };
    if dedupe {
        builder = builder.dedupe(|event, line| event == line);
    }
    let router = builder.build().await?;

    info!(
        store = ?config.store.store_type,
        dedupe,
        "Reading events from stdin (Ctrl+C to stop)"
    );

    let mut lines = FramedRead::new(
        tokio::io::stdin(),
        LinesCodec::new_with_max_length(LINE_LENGTH_MAX),
    );
    let mut read = 0u64;
    loop {
        tokio::select! {
            line = lines.next() => match line {
                Some(Ok(mut line)) => {
                    line.push('\n');
                    if let Err(e) = router.log(Bytes::from(line)).await {
                        error!(error = %e, "Event rejected");
                        break;
                    }
                    read += 1;
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!(max = LINE_LENGTH_MAX, "Skipping oversized input line");
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    error!(error = %e, "Could not read stdin");
                    break;
                }
                None => break,
            },
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!(read, "Input finished, closing partitions");
    let result = router.close().await;
    let stats = router.stats();
    info!(
        routed = stats.events_routed,
        skipped = stats.events_skipped,
        partitions = stats.partitions_created,
        evicted = stats.partitions_evicted,
        "Archiver stopped"
    );
    result?;
    Ok(())
}
