use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use redis::AsyncCommands;
use serde_derive::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{config::Settings, error::ArbServiceError, watcher::Quote};

const STATUS_TTL_SECONDS: usize = 60;
const STATUS_CHANNEL_BUFFER: usize = 64;

/// Serialized view of the aggregator, written on every price/status mutation.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub symbol: String,
    pub last_update: f64,
    pub last_update_readable: String,
    pub exchanges: BTreeMap<String, Quote>,
}

/// Publishes aggregator snapshots to Redis with a TTL, falling back to an
/// atomic JSON file write when Redis is unavailable. Runs as its own task fed
/// by the watcher over a channel so that aggregator mutations never block on
/// sink I/O. Sink failures are logged and never propagated.
pub struct StatusPublisher;

impl StatusPublisher {
    pub fn spawn(
        settings: &Settings,
    ) -> (
        mpsc::Sender<StatusSnapshot>,
        JoinHandle<Result<(), ArbServiceError>>,
    ) {
        let (status_tx, mut status_rx) = mpsc::channel::<StatusSnapshot>(STATUS_CHANNEL_BUFFER);

        let redis_url = settings.redis_url.clone();
        let status_file = settings.status_file.clone();

        let handle = tokio::spawn(async move {
            let redis_client = redis_url.as_deref().and_then(|url| {
                match redis::Client::open(url) {
                    Ok(client) => Some(client),
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            "invalid Redis url, falling back to JSON status files"
                        );
                        None
                    }
                }
            });
            let mut redis_connection: Option<redis::aio::Connection> = None;
            let mut consecutive_failures = 0u32;

            while let Some(snapshot) = status_rx.recv().await {
                let redis_ok =
                    write_status_redis(&redis_client, &mut redis_connection, &snapshot).await;

                // The file sink only runs when Redis did not take the write.
                let file_ok = if redis_ok {
                    true
                } else {
                    match write_status_file(&status_file, &snapshot).await {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::warn!(
                                error = %e,
                                path = %status_file.display(),
                                "failed to write status file"
                            );
                            false
                        }
                    }
                };

                if redis_ok || file_ok {
                    consecutive_failures = 0;
                } else {
                    consecutive_failures += 1;
                    if consecutive_failures >= 2 {
                        tracing::error!(
                            symbol = %snapshot.symbol,
                            consecutive_failures,
                            "failed to publish status to every sink"
                        );
                    }
                }
            }

            Ok(())
        });

        (status_tx, handle)
    }
}

async fn write_status_redis(
    client: &Option<redis::Client>,
    connection: &mut Option<redis::aio::Connection>,
    snapshot: &StatusSnapshot,
) -> bool {
    let Some(client) = client else {
        return false;
    };

    if connection.is_none() {
        match client.get_async_connection().await {
            Ok(new_connection) => *connection = Some(new_connection),
            Err(e) => {
                tracing::warn!(error = %e, "failed to connect to Redis");
                return false;
            }
        }
    }

    let Some(active) = connection.as_mut() else {
        return false;
    };

    match try_write_redis(active, snapshot).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "failed to write status to Redis");
            // Drop the connection so the next snapshot reconnects.
            *connection = None;
            false
        }
    }
}

async fn try_write_redis(
    connection: &mut redis::aio::Connection,
    snapshot: &StatusSnapshot,
) -> Result<(), ArbServiceError> {
    let payload = serde_json::to_string(snapshot)?;
    let key = format!("status:{}", snapshot.symbol);
    connection
        .set_ex::<_, _, ()>(key, payload, STATUS_TTL_SECONDS)
        .await?;

    // Per-venue keys make single-exchange queries cheap for consumers.
    for (venue, quote) in &snapshot.exchanges {
        let venue_key = format!("exchange:{}:{}", snapshot.symbol, venue);
        let venue_payload = serde_json::to_string(quote)?;
        connection
            .set_ex::<_, _, ()>(venue_key, venue_payload, STATUS_TTL_SECONDS)
            .await?;
    }

    Ok(())
}

async fn write_status_file(
    path: &Path,
    snapshot: &StatusSnapshot,
) -> Result<(), ArbServiceError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let payload = serde_json::to_vec_pretty(snapshot)?;

    // Write temp + rename so readers never observe a partial file.
    let temp_path = temp_path_for(path);
    tokio::fs::write(&temp_path, payload).await?;
    tokio::fs::rename(&temp_path, path).await?;

    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    PathBuf::from(temp)
}
