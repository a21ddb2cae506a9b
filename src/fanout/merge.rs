//! Fan-in stage: merge the per-channel change-event streams into one.

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::Result;
use crate::storage::{ChangeEvent, Storage};

/// Subscribe to every named channel and merge their events into a single
/// bounded stream.
///
/// One forwarding task is spawned per channel; each holds a clone of the
/// merged sender, so the merged receiver only sees end-of-stream once every
/// forwarder has finished. Registration failures surface immediately rather
/// than producing a half-merged stream.
pub async fn merge_change_streams(
    storage: &dyn Storage,
    channels: &[&str],
    buffer: usize,
) -> Result<mpsc::Receiver<ChangeEvent>> {
    let (merged_tx, merged_rx) = mpsc::channel(buffer);

    let mut listeners = Vec::with_capacity(channels.len());
    for channel in channels {
        let listener = storage.change_listener(channel, buffer).await?;
        listeners.push((channel.to_string(), listener));
    }

    for (channel, mut listener) in listeners {
        let merged_tx = merged_tx.clone();
        tokio::spawn(async move {
            info!(channel = %channel, "change-event forwarder started");
            while let Some(event) = listener.recv().await {
                if merged_tx.send(event).await.is_err() {
                    // merged consumer is gone, nothing left to forward to
                    break;
                }
            }
            debug!(channel = %channel, "change-event forwarder finished");
        });
    }

    // forwarders hold the remaining senders
    drop(merged_tx);

    Ok(merged_rx)
}
