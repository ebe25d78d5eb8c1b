use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::db::DbHandle;
use crate::errors::AnalyzerError;
use crate::models::{JobSnapshot, JobStatus, ProgressEvent};

/// Buffered events per job channel. Slow subscribers past this lag lose
/// events and recover via reconnect replay.
const EVENT_BUFFER: usize = 256;

/// Per-job fan-out of progress events with replay from the job store.
///
/// Publishing is best-effort: a send with no live receivers (or a lagged
/// receiver) never blocks or fails the pipeline. Correctness comes from the
/// store: a fresh `subscribe` always replays the full recorded history.
#[derive(Clone)]
pub struct EventBroadcaster {
    db: DbHandle,
    channels: Arc<std::sync::Mutex<HashMap<Uuid, broadcast::Sender<ProgressEvent>>>>,
}

/// What a subscriber gets back: recorded history first, then (unless the job
/// is already terminal) a live receiver. Consumers must drop live events with
/// `seq <= last replayed seq` to avoid duplicates from the handover window.
#[derive(Debug)]
pub struct Subscription {
    pub replay: Vec<ProgressEvent>,
    pub live: Option<broadcast::Receiver<ProgressEvent>>,
}

impl EventBroadcaster {
    pub fn new(db: DbHandle) -> Self {
        Self {
            db,
            channels: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Open a subscription for a job. Fails with `NotFound` for unknown ids.
    ///
    /// The live receiver is registered before the store snapshot is read:
    /// any event published during the handover lands in both the replay and
    /// the channel, and the seq filter on the consumer side drops the copy.
    /// Registering after the read would instead open a gap.
    pub async fn subscribe(&self, job_id: Uuid) -> Result<Subscription, AnalyzerError> {
        let rx = {
            let mut channels = self
                .channels
                .lock()
                .map_err(|e| anyhow::anyhow!("Broadcast lock poisoned: {}", e))?;
            channels
                .entry(job_id)
                .or_insert_with(|| broadcast::channel(EVENT_BUFFER).0)
                .subscribe()
        };

        let snapshot = self
            .db
            .call(move |db| db.get_snapshot(job_id))
            .await?
            .ok_or(AnalyzerError::NotFound(job_id))?;

        let terminal = snapshot.job.status.is_terminal();
        let replay = replay_events(&snapshot);
        if terminal {
            // Nothing further will be published; the synthesized terminal
            // event in the replay closes the stream.
            drop(rx);
            return Ok(Subscription { replay, live: None });
        }
        Ok(Subscription {
            replay,
            live: Some(rx),
        })
    }

    /// Deliver an event to all live subscribers of its job. A job with no
    /// subscribers yet still gets a channel so a subscriber arriving between
    /// publishes picks up the live feed.
    pub fn publish(&self, event: &ProgressEvent) {
        let Ok(mut channels) = self.channels.lock() else {
            tracing::error!(job_id = %event.job_id, "broadcast lock poisoned, dropping event");
            return;
        };
        let tx = channels
            .entry(event.job_id)
            .or_insert_with(|| broadcast::channel(EVENT_BUFFER).0);
        // Err here just means no live receivers.
        let _ = tx.send(event.clone());
    }

    /// Tear down the per-job channel after the terminal event. Receivers
    /// drain what is buffered, then observe the channel as closed.
    pub fn close(&self, job_id: Uuid) {
        if let Ok(mut channels) = self.channels.lock() {
            channels.remove(&job_id);
        }
    }

    #[cfg(test)]
    pub(crate) fn open_channels(&self) -> usize {
        self.channels.lock().map(|c| c.len()).unwrap_or(0)
    }
}

/// Synthesize the event history for a job from its stored snapshot: one
/// event per stage result in order, plus the terminal event if the job has
/// already finished.
fn replay_events(snapshot: &JobSnapshot) -> Vec<ProgressEvent> {
    let mut events: Vec<ProgressEvent> = snapshot
        .stages
        .iter()
        .map(ProgressEvent::for_stage)
        .collect();
    let next_seq = snapshot.stages.len() as u64 + 1;
    match snapshot.job.status {
        JobStatus::Complete => events.push(ProgressEvent::completed(snapshot.job.id, next_seq)),
        JobStatus::Failed => events.push(ProgressEvent::failed(
            snapshot.job.id,
            next_seq,
            snapshot
                .job
                .error
                .clone()
                .unwrap_or_else(|| "analysis failed".to_string()),
        )),
        _ => {}
    }
    events
}

// ── Tests ─────────────────────────────────────────────────────────────
