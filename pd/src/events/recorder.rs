//! Event Recorder - persists bus events to the `events` collection

use std::sync::Arc;

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::bus::EventBus;
use super::types::PdEvent;
use crate::state::StateManager;

/// Handle to a running recorder task
pub struct EventRecorder {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<usize>,
}

impl EventRecorder {
    /// Stop after persisting everything already emitted; returns the count written
    pub async fn finish(mut self) -> usize {
        debug!("EventRecorder::finish: called");
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        match (&mut self.handle).await {
            Ok(count) => count,
            Err(e) => {
                error!(error = %e, "EventRecorder task failed");
                0
            }
        }
    }
}

/// Subscribe now and persist events in the background
pub fn spawn_event_recorder(bus: &Arc<EventBus>, state: StateManager) -> EventRecorder {
    let rx = bus.subscribe();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(record_events(rx, shutdown_rx, state));
    EventRecorder {
        shutdown_tx: Some(shutdown_tx),
        handle,
    }
}

async fn persist(state: &StateManager, event: &PdEvent) -> bool {
    match state.append_event(event.to_record()).await {
        Ok(_) => true,
        Err(e) => {
            error!(event_type = event.event_type(), error = %e, "EventRecorder: failed to persist event");
            false
        }
    }
}

async fn record_events(
    mut rx: broadcast::Receiver<PdEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
    state: StateManager,
) -> usize {
    debug!("record_events: starting event recorder");
    let mut written = 0;
    loop {
        tokio::select! {
            biased;
            received = rx.recv() => match received {
                Ok(event) => {
                    if persist(&state, &event).await {
                        written += 1;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "EventRecorder: lagged behind, missed events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("EventRecorder: channel closed, shutting down");
                    return written;
                }
            },
            _ = &mut shutdown_rx => break,
        }
    }

    // Drain what was emitted before shutdown was requested
    loop {
        match rx.try_recv() {
            Ok(event) => {
                if persist(&state, &event).await {
                    written += 1;
                }
            }
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                warn!(missed = n, "EventRecorder: lagged behind, missed events");
            }
            Err(_) => break,
        }
    }
    debug!(written, "EventRecorder: stopped");
    written
}
