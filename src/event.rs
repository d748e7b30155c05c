//! Updates event system.

use crate::statemachine::{LauncherContext, UpdatesState};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

/// Events emitted by the updates core.
#[derive(Debug, Clone)]
pub enum UpdatesEvent {
    /// The state machine moved to a new state.
    StateChanged {
        /// New state.
        state: UpdatesState,
        /// Context after the transition.
        context: Box<LauncherContext>,
    },

    /// One asset of an update finished downloading.
    AssetDownloaded {
        /// Update being downloaded.
        update_id: Uuid,
        /// Asset key.
        key: String,
        /// Assets finished so far.
        completed: usize,
        /// Assets in the download.
        total: usize,
    },

    /// The host relaunched into an update.
    Relaunched {
        /// Update now running.
        update_id: Uuid,
    },

    /// Error occurred.
    Error {
        /// Error message.
        message: String,
    },
}

/// Channel for receiving updates events.
pub type UpdatesEventsChannel = broadcast::Receiver<UpdatesEvent>;

/// Sender for updates events.
pub type UpdatesEventsSender = broadcast::Sender<UpdatesEvent>;

/// Create a new event channel pair.
#[must_use]
pub fn create_event_channel() -> (UpdatesEventsSender, UpdatesEventsChannel) {
    broadcast::channel(256)
}

/// Forward every event to `callback` until the returned subscription is
/// dropped. Must be called within a tokio runtime.
///
/// A listener that falls more than the channel capacity behind skips the
/// missed events and keeps going.
pub fn add_listener<F>(sender: &UpdatesEventsSender, callback: F) -> Subscription
where
    F: Fn(UpdatesEvent) + Send + 'static,
{
    let mut events = sender.subscribe();
    let task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => callback(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Event listener lagged, skipped {skipped} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    Subscription { task }
}

/// Handle returned by [`add_listener`]; dropping it stops delivery.
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    /// Stop delivery now.
    pub fn remove(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
