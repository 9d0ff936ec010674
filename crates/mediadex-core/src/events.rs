/// Change notifications published to consumers.
///
/// Each subscriber owns an unbounded crossbeam receiver. Subscribers that
/// dropped their receiver are pruned on the next publish.
use crate::model::Category;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// The contents of a directory (or a single file) changed on disk.
    ItemChanged(PathBuf),
    /// One or more rows of a category table changed since the last drain.
    CategoryUpdated(Category),
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<MediaEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<MediaEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: MediaEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}
