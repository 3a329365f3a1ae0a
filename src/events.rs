use crossbeam::channel::{unbounded, Receiver, Sender};
use log::debug;
use std::sync::Mutex;
use uuid::Uuid;

use crate::source::SourceState;

/// What made a clock-attached source miss frames during a mix cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropoutKind {
    /// The ring buffer came up short; the gap was zero-filled.
    ShortRead,
    /// The source reported an error while being read.
    SourceFailed,
}

/// Events emitted by the engine while running.
///
/// Runtime failures on the mixing path never abort the cycle; they surface
/// here instead, with enough context to be counted and diagnosed.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    BufferUnderrun {
        source_id: Uuid,
        missing_frames: usize,
        frame_position: u64,
    },
    SourceError {
        source_id: Uuid,
        message: String,
    },
    TrackDropout {
        source_id: Uuid,
        kind: DropoutKind,
        timestamp: f64,
        missing_frames: usize,
        reason: String,
    },
    StateChanged {
        source_id: Uuid,
        old: SourceState,
        new: SourceState,
    },
}

/// Multi-subscriber event fan-out.
///
/// Each subscriber gets its own unbounded channel; `emit` clones the event to
/// every live subscriber and silently drops channels whose receiver has gone
/// away. Emission is cheap enough for the mixer thread (events are rare and
/// the send is non-blocking).
pub struct EventHub {
    senders: Mutex<Vec<Sender<EngineEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    /// Create a new subscription. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = unbounded();
        if let Ok(mut senders) = self.senders.lock() {
            senders.push(tx);
        }
        rx
    }

    pub fn emit(&self, event: EngineEvent) {
        debug!("Engine event: {:?}", event);
        if let Ok(mut senders) = self.senders.lock() {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_reaches_all_subscribers() {
        let hub = EventHub::new();
        let rx1 = hub.subscribe();
        let rx2 = hub.subscribe();

        hub.emit(EngineEvent::BufferUnderrun {
            source_id: Uuid::new_v4(),
            missing_frames: 128,
            frame_position: 4096,
        });

        assert!(matches!(
            rx1.try_recv().unwrap(),
            EngineEvent::BufferUnderrun { missing_frames: 128, .. }
        ));
        assert!(matches!(
            rx2.try_recv().unwrap(),
            EngineEvent::BufferUnderrun { .. }
        ));
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let hub = EventHub::new();
        let rx1 = hub.subscribe();
        {
            let _rx2 = hub.subscribe();
        }
        assert_eq!(hub.subscriber_count(), 2);

        hub.emit(EngineEvent::SourceError {
            source_id: Uuid::new_v4(),
            message: "decode failed".into(),
        });

        assert_eq!(hub.subscriber_count(), 1);
        assert!(rx1.try_recv().is_ok());
    }
}
