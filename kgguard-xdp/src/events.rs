//! Drop-event delivery to the control plane.
//!
//! The pipeline never waits on the queue: a full or closed channel loses the
//! event and bumps `STAT_EVENTS_LOST`.

use kgguard_common::DropEvent;
use tokio::sync::mpsc;

pub const DEFAULT_EVENT_QUEUE: usize = 10_000;

pub type EventReceiver = mpsc::Receiver<DropEvent>;

#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<DropEvent>,
}

impl EventSink {
    /// Sink plus the receiving end for the aggregator.
    pub fn channel(depth: usize) -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { tx }, rx)
    }

    /// Returns false when the event was dropped.
    #[inline]
    pub fn emit(&self, event: DropEvent) -> bool {
        self.tx.try_send(event).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(src_ip: u32) -> DropEvent {
        DropEvent {
            src_ip,
            dst_ip: 0,
            src_port: 0,
            dst_port: 0,
            proto: 17,
            reason: 7,
            packet_len: 60,
            timestamp: 1,
        }
    }

    #[test]
    fn full_queue_reports_loss() {
        let (sink, mut rx) = EventSink::channel(1);
        assert!(sink.emit(event(1)));
        assert!(!sink.emit(event(2)));
        assert_eq!(rx.try_recv().map(|e| e.src_ip), Ok(1));
    }

    #[test]
    fn closed_queue_reports_loss() {
        let (sink, rx) = EventSink::channel(4);
        drop(rx);
        assert!(!sink.emit(event(1)));
    }
}
