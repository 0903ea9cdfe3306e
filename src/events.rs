//! Outbound event sink (spec §6, §4.7).
//!
//! Delivery is best-effort: the engine drops events if the sink
//! back-pressures beyond a bounded buffer, never blocking the call that
//! triggered them.

use async_trait::async_trait;
use uuid::Uuid;

use crate::model::TaskStatus;

#[derive(Debug, Clone)]
pub enum Event {
    /// A command's ready queue transitioned from empty, or a delayed task
    /// became immediately due.
    QueueAvailable { command: String, approx_depth: u64 },
    /// A task reached a terminal status.
    TaskTerminal {
        task_id: Uuid,
        status: TaskStatus,
        webhook_url: Option<String>,
    },
}

/// Capability interface the host supplies to the engine (spec §9
/// "Polymorphism"). Implementations must not block the caller — `notify`
/// is expected to be a cheap enqueue, not a network call.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn notify(&self, event: Event);
}

/// Discards every event. Used when a host has no interest in advisory
/// notifications (e.g. most tests).
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn notify(&self, _event: Event) {}
}

/// Bounded-channel sink backed by `tokio::sync::mpsc`. Sends are
/// non-blocking: a full channel drops the event rather than stalling the
/// engine call that produced it.
pub struct ChannelSink {
    tx: tokio::sync::mpsc::Sender<Event>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, tokio::sync::mpsc::Receiver<Event>) {
        let (tx, rx) = tokio::sync::mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn notify(&self, event: Event) {
        if self.tx.try_send(event).is_err() {
            tracing::warn!("event sink back-pressured; dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_sink_delivers_events() {
        let (sink, mut rx) = ChannelSink::new(4);
        sink.notify(Event::QueueAvailable {
            command: "echo".into(),
            approx_depth: 1,
        })
        .await;
        let received = rx.recv().await.unwrap();
        match received {
            Event::QueueAvailable { command, .. } => assert_eq!(command, "echo"),
            _ => panic!("wrong event kind"),
        }
    }

    #[tokio::test]
    async fn channel_sink_drops_when_full_instead_of_blocking() {
        let (sink, _rx) = ChannelSink::new(1);
        sink.notify(Event::QueueAvailable {
            command: "a".into(),
            approx_depth: 1,
        })
        .await;
        // Second send: channel is full (receiver hasn't drained), but this
        // must return promptly rather than deadlock.
        sink.notify(Event::QueueAvailable {
            command: "b".into(),
            approx_depth: 1,
        })
        .await;
    }
}
