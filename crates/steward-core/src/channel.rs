//! Bounded event hand-off between a run's pipeline and its consumer.
//!
//! A full channel suspends the sender; it never drops an event and never
//! spins. Because the pipeline only reads the next frame after the previous
//! event was accepted, a slow consumer slows down pipe reads, which in turn
//! makes the provider block on its own writes.

use tokio::sync::mpsc;

use crate::event::RunEvent;

/// The consumer went away; nothing more can be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event stream closed by consumer")]
pub struct ChannelClosed;

/// Producer half, held by the run pipeline.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<RunEvent>,
}

/// Consumer half, handed to the caller of `spawn`.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<RunEvent>,
}

/// Create a bounded channel. A capacity of zero is raised to one.
pub fn event_channel(capacity: usize) -> (EventSender, EventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSender { tx }, EventStream { rx })
}

impl EventSender {
    /// Deliver one event, waiting for room if the channel is full.
    pub async fn send(&self, event: RunEvent) -> Result<(), ChannelClosed> {
        self.tx.send(event).await.map_err(|_| ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }
}

impl EventStream {
    /// Next event, or `None` once the run finished and everything was drained.
    pub async fn recv(&mut self) -> Option<RunEvent> {
        self.rx.recv().await
    }

    /// Drain until the producer side closes.
    pub async fn collect(mut self) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        events
    }

    /// Stop accepting events; pending sends fail with [`ChannelClosed`].
    pub fn close(&mut self) {
        self.rx.close();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::CanonicalEvent;
    use crate::registry::RunId;
    use std::time::Duration;

    fn text(s: &str) -> RunEvent {
        RunEvent::new(RunId(1), None, CanonicalEvent::text(s))
    }

    #[tokio::test]
    async fn full_channel_suspends_sender() {
        let (tx, mut rx) = event_channel(1);
        tx.send(text("a")).await.unwrap();
        assert_eq!(tx.available(), 0);

        let blocked = tokio::time::timeout(Duration::from_millis(50), tx.send(text("b"))).await;
        assert!(blocked.is_err(), "send should wait for room");

        assert_eq!(rx.recv().await.unwrap().event, CanonicalEvent::text("a"));
        tx.send(text("c")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().event, CanonicalEvent::text("c"));
    }

    #[tokio::test]
    async fn slow_consumer_sees_every_event_in_order() {
        let (tx, rx) = event_channel(2);
        let producer = tokio::spawn(async move {
            for i in 0..50 {
                tx.send(text(&i.to_string())).await.unwrap();
            }
        });

        let mut rx = rx;
        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            tokio::time::sleep(Duration::from_millis(1)).await;
            if let CanonicalEvent::TextDelta { text } = event.event {
                seen.push(text);
            }
        }
        producer.await.unwrap();

        let expected: Vec<String> = (0..50).map(|i| i.to_string()).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn send_after_close_reports_closed() {
        let (tx, mut rx) = event_channel(4);
        rx.close();
        assert_eq!(tx.send(text("x")).await, Err(ChannelClosed));
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn zero_capacity_is_usable() {
        let (tx, rx) = event_channel(0);
        tx.send(text("only")).await.unwrap();
        drop(tx);
        assert_eq!(rx.collect().await.len(), 1);
    }
}
