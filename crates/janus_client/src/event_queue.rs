use std::sync::Mutex as StdMutex;

use serde_json::Value;
use tokio::sync::{
    Mutex,
    mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
};

/// Unbounded FIFO mailbox of gateway events for one plugin handle.
///
/// The session's poll loop is the only producer, the owning handle's
/// `send` the only consumer. Closing the queue drops the producer side:
/// buffered messages are still handed out, then `take_next` yields `None`.
#[derive(Debug)]
pub struct EventQueue {
    tx: StdMutex<Option<UnboundedSender<Value>>>,
    rx: Mutex<UnboundedReceiver<Value>>,
}

impl EventQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            tx: StdMutex::new(Some(tx)),
            rx: Mutex::new(rx),
        }
    }

    /// Enqueue a message. Never blocks. Messages put after `close` are
    /// dropped; the return value says whether it was queued.
    pub fn put(&self, msg: Value) -> bool {
        match self.tx.lock() {
            Ok(tx) => tx.as_ref().is_some_and(|tx| tx.send(msg).is_ok()),
            Err(_) => false,
        }
    }

    /// Stop accepting messages and wake a parked consumer once the buffer
    /// is drained.
    pub fn close(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().map(|tx| tx.is_none()).unwrap_or(true)
    }

    /// Wait for the next message in arrival order.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn take_next(&self) -> Option<Value> {
        self.rx.lock().await.recv().await
    }

    /// Non-blocking variant of [`take_next`](Self::take_next).
    pub fn try_take_next(&self) -> Option<Value> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    /// A queue whose consumer is currently parked counts as empty.
    pub fn is_empty(&self) -> bool {
        self.rx.try_lock().map(|rx| rx.is_empty()).unwrap_or(true)
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::time::{Duration, timeout};

    #[tokio::test]
    async fn delivers_in_arrival_order() {
        let q = EventQueue::new();
        q.put(json!({"n": 1}));
        q.put(json!({"n": 2}));
        q.put(json!({"n": 3}));

        for n in 1..=3 {
            assert_eq!(q.take_next().await.unwrap()["n"], n);
        }
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn take_waits_for_put() {
        let q = Arc::new(EventQueue::new());
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.take_next().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        q.put(json!("late"));
        let got = timeout(Duration::from_millis(500), consumer)
            .await
            .expect("timed-out")
            .unwrap();
        assert_eq!(got, Some(json!("late")));
    }

    #[tokio::test]
    async fn close_wakes_parked_consumer() {
        let q = Arc::new(EventQueue::new());
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.take_next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        q.close();
        let got = timeout(Duration::from_millis(500), consumer)
            .await
            .expect("timed-out")
            .unwrap();
        assert_eq!(got, None);
        assert!(q.is_closed());
    }

    #[tokio::test]
    async fn close_drains_buffer_then_ends() {
        let q = EventQueue::new();
        assert!(q.put(json!(1)));
        q.close();
        assert!(!q.put(json!(2)));

        assert_eq!(q.take_next().await, Some(json!(1)));
        assert_eq!(q.take_next().await, None);
    }

    #[test]
    fn try_take_on_empty_queue() {
        let q = EventQueue::new();
        assert_eq!(q.try_take_next(), None);
        q.put(json!(1));
        assert_eq!(q.try_take_next(), Some(json!(1)));
    }
}
