// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Ordered delivery of stack events to the listener.
//!
//! Producers (transport tasks, timer tasks, application calls) push onto an
//! unbounded queue; a single worker task pops in FIFO order. Events produced
//! by one inbound message are pushed together, so they reach the listener in
//! the order they happened.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::DeliveryMode;
use crate::event::{DispatchItem, SipEvent, SipListener};
use crate::StackError;

pub struct EventDispatcher {
    tx: mpsc::UnboundedSender<DispatchItem>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventDispatcher {
    /// Starts the worker task. Must be called from within a tokio runtime.
    pub fn spawn(listener: Arc<dyn SipListener>, mode: DeliveryMode) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(listener, mode, rx));
        Self {
            tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queues an event behind everything already queued.
    pub fn enqueue(&self, event: SipEvent) -> Result<(), StackError> {
        trace!(kind = event.kind(), "event queued");
        self.tx.send(DispatchItem::Event(event)).map_err(|err| {
            if let DispatchItem::Event(event) = err.0 {
                warn!(kind = event.kind(), "event dropped, dispatcher stopped");
            }
            StackError::Shutdown
        })
    }

    /// Queues the poison item. Events queued earlier are still delivered.
    pub fn shutdown(&self) {
        let _ = self.tx.send(DispatchItem::Shutdown);
    }

    /// Waits for the worker to exit. Returns at once if already joined.
    pub async fn join(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                warn!(%err, "event dispatcher worker failed");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn run_worker(
    listener: Arc<dyn SipListener>,
    mode: DeliveryMode,
    mut rx: mpsc::UnboundedReceiver<DispatchItem>,
) {
    while let Some(item) = rx.recv().await {
        match item {
            DispatchItem::Event(event) => match mode {
                DeliveryMode::Serialized => listener.on_event(event).await,
                DeliveryMode::Concurrent => {
                    let listener = listener.clone();
                    tokio::spawn(async move { listener.on_event(event).await });
                }
            },
            DispatchItem::Shutdown => break,
        }
    }
    rx.close();
    debug!("event dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sip_dialog::DialogId;
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct SlowListener {
        log: AsyncMutex<Vec<String>>,
    }

    #[async_trait]
    impl SipListener for SlowListener {
        async fn on_event(&self, event: SipEvent) {
            let SipEvent::DialogTerminated { dialog } = event else {
                return;
            };
            self.log.lock().await.push(format!("start {}", dialog.call_id));
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.log.lock().await.push(format!("end {}", dialog.call_id));
        }
    }

    fn event(call_id: &str) -> SipEvent {
        SipEvent::DialogTerminated {
            dialog: DialogId::new(call_id, "l", "r"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn serialized_mode_never_overlaps() {
        let listener = Arc::new(SlowListener::default());
        let dispatcher = EventDispatcher::spawn(listener.clone(), DeliveryMode::Serialized);
        dispatcher.enqueue(event("a")).unwrap();
        dispatcher.enqueue(event("b")).unwrap();
        dispatcher.shutdown();
        dispatcher.join().await;

        assert_eq!(
            *listener.log.lock().await,
            vec!["start a", "end a", "start b", "end b"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_mode_starts_in_queue_order() {
        let listener = Arc::new(SlowListener::default());
        let dispatcher = EventDispatcher::spawn(listener.clone(), DeliveryMode::Concurrent);
        dispatcher.enqueue(event("a")).unwrap();
        dispatcher.enqueue(event("b")).unwrap();
        dispatcher.shutdown();
        dispatcher.join().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let log = listener.log.lock().await;
        assert_eq!(&log[..2], ["start a", "start b"]);
        assert_eq!(log.len(), 4);
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_fails() {
        let listener = Arc::new(SlowListener::default());
        let dispatcher = EventDispatcher::spawn(listener.clone(), DeliveryMode::Serialized);
        dispatcher.shutdown();
        dispatcher.join().await;

        assert!(dispatcher.is_closed());
        assert_eq!(dispatcher.enqueue(event("late")), Err(StackError::Shutdown));
        assert!(listener.log.lock().await.is_empty());
        // A second join is a no-op.
        dispatcher.join().await;
    }
}
