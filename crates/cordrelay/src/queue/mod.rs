//! Paced outbound message queue.
//!
//! Any thread may [`enqueue`](OutboundQueue::enqueue) without blocking. A
//! single background consumer delivers envelopes to the [`ChatClient`] in
//! FIFO order, pausing for the pacing interval after every delivery and for
//! the shorter idle interval when the queue is empty. Delivery is
//! best-effort: a failed send is logged and the envelope dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use cordrelay_core::config::TimingConfig;

use crate::chat::{ChannelId, ChatClient, Payload};

/// A message waiting for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEnvelope {
    pub destination: ChannelId,
    pub payload: Payload,
    pub enqueued_at: Instant,
}

/// Consumer loop timing.
#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    /// Pause after each delivery.
    pub pacing_interval: Duration,
    /// Pause when the queue was found empty.
    pub idle_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from(&TimingConfig::default())
    }
}

impl From<&TimingConfig> for QueueSettings {
    fn from(timing: &TimingConfig) -> Self {
        Self {
            pacing_interval: timing.pacing_interval(),
            idle_interval: timing.idle_interval(),
        }
    }
}

struct Worker {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct QueueInner {
    items: Mutex<VecDeque<OutboundEnvelope>>,
    worker: Mutex<Option<Worker>>,
    settings: QueueSettings,
}

impl QueueInner {
    fn items(&self) -> MutexGuard<'_, VecDeque<OutboundEnvelope>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop(&self) -> Option<OutboundEnvelope> {
        self.items().pop_front()
    }
}

/// Cloneable handle to the shared outbound queue.
#[derive(Clone)]
pub struct OutboundQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for OutboundQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundQueue")
            .field("len", &self.len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl OutboundQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                items: Mutex::new(VecDeque::new()),
                worker: Mutex::new(None),
                settings,
            }),
        }
    }

    /// Append a message. Never blocks on delivery and never fails.
    pub fn enqueue(&self, destination: ChannelId, payload: Payload) {
        self.inner.items().push_back(OutboundEnvelope {
            destination,
            payload,
            enqueued_at: Instant::now(),
        });
    }

    /// Number of messages waiting for delivery.
    pub fn len(&self) -> usize {
        self.inner.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the messages waiting for delivery, oldest first.
    pub fn snapshot(&self) -> Vec<OutboundEnvelope> {
        self.inner.items().iter().cloned().collect()
    }

    /// Whether a consumer is currently running.
    pub fn is_running(&self) -> bool {
        self.inner.worker().is_some()
    }

    /// Spawn the consumer. Does nothing if one is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, client: Arc<dyn ChatClient>) {
        let mut worker = self.inner.worker();
        if worker.is_some() {
            debug!("Outbound queue already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_consumer(Arc::clone(&self.inner), client, shutdown_rx));
        *worker = Some(Worker {
            shutdown_tx,
            handle,
        });
        info!("Outbound queue started");
    }

    /// Stop the consumer, waiting up to `drain_timeout` for an in-flight send.
    ///
    /// Messages still queued afterwards are discarded. Does nothing if the
    /// consumer is not running.
    pub async fn stop(&self, drain_timeout: Duration) {
        let Some(Worker {
            shutdown_tx,
            mut handle,
        }) = self.inner.worker().take()
        else {
            return;
        };

        let _ = shutdown_tx.send(true);
        if tokio::time::timeout(drain_timeout, &mut handle).await.is_err() {
            warn!(
                timeout_ms = drain_timeout.as_millis(),
                "Outbound queue did not stop in time, aborting consumer"
            );
            handle.abort();
        }

        let discarded = {
            let mut items = self.inner.items();
            let n = items.len();
            items.clear();
            n
        };
        if discarded > 0 {
            info!(discarded, "Discarded undelivered outbound messages");
        }
        info!("Outbound queue stopped");
    }
}

async fn run_consumer(
    inner: Arc<QueueInner>,
    client: Arc<dyn ChatClient>,
    mut shutdown: watch::Receiver<bool>,
) {
    let settings = inner.settings;
    loop {
        if *shutdown.borrow() {
            break;
        }

        // The lock is released before the send so producers never wait on I/O.
        let next = inner.pop();
        let pause = match next {
            Some(envelope) => {
                deliver(client.as_ref(), &envelope).await;
                settings.pacing_interval
            }
            None => settings.idle_interval,
        };

        tokio::select! {
            () = tokio::time::sleep(pause) => {}
            _ = shutdown.changed() => break,
        }
    }
    debug!("Outbound consumer exited");
}

async fn deliver(client: &dyn ChatClient, envelope: &OutboundEnvelope) {
    if let Err(e) = client.send(envelope.destination, &envelope.payload).await {
        warn!(
            channel = envelope.destination,
            queued_ms = envelope.enqueued_at.elapsed().as_millis(),
            error = %e,
            "Failed to deliver outbound message, dropping"
        );
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::chat::ChatError;
    use async_trait::async_trait;
    use cordrelay_core::config::ActivityKind;

    #[derive(Default)]
    struct RecordingClient {
        sent: Mutex<Vec<(Instant, ChannelId, Payload)>>,
        fail_channel: Option<ChannelId>,
        send_delay: Duration,
    }

    impl RecordingClient {
        fn sent(&self) -> Vec<(Instant, ChannelId, Payload)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatClient for RecordingClient {
        async fn send(&self, channel: ChannelId, payload: &Payload) -> Result<(), ChatError> {
            if !self.send_delay.is_zero() {
                tokio::time::sleep(self.send_delay).await;
            }
            self.sent
                .lock()
                .unwrap()
                .push((Instant::now(), channel, payload.clone()));
            if Some(channel) == self.fail_channel {
                return Err(ChatError::Request("boom".to_string()));
            }
            Ok(())
        }

        async fn set_presence_status(
            &self,
            _text: &str,
            _activity: ActivityKind,
        ) -> Result<(), ChatError> {
            Ok(())
        }
    }

    fn text(s: &str) -> Payload {
        Payload::Text(s.to_string())
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn delivers_in_enqueue_order() {
        let client = Arc::new(RecordingClient::default());
        let queue = OutboundQueue::new(QueueSettings::default());
        for i in 0..5 {
            queue.enqueue(1, text(&format!("m{i}")));
        }

        queue.start(client.clone());
        tokio::time::sleep(Duration::from_secs(3)).await;
        queue.stop(Duration::from_secs(5)).await;

        let payloads: Vec<Payload> = client.sent().into_iter().map(|(_, _, p)| p).collect();
        let expected: Vec<Payload> = (0..5).map(|i| text(&format!("m{i}"))).collect();
        assert_eq!(payloads, expected);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn deliveries_are_paced() {
        let client = Arc::new(RecordingClient::default());
        let queue = OutboundQueue::new(QueueSettings::default());
        queue.start(client.clone());

        // Producers racing the consumer, including while it is idle.
        queue.enqueue(1, text("a"));
        queue.enqueue(1, text("b"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.enqueue(1, text("c"));
        tokio::time::sleep(Duration::from_secs(2)).await;
        queue.enqueue(1, text("d"));
        tokio::time::sleep(Duration::from_secs(2)).await;
        queue.stop(Duration::from_secs(5)).await;

        let sent = client.sent();
        assert_eq!(sent.len(), 4);
        for pair in sent.windows(2) {
            let gap = pair[1].0 - pair[0].0;
            assert!(gap >= Duration::from_millis(300), "gap too short: {gap:?}");
        }
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn failed_delivery_is_dropped_not_retried() {
        let client = Arc::new(RecordingClient {
            fail_channel: Some(13),
            ..Default::default()
        });
        let queue = OutboundQueue::new(QueueSettings::default());
        queue.enqueue(13, text("lost"));
        queue.enqueue(2, text("kept"));

        queue.start(client.clone());
        tokio::time::sleep(Duration::from_secs(2)).await;
        queue.stop(Duration::from_secs(5)).await;

        let channels: Vec<ChannelId> = client.sent().into_iter().map(|(_, c, _)| c).collect();
        assert_eq!(channels, vec![13, 2]);
        assert!(queue.is_empty());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn start_and_stop_are_idempotent() {
        let client = Arc::new(RecordingClient::default());
        let queue = OutboundQueue::new(QueueSettings::default());

        queue.stop(Duration::from_secs(1)).await;
        assert!(!queue.is_running());

        queue.start(client.clone());
        queue.start(client.clone());
        assert!(queue.is_running());

        queue.enqueue(1, text("once"));
        tokio::time::sleep(Duration::from_secs(1)).await;

        queue.stop(Duration::from_secs(1)).await;
        queue.stop(Duration::from_secs(1)).await;
        assert!(!queue.is_running());
        assert_eq!(client.sent().len(), 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn stop_interrupts_pacing_and_discards_backlog() {
        let client = Arc::new(RecordingClient::default());
        let queue = OutboundQueue::new(QueueSettings {
            pacing_interval: Duration::from_secs(60),
            idle_interval: Duration::from_millis(100),
        });
        for i in 0..3 {
            queue.enqueue(1, text(&format!("m{i}")));
        }
        queue.start(client.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;

        let before = Instant::now();
        queue.stop(Duration::from_secs(5)).await;
        assert!(before.elapsed() < Duration::from_secs(1));

        assert_eq!(client.sent().len(), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn stop_gives_up_on_slow_send_after_drain_timeout() {
        let client = Arc::new(RecordingClient {
            send_delay: Duration::from_secs(30),
            ..Default::default()
        });
        let queue = OutboundQueue::new(QueueSettings::default());
        queue.enqueue(1, text("slow"));
        queue.start(client.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;

        let before = Instant::now();
        queue.stop(Duration::from_secs(5)).await;
        let waited = before.elapsed();
        assert!(waited >= Duration::from_secs(5));
        assert!(waited < Duration::from_secs(30));
        assert!(client.sent().is_empty());
    }
}
