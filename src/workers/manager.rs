//! Worker pool
//!
//! `W` consumers share one group on the feed stream. Each worker drains its
//! own pending list first (crash recovery), then loops: blocking group
//! read, process, ack. Messages whose handler failed stay unacked; a peer
//! reclaims them once they've been idle past the threshold. On shutdown a
//! worker finishes the batch in hand, stops reading, and returns; whatever
//! it still owns is reclaimed by the survivors.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::EventHandler;
use crate::config::WorkersConfig;
use crate::error::ServiceResult;
use crate::metrics;
use crate::stream::{EventConsumer, StreamMessage, GROUP_FEED_WORKERS, STREAM_FEED};

/// How long `stop` waits for in-flight batches before abandoning a worker
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub struct WorkerManager {
    consumer: Arc<dyn EventConsumer>,
    handler: Arc<EventHandler>,
    config: WorkersConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerManager {
    pub fn new(
        consumer: Arc<dyn EventConsumer>,
        handler: Arc<EventHandler>,
        config: WorkersConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            consumer,
            handler,
            config,
            shutdown_tx,
            shutdown_rx,
            handles: Vec::new(),
        }
    }

    /// Ensure the consumer group exists and spin up the workers.
    pub async fn start(&mut self) -> ServiceResult<()> {
        self.consumer
            .ensure_group(STREAM_FEED, GROUP_FEED_WORKERS)
            .await?;

        info!(
            workers = self.config.count,
            stream = STREAM_FEED,
            group = GROUP_FEED_WORKERS,
            "starting feed workers"
        );

        for worker_id in 1..=self.config.count {
            let worker = Worker {
                consumer: Arc::clone(&self.consumer),
                handler: Arc::clone(&self.handler),
                config: self.config.clone(),
                name: format!("worker-{worker_id}"),
                shutdown: self.shutdown_rx.clone(),
            };
            self.handles.push(tokio::spawn(worker.run()));
        }

        Ok(())
    }

    /// Signal shutdown and wait for every worker to finish its batch, up to
    /// a grace period. A worker that overruns is aborted; whatever it left
    /// pending is reclaimed on the next start.
    pub async fn stop(&mut self) {
        info!("stopping feed workers");
        let _ = self.shutdown_tx.send(true);
        for mut handle in self.handles.drain(..) {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "worker task panicked"),
                Err(_) => {
                    warn!("worker exceeded the shutdown grace period, aborting");
                    handle.abort();
                }
            }
        }
        info!("all feed workers stopped");
    }
}

struct Worker {
    consumer: Arc<dyn EventConsumer>,
    handler: Arc<EventHandler>,
    config: WorkersConfig,
    name: String,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        info!(consumer = %self.name, "worker started");

        self.drain_pending().await;

        let block = Duration::from_millis(self.config.block_ms);
        let reclaim_every = Duration::from_secs(self.config.reclaim_every_secs);
        let mut last_reclaim = Instant::now();

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                read = self.consumer.read(
                    STREAM_FEED,
                    GROUP_FEED_WORKERS,
                    &self.name,
                    self.config.batch_size,
                    block,
                ) => {
                    match read {
                        Ok(messages) if !messages.is_empty() => {
                            self.process_batch(&messages).await;
                        }
                        Ok(_) => {} // block timeout, nothing new
                        Err(e) => {
                            warn!(consumer = %self.name, error = %e, "stream read failed");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }

            if last_reclaim.elapsed() >= reclaim_every {
                last_reclaim = Instant::now();
                self.reclaim_idle().await;
            }
        }

        info!(consumer = %self.name, "worker stopped");
    }

    /// Crash recovery: work through whatever this consumer name left
    /// unacked in a previous life. Stops when the list is empty or when a
    /// pass makes no progress (persistently failing messages are left for
    /// peers to reclaim).
    async fn drain_pending(&self) {
        loop {
            let messages = match self
                .consumer
                .read_pending(
                    STREAM_FEED,
                    GROUP_FEED_WORKERS,
                    &self.name,
                    self.config.batch_size,
                )
                .await
            {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(consumer = %self.name, error = %e, "pending read failed");
                    return;
                }
            };

            if messages.is_empty() {
                debug!(consumer = %self.name, "no pending messages");
                return;
            }

            info!(consumer = %self.name, count = messages.len(), "recovering pending messages");
            if self.process_batch(&messages).await == 0 {
                return;
            }
        }
    }

    /// Claim messages idle past the threshold from dead or stuck peers and
    /// process them here.
    async fn reclaim_idle(&self) {
        let min_idle = Duration::from_secs(self.config.reclaim_idle_secs);
        match self
            .consumer
            .reclaim(
                STREAM_FEED,
                GROUP_FEED_WORKERS,
                &self.name,
                min_idle,
                self.config.batch_size,
            )
            .await
        {
            Ok(messages) if !messages.is_empty() => {
                info!(consumer = %self.name, count = messages.len(), "reclaimed idle messages");
                self.process_batch(&messages).await;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(consumer = %self.name, error = %e, "reclaim failed");
            }
        }
    }

    /// Handle a batch and ack what succeeded. Returns the ack count.
    /// Malformed payloads are acked too: replaying them can never
    /// succeed, so the worker logs, counts, and advances.
    async fn process_batch(&self, messages: &[StreamMessage]) -> usize {
        let mut ack_ids = Vec::with_capacity(messages.len());

        for message in messages {
            match &message.event {
                None => {
                    warn!(
                        consumer = %self.name,
                        message_id = %message.id,
                        "acking undecodable message"
                    );
                    ack_ids.push(message.id.clone());
                }
                Some(event) => match self.handler.handle(event).await {
                    Ok(()) => {
                        metrics::record_event(event.type_name(), "ok");
                        ack_ids.push(message.id.clone());
                    }
                    Err(e) => {
                        // Left unacked: redelivered to this consumer on
                        // restart, or reclaimed by a peer after min_idle
                        warn!(
                            consumer = %self.name,
                            message_id = %message.id,
                            event = event.type_name(),
                            error = %e,
                            "event handling failed"
                        );
                        metrics::record_event(event.type_name(), "error");
                    }
                },
            }
        }

        let acked = ack_ids.len();
        if !ack_ids.is_empty() {
            if let Err(e) = self
                .consumer
                .ack(STREAM_FEED, GROUP_FEED_WORKERS, &ack_ids)
                .await
            {
                warn!(consumer = %self.name, error = %e, "ack failed");
            }
        }
        acked
    }
}
