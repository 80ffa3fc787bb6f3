//! Watch/reconcile engine.
//!
//! Runs forever in generations: list the three resource kinds into a fresh
//! cache, subscribe to their change streams, then debounce events within a
//! fixed window and reload nginx when a batch materially changed the cache.
//! Any stream closing tears the generation down and the next one rebuilds
//! state from a full re-list; no attempt is made to resume from the lost
//! resource version.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::Client;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::cache::Cache;
use crate::config::Config;
use crate::error::Error;
use crate::nginx::{self, NginxDriver};
use crate::resources::namespaces::{NamespaceOps, NamespaceSet};
use crate::resources::pods::{PodOps, PodSet};
use crate::resources::secrets::{SecretOps, SecretSet};
use crate::resources::{process_event, EventKind, RawObject, WatchableResourceSet};

/// Time window to buffer events before processing a batch
pub const EVENT_WINDOW: Duration = Duration::from_millis(2000);

/// The long-lived reconcile loop
pub struct Reconciler {
    config: Arc<Config>,
    client: Client,
    driver: NginxDriver,
}

/// One buffered watch event: which set produced it plus the raw payload
type SetEvent = (usize, EventKind, RawObject);

impl Reconciler {
    pub fn new(config: Arc<Config>, client: Client, driver: NginxDriver) -> Self {
        Self {
            config,
            client,
            driver,
        }
    }

    /// Run generations forever. Returns only on errors that should end the
    /// process (failing to list cluster state, or failing to write the
    /// configuration).
    pub async fn run(&self) -> Result<(), Error> {
        loop {
            self.run_generation().await?;
            info!("watch streams closed, rebuilding cluster state");
        }
    }

    /// One list-then-watch cycle
    async fn run_generation(&self) -> Result<(), Error> {
        let sets: Vec<Arc<dyn WatchableResourceSet>> = vec![
            Arc::new(NamespaceSet::new(
                NamespaceOps::new(self.config.clone()),
                self.client.clone(),
            )),
            Arc::new(SecretSet::new(
                SecretOps::new(self.config.clone()),
                self.client.clone(),
            )),
            Arc::new(PodSet::new(
                PodOps::new(self.config.clone()),
                self.client.clone(),
            )),
        ];

        // Initial state plus one subscription per set, in fixed order
        let mut cache = Cache::new();
        let mut streams = Vec::with_capacity(sets.len());
        for set in &sets {
            let (items, version) = set.list().await?;
            debug!(kind = set.kind(), count = items.len(), "listed resources");
            for item in items {
                set.cache_add(&mut cache, item);
            }
            streams.push(set.watch(&version).await?);
        }

        let rendered = nginx::render_config(&self.config, &cache)?;
        self.driver.reload(&rendered).await?;

        // Fan-in: one reader per stream into a shared queue; a token on the
        // done channel means a stream closed and the generation is over
        let (event_tx, mut event_rx) = mpsc::channel::<SetEvent>(256);
        let (done_tx, mut done_rx) = mpsc::channel::<usize>(sets.len());

        let mut readers = Vec::with_capacity(streams.len());
        for (index, mut stream) in streams.into_iter().enumerate() {
            let events = event_tx.clone();
            let done = done_tx.clone();
            let kind = sets[index].kind();

            readers.push(tokio::spawn(async move {
                while let Some(item) = stream.next().await {
                    match item {
                        Ok((event_kind, raw)) => {
                            if events.send((index, event_kind, raw)).await.is_err() {
                                break;
                            }
                        }
                        Err(error) => {
                            warn!(kind, %error, "watch stream error");
                            break;
                        }
                    }
                }
                let _ = done.send(index).await;
            }));
        }
        drop(event_tx);
        drop(done_tx);

        // Debounce loop: the window opens at the first buffered event and
        // closes exactly EVENT_WINDOW later; later events never extend it
        let mut pending: Vec<SetEvent> = Vec::new();
        let mut window_expiry: Option<Instant> = None;

        loop {
            tokio::select! {
                maybe_event = event_rx.recv() => {
                    let Some(event) = maybe_event else { break };
                    if window_expiry.is_none() {
                        window_expiry = Some(Instant::now() + EVENT_WINDOW);
                    }
                    pending.push(event);
                }
                _ = sleep_until(window_expiry.unwrap_or_else(Instant::now)), if window_expiry.is_some() => {
                    window_expiry = None;
                    let events = std::mem::take(&mut pending);
                    if apply_batch(&mut cache, &sets, events) {
                        info!("cache changed, reloading nginx");
                        let rendered = nginx::render_config(&self.config, &cache)?;
                        self.driver.reload(&rendered).await?;
                    }
                }
                Some(index) = done_rx.recv() => {
                    warn!(kind = sets[index].kind(), "watch stream closed");
                    break;
                }
            }
        }

        for reader in &readers {
            reader.abort();
        }

        Ok(())
    }
}

/// Apply a batch of buffered events in arrival order; true when any event
/// materially changed the cache
fn apply_batch(
    cache: &mut Cache,
    sets: &[Arc<dyn WatchableResourceSet>],
    events: Vec<SetEvent>,
) -> bool {
    let mut material = false;
    for (index, kind, raw) in events {
        if process_event(cache, sets[index].as_ref(), kind, &raw) {
            material = true;
        }
    }
    material
}
