mod chain_swap;
pub mod claimer;
pub mod listeners;
mod outputs;
mod reverse;
mod submarine;
mod worker;

use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::boltz::{BoltzApi, StatusClassifier, SwapStatusResponse, SwapUpdateEvent};
use crate::chain::{BlockEpoch, ChainBackend};
use crate::config::NurseryConfig;
use crate::error::{SwapError, persistence};
use crate::lightning::LightningNode;
use crate::network::Currency;
use crate::swap::store::SqliteSwapStore;
use crate::swap::{LegSide, SwapRecord, SwapState, SwapType};

pub use claimer::{Claimer, SweepReason};
pub use listeners::{ListenerGuard, ListenerRegistry};

const CURRENCIES: [Currency; 2] = [Currency::Btc, Currency::Liquid];

/// Snapshot of a swap after the engine processed something about it.
#[derive(Debug, Clone)]
pub struct SwapUpdate {
    pub swap: SwapRecord,
    pub is_final: bool,
}

/// Drives every tracked swap from lockup to settlement.
///
/// Cheap to clone; all clones share the same workers, queue and store.
#[derive(Clone)]
pub struct Nursery {
    inner: Arc<Inner>,
}

struct Inner {
    config: NurseryConfig,
    classifier: StatusClassifier,
    boltz: Arc<dyn BoltzApi>,
    chain: Arc<dyn ChainBackend>,
    lightning: Option<Arc<dyn LightningNode>>,
    store: Arc<Mutex<SqliteSwapStore>>,
    claimer: tokio::sync::Mutex<Claimer>,
    listeners: Arc<ListenerRegistry>,
    updates: broadcast::Sender<SwapUpdate>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Nursery {
    pub fn new(
        config: NurseryConfig,
        boltz: Arc<dyn BoltzApi>,
        chain: Arc<dyn ChainBackend>,
        lightning: Option<Arc<dyn LightningNode>>,
        store: Arc<Mutex<SqliteSwapStore>>,
    ) -> Self {
        let (updates, _) = broadcast::channel(256);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                classifier: config.status_classifier(),
                claimer: tokio::sync::Mutex::new(Claimer::new(config.claimer.clone())),
                config,
                boltz,
                chain,
                lightning,
                store,
                listeners: ListenerRegistry::new(),
                updates,
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &NurseryConfig {
        &self.inner.config
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.inner.listeners
    }

    /// Receives every [`SwapUpdate`] published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SwapUpdate> {
        self.inner.updates.subscribe()
    }

    /// Starts block listeners, recovers pending swaps, settles whatever is claimable and
    /// starts the deferred sweep timer.
    pub async fn start(&self) -> Result<()> {
        tracing::info!(network = %self.inner.config.network, "starting nursery");

        for currency in CURRENCIES {
            self.spawn_block_listener(currency);
        }

        self.recover_swaps().await.context("recover swaps")?;

        for currency in CURRENCIES {
            if let Err(err) = self.queue_all(currency).await {
                tracing::warn!(%currency, error = %format!("{err:#}"), "could not collect outputs");
                continue;
            }
            if let Err(err) = self.sweep(SweepReason::Forced, currency).await {
                tracing::error!(%currency, error = %format!("{err:#}"), "startup sweep failed");
            }
        }

        self.spawn_sweep_timer();
        Ok(())
    }

    /// Cancels every worker and waits for them to finish.
    pub async fn stop(&self) {
        self.inner.shutdown.send_replace(true);
        self.inner.listeners.stop_all();

        let tasks = match self.inner.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "nursery task ended abnormally");
            }
        }
        tracing::info!("nursery stopped");
    }

    /// Verifies the swap's derived outputs, persists it if it is new and starts tracking it.
    /// The invoice of a reverse swap is paid unless it is paid externally.
    pub async fn register_swap(&self, record: SwapRecord) -> Result<()> {
        let id = record.id.clone();
        if let Err(err) = self.verify_outputs(&record) {
            if self.db_get(&id).await?.is_none() {
                self.db_insert(record).await?;
            }
            self.fail_swap(&id, err).await?;
            anyhow::bail!("swap {id} rejected");
        }

        let swap_type = record.swap_type;
        if self.db_get(&id).await?.is_none() {
            self.db_insert(record).await?;
        }
        tracing::info!(swap_id = %id, "registered swap");
        self.spawn_worker(id.clone());
        self.publish(&id).await;
        if swap_type == SwapType::Reverse {
            self.pay_reverse_swap(&id).await?;
        }
        Ok(())
    }

    /// Fetches the status of every unfinished swap once, processes changes and resumes
    /// streaming.
    pub async fn recover_swaps(&self) -> Result<()> {
        let swaps = self
            .with_store(|store| store.query_by_states(&[SwapState::Pending, SwapState::Error]))
            .await?;
        tracing::info!(count = swaps.len(), "recovering swaps");

        for record in swaps {
            match self.inner.boltz.swap_status(&record.id).await {
                Ok(status) if status.status != record.status => {
                    tracing::info!(swap_id = %record.id, status = %status.status, "status changed while offline");
                    if let Err(err) = self.handle_status(&status).await {
                        tracing::error!(swap_id = %record.id, error = %format!("{err:#}"), "could not process recovered status");
                    }
                }
                Ok(_) => tracing::debug!(swap_id = %record.id, "status unchanged"),
                Err(err) => {
                    tracing::warn!(swap_id = %record.id, error = %format!("{err:#}"), "could not fetch status")
                }
            }

            match self.db_get(&record.id).await? {
                Some(current) if !current.state.is_final() => self.spawn_worker(current.id),
                _ => {}
            }
        }
        Ok(())
    }

    /// Processes one status update. Replays of the recorded status are ignored.
    pub async fn handle_status(&self, response: &SwapStatusResponse) -> Result<()> {
        let Some(record) = self.db_get(&response.id).await? else {
            tracing::warn!(swap_id = %response.id, "status update for unknown swap");
            return Ok(());
        };
        if record.state.is_final() {
            tracing::debug!(swap_id = %record.id, state = %record.state, "ignoring update of finished swap");
            return Ok(());
        }
        if record.status == response.status {
            tracing::debug!(swap_id = %record.id, status = %record.status, "status already processed");
            return Ok(());
        }
        if let (Some(recorded), Some(next)) = (
            SwapUpdateEvent::parse(&record.status),
            SwapUpdateEvent::parse(&response.status),
        ) && next.progress() < recorded.progress()
        {
            tracing::debug!(swap_id = %record.id, recorded = %record.status, status = %response.status, "ignoring outdated status");
            return Ok(());
        }

        tracing::info!(
            swap_id = %record.id,
            swap_type = %record.swap_type,
            status = %response.status,
            "swap status changed"
        );

        let id = record.id.clone();
        let result = match record.swap_type {
            SwapType::Submarine => self.handle_submarine(record, response).await,
            SwapType::Reverse => self.handle_reverse(record, response).await,
            SwapType::Chain => self.handle_chain(record, response).await,
        };
        if let Err(err) = result {
            if matches!(SwapError::find(&err), Some(SwapError::Persistence(_))) {
                return Err(err);
            }
            self.fail_swap(&id, err).await?;
        }

        self.publish(&id).await;
        Ok(())
    }

    /// Refunds everything that timed out at `epoch`, retries failed sweeps and sweeps queued
    /// outputs close to expiry.
    pub async fn on_block(&self, epoch: BlockEpoch) -> Result<()> {
        let BlockEpoch { currency, height } = epoch;
        let refundable = self
            .with_store(move |store| store.query_refundable(currency, height))
            .await?;

        let mut reason = SweepReason::None;
        if !refundable.is_empty() {
            tracing::info!(%currency, height, count = refundable.len(), "found swaps to refund");
        }
        for record in refundable {
            match self.refund_output(&record, None).await {
                Ok(output) => {
                    let next = self.inner.claimer.lock().await.queue(output, Some(height));
                    if reason == SweepReason::None {
                        reason = next;
                    }
                }
                Err(err) => self.fail_swap(&record.id, err).await?,
            }
        }

        if reason == SweepReason::None {
            let claimer = self.inner.claimer.lock().await;
            if claimer.needs_retry(currency) {
                reason = SweepReason::Retry;
            } else if claimer.has_expiring(currency, height) {
                reason = SweepReason::Expiry;
            }
        }
        if reason != SweepReason::None {
            self.sweep(reason, currency).await?;
        }
        Ok(())
    }

    /// Settles every queued output of `currency`, batching those that share a destination.
    pub async fn sweep(&self, reason: SweepReason, currency: Currency) -> Result<Vec<String>> {
        outputs::sweep(self, reason, currency).await
    }

    /// Queues every claimable and refundable output of `currency` and settles them now.
    pub async fn sweep_all(&self, currency: Currency) -> Result<Vec<String>> {
        self.queue_all(currency).await?;
        self.sweep(SweepReason::Forced, currency).await
    }

    fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(task);
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.retain(|task| !task.is_finished());
            tasks.push(handle);
        }
    }

    fn spawn_worker(&self, swap_id: String) {
        let Some((guard, stop)) = self.inner.listeners.register(&swap_id) else {
            tracing::debug!(swap_id = %swap_id, "swap already has a listener");
            return;
        };
        let nursery = self.clone();
        self.spawn(async move {
            let _guard = guard;
            worker::run(nursery, swap_id, stop).await;
        });
    }

    fn spawn_block_listener(&self, currency: Currency) {
        let nursery = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        self.spawn(async move {
            loop {
                let (epochs, mut received) = mpsc::channel(16);
                let listen =
                    nursery
                        .inner
                        .chain
                        .register_block_listener(currency, epochs, shutdown.clone());
                tokio::pin!(listen);

                let result = loop {
                    tokio::select! {
                        result = &mut listen => break result,
                        Some(epoch) = received.recv() => nursery.process_block(epoch).await,
                    }
                };
                while let Ok(epoch) = received.try_recv() {
                    nursery.process_block(epoch).await;
                }

                if *shutdown.borrow() {
                    return;
                }
                if let Err(err) = result {
                    tracing::error!(%currency, error = %format!("{err:#}"), "lost block listener");
                }
                tracing::info!(%currency, retry_in = ?nursery.inner.config.retry_interval(), "reconnecting block listener");
                tokio::select! {
                    _ = tokio::time::sleep(nursery.inner.config.retry_interval()) => {}
                    _ = wait_stopped(&mut shutdown) => return,
                }
            }
        });
    }

    /// Sweeps `currency` again after the retry interval unless a block sweeps it first.
    fn schedule_retry(&self, currency: Currency) {
        let retry_in = self.inner.config.retry_interval();
        tracing::info!(%currency, ?retry_in, "scheduling sweep retry");

        let nursery = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        self.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(retry_in) => {}
                _ = wait_stopped(&mut shutdown) => return,
            }
            if !nursery.inner.claimer.lock().await.needs_retry(currency) {
                return;
            }
            if let Err(err) = nursery.sweep(SweepReason::Retry, currency).await {
                tracing::error!(%currency, error = %format!("{err:#}"), "sweep retry failed");
            }
        });
    }

    fn spawn_sweep_timer(&self) {
        let Some(interval) = self.inner.config.claimer.interval() else {
            tracing::info!("deferred claimer disabled");
            return;
        };
        let currencies = self.inner.config.claimer.deferred_currencies.clone();
        tracing::info!(?currencies, ?interval, "starting deferred claimer");

        let nursery = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        self.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for currency in &currencies {
                            if let Err(err) = nursery.sweep(SweepReason::Interval, *currency).await {
                                tracing::error!(%currency, error = %format!("{err:#}"), "scheduled sweep failed");
                            }
                        }
                    }
                    _ = wait_stopped(&mut shutdown) => return,
                }
            }
        });
    }

    async fn process_block(&self, epoch: BlockEpoch) {
        tracing::debug!(currency = %epoch.currency, height = epoch.height, "new block");
        if let Err(err) = self.on_block(epoch).await {
            tracing::error!(currency = %epoch.currency, height = epoch.height, error = %format!("{err:#}"), "could not process block");
        }
    }

    async fn queue_all(&self, currency: Currency) -> Result<()> {
        let height = self.inner.chain.block_height(currency).await?;
        let claimable = self
            .with_store(move |store| store.query_claimable(currency))
            .await?;
        let refundable = self
            .with_store(move |store| store.query_refundable(currency, height))
            .await?;

        let mut collected = Vec::new();
        for record in &claimable {
            match self.claim_output(record, None).await {
                Ok(output) => collected.push(output),
                Err(err) => self.fail_swap(&record.id, err).await?,
            }
        }
        for record in &refundable {
            match self.refund_output(record, None).await {
                Ok(output) => collected.push(output),
                Err(err) => self.fail_swap(&record.id, err).await?,
            }
        }

        self.inner.claimer.lock().await.restore(collected);
        Ok(())
    }

    /// Records a failure. Swaps that can never complete are abandoned.
    async fn fail_swap(&self, swap_id: &str, err: anyhow::Error) -> Result<()> {
        let state = match SwapError::find(&err) {
            Some(swap_error) if swap_error.is_abandoning() => SwapState::Abandoned,
            _ => SwapState::Error,
        };
        let message = format!("{err:#}");
        tracing::error!(swap_id = %swap_id, %state, error = %message, "swap failed");

        let id = swap_id.to_string();
        self.with_store(move |store| store.update_state(&id, state, Some(&message)))
            .await?;
        self.publish(swap_id).await;
        Ok(())
    }

    async fn publish(&self, swap_id: &str) {
        match self.db_get(swap_id).await {
            Ok(Some(swap)) => {
                let is_final = swap.state.is_final();
                let _ = self.inner.updates.send(SwapUpdate { swap, is_final });
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(swap_id = %swap_id, error = %format!("{err:#}"), "could not publish update")
            }
        }
    }

    async fn update_state(&self, swap_id: &str, state: SwapState) -> Result<bool> {
        let id = swap_id.to_string();
        self.with_store(move |store| store.update_state(&id, state, None))
            .await
    }

    async fn update_status(&self, swap_id: &str, status: &str) -> Result<()> {
        let id = swap_id.to_string();
        let status = status.to_string();
        self.with_store(move |store| store.update_status(&id, &status))
            .await
    }

    async fn set_lockup_txid(&self, swap_id: &str, side: LegSide, txid: &str) -> Result<bool> {
        let id = swap_id.to_string();
        let txid = txid.to_string();
        self.with_store(move |store| store.set_lockup_txid(&id, side, &txid))
            .await
    }

    async fn db_get(&self, swap_id: &str) -> Result<Option<SwapRecord>> {
        let id = swap_id.to_string();
        self.with_store(move |store| store.get_swap(&id)).await
    }

    async fn db_insert(&self, record: SwapRecord) -> Result<()> {
        self.with_store(move |store| store.insert_swap(&record)).await
    }

    /// Runs `f` against the store on the blocking pool.
    async fn with_store<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteSwapStore) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.inner.store);
        tokio::task::spawn_blocking(move || {
            let mut store = store
                .lock()
                .map_err(|_| anyhow::anyhow!("swap store mutex poisoned"))?;
            f(&mut store)
        })
        .await
        .context("join swap store task")?
        .map_err(persistence)
    }
}

/// Resolves once `stop` carries `true` or its sender is gone.
async fn wait_stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}
