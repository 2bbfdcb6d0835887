use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::warn;

use crate::{
    cache::{CacheState, FilterEval, SubstringFilter},
    channel::{ConnectionState, EventChannelHandle, SyncSignal},
    error::StoreQueryError,
    merge,
    query::QueryController,
};

#[derive(Debug, Clone)]
pub struct ListViewOptions {
    pub page_size: u32,
    pub filter: Option<String>,
    /// Delay between the last filter edit and the fetch it triggers, so
    /// rapid typing does not turn into a query per keystroke.
    pub search_debounce: Duration,
}

impl Default for ListViewOptions {
    fn default() -> Self {
        Self {
            page_size: 20,
            filter: None,
            search_debounce: Duration::from_millis(250),
        }
    }
}

#[derive(Debug)]
enum ViewCommand {
    SetPage(u32),
    SetFilter(Option<String>),
    Refresh,
}

struct FetchOutcome {
    result: Result<Option<crate::cache::ListSnapshot>, StoreQueryError>,
}

/// Binds one reconciliation cache to one query controller and one event
/// channel handle, and exposes a single consistent read model. Snapshots and
/// events are applied on one driver task, never concurrently, so the merge
/// functions need no locking. Dropping the view disconnects the channel and
/// orphans any in-flight fetch, whose late result is then simply ignored.
pub struct ListView {
    cache_rx: watch::Receiver<CacheState>,
    error_rx: watch::Receiver<Option<String>>,
    commands: mpsc::UnboundedSender<ViewCommand>,
    channel: EventChannelHandle,
    driver: JoinHandle<()>,
}

impl ListView {
    pub fn open(
        controller: Arc<QueryController>,
        channel: EventChannelHandle,
        options: ListViewOptions,
    ) -> Self {
        Self::open_with_filter_eval(controller, channel, options, Arc::new(SubstringFilter))
    }

    pub fn open_with_filter_eval(
        controller: Arc<QueryController>,
        channel: EventChannelHandle,
        options: ListViewOptions,
        filter_eval: Arc<dyn FilterEval>,
    ) -> Self {
        let initial = CacheState::new(0, options.page_size, options.filter.clone());
        let (cache_tx, cache_rx) = watch::channel(initial);
        let (error_tx, error_rx) = watch::channel(None);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let signals = channel.subscribe();

        let driver = Driver {
            controller,
            filter_eval,
            cache_tx,
            error_tx,
            page_index: 0,
            page_size: options.page_size,
            filter: options.filter,
            search_debounce: options.search_debounce,
        };
        let task = tokio::spawn(driver.run(commands_rx, signals));

        Self {
            cache_rx,
            error_rx,
            commands: commands_tx,
            channel,
            driver: task,
        }
    }

    /// The read model: always reflects the cache's current state.
    pub fn read_model(&self) -> watch::Receiver<CacheState> {
        self.cache_rx.clone()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.channel.state()
    }

    /// Message of the most recent failed fetch, cleared once a fetch lands.
    pub fn last_query_error(&self) -> watch::Receiver<Option<String>> {
        self.error_rx.clone()
    }

    pub fn set_page(&self, page_index: u32) {
        let _ = self.commands.send(ViewCommand::SetPage(page_index));
    }

    pub fn set_filter(&self, filter: Option<String>) {
        let _ = self.commands.send(ViewCommand::SetFilter(filter));
    }

    pub fn refresh(&self) {
        let _ = self.commands.send(ViewCommand::Refresh);
    }

    pub fn close(self) {}
}

impl Drop for ListView {
    fn drop(&mut self) {
        self.driver.abort();
        self.channel.disconnect();
    }
}

struct Driver {
    controller: Arc<QueryController>,
    filter_eval: Arc<dyn FilterEval>,
    cache_tx: watch::Sender<CacheState>,
    error_tx: watch::Sender<Option<String>>,
    page_index: u32,
    page_size: u32,
    filter: Option<String>,
    search_debounce: Duration,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<ViewCommand>,
        mut signals: broadcast::Receiver<SyncSignal>,
    ) {
        let (fetch_tx, mut fetch_rx) = mpsc::unbounded_channel();
        let mut debounce_deadline: Option<Instant> = None;

        self.spawn_fetch(&fetch_tx);

        loop {
            let debounce = async {
                match debounce_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = commands.recv() => match command {
                    Some(ViewCommand::SetPage(page_index)) => {
                        self.page_index = page_index;
                        debounce_deadline = None;
                        self.spawn_fetch(&fetch_tx);
                    }
                    Some(ViewCommand::SetFilter(filter)) => {
                        self.filter = filter;
                        self.page_index = 0;
                        debounce_deadline = Some(Instant::now() + self.search_debounce);
                    }
                    Some(ViewCommand::Refresh) => {
                        self.spawn_fetch(&fetch_tx);
                    }
                    None => break,
                },
                signal = signals.recv() => match signal {
                    Ok(SyncSignal::Event(event)) => {
                        let current = self.cache_tx.borrow().clone();
                        let next = merge::apply_event(&current, &event, self.filter_eval.as_ref());
                        let went_stale = next.pending_stale && !current.pending_stale;
                        if next != current {
                            let _ = self.cache_tx.send(next);
                        }
                        if went_stale {
                            self.spawn_fetch(&fetch_tx);
                        }
                    }
                    Ok(SyncSignal::Resynchronize) => {
                        self.mark_stale_and_refetch(&fetch_tx);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Events were dropped before we read them; same
                        // situation as a delivery gap on reconnect.
                        warn!(missed, "event subscription lagged, forcing resynchronize");
                        self.mark_stale_and_refetch(&fetch_tx);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // Channel handle is gone; keep serving navigation.
                    }
                },
                outcome = fetch_rx.recv() => {
                    let Some(FetchOutcome { result }) = outcome else { continue };
                    match result {
                        Ok(Some(snapshot)) => {
                            let current = self.cache_tx.borrow().clone();
                            let next = merge::apply_snapshot(&current, snapshot);
                            let _ = self.cache_tx.send(next);
                            let _ = self.error_tx.send(None);
                        }
                        // Superseded by a later request; nothing to show.
                        Ok(None) => {}
                        Err(err) => {
                            warn!(%err, "page fetch failed, keeping previous state");
                            let _ = self.error_tx.send(Some(err.to_string()));
                        }
                    }
                },
                _ = debounce => {
                    debounce_deadline = None;
                    self.spawn_fetch(&fetch_tx);
                }
            }
        }
    }

    fn mark_stale_and_refetch(&self, fetch_tx: &mpsc::UnboundedSender<FetchOutcome>) {
        let current = self.cache_tx.borrow().clone();
        let _ = self.cache_tx.send(merge::mark_stale(&current));
        self.spawn_fetch(fetch_tx);
    }

    /// Fetches run off the driver task so events keep applying while a query
    /// is in flight; the controller's request ids keep late results from
    /// clobbering newer ones.
    fn spawn_fetch(&self, fetch_tx: &mpsc::UnboundedSender<FetchOutcome>) {
        let controller = Arc::clone(&self.controller);
        let fetch_tx = fetch_tx.clone();
        let page_index = self.page_index;
        let page_size = self.page_size;
        let filter = self.filter.clone();
        tokio::spawn(async move {
            let result = controller
                .fetch(page_index, page_size, filter.as_deref())
                .await;
            // The view may have closed while we were fetching.
            let _ = fetch_tx.send(FetchOutcome { result });
        });
    }
}

#[cfg(test)]
#[path = "tests/view_tests.rs"]
mod tests;
