// Bitcoin Dev Kit
// Written in 2020 by Alekos Filini <alekos.filini@gmail.com>
//
// Copyright (c) 2020-2021 Bitcoin Dev Kit Developers
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Periodic rebroadcast of pending transactions
//!
//! The [`RebroadcastScheduler`] owns a background task that, every interval, asks an
//! [`UnconfirmedSource`] for the transactions the wallet sent that are still waiting for a block
//! and hands each of them to the [`NodeApi`]. Failures are logged and retried at the next tick.
//!
//! The scheduler is an owned resource: [`start`](RebroadcastScheduler::start) spawns the task,
//! [`stop`](RebroadcastScheduler::stop) or dropping the scheduler ends it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::Transaction;
use log::{debug, info, warn};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::Wallet;
use crate::blockchain::NodeApi;
use crate::database::BatchDatabase;
use crate::error::Error;

/// Source of the transactions to rebroadcast
#[async_trait]
pub trait UnconfirmedSource: Send + Sync {
    /// Transactions sent by the wallet that are not in a block yet
    async fn unconfirmed_transactions(&self) -> Result<Vec<Transaction>, Error>;
}

#[async_trait]
impl<D> UnconfirmedSource for Wallet<D>
where
    D: BatchDatabase + Send + 'static,
{
    async fn unconfirmed_transactions(&self) -> Result<Vec<Transaction>, Error> {
        self.list_pending_transactions().await
    }
}

/// Handle to the rebroadcast task
pub struct RebroadcastScheduler {
    source: Arc<dyn UnconfirmedSource>,
    node: Arc<dyn NodeApi>,
    interval: Duration,
    task_handle: Option<JoinHandle<()>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl std::fmt::Debug for RebroadcastScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebroadcastScheduler")
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish()
    }
}

impl RebroadcastScheduler {
    /// Create a stopped scheduler
    pub fn new(
        source: Arc<dyn UnconfirmedSource>,
        node: Arc<dyn NodeApi>,
        interval: Duration,
    ) -> Self {
        RebroadcastScheduler {
            source,
            node,
            interval,
            task_handle: None,
            shutdown: None,
        }
    }

    /// Spawn the task on the current tokio runtime, the first run happens one interval from now
    ///
    /// Returns `false`, without doing anything, if the task is already running.
    pub fn start(&mut self) -> bool {
        if self.is_running() {
            debug!("Rebroadcast task already running");
            return false;
        }

        let (shutdown, mut shutdown_rx) = oneshot::channel();
        let source = Arc::clone(&self.source);
        let node = Arc::clone(&self.node);
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticks.tick() => {
                        rebroadcast(source.as_ref(), node.as_ref()).await;
                    }
                }
            }

            debug!("Rebroadcast task stopped");
        });

        info!("Started rebroadcast task, every {:?}", period);
        self.task_handle = Some(handle);
        self.shutdown = Some(shutdown);

        true
    }

    /// Signal the task to stop and wait for it, letting a running broadcast round finish
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }

    /// Whether the task is running
    pub fn is_running(&self) -> bool {
        self.task_handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Run a single rebroadcast round right away, outside the schedule
    pub async fn rebroadcast_now(&self) {
        rebroadcast(self.source.as_ref(), self.node.as_ref()).await
    }
}

impl Drop for RebroadcastScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

async fn rebroadcast(source: &dyn UnconfirmedSource, node: &dyn NodeApi) {
    let txs = match source.unconfirmed_transactions().await {
        Ok(txs) => txs,
        Err(e) => {
            warn!("Can't list the pending transactions: {}", e);
            return;
        }
    };
    debug!("Rebroadcasting {} pending transactions", txs.len());

    for tx in &txs {
        if let Err(e) = node.broadcast_transaction(tx).await {
            warn!("Rebroadcast of {} failed: {}", tx.compute_txid(), e);
        }
    }
}
