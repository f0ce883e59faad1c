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

//! Address derivation
//!
//! Every operation that allocates a derivation index goes through a single worker task that owns
//! the receiving end of a bounded channel. Requests are served one at a time, in the order they
//! were queued, so two concurrent callers can never be handed the same index.
//!
//! A request that doesn't fit in the queue fails right away with [`Error::QueueFull`], one that
//! doesn't get an answer within the configured deadline fails with [`Error::Timeout`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::bip32::ChildNumber;
use bitcoin::{CompressedPublicKey, PublicKey};
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::blockchain::ChainQuery;
use crate::config::WalletConfig;
use crate::database::{BatchDatabase, BatchOperations, Database, DatabaseUtils};
use crate::error::Error;
use crate::types::{AccountRecord, AddressRecord, ChainType, HdAccount};

use super::utils::{script_for, SecpCtx};

/// Derive the address at `index` on `chain` from the account's extended public key
pub(crate) fn derive_address(
    secp: &SecpCtx,
    account: &AccountRecord,
    chain: ChainType,
    index: u32,
) -> Result<AddressRecord, Error> {
    let path = [
        ChildNumber::from_normal_idx(chain.index())?,
        ChildNumber::from_normal_idx(index)?,
    ];
    let child = account.xpub.derive_pub(secp, &path)?;
    let public_key = CompressedPublicKey(child.public_key);

    Ok(AddressRecord {
        account: account.account,
        chain,
        index,
        public_key: PublicKey::new(child.public_key),
        script_pubkey: script_for(account.account.purpose, &public_key),
        used: false,
        beyond_gap: false,
    })
}

#[derive(Debug)]
enum AddressRequest {
    /// Issue the next index
    Next {
        account: HdAccount,
        chain: ChainType,
        reply: oneshot::Sender<Result<AddressRecord, Error>>,
    },
    /// Issue every index up to `index` included
    Extend {
        account: HdAccount,
        chain: ChainType,
        index: u32,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    /// Scan the chain for used addresses
    Discover {
        account: HdAccount,
        chain: ChainType,
        reply: oneshot::Sender<Result<Option<u32>, Error>>,
    },
}

/// Handle to the address worker
///
/// Cloning the handle is cheap, the worker stops once every handle is dropped.
#[derive(Debug, Clone)]
pub(crate) struct AddressHandler {
    sender: mpsc::Sender<AddressRequest>,
    timeout: Duration,
}

impl AddressHandler {
    /// Spawn the worker on the current tokio runtime
    pub(crate) fn spawn<D>(
        database: Arc<Mutex<D>>,
        chain: Arc<dyn ChainQuery>,
        config: &WalletConfig,
    ) -> Self
    where
        D: BatchDatabase + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(config.address_queue_size);
        let worker = AddressWorker {
            database,
            chain,
            secp: SecpCtx::new(),
            gap_limit: config.gap_limit,
            batch_size: config.discovery_batch_size,
        };
        tokio::spawn(worker.run(receiver));

        AddressHandler {
            sender,
            timeout: config.address_request_timeout(),
        }
    }

    /// Issue the next address of `chain`
    pub(crate) async fn next_address(
        &self,
        account: HdAccount,
        chain: ChainType,
    ) -> Result<AddressRecord, Error> {
        self.request(
            |reply| AddressRequest::Next {
                account,
                chain,
                reply,
            },
            true,
        )
        .await
    }

    /// Make sure every index up to `index` is issued
    pub(crate) async fn extend_to(
        &self,
        account: HdAccount,
        chain: ChainType,
        index: u32,
    ) -> Result<(), Error> {
        self.request(
            |reply| AddressRequest::Extend {
                account,
                chain,
                index,
                reply,
            },
            true,
        )
        .await
    }

    /// Run the gap limit discovery on `chain`, returning the last index with a history
    pub(crate) async fn discover(
        &self,
        account: HdAccount,
        chain: ChainType,
    ) -> Result<Option<u32>, Error> {
        // discovery talks to the chain for every derived script, no deadline here
        self.request(
            |reply| AddressRequest::Discover {
                account,
                chain,
                reply,
            },
            false,
        )
        .await
    }

    async fn request<T, F>(&self, make_request: F, deadline: bool) -> Result<T, Error>
    where
        F: FnOnce(oneshot::Sender<Result<T, Error>>) -> AddressRequest,
    {
        let (reply, response) = oneshot::channel();
        self.sender
            .try_send(make_request(reply))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => Error::QueueFull,
                mpsc::error::TrySendError::Closed(_) => {
                    Error::Generic("address worker stopped".into())
                }
            })?;

        let response = if deadline {
            tokio::time::timeout(self.timeout, response)
                .await
                .map_err(|_| Error::Timeout)?
        } else {
            response.await
        };

        response.map_err(|_| Error::Generic("address worker dropped the request".into()))?
    }
}

struct AddressWorker<D> {
    database: Arc<Mutex<D>>,
    chain: Arc<dyn ChainQuery>,
    secp: SecpCtx,
    gap_limit: u32,
    batch_size: u32,
}

impl<D: BatchDatabase + Send + 'static> AddressWorker<D> {
    async fn run(self, mut receiver: mpsc::Receiver<AddressRequest>) {
        while let Some(request) = receiver.recv().await {
            // a requester that timed out dropped its receiver, the index stays allocated
            match request {
                AddressRequest::Next {
                    account,
                    chain,
                    reply,
                } => {
                    let mut database = self.database.lock().await;
                    let _ = reply.send(self.issue_next(&mut *database, &account, chain));
                }
                AddressRequest::Extend {
                    account,
                    chain,
                    index,
                    reply,
                } => {
                    let mut database = self.database.lock().await;
                    let _ = reply.send(self.extend_to(&mut *database, &account, chain, index));
                }
                AddressRequest::Discover {
                    account,
                    chain,
                    reply,
                } => {
                    let _ = reply.send(self.discover(&account, chain).await);
                }
            }
        }

        debug!("Address worker stopped");
    }

    fn issue_next(
        &self,
        database: &mut D,
        account: &HdAccount,
        chain: ChainType,
    ) -> Result<AddressRecord, Error> {
        let record = database.get_account_or_err(account)?;
        let index = match database.get_last_index(account, chain)? {
            Some(last) => last + 1,
            None => 0,
        };

        let trailing_unused = database
            .iter_addresses(Some(account))?
            .into_iter()
            .filter(|a| a.chain == chain)
            .rev()
            .take_while(|a| !a.used)
            .count();

        let mut address = derive_address(&self.secp, &record, chain, index)?;
        if trailing_unused >= self.gap_limit as usize {
            warn!(
                "Issuing {}/{}/{} past the gap limit of {}, a rescan will be needed if it's used",
                account,
                chain.index(),
                index,
                self.gap_limit
            );
            address.beyond_gap = true;
        }

        let mut batch = database.begin_batch();
        batch.set_address(&address)?;
        batch.set_last_index(account, chain, index)?;
        database.commit_batch(batch)?;

        debug!("Issued address {}/{}/{}", account, chain.index(), index);

        Ok(address)
    }

    fn extend_to(
        &self,
        database: &mut D,
        account: &HdAccount,
        chain: ChainType,
        index: u32,
    ) -> Result<(), Error> {
        while database
            .get_last_index(account, chain)?
            .map_or(true, |last| last < index)
        {
            self.issue_next(database, account, chain)?;
        }

        Ok(())
    }

    async fn discover(&self, account: &HdAccount, chain: ChainType) -> Result<Option<u32>, Error> {
        let record = self.database.lock().await.get_account_or_err(account)?;

        let mut found = BTreeSet::new();
        let mut start = 0u32;
        loop {
            let end = start + self.batch_size;
            for index in start..end {
                let address = derive_address(&self.secp, &record, chain, index)?;
                if self.chain.has_history(&address.script_pubkey).await? {
                    found.insert(index);
                }
            }

            let first_unused = found.iter().next_back().map_or(0, |last| last + 1);
            if end - first_unused >= self.gap_limit {
                break;
            }
            start = end;
        }

        let last_found = match found.iter().next_back() {
            Some(last) => *last,
            None => {
                debug!("No history for {}/{}", account, chain.index());
                return Ok(None);
            }
        };

        let mut database = self.database.lock().await;
        let mut batch = database.begin_batch();
        for index in 0..=last_found {
            let used = found.contains(&index);
            let address = match database.get_address(account, chain, index)? {
                Some(address) if address.used || !used => continue,
                Some(address) => AddressRecord { used, ..address },
                None => AddressRecord {
                    used,
                    ..derive_address(&self.secp, &record, chain, index)?
                },
            };
            batch.set_address(&address)?;
        }
        let last_index = database
            .get_last_index(account, chain)?
            .map_or(last_found, |current| current.max(last_found));
        batch.set_last_index(account, chain, last_index)?;
        database.commit_batch(batch)?;

        info!(
            "Discovered {} used addresses on {}/{}, last at index {}",
            found.len(),
            account,
            chain.index(),
            last_found
        );

        Ok(Some(last_found))
    }
}
