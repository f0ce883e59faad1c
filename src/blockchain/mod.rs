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

//! Blockchain backends
//!
//! This module defines the traits the wallet uses to talk to the outside world: a view of the
//! best chain ([`ChainQuery`]), a node that relays transactions ([`NodeApi`]) and a fee
//! estimator ([`FeeRateApi`]). The wallet never caches what these return, every call asks again.

use async_trait::async_trait;
use bitcoin::{BlockHash, Script, Transaction};

use crate::error::Error;
use crate::FeeRate;

/// Read-only view of the best chain
#[async_trait]
pub trait ChainQuery: Send + Sync {
    /// Height of the tip of the best chain
    async fn get_best_height(&self) -> Result<u32, Error>;

    /// Height of a block, `None` if the block is unknown
    async fn get_block_height(&self, hash: &BlockHash) -> Result<Option<u32>, Error>;

    /// Whether the block is part of the best chain
    async fn is_in_best_chain(&self, hash: &BlockHash) -> Result<bool, Error>;

    /// Whether any transaction in the chain or in the mempool touches `script`
    async fn has_history(&self, script: &Script) -> Result<bool, Error>;

    /// Number of confirmations of a block: `1` for the tip, `0` if it's not in the best chain
    async fn get_confirmations(&self, hash: &BlockHash) -> Result<u32, Error> {
        if !self.is_in_best_chain(hash).await? {
            return Ok(0);
        }
        let height = match self.get_block_height(hash).await? {
            Some(height) => height,
            None => return Ok(0),
        };
        let tip = self.get_best_height().await?;

        Ok(tip.saturating_sub(height) + 1)
    }
}

/// A node that relays transactions to the network
#[async_trait]
pub trait NodeApi: Send + Sync {
    /// Broadcast a transaction
    async fn broadcast_transaction(&self, tx: &Transaction) -> Result<(), Error>;

    /// Broadcast a list of transactions, stopping at the first failure
    async fn broadcast_transactions(&self, txs: &[Transaction]) -> Result<(), Error> {
        for tx in txs {
            self.broadcast_transaction(tx).await?;
        }

        Ok(())
    }
}

/// Fee rate estimator
#[async_trait]
pub trait FeeRateApi: Send + Sync {
    /// Current fee rate estimation
    async fn get_fee_rate(&self) -> Result<FeeRate, Error>;
}

/// [`FeeRateApi`] that always returns the same rate
#[derive(Debug, Clone, Copy)]
pub struct StaticFeeRate(pub FeeRate);

#[async_trait]
impl FeeRateApi for StaticFeeRate {
    async fn get_fee_rate(&self) -> Result<FeeRate, Error> {
        Ok(self.0)
    }
}
