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

//! Fee bumping
//!
//! A pending transaction can be accelerated in two ways:
//!
//! * [`ReplaceByFee`](FeeBumpStrategy::ReplaceByFee): the transaction is re-signed with the same
//!   inputs and a higher fee, taken from its change output.
//! * [`ChildPaysForParent`](FeeBumpStrategy::ChildPaysForParent): a new transaction spends one
//!   of its outputs back to the wallet, paying enough for the two of them to reach the rate.

use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, ScriptBuf, Transaction, TxOut, Txid, Witness};
use log::{debug, info};

use super::tx_builder::unsigned_input;
use super::utils::{self, IsDust};
use super::{utxo, Wallet};
use crate::database::{BatchDatabase, Database, DatabaseUtils};
use crate::error::Error;
use crate::types::*;

/// Fee bumping technique
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeBumpStrategy {
    /// Replace the transaction with one paying a higher fee (BIP125)
    ReplaceByFee,
    /// Spend one of the transaction's outputs with a high fee child
    ChildPaysForParent,
}

impl<D> Wallet<D>
where
    D: BatchDatabase + Send + 'static,
{
    /// Bump the fee of the pending transaction `txid` to `fee_rate`, then broadcast the
    /// replacement or the child
    pub async fn bump_fee(
        &self,
        txid: &Txid,
        fee_rate: FeeRate,
        strategy: FeeBumpStrategy,
    ) -> Result<Transaction, Error> {
        match strategy {
            FeeBumpStrategy::ReplaceByFee => self.bump_fee_rbf(txid, fee_rate).await,
            FeeBumpStrategy::ChildPaysForParent => self.bump_fee_cpfp(txid, fee_rate).await,
        }
    }

    /// Replace the pending transaction `txid` with one paying `fee_rate`
    ///
    /// The replacement spends the same inputs and keeps the same outputs, the fee difference is
    /// taken from the change output, or from the only output if there's no change. `fee_rate`
    /// must be strictly higher than the rate of the original transaction.
    pub async fn bump_fee_rbf(&self, txid: &Txid, fee_rate: FeeRate) -> Result<Transaction, Error> {
        if !fee_rate.is_valid() {
            return Err(Error::InvalidFeeRate(fee_rate));
        }

        let (mut tx, inputs, old_fee, change_index) = {
            let database = self.database.lock().await;
            let record = database.get_tx_or_err(txid)?;
            if !record.is_pending() {
                return Err(Error::TransactionNotPending(*txid));
            }
            if !record.transaction.input.iter().any(|txin| txin.sequence.is_rbf()) {
                return Err(Error::IrreplaceableTransaction(*txid));
            }
            // the fee is only known when every input is ours
            let old_fee = record.fee.ok_or(Error::IrreplaceableTransaction(*txid))?;
            let old_rate = FeeRate::from_wu(old_fee, record.transaction.weight().to_wu());
            if fee_rate <= old_rate {
                return Err(Error::FeeRateTooLow { required: old_rate });
            }

            let inputs = record
                .transaction
                .input
                .iter()
                .map(|txin| {
                    database
                        .get_utxo(&txin.previous_output)?
                        .filter(|u| u.spending_txid == Some(*txid))
                        .ok_or(Error::UnknownUtxo(txin.previous_output))
                })
                .collect::<Result<Vec<_>, Error>>()?;

            let mut change_index = None;
            for (index, txout) in record.transaction.output.iter().enumerate() {
                if let Some(address) = database.get_address_by_script(&txout.script_pubkey)? {
                    if address.chain == ChainType::Change {
                        change_index = Some(index);
                        break;
                    }
                }
            }
            if change_index.is_none() && record.transaction.output.len() == 1 {
                change_index = Some(0);
            }

            (record.transaction, inputs, old_fee, change_index)
        };

        for txin in tx.input.iter_mut() {
            txin.script_sig = ScriptBuf::new();
            txin.witness = Witness::new();
        }

        let purposes = inputs.iter().map(|u| u.account.purpose).collect::<Vec<_>>();
        let weight = utils::estimate_weight(&purposes, &tx.output);
        // BIP125: the replacement also pays for its own relay at the minimum rate
        let new_fee = fee_rate
            .fee_wu(weight)
            .max(old_fee + FeeRate::default_min_relay_fee().fee_wu(weight));
        let delta = new_fee - old_fee;

        let output = change_index
            .and_then(|i| tx.output.get_mut(i))
            .ok_or(Error::InsufficientFunds {
                needed: delta,
                available: 0,
            })?;
        let available = output.value.to_sat();
        let value = available
            .checked_sub(delta)
            .filter(|v| !v.is_dust())
            .ok_or(Error::InsufficientFunds {
                needed: delta,
                available,
            })?;
        output.value = Amount::from_sat(value);

        self.sign(&mut tx, &inputs)?;
        info!(
            "Replacing {} with {}, fee {} -> {} sat",
            txid,
            tx.compute_txid(),
            old_fee,
            new_fee
        );
        self.broadcast_transaction(&tx).await?;

        Ok(tx)
    }

    /// Spend the largest wallet output of the pending transaction `txid` back to the wallet,
    /// paying enough for the parent and the child together to reach `fee_rate`
    ///
    /// Change outputs are preferred over received ones, so that an outgoing payment is
    /// accelerated with the wallet's own change when it has any.
    pub async fn bump_fee_cpfp(
        &self,
        txid: &Txid,
        fee_rate: FeeRate,
    ) -> Result<Transaction, Error> {
        if !fee_rate.is_valid() {
            return Err(Error::InvalidFeeRate(fee_rate));
        }

        let (parent, parent_output) = {
            let database = self.database.lock().await;
            let record = database.get_tx_or_err(txid)?;
            if !record.is_pending() {
                return Err(Error::TransactionNotPending(*txid));
            }

            let mut best: Option<SpendingInfo> = None;
            for vout in 0..record.transaction.output.len() {
                let outpoint = bitcoin::OutPoint::new(*txid, vout as u32);
                if let Some(utxo) = database.get_utxo(&outpoint)? {
                    if utxo.state.is_spendable()
                        && best.as_ref().map_or(true, |b| child_rank(&utxo) > child_rank(b))
                    {
                        best = Some(utxo);
                    }
                }
            }

            (
                record,
                best.ok_or(Error::NoSpendableChildOutput(*txid))?,
            )
        };

        let change = self
            .next_address(&parent_output.account, ChainType::Change)
            .await?;
        let mut child = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![unsigned_input(parent_output.outpoint)],
            output: vec![TxOut {
                value: Amount::ZERO,
                script_pubkey: change.script_pubkey,
            }],
        };

        let child_weight = utils::estimate_weight(&[parent_output.account.purpose], &child.output);
        let child_vsize = (child_weight + 3) / 4;
        // an unknown parent fee is counted as zero
        let package_fee = fee_rate.fee_vb(parent.transaction.vsize() + child_vsize);
        let child_fee = package_fee
            .saturating_sub(parent.fee.unwrap_or(0))
            .max(FeeRate::default_min_relay_fee().fee_vb(child_vsize));

        let available = parent_output.amount().to_sat();
        let value = available
            .checked_sub(child_fee)
            .filter(|v| !v.is_dust())
            .ok_or(Error::InsufficientFunds {
                needed: child_fee,
                available,
            })?;
        child.output[0].value = Amount::from_sat(value);
        debug!(
            "CPFP child of {}: vsize {}, fee {} sat",
            txid, child_vsize, child_fee
        );

        let outpoints = [parent_output.outpoint];
        let inputs = utxo::reserve(&mut *self.database.lock().await, &outpoints)?;
        if let Err(e) = self.sign(&mut child, &inputs) {
            utxo::unreserve(&mut *self.database.lock().await, &outpoints)?;
            return Err(e);
        }

        info!(
            "Bumping {} with child {}",
            txid,
            child.compute_txid()
        );
        if let Err(e) = self.broadcast_transaction(&child).await {
            utxo::unreserve(&mut *self.database.lock().await, &outpoints)?;
            return Err(e);
        }

        Ok(child)
    }
}

// Change first, then the largest amount
fn child_rank(utxo: &SpendingInfo) -> (bool, Amount) {
    (utxo.chain == ChainType::Change, utxo.amount())
}
