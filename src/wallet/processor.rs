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

//! Transaction and block ingestion
//!
//! Transactions and blocks coming from the network are matched against the wallet's addresses,
//! including a lookahead of `gap_limit` addresses past the last issued index of every chain, and
//! drive the [`TxoState`] transitions of the ledger.
//!
//! The chain facts (block heights, best chain membership, confirmations) are asked to the
//! [`ChainQuery`](crate::blockchain::ChainQuery) on every call and never cached.

use std::collections::{BTreeMap, HashMap};
use std::mem;

use bitcoin::{Block, BlockHash, OutPoint, Script, ScriptBuf, Transaction, Txid};
use log::{debug, error, info, warn};

use super::address::derive_address;
use super::time;
use super::utils::SecpCtx;
use super::utxo::LedgerUpdate;
use super::Wallet;
use crate::database::{BatchDatabase, Database};
use crate::error::Error;
use crate::types::*;

impl<D> Wallet<D>
where
    D: BatchDatabase + Send + 'static,
{
    /// Apply a transaction to the ledger, returning whether it's relevant to the wallet
    ///
    /// `block_hash` is the block including the transaction, `None` for a mempool transaction.
    /// Processing the same transaction twice leaves the ledger as processing it once.
    ///
    /// When the transaction spends an output already spent by another wallet transaction, the
    /// other one is marked as replaced and the outputs it created are dropped from the ledger,
    /// together with every wallet transaction descending from them. A mempool transaction
    /// conflicting with a spend that is already in a block is ignored.
    pub async fn process_transaction(
        &self,
        tx: &Transaction,
        block_hash: Option<BlockHash>,
    ) -> Result<bool, Error> {
        let block = match block_hash {
            Some(hash) => Some((
                hash,
                self.chain
                    .get_block_height(&hash)
                    .await?
                    .ok_or(Error::UnknownBlock(hash))?,
            )),
            None => None,
        };

        self.issue_lookahead_matches(tx).await?;

        let txid = tx.compute_txid();
        let mut database = self.database.lock().await;
        let mut update = LedgerUpdate::default();

        let existing = database.get_tx(&txid)?;
        if let Some(existing) = &existing {
            if existing.replaced_by.is_some() && block.is_none() {
                debug!("Ignoring {}, already replaced", txid);
                return Ok(true);
            }
        }

        let mut spent_values = Vec::new();
        for txin in &tx.input {
            let outpoint = txin.previous_output;
            let utxo = match update.get_utxo(&*database, &outpoint)? {
                Some(utxo) => utxo,
                None => continue,
            };

            if let Some(other) = utxo.spending_txid.filter(|other| *other != txid) {
                if block.is_none() && utxo.spending_block.is_some() {
                    warn!(
                        "Ignoring {}: it spends {}, already spent by {} in a block",
                        txid, outpoint, other
                    );
                    return Ok(true);
                }
                if utxo.state == TxoState::ConfirmedSpent {
                    error!(
                        "{} spends {}, already spent by {} with enough confirmations",
                        txid, outpoint, other
                    );
                    return Err(Error::ReorgInconsistency(format!(
                        "{} is a double spend of {}",
                        txid, outpoint
                    )));
                }
                replace_transaction(&*database, &mut update, other, txid)?;
            }

            let mut utxo = update
                .get_utxo(&*database, &outpoint)?
                .ok_or(Error::UnknownUtxo(outpoint))?;
            spent_values.push(utxo.txout.value.to_sat());
            utxo.spend(txid, block_hash);
            update.set_utxo(utxo);
        }

        let mut received = 0;
        for (vout, txout) in tx.output.iter().enumerate() {
            let address = match update.get_address(&*database, &txout.script_pubkey)? {
                Some(address) => address,
                None => continue,
            };
            received += txout.value.to_sat();

            let outpoint = OutPoint::new(txid, vout as u32);
            let mut utxo = match update.get_utxo(&*database, &outpoint)? {
                Some(utxo) => utxo,
                None => SpendingInfo {
                    id: database.increment_utxo_id()?,
                    outpoint,
                    txout: txout.clone(),
                    account: address.account,
                    chain: address.chain,
                    index: address.index,
                    state: TxoState::Unconfirmed,
                    block_hash: None,
                    height: None,
                    spending_txid: None,
                    spending_block: None,
                },
            };
            if let Some((hash, height)) = block {
                utxo.confirm(hash, height);
            }
            update.set_utxo(utxo);

            if !address.used {
                update.set_address(AddressRecord {
                    used: true,
                    ..address
                });
            }
        }

        if spent_values.is_empty() && received == 0 && existing.is_none() {
            return Ok(false);
        }

        let sent = spent_values.iter().sum::<u64>();
        let fee = if spent_values.len() == tx.input.len() {
            let output_amount = tx.output.iter().map(|o| o.value.to_sat()).sum::<u64>();
            sent.checked_sub(output_amount)
        } else {
            None
        };
        let record = TransactionRecord {
            txid,
            transaction: tx.clone(),
            block_hash: block_hash.or(existing.as_ref().and_then(|e| e.block_hash)),
            direction: match spent_values.is_empty() {
                true => TxDirection::Incoming,
                false => TxDirection::Outgoing,
            },
            received,
            sent,
            fee,
            timestamp: existing
                .as_ref()
                .map_or_else(time::get_timestamp, |e| e.timestamp),
            replaced_by: match block {
                Some(_) => None,
                None => existing.as_ref().and_then(|e| e.replaced_by),
            },
        };
        let is_new = existing.is_none();
        update.set_tx(record);
        update.commit(&mut *database)?;

        if is_new {
            info!(
                "Processed {} transaction {}: received {} sat, sent {} sat",
                if spent_values.is_empty() { "incoming" } else { "outgoing" },
                txid,
                received,
                sent
            );
        } else {
            debug!("Updated transaction {}", txid);
        }

        Ok(true)
    }

    /// Apply every transaction of `block`, then refresh the pending states of the ledger
    pub async fn process_block(&self, block: &Block) -> Result<(), Error> {
        let hash = block.block_hash();
        debug!("Processing block {} with {} txs", hash, block.txdata.len());

        for tx in &block.txdata {
            self.process_transaction(tx, Some(hash)).await?;
        }

        self.update_utxo_pending_states().await
    }

    /// Check the ledger against the current best chain
    ///
    /// Outputs whose funding block left the best chain go back to [`TxoState::Unconfirmed`],
    /// spends whose block left the best chain lose it, and spends buried under
    /// `required_confirmations` blocks become [`TxoState::ConfirmedSpent`].
    ///
    /// A [`TxoState::ConfirmedSpent`] output affected by a reorg can't be repaired: the call fails
    /// with [`Error::ReorgInconsistency`] and nothing is written.
    pub async fn update_utxo_pending_states(&self) -> Result<(), Error> {
        let mut database = self.database.lock().await;
        let mut update = LedgerUpdate::default();
        let mut in_best_chain = BestChainView::default();

        for utxo in database.iter_utxos()? {
            let mut updated = utxo.clone();

            if let Some(hash) = utxo.block_hash {
                if !in_best_chain.contains(self, hash).await? {
                    if utxo.state == TxoState::ConfirmedSpent {
                        return Err(reorg_inconsistency(&utxo, "funding", hash));
                    }
                    info!("{} reverted to unconfirmed, block {} was reorged", utxo.outpoint, hash);
                    updated.unconfirm();
                }
            }

            if let Some(hash) = utxo.spending_block {
                if !in_best_chain.contains(self, hash).await? {
                    if utxo.state == TxoState::ConfirmedSpent {
                        return Err(reorg_inconsistency(&utxo, "spending", hash));
                    }
                    info!("Spend of {} is unconfirmed again", utxo.outpoint);
                    updated.spending_block = None;
                } else if utxo.state == TxoState::PendingConfirmationsSpent {
                    let confirmations = self.chain.get_confirmations(&hash).await?;
                    if confirmations >= self.config.required_confirmations {
                        info!(
                            "{} spent with {} confirmations",
                            utxo.outpoint, confirmations
                        );
                        updated.state = TxoState::ConfirmedSpent;
                    }
                }
            }

            if updated != utxo {
                update.set_utxo(updated);
            }
        }

        for tx in database.iter_txs()? {
            if let Some(hash) = tx.block_hash {
                if !in_best_chain.contains(self, hash).await? {
                    debug!("Transaction {} is unconfirmed again", tx.txid);
                    update.set_tx(TransactionRecord {
                        block_hash: None,
                        ..tx
                    });
                }
            }
        }

        update.commit(&mut *database)
    }

    // Issue every address a lookahead match of `tx` points at, so that the matching outputs are
    // found by the ledger update
    async fn issue_lookahead_matches(&self, tx: &Transaction) -> Result<(), Error> {
        let (unknown, windows) = {
            let database = self.database.lock().await;
            let mut unknown = Vec::new();
            for txout in &tx.output {
                if database.get_address_by_script(&txout.script_pubkey)?.is_none() {
                    unknown.push(txout.script_pubkey.clone());
                }
            }
            if unknown.is_empty() {
                return Ok(());
            }

            let mut windows = Vec::new();
            for record in database.iter_accounts()? {
                for chain in [ChainType::External, ChainType::Change] {
                    let first = database
                        .get_last_index(&record.account, chain)?
                        .map_or(0, |last| last + 1);
                    windows.push((record.clone(), chain, first));
                }
            }

            (unknown, windows)
        };

        let mut highest = BTreeMap::<(HdAccount, ChainType), u32>::new();
        {
            let mut lookahead = self.lookahead.lock().await;
            for (record, chain, first) in &windows {
                lookahead.refresh(&self.secp, record, *chain, *first, self.config.gap_limit)?;
            }
            for script in &unknown {
                if let Some((account, chain, index)) = lookahead.get(script) {
                    let entry = highest.entry((account, chain)).or_insert(index);
                    *entry = (*entry).max(index);
                }
            }
        }

        for ((account, chain), index) in highest {
            debug!(
                "Lookahead match on {}/{}/{}",
                account,
                chain.index(),
                index
            );
            self.addresses.extend_to(account, chain, index).await?;
        }

        Ok(())
    }
}

/// Scripts of the `gap_limit` addresses following the last issued index of every chain
///
/// A script is derived once and kept until its index is issued.
#[derive(Debug, Default)]
pub(crate) struct Lookahead {
    windows: BTreeMap<(HdAccount, ChainType), BTreeMap<u32, ScriptBuf>>,
    scripts: HashMap<ScriptBuf, (HdAccount, ChainType, u32)>,
}

impl Lookahead {
    // Move the window of `chain` to start at `first`, returning how many scripts were derived
    fn refresh(
        &mut self,
        secp: &SecpCtx,
        record: &AccountRecord,
        chain: ChainType,
        first: u32,
        gap_limit: u32,
    ) -> Result<usize, Error> {
        let window = self.windows.entry((record.account, chain)).or_default();
        let kept = window.split_off(&first);
        for script in mem::replace(window, kept).into_values() {
            self.scripts.remove(&script);
        }

        let mut derived = 0;
        for index in first..first.saturating_add(gap_limit) {
            if window.contains_key(&index) {
                continue;
            }
            let script = derive_address(secp, record, chain, index)?.script_pubkey;
            self.scripts
                .insert(script.clone(), (record.account, chain, index));
            window.insert(index, script);
            derived += 1;
        }
        if derived > 0 {
            debug!(
                "Derived {} lookahead scripts for {}/{}",
                derived,
                record.account,
                chain.index()
            );
        }

        Ok(derived)
    }

    fn get(&self, script: &Script) -> Option<(HdAccount, ChainType, u32)> {
        self.scripts.get(script).copied()
    }
}

// Mark `replaced` as replaced by `replacement`, drop the outputs it created and release the
// other outputs it spent, then do the same for its descendants
fn replace_transaction<D: Database>(
    database: &D,
    update: &mut LedgerUpdate,
    replaced: Txid,
    replacement: Txid,
) -> Result<(), Error> {
    let record = match update.get_tx(database, &replaced)? {
        Some(record) if record.replaced_by != Some(replacement) => record,
        _ => return Ok(()),
    };
    info!("Transaction {} replaced by {}", replaced, replacement);

    for txin in &record.transaction.input {
        if let Some(mut utxo) = update.get_utxo(database, &txin.previous_output)? {
            if utxo.spending_txid == Some(replaced) {
                utxo.release();
                update.set_utxo(utxo);
            }
        }
    }
    for vout in 0..record.transaction.output.len() {
        let outpoint = OutPoint::new(replaced, vout as u32);
        if let Some(utxo) = update.get_utxo(database, &outpoint)? {
            // a descendant spending the dropped output goes with it
            if let Some(child) = utxo.spending_txid {
                replace_transaction(database, update, child, replacement)?;
            }
            update.del_utxo(outpoint);
        }
    }

    update.set_tx(TransactionRecord {
        replaced_by: Some(replacement),
        ..record
    });

    Ok(())
}

fn reorg_inconsistency(utxo: &SpendingInfo, which: &str, hash: BlockHash) -> Error {
    error!(
        "The {} block {} of {} left the best chain after the spend was final",
        which, hash, utxo.outpoint
    );
    Error::ReorgInconsistency(format!(
        "{} block {} of {} is no longer in the best chain",
        which, hash, utxo.outpoint
    ))
}

// Best chain membership, asked once per block for the duration of a single update
#[derive(Default)]
struct BestChainView(HashMap<BlockHash, bool>);

impl BestChainView {
    async fn contains<D>(&mut self, wallet: &Wallet<D>, hash: BlockHash) -> Result<bool, Error> {
        if let Some(known) = self.0.get(&hash) {
            return Ok(*known);
        }
        let in_best_chain = wallet.chain.is_in_best_chain(&hash).await?;
        self.0.insert(hash, in_best_chain);

        Ok(in_best_chain)
    }
}
