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

//! UTXO ledger
//!
//! Every output the wallet can spend is tracked as a [`SpendingInfo`] whose [`TxoState`] moves
//! along this graph:
//!
//! ```text
//! DoesNotExist -> Unconfirmed -> Confirmed(h) -> PendingConfirmationsSpent -> ConfirmedSpent
//!                 Unconfirmed | Confirmed(h) <-> Reserved
//!                 Unconfirmed | Reserved -> PendingConfirmationsSpent
//! ```
//!
//! A reorg moves `Confirmed(h)` back to `Unconfirmed`. The functions in this module operate on a
//! database the caller has already locked, and write everything through a single batch.

use std::collections::BTreeMap;
use std::mem;

use bitcoin::{BlockHash, OutPoint, Script, ScriptBuf, Txid};
use log::{debug, info};

use crate::database::{BatchDatabase, BatchOperations, Database};
use crate::error::Error;
use crate::types::{AddressRecord, SpendingInfo, TransactionRecord, TxoState};

impl SpendingInfo {
    /// Record the block including the funding transaction
    pub(crate) fn confirm(&mut self, block_hash: BlockHash, height: u32) {
        self.block_hash = Some(block_hash);
        self.height = Some(height);
        if matches!(self.state, TxoState::Unconfirmed | TxoState::Confirmed { .. }) {
            self.state = TxoState::Confirmed { height };
        }
    }

    /// Forget the block including the funding transaction, after a reorg
    pub(crate) fn unconfirm(&mut self) {
        self.block_hash = None;
        self.height = None;
        if let TxoState::Confirmed { .. } = self.state {
            self.state = TxoState::Unconfirmed;
        }
    }

    /// Record a transaction spending this output
    pub(crate) fn spend(&mut self, txid: Txid, block_hash: Option<BlockHash>) {
        if self.spending_txid == Some(txid) {
            if self.state == TxoState::ConfirmedSpent {
                return;
            }
            // a mempool re-announcement doesn't forget the block
            if block_hash.is_some() {
                self.spending_block = block_hash;
            }
        } else {
            self.spending_txid = Some(txid);
            self.spending_block = block_hash;
        }
        self.state = TxoState::PendingConfirmationsSpent;
    }

    /// Undo [`spend`](Self::spend), used when the spending transaction is replaced
    pub(crate) fn release(&mut self) {
        self.spending_txid = None;
        self.spending_block = None;
        self.state = self.unreserved_state();
    }
}

/// Changes to the ledger accumulated in memory and applied with a single batch
///
/// Reads go through the pending changes first, so that a multi-step update sees its own writes.
#[derive(Debug, Default)]
pub(crate) struct LedgerUpdate {
    utxos: BTreeMap<OutPoint, Option<SpendingInfo>>,
    txs: BTreeMap<Txid, TransactionRecord>,
    addresses: BTreeMap<ScriptBuf, AddressRecord>,
}

impl LedgerUpdate {
    pub(crate) fn get_utxo<D: Database>(
        &self,
        database: &D,
        outpoint: &OutPoint,
    ) -> Result<Option<SpendingInfo>, Error> {
        match self.utxos.get(outpoint) {
            Some(utxo) => Ok(utxo.clone()),
            None => database.get_utxo(outpoint),
        }
    }

    pub(crate) fn set_utxo(&mut self, utxo: SpendingInfo) {
        self.utxos.insert(utxo.outpoint, Some(utxo));
    }

    pub(crate) fn del_utxo(&mut self, outpoint: OutPoint) {
        self.utxos.insert(outpoint, None);
    }

    pub(crate) fn get_tx<D: Database>(
        &self,
        database: &D,
        txid: &Txid,
    ) -> Result<Option<TransactionRecord>, Error> {
        match self.txs.get(txid) {
            Some(tx) => Ok(Some(tx.clone())),
            None => database.get_tx(txid),
        }
    }

    pub(crate) fn set_tx(&mut self, tx: TransactionRecord) {
        self.txs.insert(tx.txid, tx);
    }

    pub(crate) fn get_address<D: Database>(
        &self,
        database: &D,
        script: &Script,
    ) -> Result<Option<AddressRecord>, Error> {
        match self.addresses.get(script) {
            Some(address) => Ok(Some(address.clone())),
            None => database.get_address_by_script(script),
        }
    }

    pub(crate) fn set_address(&mut self, address: AddressRecord) {
        self.addresses
            .insert(address.script_pubkey.clone(), address);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.utxos.is_empty() && self.txs.is_empty() && self.addresses.is_empty()
    }

    /// Write every change in one batch
    pub(crate) fn commit<D: BatchDatabase>(self, database: &mut D) -> Result<(), Error> {
        if self.is_empty() {
            return Ok(());
        }

        let mut batch = database.begin_batch();
        for (outpoint, utxo) in &self.utxos {
            match utxo {
                Some(utxo) => batch.set_utxo(utxo)?,
                None => {
                    batch.del_utxo(outpoint)?;
                }
            }
        }
        for tx in self.txs.values() {
            batch.set_tx(tx)?;
        }
        for address in self.addresses.values() {
            batch.set_address(address)?;
        }

        database.commit_batch(batch)
    }
}

/// Mark `outpoints` as reserved, all of them or none
pub(crate) fn reserve<D: BatchDatabase>(
    database: &mut D,
    outpoints: &[OutPoint],
) -> Result<Vec<SpendingInfo>, Error> {
    let mut update = LedgerUpdate::default();
    let mut already_reserved = Vec::new();
    let mut reserved = Vec::with_capacity(outpoints.len());

    for outpoint in outpoints {
        let mut utxo = update
            .get_utxo(database, outpoint)?
            .ok_or(Error::UnknownUtxo(*outpoint))?;
        match utxo.state {
            TxoState::Reserved => already_reserved.push(*outpoint),
            state if state.is_spendable() => {
                utxo.state = TxoState::Reserved;
                update.set_utxo(utxo.clone());
                reserved.push(utxo);
            }
            _ => return Err(Error::UnspendableUtxo(*outpoint)),
        }
    }

    if !already_reserved.is_empty() {
        return Err(Error::AlreadyReserved(already_reserved));
    }

    update.commit(database)?;
    info!("Reserved {} utxos", reserved.len());

    Ok(reserved)
}

/// Release the reservation of `outpoints`, restoring their prior state
///
/// Outputs that are not reserved are left untouched.
pub(crate) fn unreserve<D: BatchDatabase>(
    database: &mut D,
    outpoints: &[OutPoint],
) -> Result<Vec<SpendingInfo>, Error> {
    let mut update = LedgerUpdate::default();
    let mut released = Vec::with_capacity(outpoints.len());

    for outpoint in outpoints {
        let mut utxo = update
            .get_utxo(database, outpoint)?
            .ok_or(Error::UnknownUtxo(*outpoint))?;
        if utxo.state == TxoState::Reserved {
            utxo.state = utxo.unreserved_state();
            update.set_utxo(utxo.clone());
            released.push(utxo);
        }
    }

    update.commit(database)?;
    info!("Unreserved {} utxos", released.len());

    Ok(released)
}

/// Every output in `state`, the height of [`TxoState::Confirmed`] is not compared
pub(crate) fn utxos_by_state<D: Database>(
    database: &D,
    state: TxoState,
) -> Result<Vec<SpendingInfo>, Error> {
    Ok(database
        .iter_utxos()?
        .into_iter()
        .filter(|u| mem::discriminant(&u.state) == mem::discriminant(&state))
        .collect())
}

/// Every output paying a script tagged `name`
pub(crate) fn utxos_by_tag<D: Database>(
    database: &D,
    name: &str,
) -> Result<Vec<SpendingInfo>, Error> {
    let mut tagged = BTreeMap::new();
    let mut result = Vec::new();
    for utxo in database.iter_utxos()? {
        let script = utxo.txout.script_pubkey.clone();
        let is_tagged = match tagged.get(&script) {
            Some(is_tagged) => *is_tagged,
            None => {
                let is_tagged = database
                    .iter_address_tags(&script)?
                    .iter()
                    .any(|t| t.name == name);
                tagged.insert(script, is_tagged);
                is_tagged
            }
        };
        if is_tagged {
            result.push(utxo);
        }
    }

    Ok(result)
}

/// The outputs at `outpoints`, failing on the first one the ledger doesn't know
pub(crate) fn utxos_for_outpoints<D: Database>(
    database: &D,
    outpoints: &[OutPoint],
) -> Result<Vec<SpendingInfo>, Error> {
    outpoints
        .iter()
        .map(|o| database.get_utxo(o)?.ok_or(Error::UnknownUtxo(*o)))
        .collect()
}

/// Drop every output and transaction, so that a rescan can rebuild them
pub(crate) fn clear_all<D: BatchDatabase>(database: &mut D) -> Result<(), Error> {
    let mut batch = database.begin_batch();
    for utxo in database.iter_utxos()? {
        batch.del_utxo(&utxo.outpoint)?;
    }
    for tx in database.iter_txs()? {
        batch.del_tx(&tx.txid)?;
    }
    database.commit_batch(batch)?;
    debug!("Cleared the ledger");

    Ok(())
}
