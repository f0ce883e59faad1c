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

//! Wallet
//!
//! This module defines the [`Wallet`] structure.
//!
//! The wallet keeps its state in a [`BatchDatabase`] shared between the caller-facing methods,
//! the address worker and the rebroadcast task. Every mutation of the ledger takes the database
//! lock once, accumulates its changes and commits them in a single batch, so that a failure never
//! leaves a partial update behind.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use bitcoin::absolute::LockTime;
use bitcoin::script::PushBytesBuf;
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, Network, OutPoint, Script, ScriptBuf, Transaction, TxOut, Txid};
use tokio::sync::Mutex;

#[allow(unused_imports)]
use log::{debug, info, warn};

mod address;
pub mod coin_selection;
pub mod fee_bump;
mod processor;
pub mod rebroadcast;
pub mod signer;
pub mod time;
pub mod tx_builder;
pub mod utils;
mod utxo;

use address::{derive_address, AddressHandler};
use coin_selection::WeightedUtxo;
use processor::Lookahead;
use rebroadcast::RebroadcastScheduler;
use signer::{InputSigningInfo, KeyManager};
use tx_builder::{unsigned_input, FundedTransaction, TxBuilder};
use utils::{IsDust, SecpCtx};

use crate::blockchain::{ChainQuery, FeeRateApi, NodeApi};
use crate::config::WalletConfig;
use crate::database::{BatchDatabase, BatchOperations, Database, DatabaseUtils};
use crate::error::Error;
use crate::types::*;

/// Largest `OP_RETURN` payload relayed by default
pub const MAX_OP_RETURN_DATA: usize = 80;

/// A BIP44 hierarchical deterministic wallet
///
/// The wallet tracks the addresses and the outputs of its accounts, builds and signs
/// transactions through a [`KeyManager`] and follows the chain through the events fed to
/// [`process_transaction`](Wallet::process_transaction) and
/// [`process_block`](Wallet::process_block).
///
/// Every method takes `&self`: wrap the wallet in an [`Arc`] to share it between tasks.
pub struct Wallet<D> {
    config: WalletConfig,
    database: Arc<Mutex<D>>,
    keys: Arc<dyn KeyManager>,
    chain: Arc<dyn ChainQuery>,
    node: Arc<dyn NodeApi>,
    fee_oracle: Arc<dyn FeeRateApi>,
    addresses: AddressHandler,
    lookahead: Mutex<Lookahead>,
    secp: SecpCtx,
}

impl<D> Wallet<D>
where
    D: BatchDatabase + Send + 'static,
{
    /// Create a new wallet, spawning its address worker on the current tokio runtime
    ///
    /// Account `0` of the configured default purpose is created if the database doesn't have it
    /// yet.
    pub async fn new(
        config: WalletConfig,
        mut database: D,
        keys: Arc<dyn KeyManager>,
        chain: Arc<dyn ChainQuery>,
        node: Arc<dyn NodeApi>,
        fee_oracle: Arc<dyn FeeRateApi>,
    ) -> Result<Self, Error> {
        config.validate()?;

        let account = HdAccount::new(config.default_purpose, coin_type_for(config.network), 0);
        if database.get_account(&account)?.is_none() {
            let xpub = keys.derive_xpub(&account.path()?)?;
            let mut batch = database.begin_batch();
            batch.set_account(&AccountRecord { account, xpub })?;
            database.commit_batch(batch)?;
            info!("Created default account {}", account);
        }

        let database = Arc::new(Mutex::new(database));
        let addresses = AddressHandler::spawn(Arc::clone(&database), Arc::clone(&chain), &config);

        Ok(Wallet {
            config,
            database,
            keys,
            chain,
            node,
            fee_oracle,
            addresses,
            lookahead: Mutex::new(Lookahead::default()),
            secp: SecpCtx::new(),
        })
    }

    /// Network the wallet lives on
    pub fn network(&self) -> Network {
        self.config.network
    }

    /// The wallet configuration
    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    /// Account `0` of the configured default purpose
    pub fn default_account(&self) -> HdAccount {
        HdAccount::new(
            self.config.default_purpose,
            coin_type_for(self.config.network),
            0,
        )
    }

    /// Create the next account of `purpose`
    ///
    /// Following BIP44, a new account can only be created once the most recent account of the
    /// same purpose has received a transaction.
    pub async fn create_account(&self, purpose: HdPurpose) -> Result<HdAccount, Error> {
        let mut database = self.database.lock().await;
        let coin_type = coin_type_for(self.config.network);

        let latest = database
            .iter_accounts()?
            .into_iter()
            .map(|r| r.account)
            .filter(|a| a.purpose == purpose && a.coin_type == coin_type)
            .max_by_key(|a| a.index);
        let index = match latest {
            None => 0,
            Some(latest) => {
                let has_history = database
                    .iter_addresses(Some(&latest))?
                    .iter()
                    .any(|a| a.used);
                if !has_history {
                    return Err(Error::AccountHistoryRequired(latest));
                }
                latest.index + 1
            }
        };

        let account = HdAccount::new(purpose, coin_type, index);
        let xpub = self.keys.derive_xpub(&account.path()?)?;
        let mut batch = database.begin_batch();
        batch.set_account(&AccountRecord { account, xpub })?;
        database.commit_batch(batch)?;

        info!("Created account {}", account);

        Ok(account)
    }

    /// Return the list of accounts
    pub async fn list_accounts(&self) -> Result<Vec<AccountRecord>, Error> {
        self.database.lock().await.iter_accounts()
    }

    /// Issue the next address of `chain`
    ///
    /// Concurrent callers are served in order and never get the same index.
    pub async fn next_address(
        &self,
        account: &HdAccount,
        chain: ChainType,
    ) -> Result<AddressRecord, Error> {
        self.addresses.next_address(*account, chain).await
    }

    /// Issue a new receiving address of the default account
    pub async fn get_new_address(&self) -> Result<Address, Error> {
        self.next_address(&self.default_account(), ChainType::External)
            .await?
            .address(self.network())
    }

    /// Issue a new change address of the default account
    pub async fn get_new_change_address(&self) -> Result<Address, Error> {
        self.next_address(&self.default_account(), ChainType::Change)
            .await?
            .address(self.network())
    }

    /// Compute the address at `index` without issuing it
    pub async fn peek_address(
        &self,
        account: &HdAccount,
        chain: ChainType,
        index: u32,
    ) -> Result<AddressRecord, Error> {
        let database = self.database.lock().await;
        if let Some(address) = database.get_address(account, chain, index)? {
            return Ok(address);
        }

        let record = database.get_account_or_err(account)?;
        derive_address(&self.secp, &record, chain, index)
    }

    /// Mark the address paid by `script` as used
    pub async fn mark_used(&self, script: &Script) -> Result<(), Error> {
        let mut database = self.database.lock().await;
        let address = database
            .get_address_by_script(script)?
            .ok_or_else(|| Error::UnknownScript(script.to_owned()))?;
        if !address.used {
            let mut batch = database.begin_batch();
            batch.set_address(&AddressRecord {
                used: true,
                ..address
            })?;
            database.commit_batch(batch)?;
        }

        Ok(())
    }

    /// Scan the chain for the used addresses of `account`, on both chains, issuing every index
    /// up to the last one with a history
    pub async fn discover_addresses(&self, account: &HdAccount) -> Result<(), Error> {
        for chain in [ChainType::External, ChainType::Change] {
            self.addresses.discover(*account, chain).await?;
        }

        Ok(())
    }

    /// Return the lowest issued receiving address that was never used, or a new one
    pub async fn get_unused_address(&self, account: &HdAccount) -> Result<AddressRecord, Error> {
        let unused = self
            .database
            .lock()
            .await
            .iter_addresses(Some(account))?
            .into_iter()
            .find(|a| a.chain == ChainType::External && !a.used);

        match unused {
            Some(address) => Ok(address),
            None => self.next_address(account, ChainType::External).await,
        }
    }

    /// Return the issued addresses of `account`, or of every account
    pub async fn list_addresses(
        &self,
        account: Option<&HdAccount>,
    ) -> Result<Vec<AddressRecord>, Error> {
        self.database.lock().await.iter_addresses(account)
    }

    /// Return the issued addresses that never received a transaction
    pub async fn list_unused_addresses(
        &self,
        account: Option<&HdAccount>,
    ) -> Result<Vec<AddressRecord>, Error> {
        Ok(self
            .list_addresses(account)
            .await?
            .into_iter()
            .filter(|a| !a.used)
            .collect())
    }

    /// Return the addresses holding unspent outputs, with their balance
    pub async fn list_funded_addresses(
        &self,
        account: Option<&HdAccount>,
    ) -> Result<Vec<(AddressRecord, Amount)>, Error> {
        let database = self.database.lock().await;
        let mut funds = BTreeMap::<ScriptBuf, Amount>::new();
        for utxo in database.iter_utxos()? {
            if !utxo.state.is_spent() {
                *funds.entry(utxo.txout.script_pubkey.clone()).or_default() += utxo.amount();
            }
        }

        Ok(database
            .iter_addresses(account)?
            .into_iter()
            .filter_map(|a| funds.get(&a.script_pubkey).map(|amount| (a.clone(), *amount)))
            .collect())
    }

    /// Return the used addresses whose every output has been spent
    pub async fn list_spent_addresses(
        &self,
        account: Option<&HdAccount>,
    ) -> Result<Vec<AddressRecord>, Error> {
        let database = self.database.lock().await;
        let mut fully_spent = BTreeMap::<ScriptBuf, bool>::new();
        for utxo in database.iter_utxos()? {
            *fully_spent
                .entry(utxo.txout.script_pubkey.clone())
                .or_insert(true) &= utxo.state.is_spent();
        }

        Ok(database
            .iter_addresses(account)?
            .into_iter()
            .filter(|a| fully_spent.get(&a.script_pubkey) == Some(&true))
            .collect())
    }

    /// Return the address paid by `script`, if it belongs to the wallet
    pub async fn get_address_info(&self, script: &Script) -> Result<Option<AddressRecord>, Error> {
        self.database.lock().await.get_address_by_script(script)
    }

    /// Return whether `script` pays one of the wallet's addresses
    pub async fn is_mine(&self, script: &Script) -> Result<bool, Error> {
        self.database.lock().await.is_mine(script)
    }

    /// Return whether `output` pays one of the wallet's change addresses
    pub async fn is_change(&self, output: &TxOut) -> Result<bool, Error> {
        Ok(self
            .get_address_info(&output.script_pubkey)
            .await?
            .map_or(false, |a| a.chain == ChainType::Change))
    }

    /// Return whether an address issued past the gap limit received a transaction, in which case
    /// [`discover_addresses`](Self::discover_addresses) should be run again
    pub async fn is_rescan_needed(&self) -> Result<bool, Error> {
        Ok(self
            .list_addresses(None)
            .await?
            .iter()
            .any(|a| a.beyond_gap && a.used))
    }

    /// Attach `tag` to the address paid by `script`, replacing a tag with the same name
    pub async fn tag_address(&self, script: &Script, tag: AddressTag) -> Result<(), Error> {
        let mut database = self.database.lock().await;
        if !database.is_mine(script)? {
            return Err(Error::UnknownScript(script.to_owned()));
        }

        let mut batch = database.begin_batch();
        batch.set_address_tag(script, &tag)?;
        database.commit_batch(batch)?;
        debug!("Tagged {} with {:?}", script, tag);

        Ok(())
    }

    /// Attach `tag` to the address paid by the output at `outpoint`
    pub async fn tag_utxo(&self, outpoint: &OutPoint, tag: AddressTag) -> Result<(), Error> {
        let script = self
            .database
            .lock()
            .await
            .get_utxo(outpoint)?
            .ok_or(Error::UnknownUtxo(*outpoint))?
            .txout
            .script_pubkey;

        self.tag_address(&script, tag).await
    }

    /// Remove the tag named `name` from `script`, returning it if it existed
    pub async fn drop_address_tag(
        &self,
        script: &Script,
        name: &str,
    ) -> Result<Option<AddressTag>, Error> {
        self.database.lock().await.del_address_tag(script, name)
    }

    /// Return the tags attached to `script`
    pub async fn get_address_tags(&self, script: &Script) -> Result<Vec<AddressTag>, Error> {
        self.database.lock().await.iter_address_tags(script)
    }

    /// Balance of the outputs paying addresses tagged `name`
    pub async fn balance_by_tag(&self, name: &str) -> Result<Balance, Error> {
        let database = self.database.lock().await;
        let mut balance = Balance::default();
        for utxo in utxo::utxos_by_tag(&*database, name)? {
            balance.add(&utxo);
        }

        Ok(balance)
    }

    /// Balance of `account`, or of the whole wallet, computed from the ledger
    pub async fn get_balance(&self, account: Option<&HdAccount>) -> Result<Balance, Error> {
        let mut balance = Balance::default();
        for utxo in self.database.lock().await.iter_utxos()? {
            if account.map_or(true, |a| *a == utxo.account) {
                balance.add(&utxo);
            }
        }

        Ok(balance)
    }

    /// Sum of the confirmed outputs of the whole wallet
    pub async fn get_confirmed_balance(&self) -> Result<Amount, Error> {
        Ok(self.get_balance(None).await?.confirmed)
    }

    /// Sum of the unconfirmed outputs of the whole wallet
    pub async fn get_unconfirmed_balance(&self) -> Result<Amount, Error> {
        Ok(self.get_balance(None).await?.unconfirmed)
    }

    /// Return the whole ledger, spent outputs included
    pub async fn list_utxos(&self) -> Result<Vec<SpendingInfo>, Error> {
        self.database.lock().await.iter_utxos()
    }

    /// Return the outputs that haven't been spent yet, reserved ones included
    pub async fn list_unspent(&self) -> Result<Vec<SpendingInfo>, Error> {
        Ok(self
            .list_utxos()
            .await?
            .into_iter()
            .filter(|u| !u.state.is_spent())
            .collect())
    }

    /// Return the outputs in `state`; the height of [`TxoState::Confirmed`] is not compared
    pub async fn utxos_by_state(&self, state: TxoState) -> Result<Vec<SpendingInfo>, Error> {
        utxo::utxos_by_state(&*self.database.lock().await, state)
    }

    /// Return the outputs paying an address tagged `name`
    pub async fn utxos_by_tag(&self, name: &str) -> Result<Vec<SpendingInfo>, Error> {
        utxo::utxos_by_tag(&*self.database.lock().await, name)
    }

    /// Return the outputs at `outpoints`
    pub async fn utxos_for_outpoints(
        &self,
        outpoints: &[OutPoint],
    ) -> Result<Vec<SpendingInfo>, Error> {
        utxo::utxos_for_outpoints(&*self.database.lock().await, outpoints)
    }

    /// Reserve the outputs at `outpoints`, all of them or none
    ///
    /// Fails with [`Error::AlreadyReserved`] if any of them is already reserved.
    pub async fn mark_utxos_as_reserved(
        &self,
        outpoints: &[OutPoint],
    ) -> Result<Vec<SpendingInfo>, Error> {
        utxo::reserve(&mut *self.database.lock().await, outpoints)
    }

    /// Release the outputs at `outpoints`, restoring the state they had before the reservation
    pub async fn unmark_utxos_as_reserved(
        &self,
        outpoints: &[OutPoint],
    ) -> Result<Vec<SpendingInfo>, Error> {
        utxo::unreserve(&mut *self.database.lock().await, outpoints)
    }

    /// Drop every output and transaction record, before a rescan
    pub async fn clear_all_utxos(&self) -> Result<(), Error> {
        utxo::clear_all(&mut *self.database.lock().await)
    }

    /// Return the list of transactions
    pub async fn list_transactions(&self) -> Result<Vec<TransactionRecord>, Error> {
        self.database.lock().await.iter_txs()
    }

    /// Return a transaction given its [`Txid`]
    pub async fn find_transaction(&self, txid: &Txid) -> Result<Option<TransactionRecord>, Error> {
        self.database.lock().await.get_tx(txid)
    }

    /// Return the transactions sent by the wallet that are still waiting for a block
    pub async fn list_pending_transactions(&self) -> Result<Vec<Transaction>, Error> {
        Ok(self
            .list_transactions()
            .await?
            .into_iter()
            .filter(|t| t.is_pending() && t.direction == TxDirection::Outgoing)
            .map(|t| t.transaction)
            .collect())
    }

    /// Record `tx` in the ledger, then hand it to the node
    ///
    /// A broadcast failure is only logged: the transaction stays pending and the rebroadcast
    /// task will try again.
    pub async fn broadcast_transaction(&self, tx: &Transaction) -> Result<(), Error> {
        self.process_transaction(tx, None).await?;

        match self.node.broadcast_transaction(tx).await {
            Ok(()) => info!("Broadcast transaction {}", tx.compute_txid()),
            Err(e) => warn!(
                "Failed to broadcast transaction {}: {}",
                tx.compute_txid(),
                e
            ),
        }

        Ok(())
    }

    /// Create a scheduler that rebroadcasts the pending transactions every
    /// [`rebroadcast_interval`](WalletConfig::rebroadcast_interval)
    pub fn rebroadcast_scheduler(self: &Arc<Self>) -> RebroadcastScheduler {
        RebroadcastScheduler::new(
            Arc::clone(self) as Arc<dyn rebroadcast::UnconfirmedSource>,
            Arc::clone(&self.node),
            self.config.rebroadcast_interval(),
        )
    }

    /// Fund and sign a transaction following `builder`
    ///
    /// The steps are: fee rate resolution, coin selection (or validation of the outputs given
    /// with [`TxBuilder::utxos`]), change synthesis, ordering, reservation and signing. Nothing is
    /// persisted if any of them fails, except for the change address that stays issued.
    pub async fn fund_transaction(&self, builder: TxBuilder) -> Result<FundedTransaction, Error> {
        if builder.recipients.is_empty() && builder.data.is_none() {
            return Err(Error::NoRecipients);
        }
        if builder.drain_wallet && builder.recipients.len() != 1 {
            return Err(Error::Generic(
                "Draining the wallet requires exactly one recipient".into(),
            ));
        }

        let fee_rate = self.resolve_fee_rate(builder.fee_rate).await?;
        let account = builder.account.unwrap_or_else(|| self.default_account());

        let mut outputs = Vec::with_capacity(builder.recipients.len() + 2);
        for (index, (script_pubkey, amount)) in builder.recipients.iter().enumerate() {
            if !builder.drain_wallet && amount.is_dust() {
                return Err(Error::OutputBelowDustLimit(index));
            }
            outputs.push(TxOut {
                value: Amount::from_sat(*amount),
                script_pubkey: script_pubkey.clone(),
            });
        }
        if let Some(data) = &builder.data {
            outputs.push(op_return_output(data)?);
        }
        let amount_needed = match builder.drain_wallet {
            true => 0,
            false => builder.recipients.iter().map(|(_, amount)| amount).sum(),
        };

        let (must_use, may_use) = {
            let database = self.database.lock().await;
            database.get_account_or_err(&account)?;
            match &builder.utxos {
                Some(outpoints) => (manual_utxos(&*database, outpoints)?, vec![]),
                None => {
                    let may_use = database
                        .iter_utxos()?
                        .into_iter()
                        .filter(|u| {
                            u.account == account
                                && u.state.is_spendable()
                                && !builder.unspendable.contains(&u.outpoint)
                        })
                        .map(weighted)
                        .collect::<Vec<_>>();
                    (vec![], may_use)
                }
            }
        };

        let base_weight = utils::base_weight(&outputs);
        let change_weight = utils::output_weight_for(account.purpose);

        let (selected, fee, change_value) = if builder.drain_wallet {
            let all = must_use.into_iter().chain(may_use).collect::<Vec<_>>();
            let available = all.iter().map(|w| w.utxo.txout.value.to_sat()).sum::<u64>();
            let weight = base_weight
                + utils::varint_weight(all.len())
                + all.iter().map(|w| w.weight).sum::<usize>();
            let fee = fee_rate.fee_wu(weight);
            let value = available
                .checked_sub(fee)
                .ok_or(Error::InsufficientFunds {
                    needed: fee,
                    available,
                })?;
            if value.is_dust() {
                return Err(Error::OutputBelowDustLimit(0));
            }
            outputs[0].value = Amount::from_sat(value);

            (all.into_iter().map(|w| w.utxo).collect::<Vec<_>>(), fee, None)
        } else {
            let result = builder.coin_selection.coin_select(
                must_use,
                may_use,
                fee_rate,
                amount_needed,
                base_weight,
                change_weight,
            )?;
            let excess = result.excess(amount_needed);
            let change_fee = fee_rate.fee_wu(change_weight);
            match excess.checked_sub(change_fee) {
                Some(change) if !change.is_dust() => (
                    result.selected,
                    result.fee_amount + change_fee,
                    Some(change),
                ),
                _ => {
                    let fee = result.selected_amount - amount_needed;
                    (result.selected, fee, None)
                }
            }
        };

        let change_script = match change_value {
            Some(value) => {
                let change = self.next_address(&account, ChainType::Change).await?;
                outputs.push(TxOut {
                    value: Amount::from_sat(value),
                    script_pubkey: change.script_pubkey.clone(),
                });
                Some(change.script_pubkey)
            }
            None => None,
        };

        let mut transaction = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: selected.iter().map(|u| unsigned_input(u.outpoint)).collect(),
            output: outputs,
        };
        builder.ordering.sort_tx(&mut transaction);

        let mut by_outpoint = selected
            .into_iter()
            .map(|u| (u.outpoint, u))
            .collect::<BTreeMap<_, _>>();
        let mut inputs = transaction
            .input
            .iter()
            .filter_map(|txin| by_outpoint.remove(&txin.previous_output))
            .collect::<Vec<_>>();
        let outpoints = inputs.iter().map(|u| u.outpoint).collect::<Vec<_>>();
        let change_index = change_script
            .and_then(|s| transaction.output.iter().position(|o| o.script_pubkey == s));

        if builder.mark_as_reserved {
            inputs = utxo::reserve(&mut *self.database.lock().await, &outpoints)?;
        }

        if let Err(e) = self.sign(&mut transaction, &inputs) {
            if builder.mark_as_reserved {
                utxo::unreserve(&mut *self.database.lock().await, &outpoints)?;
            }
            return Err(e);
        }

        debug!(
            "Funded transaction {} spending {} inputs, fee {} sat",
            transaction.compute_txid(),
            inputs.len(),
            fee
        );

        Ok(FundedTransaction {
            transaction,
            inputs,
            fee,
            fee_rate,
            change_index,
        })
    }

    /// Send `amount` to `address`, then broadcast
    pub async fn send_to_address(
        &self,
        address: &Address,
        amount: Amount,
        fee_rate: Option<FeeRate>,
    ) -> Result<Transaction, Error> {
        self.send_to_addresses(&[(address.clone(), amount)], fee_rate)
            .await
    }

    /// Send to several addresses with a single transaction, then broadcast
    pub async fn send_to_addresses(
        &self,
        recipients: &[(Address, Amount)],
        fee_rate: Option<FeeRate>,
    ) -> Result<Transaction, Error> {
        let builder = TxBuilder::with_recipients(
            recipients
                .iter()
                .map(|(address, amount)| (address.script_pubkey(), amount.to_sat()))
                .collect(),
        );

        self.send(with_fee_rate(builder, fee_rate)).await
    }

    /// Send `amount` to `address` spending exactly `outpoints`, then broadcast
    pub async fn send_from_outpoints(
        &self,
        outpoints: Vec<OutPoint>,
        address: &Address,
        amount: Amount,
        fee_rate: Option<FeeRate>,
    ) -> Result<Transaction, Error> {
        let builder = TxBuilder::with_recipients(vec![(address.script_pubkey(), amount.to_sat())])
            .utxos(outpoints);

        self.send(with_fee_rate(builder, fee_rate)).await
    }

    /// Send every spendable output of the default account to `address`, without change
    pub async fn sweep_wallet(
        &self,
        address: &Address,
        fee_rate: Option<FeeRate>,
    ) -> Result<Transaction, Error> {
        let builder =
            TxBuilder::with_recipients(vec![(address.script_pubkey(), 0)]).drain_wallet();

        self.send(with_fee_rate(builder, fee_rate)).await
    }

    /// Commit to `data` with a zero-valued `OP_RETURN` output, then broadcast
    pub async fn make_op_return_commitment(
        &self,
        data: &[u8],
        fee_rate: Option<FeeRate>,
        account: Option<HdAccount>,
    ) -> Result<Transaction, Error> {
        let mut builder = TxBuilder::new().add_data(data.to_vec());
        if let Some(account) = account {
            builder = builder.account(account);
        }

        self.send(with_fee_rate(builder, fee_rate)).await
    }

    async fn send(&self, builder: TxBuilder) -> Result<Transaction, Error> {
        let funded = self.fund_transaction(builder).await?;
        if let Err(e) = self.broadcast_transaction(&funded.transaction).await {
            let outpoints = funded.inputs.iter().map(|u| u.outpoint).collect::<Vec<_>>();
            utxo::unreserve(&mut *self.database.lock().await, &outpoints)?;
            return Err(e);
        }

        Ok(funded.transaction)
    }

    pub(crate) async fn resolve_fee_rate(
        &self,
        fee_rate: Option<FeeRate>,
    ) -> Result<FeeRate, Error> {
        let fee_rate = match fee_rate {
            Some(fee_rate) => fee_rate,
            None => match self.fee_oracle.get_fee_rate().await {
                Ok(fee_rate) => fee_rate,
                Err(e) => match self.config.fee_rate_fallback {
                    Some(fallback) => {
                        warn!("Fee oracle failed ({}), using the fallback {}", e, fallback);
                        fallback
                    }
                    None => return Err(e),
                },
            },
        };

        if !fee_rate.is_valid() {
            return Err(Error::InvalidFeeRate(fee_rate));
        }

        Ok(fee_rate)
    }

    pub(crate) fn sign(
        &self,
        transaction: &mut Transaction,
        inputs: &[SpendingInfo],
    ) -> Result<(), Error> {
        let signing_info = inputs
            .iter()
            .map(|u| {
                Ok(InputSigningInfo {
                    txout: u.txout.clone(),
                    purpose: u.account.purpose,
                    path: u.account.address_path(u.chain, u.index)?,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(self.keys.sign_transaction(transaction, &signing_info)?)
    }
}

fn with_fee_rate(builder: TxBuilder, fee_rate: Option<FeeRate>) -> TxBuilder {
    match fee_rate {
        Some(fee_rate) => builder.fee_rate(fee_rate),
        None => builder,
    }
}

fn weighted(utxo: SpendingInfo) -> WeightedUtxo {
    WeightedUtxo {
        weight: utils::txin_weight(utxo.account.purpose),
        utxo,
    }
}

fn manual_utxos<D: Database>(
    database: &D,
    outpoints: &[OutPoint],
) -> Result<Vec<WeightedUtxo>, Error> {
    let mut seen = HashSet::new();
    let mut already_reserved = Vec::new();
    let mut utxos = Vec::new();

    for outpoint in outpoints.iter().filter(|o| seen.insert(**o)) {
        let utxo = database
            .get_utxo(outpoint)?
            .ok_or(Error::UnknownUtxo(*outpoint))?;
        match utxo.state {
            TxoState::Reserved => already_reserved.push(*outpoint),
            state if state.is_spendable() => utxos.push(weighted(utxo)),
            _ => return Err(Error::UnspendableUtxo(*outpoint)),
        }
    }

    if !already_reserved.is_empty() {
        return Err(Error::AlreadyReserved(already_reserved));
    }

    Ok(utxos)
}

fn op_return_output(data: &[u8]) -> Result<TxOut, Error> {
    if data.len() > MAX_OP_RETURN_DATA {
        return Err(Error::DataTooLarge(data.len()));
    }
    let data =
        PushBytesBuf::try_from(data.to_vec()).map_err(|_| Error::DataTooLarge(data.len()))?;

    Ok(TxOut {
        value: Amount::ZERO,
        script_pubkey: ScriptBuf::new_op_return(data),
    })
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_op_return_output() {
        let output = op_return_output(b"commitment").unwrap();
        assert!(output.script_pubkey.is_op_return());
        assert_eq!(output.value, Amount::ZERO);

        assert_matches!(
            op_return_output(&[0; MAX_OP_RETURN_DATA + 1]),
            Err(Error::DataTooLarge(81))
        );
        assert!(op_return_output(&[0; MAX_OP_RETURN_DATA]).is_ok());
    }
}
