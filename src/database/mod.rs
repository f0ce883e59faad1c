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

//! Database types
//!
//! This module provides the implementation of some defaults database types, along with traits that
//! can be implemented externally to let the [`Wallet`](crate::wallet::Wallet) use customized databases.
//!
//! Every mutation the wallet performs on the ledger goes through a batch: the whole batch is
//! applied by [`BatchDatabase::commit_batch`] or, if it's dropped, not at all.

use bitcoin::{OutPoint, Script, Txid};

use crate::error::Error;
use crate::types::*;

pub mod memory;
pub use memory::MemoryDatabase;

/// Trait for operations that can be batched
///
/// This trait defines the list of operations that must be implemented on the [`Database`] type and
/// the [`BatchDatabase::Batch`] type.
pub trait BatchOperations {
    /// Store an account
    fn set_account(&mut self, account: &AccountRecord) -> Result<(), Error>;
    /// Store an address, indexed both by path and by script
    fn set_address(&mut self, address: &AddressRecord) -> Result<(), Error>;
    /// Store a [`SpendingInfo`]
    fn set_utxo(&mut self, utxo: &SpendingInfo) -> Result<(), Error>;
    /// Store a [`TransactionRecord`]
    fn set_tx(&mut self, transaction: &TransactionRecord) -> Result<(), Error>;
    /// Store the last derivation index for a given account and chain
    fn set_last_index(
        &mut self,
        account: &HdAccount,
        chain: ChainType,
        value: u32,
    ) -> Result<(), Error>;
    /// Attach a tag to a script
    fn set_address_tag(&mut self, script: &Script, tag: &AddressTag) -> Result<(), Error>;

    /// Delete a [`SpendingInfo`] given its [`OutPoint`]
    fn del_utxo(&mut self, outpoint: &OutPoint) -> Result<Option<SpendingInfo>, Error>;
    /// Delete a [`TransactionRecord`] given its [`Txid`]
    fn del_tx(&mut self, txid: &Txid) -> Result<Option<TransactionRecord>, Error>;
    /// Delete the tag named `name` from a script
    fn del_address_tag(&mut self, script: &Script, name: &str)
        -> Result<Option<AddressTag>, Error>;
}

/// Trait for reading data from a database
///
/// This traits defines the operations that can be used to read data out of a database
pub trait Database: BatchOperations {
    /// Read an account
    fn get_account(&self, account: &HdAccount) -> Result<Option<AccountRecord>, Error>;
    /// Read the address at a given path
    fn get_address(
        &self,
        account: &HdAccount,
        chain: ChainType,
        index: u32,
    ) -> Result<Option<AddressRecord>, Error>;
    /// Read the address paying to `script`
    fn get_address_by_script(&self, script: &Script) -> Result<Option<AddressRecord>, Error>;
    /// Read a [`SpendingInfo`] given its [`OutPoint`]
    fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<SpendingInfo>, Error>;
    /// Read a [`TransactionRecord`] given its [`Txid`]
    fn get_tx(&self, txid: &Txid) -> Result<Option<TransactionRecord>, Error>;
    /// Return the last derivation index for a given account and chain
    fn get_last_index(&self, account: &HdAccount, chain: ChainType) -> Result<Option<u32>, Error>;

    /// Return the list of accounts
    fn iter_accounts(&self) -> Result<Vec<AccountRecord>, Error>;
    /// Return the addresses of `account`, or of every account, ordered by path
    fn iter_addresses(&self, account: Option<&HdAccount>) -> Result<Vec<AddressRecord>, Error>;
    /// Return the whole ledger
    fn iter_utxos(&self) -> Result<Vec<SpendingInfo>, Error>;
    /// Return the list of transactions
    fn iter_txs(&self) -> Result<Vec<TransactionRecord>, Error>;
    /// Return the tags attached to a script
    fn iter_address_tags(&self, script: &Script) -> Result<Vec<AddressTag>, Error>;

    /// Increment the ledger insertion counter and return its new value, starting from `0`
    fn increment_utxo_id(&mut self) -> Result<u64, Error>;
}

/// Trait for a database that supports batch operations
///
/// This trait defines the methods to start and apply a batch of operations.
pub trait BatchDatabase: Database {
    /// Container for the operations
    type Batch: BatchOperations;

    /// Create a new batch container
    fn begin_batch(&self) -> Self::Batch;
    /// Consume and apply a batch of operations
    fn commit_batch(&mut self, batch: Self::Batch) -> Result<(), Error>;
}

/// Helpers built on top of [`Database`]
pub trait DatabaseUtils: Database {
    /// Whether `script` pays one of the wallet's addresses
    fn is_mine(&self, script: &Script) -> Result<bool, Error> {
        self.get_address_by_script(script).map(|o| o.is_some())
    }

    /// Read an account or fail with [`Error::InvalidAccount`]
    fn get_account_or_err(&self, account: &HdAccount) -> Result<AccountRecord, Error> {
        self.get_account(account)?
            .ok_or(Error::InvalidAccount(*account))
    }

    /// Read a transaction or fail with [`Error::TransactionNotFound`]
    fn get_tx_or_err(&self, txid: &Txid) -> Result<TransactionRecord, Error> {
        self.get_tx(txid)?.ok_or(Error::TransactionNotFound(*txid))
    }
}

impl<T: Database> DatabaseUtils for T {}

#[cfg(test)]
pub mod test {
    use std::str::FromStr;

    use bitcoin::absolute::LockTime;
    use bitcoin::bip32::Xpriv;
    use bitcoin::secp256k1::Secp256k1;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, Network, ScriptBuf, Transaction, TxOut};

    use super::*;

    fn account() -> HdAccount {
        HdAccount::new(HdPurpose::Segwit, 1, 0)
    }

    fn address(index: u32) -> AddressRecord {
        let secp = Secp256k1::new();
        let xpriv = Xpriv::new_master(Network::Regtest, &[index as u8; 32]).unwrap();
        let public_key = bitcoin::PublicKey::new(xpriv.private_key.public_key(&secp));
        let compressed = bitcoin::CompressedPublicKey(public_key.inner);

        AddressRecord {
            account: account(),
            chain: ChainType::External,
            index,
            public_key,
            script_pubkey: ScriptBuf::new_p2wpkh(&compressed.wpubkey_hash()),
            used: false,
            beyond_gap: false,
        }
    }

    fn utxo(vout: u32, value: u64) -> SpendingInfo {
        SpendingInfo {
            id: vout as u64,
            outpoint: OutPoint::from_str(
                "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456:0",
            )
            .map(|o| OutPoint { vout, ..o })
            .unwrap(),
            txout: TxOut {
                value: Amount::from_sat(value),
                script_pubkey: address(0).script_pubkey,
            },
            account: account(),
            chain: ChainType::External,
            index: 0,
            state: TxoState::Unconfirmed,
            block_hash: None,
            height: None,
            spending_txid: None,
            spending_block: None,
        }
    }

    pub fn test_account<D: Database>(mut tree: D) {
        let secp = Secp256k1::new();
        let xpriv = Xpriv::new_master(Network::Regtest, &[42; 32]).unwrap();
        let record = AccountRecord {
            account: account(),
            xpub: bitcoin::bip32::Xpub::from_priv(&secp, &xpriv),
        };

        assert_eq!(tree.get_account(&account()).unwrap(), None);
        tree.set_account(&record).unwrap();
        assert_eq!(tree.get_account(&account()).unwrap(), Some(record.clone()));
        assert_eq!(tree.iter_accounts().unwrap(), vec![record]);
    }

    pub fn test_address<D: Database>(mut tree: D) {
        let address = address(42);
        tree.set_address(&address).unwrap();

        assert_eq!(
            tree.get_address(&account(), ChainType::External, 42)
                .unwrap(),
            Some(address.clone())
        );
        assert_eq!(
            tree.get_address_by_script(&address.script_pubkey).unwrap(),
            Some(address.clone())
        );
        assert!(tree.is_mine(&address.script_pubkey).unwrap());
        assert_eq!(
            tree.get_address(&account(), ChainType::Change, 42).unwrap(),
            None
        );
    }

    pub fn test_iter_addresses_ordered<D: Database>(mut tree: D) {
        for index in [3, 1, 2, 0] {
            tree.set_address(&address(index)).unwrap();
        }

        let indexes = tree
            .iter_addresses(Some(&account()))
            .unwrap()
            .into_iter()
            .map(|a| a.index)
            .collect::<Vec<_>>();
        assert_eq!(indexes, vec![0, 1, 2, 3]);

        let other = HdAccount::new(HdPurpose::Segwit, 1, 1);
        assert!(tree.iter_addresses(Some(&other)).unwrap().is_empty());
        assert_eq!(tree.iter_addresses(None).unwrap().len(), 4);
    }

    pub fn test_batch_address<D: BatchDatabase>(mut tree: D) {
        let address = address(7);

        let mut batch = tree.begin_batch();
        batch.set_address(&address).unwrap();
        batch
            .set_last_index(&account(), ChainType::External, 7)
            .unwrap();

        assert_eq!(
            tree.get_address_by_script(&address.script_pubkey).unwrap(),
            None
        );
        assert_eq!(
            tree.get_last_index(&account(), ChainType::External)
                .unwrap(),
            None
        );

        tree.commit_batch(batch).unwrap();

        assert_eq!(
            tree.get_address_by_script(&address.script_pubkey).unwrap(),
            Some(address)
        );
        assert_eq!(
            tree.get_last_index(&account(), ChainType::External)
                .unwrap(),
            Some(7)
        );
    }

    pub fn test_utxo<D: BatchDatabase>(mut tree: D) {
        let first = utxo(0, 133_742);
        let second = utxo(1, 50_000);
        tree.set_utxo(&first).unwrap();
        tree.set_utxo(&second).unwrap();

        assert_eq!(tree.get_utxo(&first.outpoint).unwrap(), Some(first.clone()));
        assert_eq!(tree.iter_utxos().unwrap().len(), 2);

        let mut batch = tree.begin_batch();
        batch.del_utxo(&first.outpoint).unwrap();
        tree.commit_batch(batch).unwrap();

        assert_eq!(tree.get_utxo(&first.outpoint).unwrap(), None);
        assert_eq!(tree.iter_utxos().unwrap(), vec![second]);
    }

    pub fn test_tx<D: Database>(mut tree: D) {
        let transaction = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![TxOut {
                value: Amount::from_sat(1_337),
                script_pubkey: address(0).script_pubkey,
            }],
        };
        let record = TransactionRecord {
            txid: transaction.compute_txid(),
            transaction,
            block_hash: None,
            direction: TxDirection::Incoming,
            received: 1_337,
            sent: 0,
            fee: None,
            timestamp: 123_456,
            replaced_by: None,
        };

        tree.set_tx(&record).unwrap();
        assert_eq!(tree.get_tx(&record.txid).unwrap(), Some(record.clone()));
        assert_eq!(tree.iter_txs().unwrap().len(), 1);

        assert_eq!(tree.del_tx(&record.txid).unwrap(), Some(record.clone()));
        assert_eq!(tree.get_tx(&record.txid).unwrap(), None);
    }

    pub fn test_address_tags<D: Database>(mut tree: D) {
        let script = address(0).script_pubkey;
        let cold = AddressTag::new("cold", AddressTagType::StorageLocation);
        let label = AddressTag::new("rent", AddressTagType::Label);

        tree.set_address_tag(&script, &cold).unwrap();
        tree.set_address_tag(&script, &label).unwrap();
        assert_eq!(tree.iter_address_tags(&script).unwrap().len(), 2);

        assert_eq!(
            tree.del_address_tag(&script, "cold").unwrap(),
            Some(cold)
        );
        assert_eq!(tree.iter_address_tags(&script).unwrap(), vec![label]);
    }

    pub fn test_last_index<D: Database>(mut tree: D) {
        tree.set_last_index(&account(), ChainType::External, 1337)
            .unwrap();

        assert_eq!(
            tree.get_last_index(&account(), ChainType::External)
                .unwrap(),
            Some(1337)
        );
        assert_eq!(
            tree.get_last_index(&account(), ChainType::Change).unwrap(),
            None
        );
    }

    pub fn test_utxo_id<D: Database>(mut tree: D) {
        assert_eq!(tree.increment_utxo_id().unwrap(), 0);
        assert_eq!(tree.increment_utxo_id().unwrap(), 1);
        assert_eq!(tree.increment_utxo_id().unwrap(), 2);
    }
}
