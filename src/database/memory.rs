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

//! In-memory ephemeral database
//!
//! This module defines an in-memory database type called [`MemoryDatabase`] that is based on a
//! [`BTreeMap`].

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included};

use bitcoin::consensus::encode::serialize;
use bitcoin::{OutPoint, Script, Txid};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::database::{BatchDatabase, BatchOperations, Database};
use crate::error::Error;
use crate::types::*;

// account              a<account> -> account record
// path -> address      p<account><chain><index> -> address record
// script -> path       s<script> -> (account, chain, index)
// utxo                 u<outpoint> -> spending info
// transactions         t<txid> -> transaction record
// deriv indexes        c<account><chain> -> u32
// tags                 g<script><name> -> tag
// utxo counter         n -> u64

pub(crate) enum MapKey<'a> {
    Account(Option<&'a HdAccount>),
    Path((Option<&'a HdAccount>, Option<ChainType>, Option<u32>)),
    Script(Option<&'a Script>),
    Utxo(Option<&'a OutPoint>),
    Transaction(Option<&'a Txid>),
    LastIndex(&'a HdAccount, ChainType),
    Tag(&'a Script, Option<&'a str>),
    UtxoCounter,
}

impl MapKey<'_> {
    fn as_prefix(&self) -> Vec<u8> {
        match self {
            MapKey::Account(_) => b"a".to_vec(),
            MapKey::Path((account, chain, _)) => {
                let mut v = b"p".to_vec();
                if let Some(account) = account {
                    v.extend(account.as_key());
                    if let Some(chain) = chain {
                        v.push(chain.as_byte());
                    }
                }
                v
            }
            MapKey::Script(_) => b"s".to_vec(),
            MapKey::Utxo(_) => b"u".to_vec(),
            MapKey::Transaction(_) => b"t".to_vec(),
            MapKey::LastIndex(account, chain) => {
                [&b"c"[..], &account.as_key()[..], chain.as_ref()].concat()
            }
            MapKey::Tag(script, _) => {
                let script = script.as_bytes();
                // length prefix so that a script can't be a prefix of another one
                [
                    &b"g"[..],
                    &(script.len() as u32).to_be_bytes()[..],
                    script,
                ]
                .concat()
            }
            MapKey::UtxoCounter => b"n".to_vec(),
        }
    }

    fn serialize_content(&self) -> Vec<u8> {
        match self {
            MapKey::Account(Some(account)) => account.as_key(),
            MapKey::Path((_, _, Some(child))) => child.to_be_bytes().to_vec(),
            MapKey::Script(Some(s)) => s.as_bytes().to_vec(),
            MapKey::Utxo(Some(s)) => serialize(*s),
            MapKey::Transaction(Some(s)) => serialize(*s),
            MapKey::Tag(_, Some(name)) => name.as_bytes().to_vec(),
            _ => vec![],
        }
    }

    pub fn as_map_key(&self) -> Vec<u8> {
        let mut v = self.as_prefix();
        v.extend_from_slice(&self.serialize_content());

        v
    }
}

fn after(key: &[u8]) -> Vec<u8> {
    let mut key = key.to_owned();
    let mut idx = key.len();
    while idx > 0 {
        if key[idx - 1] == 0xFF {
            idx -= 1;
            continue;
        } else {
            key[idx - 1] += 1;
            break;
        }
    }

    key
}

/// In-memory ephemeral database
///
/// This database can be used as a temporary storage for wallets that are not kept permanently on
/// a device, or on platforms that don't provide a filesystem, like `wasm32`.
///
/// Once it's dropped its content will be lost.
///
/// If you are looking for a permanent storage solution, implement [`BatchDatabase`] on top of it.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    map: BTreeMap<Vec<u8>, serde_json::Value>,
    deleted_keys: Vec<Vec<u8>>,
}

impl MemoryDatabase {
    /// Create a new empty database
    pub fn new() -> Self {
        MemoryDatabase {
            map: BTreeMap::new(),
            deleted_keys: Vec::new(),
        }
    }

    fn insert<T: Serialize>(&mut self, key: Vec<u8>, value: &T) -> Result<(), Error> {
        self.map.insert(key, serde_json::to_value(value)?);
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>, Error> {
        self.map
            .get(key)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(Error::from)
    }

    fn remove<T: DeserializeOwned>(&mut self, key: Vec<u8>) -> Result<Option<T>, Error> {
        let res = self.map.remove(&key);
        self.deleted_keys.push(key);

        res.map(serde_json::from_value)
            .transpose()
            .map_err(Error::from)
    }

    fn range<T: DeserializeOwned>(&self, prefix: Vec<u8>) -> Result<Vec<T>, Error> {
        self.map
            .range::<Vec<u8>, _>((Included(&prefix), Excluded(&after(&prefix))))
            .map(|(_, v)| Ok(serde_json::from_value(v.clone())?))
            .collect()
    }
}

impl BatchOperations for MemoryDatabase {
    fn set_account(&mut self, account: &AccountRecord) -> Result<(), Error> {
        let key = MapKey::Account(Some(&account.account)).as_map_key();
        self.insert(key, account)
    }

    fn set_address(&mut self, address: &AddressRecord) -> Result<(), Error> {
        let key = MapKey::Path((
            Some(&address.account),
            Some(address.chain),
            Some(address.index),
        ))
        .as_map_key();
        self.insert(key, address)?;

        let key = MapKey::Script(Some(&address.script_pubkey)).as_map_key();
        self.insert(key, &(address.account, address.chain, address.index))
    }

    fn set_utxo(&mut self, utxo: &SpendingInfo) -> Result<(), Error> {
        let key = MapKey::Utxo(Some(&utxo.outpoint)).as_map_key();
        self.insert(key, utxo)
    }

    fn set_tx(&mut self, transaction: &TransactionRecord) -> Result<(), Error> {
        let key = MapKey::Transaction(Some(&transaction.txid)).as_map_key();
        self.insert(key, transaction)
    }

    fn set_last_index(
        &mut self,
        account: &HdAccount,
        chain: ChainType,
        value: u32,
    ) -> Result<(), Error> {
        let key = MapKey::LastIndex(account, chain).as_map_key();
        self.insert(key, &value)
    }

    fn set_address_tag(&mut self, script: &Script, tag: &AddressTag) -> Result<(), Error> {
        let key = MapKey::Tag(script, Some(&tag.name)).as_map_key();
        self.insert(key, tag)
    }

    fn del_utxo(&mut self, outpoint: &OutPoint) -> Result<Option<SpendingInfo>, Error> {
        let key = MapKey::Utxo(Some(outpoint)).as_map_key();
        self.remove(key)
    }

    fn del_tx(&mut self, txid: &Txid) -> Result<Option<TransactionRecord>, Error> {
        let key = MapKey::Transaction(Some(txid)).as_map_key();
        self.remove(key)
    }

    fn del_address_tag(
        &mut self,
        script: &Script,
        name: &str,
    ) -> Result<Option<AddressTag>, Error> {
        let key = MapKey::Tag(script, Some(name)).as_map_key();
        self.remove(key)
    }
}

impl Database for MemoryDatabase {
    fn get_account(&self, account: &HdAccount) -> Result<Option<AccountRecord>, Error> {
        self.get(&MapKey::Account(Some(account)).as_map_key())
    }

    fn get_address(
        &self,
        account: &HdAccount,
        chain: ChainType,
        index: u32,
    ) -> Result<Option<AddressRecord>, Error> {
        self.get(&MapKey::Path((Some(account), Some(chain), Some(index))).as_map_key())
    }

    fn get_address_by_script(&self, script: &Script) -> Result<Option<AddressRecord>, Error> {
        let path: Option<(HdAccount, ChainType, u32)> =
            self.get(&MapKey::Script(Some(script)).as_map_key())?;
        match path {
            Some((account, chain, index)) => self.get_address(&account, chain, index),
            None => Ok(None),
        }
    }

    fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<SpendingInfo>, Error> {
        self.get(&MapKey::Utxo(Some(outpoint)).as_map_key())
    }

    fn get_tx(&self, txid: &Txid) -> Result<Option<TransactionRecord>, Error> {
        self.get(&MapKey::Transaction(Some(txid)).as_map_key())
    }

    fn get_last_index(&self, account: &HdAccount, chain: ChainType) -> Result<Option<u32>, Error> {
        self.get(&MapKey::LastIndex(account, chain).as_map_key())
    }

    fn iter_accounts(&self) -> Result<Vec<AccountRecord>, Error> {
        self.range(MapKey::Account(None).as_map_key())
    }

    fn iter_addresses(&self, account: Option<&HdAccount>) -> Result<Vec<AddressRecord>, Error> {
        self.range(MapKey::Path((account, None, None)).as_map_key())
    }

    fn iter_utxos(&self) -> Result<Vec<SpendingInfo>, Error> {
        self.range(MapKey::Utxo(None).as_map_key())
    }

    fn iter_txs(&self) -> Result<Vec<TransactionRecord>, Error> {
        self.range(MapKey::Transaction(None).as_map_key())
    }

    fn iter_address_tags(&self, script: &Script) -> Result<Vec<AddressTag>, Error> {
        self.range(MapKey::Tag(script, None).as_map_key())
    }

    fn increment_utxo_id(&mut self) -> Result<u64, Error> {
        let key = MapKey::UtxoCounter.as_map_key();
        let value = match self.get::<u64>(&key)? {
            Some(current) => current + 1,
            None => 0,
        };
        self.insert(key, &value)?;

        Ok(value)
    }
}

impl BatchDatabase for MemoryDatabase {
    type Batch = Self;

    fn begin_batch(&self) -> Self::Batch {
        MemoryDatabase::new()
    }

    fn commit_batch(&mut self, mut batch: Self::Batch) -> Result<(), Error> {
        for key in batch.deleted_keys.iter() {
            self.map.remove(key);
        }
        self.map.append(&mut batch.map);
        Ok(())
    }
}
