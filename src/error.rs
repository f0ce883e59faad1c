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

use std::fmt;

use bitcoin::{BlockHash, OutPoint, ScriptBuf, Txid};

use crate::types::{FeeRate, HdAccount};
use crate::wallet;

/// Errors that can be thrown by the [`Wallet`](crate::wallet::Wallet)
#[derive(Debug)]
pub enum Error {
    /// Generic error
    Generic(String),
    /// The requested account (or purpose) was never created
    InvalidAccount(HdAccount),
    /// A new account can only be created once the previous one has a transaction history
    AccountHistoryRequired(HdAccount),
    /// One or more of the outputs to reserve is already reserved
    AlreadyReserved(Vec<OutPoint>),
    /// Wallet's UTXO set is not enough to cover recipient's requested plus fee
    InsufficientFunds {
        /// Sats needed for some transaction
        needed: u64,
        /// Sats available for spending
        available: u64,
    },
    /// The fee rate is zero, negative or not a number
    InvalidFeeRate(FeeRate),
    /// When bumping a tx the fee rate requested is lower than required
    FeeRateTooLow {
        /// Required fee rate (satoshi/vbyte)
        required: FeeRate,
    },
    /// Happens when trying to bump a transaction that is already confirmed or replaced
    TransactionNotPending(Txid),
    /// The transaction has no wallet-owned unspent output that a child could spend
    NoSpendableChildOutput(Txid),
    /// The address request queue is full
    QueueFull,
    /// The address request did not complete in time
    Timeout,
    /// A reorganization left the ledger in a state that needs a rescan
    ReorgInconsistency(String),
    /// Thrown when a tx is not found in the internal database
    TransactionNotFound(Txid),
    /// Happens when trying to spend an UTXO that is not in the internal database
    UnknownUtxo(OutPoint),
    /// The UTXO exists but can't be spent in its current state
    UnspendableUtxo(OutPoint),
    /// The script doesn't pay any of the wallet's addresses
    UnknownScript(ScriptBuf),
    /// Trying to replace a tx that doesn't signal replaceability
    IrreplaceableTransaction(Txid),
    /// Cannot build a tx without recipients
    NoRecipients,
    /// Output created is under the dust limit, 546 satoshis
    OutputBelowDustLimit(usize),
    /// The block is not known to the chain source
    UnknownBlock(BlockHash),
    /// `OP_RETURN` payload bigger than what's relayed by default
    DataTooLarge(usize),
    /// Invalid wallet configuration
    InvalidConfig(String),
    /// Signing error
    Signer(wallet::signer::SignerError),
    /// BIP32 error
    Bip32(bitcoin::bip32::Error),
    /// Error serializing or deserializing JSON data
    Json(serde_json::Error),
    /// The script can't be rendered as an address
    Address(bitcoin::address::FromScriptError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generic(err) => write!(f, "Generic error: {}", err),
            Self::InvalidAccount(account) => write!(f, "Invalid account: {}", account),
            Self::AccountHistoryRequired(account) => write!(
                f,
                "Account {} has no transaction history, can't create a new one",
                account
            ),
            Self::AlreadyReserved(outpoints) => {
                write!(f, "Outputs already reserved: {:?}", outpoints)
            }
            Self::InsufficientFunds { needed, available } => write!(
                f,
                "Insufficient funds: {} sat available of {} sat needed",
                available, needed
            ),
            Self::InvalidFeeRate(rate) => write!(f, "Invalid fee rate: {}", rate),
            Self::FeeRateTooLow { required } => write!(
                f,
                "Fee rate too low: required more than {} sat/vbyte",
                required.as_sat_vb()
            ),
            Self::TransactionNotPending(txid) => {
                write!(f, "Transaction {} is not pending", txid)
            }
            Self::NoSpendableChildOutput(txid) => write!(
                f,
                "Transaction {} has no wallet output a child could spend",
                txid
            ),
            Self::QueueFull => write!(f, "Address request queue is full"),
            Self::Timeout => write!(f, "Address request timed out"),
            Self::ReorgInconsistency(err) => {
                write!(f, "Reorg inconsistency, a rescan is required: {}", err)
            }
            Self::TransactionNotFound(txid) => {
                write!(f, "Transaction {} not found in the internal database", txid)
            }
            Self::UnknownUtxo(outpoint) => {
                write!(f, "UTXO {} not found in the internal database", outpoint)
            }
            Self::UnspendableUtxo(outpoint) => write!(f, "UTXO {} can't be spent", outpoint),
            Self::UnknownScript(script) => {
                write!(f, "Script {} doesn't belong to the wallet", script)
            }
            Self::IrreplaceableTransaction(txid) => {
                write!(f, "Transaction {} can't be replaced", txid)
            }
            Self::NoRecipients => write!(f, "Cannot build tx without recipients"),
            Self::OutputBelowDustLimit(index) => {
                write!(f, "Output {} below the dust limit", index)
            }
            Self::UnknownBlock(hash) => write!(f, "Unknown block {}", hash),
            Self::DataTooLarge(len) => write!(f, "OP_RETURN data too large: {} bytes", len),
            Self::InvalidConfig(err) => write!(f, "Invalid configuration: {}", err),
            Self::Signer(err) => write!(f, "Signer error: {}", err),
            Self::Bip32(err) => write!(f, "BIP32 error: {}", err),
            Self::Json(err) => write!(f, "Serialize/Deserialize JSON error: {}", err),
            Self::Address(err) => write!(f, "Address error: {}", err),
        }
    }
}

impl std::error::Error for Error {}

macro_rules! impl_error {
    ( $from:ty, $to:ident ) => {
        impl_error!($from, $to, Error);
    };
    ( $from:ty, $to:ident, $impl_for:ty ) => {
        impl std::convert::From<$from> for $impl_for {
            fn from(err: $from) -> Self {
                <$impl_for>::$to(err)
            }
        }
    };
}

impl_error!(wallet::signer::SignerError, Signer);
impl_error!(bitcoin::bip32::Error, Bip32);
impl_error!(serde_json::Error, Json);
impl_error!(bitcoin::address::FromScriptError, Address);

impl From<wallet::coin_selection::InsufficientFunds> for Error {
    fn from(err: wallet::coin_selection::InsufficientFunds) -> Self {
        Error::InsufficientFunds {
            needed: err.needed,
            available: err.available,
        }
    }
}
