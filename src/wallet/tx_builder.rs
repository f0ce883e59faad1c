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

//! Transaction builder
//!
//! ## Example
//!
//! ```
//! # use std::str::FromStr;
//! # use bitcoin::*;
//! # use hdwallet::*;
//! # use hdwallet::wallet::tx_builder::TxOrdering;
//! # use hdwallet::FeeRate;
//! # let to_address = Address::from_str("2N4eQYCbKUHCCTUjBJeHcJp9ok6J2GZsTDt").unwrap().assume_checked();
//! // Create a transaction with one output to `to_address` of 50_000 satoshi, with a custom fee rate
//! // of 5.0 satoshi/vbyte, keeping the outputs in the order they were added
//! let builder = TxBuilder::with_recipients(vec![(to_address.script_pubkey(), 50_000)])
//!     .fee_rate(FeeRate::from_sat_per_vb(5.0))
//!     .ordering(TxOrdering::Untouched)
//!     .do_not_reserve();
//! ```

use std::collections::HashSet;

use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, TxIn, TxOut};

use super::coin_selection::{CoinSelectionAlgo, DEFAULT_COIN_SELECTION};
use crate::types::{FeeRate, HdAccount, SpendingInfo};

/// A transaction builder
///
/// This structure contains the configuration that the wallet must follow to build a transaction.
///
/// For an example see [this module](super::tx_builder)'s documentation;
#[derive(Debug, Clone)]
pub struct TxBuilder {
    pub(crate) recipients: Vec<(ScriptBuf, u64)>,
    pub(crate) data: Option<Vec<u8>>,
    pub(crate) drain_wallet: bool,
    pub(crate) fee_rate: Option<FeeRate>,
    pub(crate) account: Option<HdAccount>,
    pub(crate) utxos: Option<Vec<OutPoint>>,
    pub(crate) unspendable: HashSet<OutPoint>,
    pub(crate) ordering: TxOrdering,
    pub(crate) coin_selection: CoinSelectionAlgo,
    pub(crate) mark_as_reserved: bool,
}

impl Default for TxBuilder {
    fn default() -> Self {
        TxBuilder {
            recipients: vec![],
            data: None,
            drain_wallet: false,
            fee_rate: None,
            account: None,
            utxos: None,
            unspendable: HashSet::new(),
            ordering: TxOrdering::default(),
            coin_selection: DEFAULT_COIN_SELECTION,
            mark_as_reserved: true,
        }
    }
}

impl TxBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder starting from a list of recipients
    pub fn with_recipients(recipients: Vec<(ScriptBuf, u64)>) -> Self {
        Self::default().set_recipients(recipients)
    }

    /// Replace the recipients already added with a new list
    pub fn set_recipients(mut self, recipients: Vec<(ScriptBuf, u64)>) -> Self {
        self.recipients = recipients;
        self
    }

    /// Add a recipient to the internal list
    pub fn add_recipient(mut self, script_pubkey: ScriptBuf, amount: u64) -> Self {
        self.recipients.push((script_pubkey, amount));
        self
    }

    /// Add a zero-valued `OP_RETURN` output carrying `data`
    pub fn add_data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }

    /// Spend every available output and send the whole value, minus the fee, to the single
    /// recipient, whose amount is ignored. No change output is created.
    pub fn drain_wallet(mut self) -> Self {
        self.drain_wallet = true;
        self
    }

    /// Set a custom fee rate, otherwise the wallet's fee oracle is asked
    pub fn fee_rate(mut self, fee_rate: FeeRate) -> Self {
        self.fee_rate = Some(fee_rate);
        self
    }

    /// Fund the transaction from `account` instead of the default one
    pub fn account(mut self, account: HdAccount) -> Self {
        self.account = Some(account);
        self
    }

    /// Replace the internal list of utxos that **must** be spent with a new list
    ///
    /// These have priority over the "unspendable" utxos, meaning that if a utxo is present both in
    /// the "utxos" and the "unspendable" list, it will be spent. Coin selection is bypassed: the
    /// transaction spends exactly these outputs.
    pub fn utxos(mut self, utxos: Vec<OutPoint>) -> Self {
        self.utxos = Some(utxos);
        self
    }

    /// Add a utxo to the internal list of utxos that **must** be spent
    pub fn add_utxo(mut self, utxo: OutPoint) -> Self {
        self.utxos.get_or_insert(vec![]).push(utxo);
        self
    }

    /// Replace the internal list of unspendable utxos with a new list
    pub fn unspendable(mut self, unspendable: Vec<OutPoint>) -> Self {
        self.unspendable = unspendable.into_iter().collect();
        self
    }

    /// Add a utxo to the internal list of unspendable utxos
    pub fn add_unspendable(mut self, unspendable: OutPoint) -> Self {
        self.unspendable.insert(unspendable);
        self
    }

    /// Choose the ordering for inputs and outputs of the transaction
    pub fn ordering(mut self, ordering: TxOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    /// Choose the coin selection algorithm
    pub fn coin_selection(mut self, coin_selection: CoinSelectionAlgo) -> Self {
        self.coin_selection = coin_selection;
        self
    }

    /// Don't reserve the selected outputs
    ///
    /// By default they are reserved until the transaction is processed, and the caller is
    /// responsible for releasing them if it gives up on the transaction.
    pub fn do_not_reserve(mut self) -> Self {
        self.mark_as_reserved = false;
        self
    }
}

/// Ordering of the transaction's inputs and outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxOrdering {
    /// Randomized (default)
    #[default]
    Shuffle,
    /// Unchanged
    Untouched,
    /// BIP69 / Lexicographic
    Bip69Lexicographic,
}

impl TxOrdering {
    /// Sort transaction inputs and outputs by [`TxOrdering`] variant
    pub fn sort_tx(&self, tx: &mut Transaction) {
        match self {
            TxOrdering::Untouched => {}
            TxOrdering::Shuffle => {
                use rand::seq::SliceRandom;
                #[cfg(test)]
                use rand::SeedableRng;

                #[cfg(not(test))]
                let mut rng = rand::thread_rng();
                #[cfg(test)]
                let mut rng = rand::rngs::StdRng::seed_from_u64(12345);

                tx.output.shuffle(&mut rng);
            }
            TxOrdering::Bip69Lexicographic => {
                tx.input.sort_unstable_by_key(|txin| {
                    (txin.previous_output.txid, txin.previous_output.vout)
                });
                tx.output
                    .sort_unstable_by_key(|txout| (txout.value, txout.script_pubkey.clone()));
            }
        }
    }
}

/// A signed transaction built by the wallet
#[derive(Debug, Clone, PartialEq)]
pub struct FundedTransaction {
    /// The signed transaction
    pub transaction: Transaction,
    /// Wallet outputs spent by the transaction, in input order
    pub inputs: Vec<SpendingInfo>,
    /// Fee paid, in satoshi
    pub fee: u64,
    /// Fee rate the transaction was funded with
    pub fee_rate: FeeRate,
    /// Position of the change output, if any
    pub change_index: Option<usize>,
}

impl FundedTransaction {
    /// Sum of the spent outputs
    pub fn input_amount(&self) -> Amount {
        self.inputs.iter().map(|u| u.amount()).sum()
    }

    /// Sum of the created outputs
    pub fn output_amount(&self) -> Amount {
        self.transaction.output.iter().map(|o| o.value).sum()
    }

    /// The change output, if any
    pub fn change(&self) -> Option<&TxOut> {
        self.change_index.and_then(|i| self.transaction.output.get(i))
    }
}

pub(crate) fn unsigned_input(previous_output: OutPoint) -> TxIn {
    TxIn {
        previous_output,
        sequence: bitcoin::Sequence::ENABLE_RBF_NO_LOCKTIME,
        ..Default::default()
    }
}

#[cfg(test)]
mod test {
    const ORDERING_TEST_TX: &str = "0200000003c26f3eb7932f7acddc5ddd26602b77e7516079b03090a16e2c2f54\
                                    85d1fd600f0100000000ffffffffc26f3eb7932f7acddc5ddd26602b77e75160\
                                    79b03090a16e2c2f5485d1fd600f0000000000ffffffff571fb3e02278217852\
                                    dd5d299947e2b7354a639adc32ec1fa7b82cfb5dec530e0500000000ffffffff\
                                    03e80300000000000002aaeee80300000000000001aa200300000000000001ff\
                                    00000000";
    macro_rules! ordering_test_tx {
        () => {
            deserialize::<bitcoin::Transaction>(&Vec::<u8>::from_hex(ORDERING_TEST_TX).unwrap())
                .unwrap()
        };
    }

    use bitcoin::consensus::deserialize;
    use bitcoin::hex::FromHex;

    use super::*;

    #[test]
    fn test_output_ordering_default_shuffle() {
        assert_eq!(TxOrdering::default(), TxOrdering::Shuffle);
    }

    #[test]
    fn test_output_ordering_untouched() {
        let original_tx = ordering_test_tx!();
        let mut tx = original_tx.clone();

        TxOrdering::Untouched.sort_tx(&mut tx);

        assert_eq!(original_tx, tx);
    }

    #[test]
    fn test_output_ordering_shuffle() {
        let original_tx = ordering_test_tx!();
        let mut tx = original_tx.clone();

        TxOrdering::Shuffle.sort_tx(&mut tx);

        assert_eq!(original_tx.input, tx.input);
        let mut original_outputs = original_tx.output.clone();
        let mut outputs = tx.output.clone();
        original_outputs.sort_by_key(|o| o.script_pubkey.clone());
        outputs.sort_by_key(|o| o.script_pubkey.clone());
        assert_eq!(original_outputs, outputs);
    }

    #[test]
    fn test_output_ordering_bip69() {
        use std::str::FromStr;

        let original_tx = ordering_test_tx!();
        let mut tx = original_tx.clone();

        TxOrdering::Bip69Lexicographic.sort_tx(&mut tx);

        assert_eq!(
            tx.input[0].previous_output,
            bitcoin::OutPoint::from_str(
                "0e53ec5dfb2cb8a71fec32dc9a634a35b7e24799295ddd5278217822e0b31f57:5"
            )
            .unwrap()
        );
        assert_eq!(
            tx.input[1].previous_output,
            bitcoin::OutPoint::from_str(
                "0f60fdd185542f2c6ea19030b0796051e7772b6026dd5ddccd7a2f93b73e6fc2:0"
            )
            .unwrap()
        );
        assert_eq!(
            tx.input[2].previous_output,
            bitcoin::OutPoint::from_str(
                "0f60fdd185542f2c6ea19030b0796051e7772b6026dd5ddccd7a2f93b73e6fc2:1"
            )
            .unwrap()
        );

        assert_eq!(tx.output[0].value.to_sat(), 800);
        assert_eq!(tx.output[1].script_pubkey, ScriptBuf::from(vec![0xAA]));
        assert_eq!(
            tx.output[2].script_pubkey,
            ScriptBuf::from(vec![0xAA, 0xEE])
        );
    }

    #[test]
    fn test_builder_defaults() {
        let builder = TxBuilder::new().add_recipient(ScriptBuf::new(), 1_000);
        assert!(builder.mark_as_reserved);
        assert_eq!(builder.coin_selection, CoinSelectionAlgo::Default);
        assert!(!builder.do_not_reserve().mark_as_reserved);
    }
}
