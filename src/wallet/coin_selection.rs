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

//! Coin selection
//!
//! This module provides [`CoinSelectionAlgo`], the closed set of algorithms the wallet can use
//! to pick the inputs of a new transaction.
//!
//! The coin selection algorithm is not globally part of a [`Wallet`](super::Wallet), instead it
//! is selected whenever a transaction is funded, through the
//! [`TxBuilder::coin_selection`](super::tx_builder::TxBuilder::coin_selection) method.
//!
//! Every algorithm works on weights: the caller passes the weight of the transaction without
//! inputs, each candidate carries the weight it adds once selected, and the fee is computed on
//! the total. Inputs passed as "must use" are always selected first, in the given order.

use std::fmt;

use rand::seq::SliceRandom;

use crate::types::{FeeRate, SpendingInfo};
use crate::wallet::utils::varint_weight;

/// Default coin selection algorithm used by [`TxBuilder`](super::tx_builder::TxBuilder) if not
/// overridden
pub const DEFAULT_COIN_SELECTION: CoinSelectionAlgo = CoinSelectionAlgo::Default;

/// A candidate input, with the weight it adds to the transaction once selected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightedUtxo {
    /// Weight of the input, including its satisfaction
    pub weight: usize,
    /// The output to spend
    pub utxo: SpendingInfo,
}

/// Result of a successful coin selection
#[derive(Debug, Clone)]
pub struct CoinSelectionResult {
    /// List of outputs selected for use as inputs
    pub selected: Vec<SpendingInfo>,
    /// Sum of the selected inputs' value
    pub selected_amount: u64,
    /// Total fee amount for the transaction without a change output, in satoshi
    pub fee_amount: u64,
    /// Estimated weight of the transaction without a change output
    pub weight: usize,
}

impl CoinSelectionResult {
    /// What is left once the recipients and the fee are paid
    pub fn excess(&self, amount_needed: u64) -> u64 {
        self.selected_amount
            .saturating_sub(amount_needed + self.fee_amount)
    }
}

/// The available outputs can't cover the amount to send plus the fee
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsufficientFunds {
    /// Sats needed for the transaction
    pub needed: u64,
    /// Sats available for spending
    pub available: u64,
}

impl fmt::Display for InsufficientFunds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Insufficient funds: {} sat available of {} sat needed",
            self.available, self.needed
        )
    }
}

impl std::error::Error for InsufficientFunds {}

/// Coin selection algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoinSelectionAlgo {
    /// Sort the candidates by value and pick them starting from the largest ones until the
    /// required amount is reached
    LargestFirst,
    /// Pick the candidates in a random order
    Random,
    /// Pick the candidates in the order they entered the ledger
    Accumulate,
    /// [`LargestFirst`](Self::LargestFirst) leaving room for a change output, falling back to
    /// spending every candidate when that can't be satisfied
    #[default]
    Default,
}

impl fmt::Display for CoinSelectionAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LargestFirst => write!(f, "largest-first"),
            Self::Random => write!(f, "random"),
            Self::Accumulate => write!(f, "accumulate"),
            Self::Default => write!(f, "default"),
        }
    }
}

impl CoinSelectionAlgo {
    /// Perform the coin selection
    ///
    /// - `must_use_utxos`: the utxos that must be spent regardless of `amount_needed`
    /// - `may_use_utxos`: the utxos that may be spent to satisfy `amount_needed`
    /// - `fee_rate`: fee rate to use
    /// - `amount_needed`: the amount in satoshi to select
    /// - `base_weight`: weight of the transaction without any input
    /// - `change_weight`: weight of the change output [`Default`](Self::Default) leaves room for
    pub fn coin_select(
        &self,
        must_use_utxos: Vec<WeightedUtxo>,
        mut may_use_utxos: Vec<WeightedUtxo>,
        fee_rate: FeeRate,
        amount_needed: u64,
        base_weight: usize,
        change_weight: usize,
    ) -> Result<CoinSelectionResult, InsufficientFunds> {
        log::debug!(
            "coin_select algo = `{}`, amount_needed = `{}`, fee_rate = `{}`",
            self,
            amount_needed,
            fee_rate
        );

        match self {
            Self::LargestFirst => {
                sort_largest_first(&mut may_use_utxos);
                select_sorted(
                    must_use_utxos,
                    may_use_utxos,
                    fee_rate,
                    amount_needed,
                    base_weight,
                    0,
                )
            }
            Self::Random => {
                #[cfg(not(test))]
                let mut rng = rand::thread_rng();
                #[cfg(test)]
                let mut rng = {
                    use rand::SeedableRng;
                    rand::rngs::StdRng::seed_from_u64(0)
                };

                may_use_utxos.shuffle(&mut rng);
                select_sorted(
                    must_use_utxos,
                    may_use_utxos,
                    fee_rate,
                    amount_needed,
                    base_weight,
                    0,
                )
            }
            Self::Accumulate => {
                may_use_utxos.sort_by_key(|wu| wu.utxo.id);
                select_sorted(
                    must_use_utxos,
                    may_use_utxos,
                    fee_rate,
                    amount_needed,
                    base_weight,
                    0,
                )
            }
            Self::Default => {
                sort_largest_first(&mut may_use_utxos);
                let change_fee = fee_rate.fee_wu(change_weight);
                match select_sorted(
                    must_use_utxos.clone(),
                    may_use_utxos.clone(),
                    fee_rate,
                    amount_needed,
                    base_weight,
                    change_fee,
                ) {
                    Ok(result) => Ok(result),
                    Err(_) => {
                        log::debug!("largest-first can't fund a change output, using all the utxos");
                        let all = must_use_utxos.into_iter().chain(may_use_utxos).collect();
                        select_sorted(all, vec![], fee_rate, amount_needed, base_weight, 0)
                    }
                }
            }
        }
    }
}

fn sort_largest_first(utxos: &mut [WeightedUtxo]) {
    utxos.sort_by(|a, b| {
        b.utxo
            .txout
            .value
            .cmp(&a.utxo.txout.value)
            .then(a.utxo.id.cmp(&b.utxo.id))
    });
}

// Takes `must_use` entirely, then `may_use` in order until `amount_needed + fee + reserve` is
// covered
fn select_sorted(
    must_use: Vec<WeightedUtxo>,
    may_use: Vec<WeightedUtxo>,
    fee_rate: FeeRate,
    amount_needed: u64,
    base_weight: usize,
    reserve: u64,
) -> Result<CoinSelectionResult, InsufficientFunds> {
    let mut selected = Vec::new();
    let mut selected_amount = 0u64;
    let mut inputs_weight = 0usize;

    let total_weight =
        |inputs_weight: usize, count: usize| base_weight + varint_weight(count) + inputs_weight;
    let needed = |weight: usize| amount_needed + fee_rate.fee_wu(weight) + reserve;

    let must_use_len = must_use.len();
    for (i, candidate) in must_use.into_iter().chain(may_use).enumerate() {
        if i >= must_use_len
            && selected_amount >= needed(total_weight(inputs_weight, selected.len()))
        {
            break;
        }

        selected_amount += candidate.utxo.txout.value.to_sat();
        inputs_weight += candidate.weight;
        log::debug!(
            "Selected {}, selected_amount = `{}`",
            candidate.utxo.outpoint,
            selected_amount
        );
        selected.push(candidate.utxo);
    }

    let weight = total_weight(inputs_weight, selected.len());
    if selected_amount < needed(weight) {
        return Err(InsufficientFunds {
            needed: needed(weight),
            available: selected_amount,
        });
    }

    Ok(CoinSelectionResult {
        selected,
        selected_amount,
        fee_amount: fee_rate.fee_wu(weight),
        weight,
    })
}
