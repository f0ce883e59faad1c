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

use std::convert::AsRef;
use std::fmt;

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpub};
use bitcoin::{
    Address, Amount, BlockHash, Network, OutPoint, PublicKey, ScriptBuf, Transaction, TxOut, Txid,
};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Types of derivation chains inside an account
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChainType {
    /// External, used for receiving
    External = 0,
    /// Internal, used for change outputs
    Change = 1,
}

impl ChainType {
    /// Return [`ChainType`] as a byte
    pub fn as_byte(&self) -> u8 {
        match self {
            ChainType::External => b'e',
            ChainType::Change => b'c',
        }
    }

    /// Return the BIP44 `change` path element for this chain
    pub fn index(&self) -> u32 {
        match self {
            ChainType::External => 0,
            ChainType::Change => 1,
        }
    }
}

impl AsRef<[u8]> for ChainType {
    fn as_ref(&self) -> &[u8] {
        match self {
            ChainType::External => b"e",
            ChainType::Change => b"c",
        }
    }
}

/// BIP43 purpose of an account, which also decides the type of its addresses
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HdPurpose {
    /// BIP44, pay-to-pubkey-hash
    Legacy,
    /// BIP49, pay-to-witness-pubkey-hash nested in pay-to-script-hash
    NestedSegwit,
    /// BIP84, native pay-to-witness-pubkey-hash
    Segwit,
}

impl HdPurpose {
    /// The hardened purpose constant used in the derivation path
    pub fn constant(&self) -> u32 {
        match self {
            HdPurpose::Legacy => 44,
            HdPurpose::NestedSegwit => 49,
            HdPurpose::Segwit => 84,
        }
    }

    /// Weight in witness units of the data needed to spend an output of this type, counting
    /// the `scriptSig` at four units per byte and the witness at one
    pub fn satisfaction_weight(&self) -> usize {
        match self {
            // scriptSig: <sig(73)> <pubkey(33)> with their push opcodes
            HdPurpose::Legacy => (1 + 73 + 1 + 33) * 4,
            // scriptSig: push of the 22 bytes redeem script, plus the p2wpkh witness
            HdPurpose::NestedSegwit => (1 + 22) * 4 + P2WPKH_WITNESS_WEIGHT,
            HdPurpose::Segwit => P2WPKH_WITNESS_WEIGHT,
        }
    }

    /// Whether outputs of this type are spent with witness data
    pub fn is_witness(&self) -> bool {
        !matches!(self, HdPurpose::Legacy)
    }
}

// item count, then <sig(73)> and <pubkey(33)> with their length prefixes
const P2WPKH_WITNESS_WEIGHT: usize = 1 + 1 + 73 + 1 + 33;

/// Coin type for the given network, `0` on mainnet and `1` on every test network
pub fn coin_type_for(network: Network) -> u32 {
    match network {
        Network::Bitcoin => 0,
        _ => 1,
    }
}

/// A BIP44 account: `m / purpose' / coin_type' / index'`
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HdAccount {
    /// Purpose of the account
    pub purpose: HdPurpose,
    /// SLIP44 coin type
    pub coin_type: u32,
    /// Account index
    pub index: u32,
}

impl HdAccount {
    /// Create a new account identifier
    pub fn new(purpose: HdPurpose, coin_type: u32, index: u32) -> Self {
        HdAccount {
            purpose,
            coin_type,
            index,
        }
    }

    /// Hardened derivation path of the account
    pub fn path(&self) -> Result<DerivationPath, Error> {
        Ok(DerivationPath::from(vec![
            ChildNumber::from_hardened_idx(self.purpose.constant())?,
            ChildNumber::from_hardened_idx(self.coin_type)?,
            ChildNumber::from_hardened_idx(self.index)?,
        ]))
    }

    /// Full derivation path of the address at `index` on `chain`
    pub fn address_path(&self, chain: ChainType, index: u32) -> Result<DerivationPath, Error> {
        Ok(self.path()?.extend([
            ChildNumber::from_normal_idx(chain.index())?,
            ChildNumber::from_normal_idx(index)?,
        ]))
    }

    /// Serialize the account as a fixed-size key
    pub(crate) fn as_key(&self) -> Vec<u8> {
        let mut key = self.purpose.constant().to_be_bytes().to_vec();
        key.extend_from_slice(&self.coin_type.to_be_bytes());
        key.extend_from_slice(&self.index.to_be_bytes());
        key
    }
}

impl fmt::Display for HdAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "m/{}'/{}'/{}'",
            self.purpose.constant(),
            self.coin_type,
            self.index
        )
    }
}

/// An account known to the wallet, with its extended public key
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    /// Account identifier
    pub account: HdAccount,
    /// Extended public key at the account level
    pub xpub: Xpub,
}

/// An address derived by the wallet
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AddressRecord {
    /// Owning account
    pub account: HdAccount,
    /// Chain inside the account
    pub chain: ChainType,
    /// Derivation index
    pub index: u32,
    /// Derived public key
    pub public_key: PublicKey,
    /// Script paid by this address
    pub script_pubkey: ScriptBuf,
    /// Whether any transaction output has paid this address
    pub used: bool,
    /// Whether the address was issued past the gap limit, so that a history found on it
    /// means discovery has to be re-run
    pub beyond_gap: bool,
}

impl AddressRecord {
    /// Render the address for `network`
    pub fn address(&self, network: Network) -> Result<Address, Error> {
        Ok(Address::from_script(&self.script_pubkey, network)?)
    }
}

/// Fee rate
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, PartialOrd)]
// Internally stored as satoshi/vbyte
pub struct FeeRate(f32);

impl FeeRate {
    /// Create a new instance of [`FeeRate`] given a float fee rate in btc/kvbytes
    pub fn from_btc_per_kvb(btc_per_kvb: f32) -> Self {
        FeeRate(btc_per_kvb * 1e5)
    }

    /// Create a new instance of [`FeeRate`] given a float fee rate in satoshi/vbyte
    pub const fn from_sat_per_vb(sat_per_vb: f32) -> Self {
        FeeRate(sat_per_vb)
    }

    /// Create a new [`FeeRate`] with the default min relay fee value
    pub const fn default_min_relay_fee() -> Self {
        FeeRate(1.0)
    }

    /// Calculate the fee rate paid by `fee` over `weight` witness units
    pub fn from_wu(fee: u64, weight: u64) -> Self {
        if weight == 0 {
            return FeeRate(0.0);
        }
        FeeRate(fee as f32 * 4.0 / weight as f32)
    }

    /// Return the value as satoshi/vbyte
    pub fn as_sat_vb(&self) -> f32 {
        self.0
    }

    /// Whether the rate can be used to build a transaction
    pub fn is_valid(&self) -> bool {
        self.0.is_finite() && self.0 > 0.0
    }

    /// Fee in satoshi for `weight` witness units, charged on the rounded up virtual size
    pub fn fee_wu(&self, weight: usize) -> u64 {
        self.fee_vb((weight + 3) / 4)
    }

    /// Fee in satoshi for `vbytes` virtual bytes, rounded up
    pub fn fee_vb(&self, vbytes: usize) -> u64 {
        (vbytes as f32 * self.0).ceil() as u64
    }
}

impl std::default::Default for FeeRate {
    fn default() -> Self {
        FeeRate::default_min_relay_fee()
    }
}

impl fmt::Display for FeeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sat/vB", self.0)
    }
}

/// Lifecycle state of a transaction output tracked by the wallet
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxoState {
    /// Not (or no longer) part of the ledger
    DoesNotExist,
    /// Seen in a transaction that is not in a block yet
    Unconfirmed,
    /// The funding transaction is in a block of the best chain
    Confirmed {
        /// Height of the block
        height: u32,
    },
    /// Held by an in-flight transaction build
    Reserved,
    /// A spending transaction was seen, but it is not buried deep enough yet
    PendingConfirmationsSpent,
    /// The spending transaction reached the required number of confirmations
    ConfirmedSpent,
}

impl TxoState {
    /// Whether coin selection may pick an output in this state
    pub fn is_spendable(&self) -> bool {
        matches!(self, TxoState::Unconfirmed | TxoState::Confirmed { .. })
    }

    /// Whether the output has been consumed by a transaction
    pub fn is_spent(&self) -> bool {
        matches!(
            self,
            TxoState::PendingConfirmationsSpent | TxoState::ConfirmedSpent
        )
    }
}

impl fmt::Display for TxoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxoState::DoesNotExist => write!(f, "DoesNotExist"),
            TxoState::Unconfirmed => write!(f, "Unconfirmed"),
            TxoState::Confirmed { height } => write!(f, "Confirmed({})", height),
            TxoState::Reserved => write!(f, "Reserved"),
            TxoState::PendingConfirmationsSpent => write!(f, "PendingConfirmationsSpent"),
            TxoState::ConfirmedSpent => write!(f, "ConfirmedSpent"),
        }
    }
}

/// An output owned by the wallet, with everything needed to sign for it
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SpendingInfo {
    /// Insertion order inside the ledger
    pub id: u64,
    /// Reference to the transaction output
    pub outpoint: OutPoint,
    /// Transaction output
    pub txout: TxOut,
    /// Account owning the paid address
    pub account: HdAccount,
    /// Chain of the paid address
    pub chain: ChainType,
    /// Derivation index of the paid address
    pub index: u32,
    /// Current state
    pub state: TxoState,
    /// Block including the funding transaction, if any
    pub block_hash: Option<BlockHash>,
    /// Height of `block_hash`
    pub height: Option<u32>,
    /// Transaction spending this output, if any
    pub spending_txid: Option<Txid>,
    /// Block including the spending transaction, if any
    pub spending_block: Option<BlockHash>,
}

impl SpendingInfo {
    /// Value of the output
    pub fn amount(&self) -> Amount {
        self.txout.value
    }

    /// State the output goes back to once it's no longer reserved
    pub(crate) fn unreserved_state(&self) -> TxoState {
        match self.height {
            Some(height) => TxoState::Confirmed { height },
            None => TxoState::Unconfirmed,
        }
    }
}

/// Direction of a wallet transaction
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxDirection {
    /// Only pays the wallet
    Incoming,
    /// Spends at least one wallet output
    Outgoing,
}

/// A wallet transaction
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    /// Transaction id
    pub txid: Txid,
    /// The transaction
    pub transaction: Transaction,
    /// Block including the transaction, `None` means unconfirmed
    pub block_hash: Option<BlockHash>,
    /// Direction
    pub direction: TxDirection,
    /// Value paid to the wallet (sats)
    pub received: u64,
    /// Value spent from the wallet (sats)
    pub sent: u64,
    /// Fee paid, only known when every input belongs to the wallet
    pub fee: Option<u64>,
    /// First time the wallet saw the transaction
    pub timestamp: u64,
    /// Transaction that replaced this one, if any
    pub replaced_by: Option<Txid>,
}

impl TransactionRecord {
    /// Whether the transaction is waiting for a block
    pub fn is_pending(&self) -> bool {
        self.block_hash.is_none() && self.replaced_by.is_none()
    }

    /// Fee rate paid by the transaction, if the fee is known
    pub fn fee_rate(&self) -> Option<FeeRate> {
        self.fee
            .map(|fee| FeeRate::from_wu(fee, self.transaction.weight().to_wu()))
    }
}

/// Kind of an [`AddressTag`]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub enum AddressTagType {
    /// Free-form label
    Label,
    /// Where the keys for the address live (hot, cold, ...)
    StorageLocation,
    /// Application-defined tag type
    Custom(String),
}

/// A bookkeeping label attached to addresses and the outputs that pay them
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddressTag {
    /// Name of the tag
    pub name: String,
    /// Kind of the tag
    pub tag_type: AddressTagType,
}

impl AddressTag {
    /// Create a new tag
    pub fn new<S: Into<String>>(name: S, tag_type: AddressTagType) -> Self {
        AddressTag {
            name: name.into(),
            tag_type,
        }
    }
}

/// Balance of the wallet, or part of it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Balance {
    /// Outputs confirmed in the best chain
    pub confirmed: Amount,
    /// Outputs waiting for a block
    pub unconfirmed: Amount,
    /// Outputs held by in-flight transaction builds
    pub reserved: Amount,
}

impl Balance {
    /// Spendable total, `confirmed + unconfirmed`
    pub fn total(&self) -> Amount {
        self.confirmed + self.unconfirmed
    }

    pub(crate) fn add(&mut self, utxo: &SpendingInfo) {
        match utxo.state {
            TxoState::Confirmed { .. } => self.confirmed += utxo.amount(),
            TxoState::Unconfirmed => self.unconfirmed += utxo.amount(),
            TxoState::Reserved => self.reserved += utxo.amount(),
            _ => {}
        }
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn can_store_feerate_in_const() {
        const _MY_RATE: FeeRate = FeeRate::from_sat_per_vb(10.0);
        const _MIN_RELAY: FeeRate = FeeRate::default_min_relay_fee();
    }

    #[test]
    fn test_fee_from_btc_per_kvb() {
        let fee = FeeRate::from_btc_per_kvb(1e-5);
        assert!((fee.as_sat_vb() - 1.0).abs() < 0.0001);
    }

    #[test]
    fn test_fee_rate_rounds_up() {
        let rate = FeeRate::from_sat_per_vb(1.0);
        assert_eq!(rate.fee_wu(561), 141);
        assert_eq!(rate.fee_vb(141), 141);
        assert_eq!(FeeRate::from_sat_per_vb(5.0).fee_wu(561), 705);
        assert_eq!(FeeRate::from_sat_per_vb(1.5).fee_vb(3), 5);
        assert!(!FeeRate::from_sat_per_vb(0.0).is_valid());
        assert!(!FeeRate::from_sat_per_vb(-2.0).is_valid());
    }

    #[test]
    fn test_fee_rate_from_wu() {
        let rate = FeeRate::from_wu(500, 400);
        assert!((rate.as_sat_vb() - 5.0).abs() < 0.0001);
    }

    #[test]
    fn test_account_paths() {
        let account = HdAccount::new(HdPurpose::Segwit, 1, 0);
        assert_eq!(account.to_string(), "m/84'/1'/0'");
        assert_eq!(
            account.address_path(ChainType::Change, 7).unwrap(),
            DerivationPath::from_str("m/84'/1'/0'/1/7").unwrap()
        );
    }

    #[test]
    fn test_unreserved_state() {
        let mut utxo = SpendingInfo {
            id: 0,
            outpoint: OutPoint::null(),
            txout: TxOut {
                value: Amount::from_sat(1_000),
                script_pubkey: ScriptBuf::new(),
            },
            account: HdAccount::new(HdPurpose::Segwit, 1, 0),
            chain: ChainType::External,
            index: 0,
            state: TxoState::Reserved,
            block_hash: None,
            height: None,
            spending_txid: None,
            spending_block: None,
        };
        assert_eq!(utxo.unreserved_state(), TxoState::Unconfirmed);
        utxo.height = Some(10);
        assert_eq!(utxo.unreserved_state(), TxoState::Confirmed { height: 10 });
    }
}
