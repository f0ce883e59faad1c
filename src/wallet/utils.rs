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

use bitcoin::consensus::encode::{serialize, VarInt};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Amount, CompressedPublicKey, ScriptBuf, TxOut};

use crate::types::HdPurpose;

/// Trait to check if a value is below the dust limit
// we implement this trait to make sure we don't mess up the comparison with off-by-one like a <
// instead of a <= etc. The constant value for the dust limit is not public on purpose, to
// encourage the usage of this trait.
pub trait IsDust {
    /// Check whether or not a value is below dust limit
    fn is_dust(&self) -> bool;
}

impl IsDust for u64 {
    fn is_dust(&self) -> bool {
        *self <= DUST_LIMIT_SATOSHI
    }
}

impl IsDust for Amount {
    fn is_dust(&self) -> bool {
        self.to_sat().is_dust()
    }
}

const DUST_LIMIT_SATOSHI: u64 = 546;

pub(crate) type SecpCtx = Secp256k1<All>;

// prev txid, prev vout, sequence and the script_sig length prefix
pub(crate) const TXIN_BASE_WEIGHT: usize = (32 + 4 + 4 + 1) * 4;
// version, locktime, plus segwit marker and flag (always counted)
pub(crate) const TX_FIXED_WEIGHT: usize = (4 + 4) * 4 + 2;

pub(crate) fn varint_weight(n: usize) -> usize {
    VarInt(n as u64).size() * 4
}

pub(crate) fn txout_weight(txout: &TxOut) -> usize {
    serialize(txout).len() * 4
}

/// Weight of the fixed fields and of the outputs of a transaction, without any input
pub(crate) fn base_weight(outputs: &[TxOut]) -> usize {
    TX_FIXED_WEIGHT + varint_weight(outputs.len()) + outputs.iter().map(txout_weight).sum::<usize>()
}

/// Weight added by one input of the given type, including its satisfaction
pub(crate) fn txin_weight(purpose: HdPurpose) -> usize {
    // non-witness inputs still need an empty stack once the tx has a witness
    let empty_witness = if purpose.is_witness() { 0 } else { 1 };
    TXIN_BASE_WEIGHT + purpose.satisfaction_weight() + empty_witness
}

/// Full estimated weight of a transaction spending `inputs` to `outputs`
pub(crate) fn estimate_weight(inputs: &[HdPurpose], outputs: &[TxOut]) -> usize {
    base_weight(outputs)
        + varint_weight(inputs.len())
        + inputs.iter().map(|p| txin_weight(*p)).sum::<usize>()
}

/// The redeem script of a P2SH-P2WPKH output, which is the P2WPKH program itself
pub(crate) fn p2wpkh_program(public_key: &CompressedPublicKey) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&public_key.wpubkey_hash())
}

/// Script paid by a key of an account with the given purpose
pub(crate) fn script_for(purpose: HdPurpose, public_key: &CompressedPublicKey) -> ScriptBuf {
    match purpose {
        HdPurpose::Legacy => ScriptBuf::new_p2pkh(&public_key.pubkey_hash()),
        HdPurpose::NestedSegwit => ScriptBuf::new_p2sh(&p2wpkh_program(public_key).script_hash()),
        HdPurpose::Segwit => p2wpkh_program(public_key),
    }
}

/// Weight of an output paying an address of the given type
pub(crate) fn output_weight_for(purpose: HdPurpose) -> usize {
    let script_len = match purpose {
        HdPurpose::Legacy => 25,
        HdPurpose::NestedSegwit => 23,
        HdPurpose::Segwit => 22,
    };
    // value, script length prefix, script
    (8 + 1 + script_len) * 4
}

#[cfg(test)]
mod test {
    use bitcoin::bip32::Xpriv;
    use bitcoin::Network;

    use super::*;

    fn public_key() -> CompressedPublicKey {
        let secp = Secp256k1::new();
        let xpriv = Xpriv::new_master(Network::Regtest, &[7; 32]).unwrap();
        CompressedPublicKey(xpriv.private_key.public_key(&secp))
    }

    #[test]
    fn test_dust_limit() {
        assert!(546u64.is_dust());
        assert!(!547u64.is_dust());
        assert!(Amount::from_sat(100).is_dust());
    }

    #[test]
    fn test_output_weight_matches_scripts() {
        let pk = public_key();
        for purpose in [HdPurpose::Legacy, HdPurpose::NestedSegwit, HdPurpose::Segwit] {
            let txout = TxOut {
                value: Amount::from_sat(10_000),
                script_pubkey: script_for(purpose, &pk),
            };
            assert_eq!(txout_weight(&txout), output_weight_for(purpose));
        }
    }

    #[test]
    fn test_script_types() {
        let pk = public_key();
        assert!(script_for(HdPurpose::Legacy, &pk).is_p2pkh());
        assert!(script_for(HdPurpose::NestedSegwit, &pk).is_p2sh());
        assert!(script_for(HdPurpose::Segwit, &pk).is_p2wpkh());
    }

    #[test]
    fn test_estimate_weight_single_p2wpkh() {
        let outputs = vec![TxOut {
            value: Amount::from_sat(10_000),
            script_pubkey: script_for(HdPurpose::Segwit, &public_key()),
        }];
        // 34 fixed + 4 out count + 124 output + 4 in count + 164 input + 109 witness
        assert_eq!(estimate_weight(&[HdPurpose::Segwit], &outputs), 439);
    }
}
