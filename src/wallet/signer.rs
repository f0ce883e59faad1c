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

//! Key management
//!
//! The wallet never sees a private key: account keys are derived and transactions are signed by a
//! [`KeyManager`]. This module defines the trait and a software implementation,
//! [`Bip32KeyManager`], that keeps a BIP32 master key in memory.
//!
//! ```
//! # use bitcoin::Network;
//! # use hdwallet::wallet::signer::*;
//! let keys = Bip32KeyManager::new(Network::Regtest, &[42; 32])?;
//! let path = "m/84'/1'/0'/0/0".parse()?;
//! let public_key = keys.derive_public_key(&path)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::fmt;

use bitcoin::bip32::{self, DerivationPath, Xpriv, Xpub};
use bitcoin::hashes::Hash;
use bitcoin::script::{Builder as ScriptBuilder, PushBytesBuf};
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{CompressedPublicKey, Network, PublicKey, ScriptBuf, Transaction, TxOut, Witness};

use super::utils::{p2wpkh_program, script_for, SecpCtx};
use crate::types::HdPurpose;

/// Signing error
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum SignerError {
    /// The private key is missing for the required public key
    MissingKey,
    /// Input index is out of range
    InputIndexOutOfRange,
    /// The number of signing details doesn't match the number of inputs
    InputsMismatch,
    /// The sighash of an input could not be computed
    Sighash(String),
    /// Key derivation failed
    Bip32(bip32::Error),
    /// The user canceled the operation
    UserCanceled,
}

impl fmt::Display for SignerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingKey => write!(f, "Missing private key"),
            Self::InputIndexOutOfRange => write!(f, "Input index out of range"),
            Self::InputsMismatch => write!(f, "Signing details don't match the inputs"),
            Self::Sighash(err) => write!(f, "Error computing the sighash: {}", err),
            Self::Bip32(err) => write!(f, "BIP32 error: {}", err),
            Self::UserCanceled => write!(f, "The user canceled the operation"),
        }
    }
}

impl std::error::Error for SignerError {}

impl_error!(bip32::Error, Bip32, SignerError);

/// What a [`KeyManager`] needs to know to sign one input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSigningInfo {
    /// The output being spent
    pub txout: TxOut,
    /// Address type of the output
    pub purpose: HdPurpose,
    /// Full derivation path of the key that controls the output
    pub path: DerivationPath,
}

/// Key management collaborator
///
/// Implementations may keep the keys in memory, in a hardware device or in a remote service.
pub trait KeyManager: fmt::Debug + Send + Sync {
    /// Extended public key of the master key
    fn root_xpub(&self) -> Xpub;

    /// Derive the extended public key at `path`, which may contain hardened steps
    fn derive_xpub(&self, path: &DerivationPath) -> Result<Xpub, SignerError>;

    /// Derive the public key at `path`
    fn derive_public_key(&self, path: &DerivationPath) -> Result<PublicKey, SignerError> {
        Ok(PublicKey::new(self.derive_xpub(path)?.public_key))
    }

    /// Sign every input of `tx`, `inputs[i]` describing `tx.input[i]`
    fn sign_transaction(
        &self,
        tx: &mut Transaction,
        inputs: &[InputSigningInfo],
    ) -> Result<(), SignerError>;
}

/// In-memory BIP32 key manager
pub struct Bip32KeyManager {
    xpriv: Xpriv,
    secp: SecpCtx,
}

impl fmt::Debug for Bip32KeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bip32KeyManager")
            .field("fingerprint", &self.xpriv.fingerprint(&self.secp))
            .finish()
    }
}

impl Bip32KeyManager {
    /// Create a key manager from a BIP32 seed
    pub fn new(network: Network, seed: &[u8]) -> Result<Self, SignerError> {
        Ok(Self::from_xpriv(Xpriv::new_master(network, seed)?))
    }

    /// Create a key manager from an extended private key
    pub fn from_xpriv(xpriv: Xpriv) -> Self {
        Bip32KeyManager {
            xpriv,
            secp: Secp256k1::new(),
        }
    }

    fn sign_input(
        &self,
        cache: &mut SighashCache<&Transaction>,
        index: usize,
        info: &InputSigningInfo,
    ) -> Result<(ScriptBuf, Witness), SignerError> {
        let derived = self.xpriv.derive_priv(&self.secp, &info.path)?;
        let public_key = CompressedPublicKey(derived.private_key.public_key(&self.secp));
        if script_for(info.purpose, &public_key) != info.txout.script_pubkey {
            return Err(SignerError::MissingKey);
        }

        let message = match info.purpose {
            HdPurpose::Legacy => {
                let sighash = cache
                    .legacy_signature_hash(
                        index,
                        &info.txout.script_pubkey,
                        EcdsaSighashType::All.to_u32(),
                    )
                    .map_err(|e| SignerError::Sighash(e.to_string()))?;
                Message::from_digest(sighash.to_byte_array())
            }
            HdPurpose::NestedSegwit | HdPurpose::Segwit => {
                let sighash = cache
                    .p2wpkh_signature_hash(
                        index,
                        &p2wpkh_program(&public_key),
                        info.txout.value,
                        EcdsaSighashType::All,
                    )
                    .map_err(|e| SignerError::Sighash(e.to_string()))?;
                Message::from_digest(sighash.to_byte_array())
            }
        };

        let signature = self.secp.sign_ecdsa(&message, &derived.private_key);
        let mut signature = signature.serialize_der().to_vec();
        signature.push(EcdsaSighashType::All as u8);

        let push = |data: Vec<u8>| {
            PushBytesBuf::try_from(data).map_err(|e| SignerError::Sighash(e.to_string()))
        };

        Ok(match info.purpose {
            HdPurpose::Legacy => {
                let script_sig = ScriptBuilder::new()
                    .push_slice(push(signature)?)
                    .push_slice(push(public_key.to_bytes().to_vec())?)
                    .into_script();
                (script_sig, Witness::new())
            }
            HdPurpose::NestedSegwit | HdPurpose::Segwit => {
                let mut witness = Witness::new();
                witness.push(signature);
                witness.push(public_key.to_bytes());

                let script_sig = match info.purpose {
                    HdPurpose::NestedSegwit => ScriptBuilder::new()
                        .push_slice(push(p2wpkh_program(&public_key).into_bytes())?)
                        .into_script(),
                    _ => ScriptBuf::new(),
                };
                (script_sig, witness)
            }
        })
    }
}

impl KeyManager for Bip32KeyManager {
    fn root_xpub(&self) -> Xpub {
        Xpub::from_priv(&self.secp, &self.xpriv)
    }

    fn derive_xpub(&self, path: &DerivationPath) -> Result<Xpub, SignerError> {
        let derived = self.xpriv.derive_priv(&self.secp, path)?;
        Ok(Xpub::from_priv(&self.secp, &derived))
    }

    fn sign_transaction(
        &self,
        tx: &mut Transaction,
        inputs: &[InputSigningInfo],
    ) -> Result<(), SignerError> {
        if inputs.len() != tx.input.len() {
            return Err(SignerError::InputsMismatch);
        }

        let satisfactions = {
            let mut cache = SighashCache::new(&*tx);
            inputs
                .iter()
                .enumerate()
                .map(|(index, info)| self.sign_input(&mut cache, index, info))
                .collect::<Result<Vec<_>, _>>()?
        };

        for (txin, (script_sig, witness)) in tx.input.iter_mut().zip(satisfactions) {
            txin.script_sig = script_sig;
            txin.witness = witness;
        }

        Ok(())
    }
}
