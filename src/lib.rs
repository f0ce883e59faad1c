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

// only enables the `doc_cfg` feature when
// the `docsrs` configuration attribute is defined
#![cfg_attr(docsrs, feature(doc_cfg))]

//! A BIP44 hierarchical deterministic wallet engine.
//!
//! The crate keeps the accounting of an HD wallet: it derives the addresses of its accounts
//! (BIP44, BIP49 and BIP84), tracks the outputs paying them through a small state machine, funds
//! and signs transactions with a choice of coin selection algorithms, and accelerates pending
//! transactions with replace-by-fee or child-pays-for-parent.
//!
//! Everything that talks to the outside world is a trait the caller provides:
//!
//! * [`blockchain::ChainQuery`] answers questions about the best chain;
//! * [`blockchain::NodeApi`] relays transactions;
//! * [`blockchain::FeeRateApi`] estimates fee rates;
//! * [`signer::KeyManager`] holds the keys, [`signer::Bip32KeyManager`] keeps a master key in
//!   memory;
//! * [`database::BatchDatabase`] stores the ledger, [`database::MemoryDatabase`] keeps it in
//!   memory.
//!
//! ## Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use hdwallet::*;
//! # use hdwallet::blockchain::*;
//! # use hdwallet::database::MemoryDatabase;
//! # use hdwallet::signer::Bip32KeyManager;
//! # async fn run(chain: Arc<dyn ChainQuery>, node: Arc<dyn NodeApi>) -> Result<(), Error> {
//! let config = WalletConfig::default();
//! let keys = Bip32KeyManager::new(config.network, &[42; 32])?;
//! let wallet = Wallet::new(
//!     config,
//!     MemoryDatabase::default(),
//!     Arc::new(keys),
//!     chain,
//!     node,
//!     Arc::new(StaticFeeRate(FeeRate::from_sat_per_vb(2.0))),
//! )
//! .await?;
//!
//! println!("Address #0: {}", wallet.get_new_address().await?);
//! # Ok(())
//! # }
//! ```

pub extern crate bitcoin;

#[macro_use]
pub(crate) mod error;
pub mod blockchain;
pub mod config;
pub mod database;
pub(crate) mod types;
pub mod wallet;

pub use config::WalletConfig;
pub use error::Error;
pub use types::*;
pub use wallet::signer;
pub use wallet::tx_builder::TxBuilder;
pub use wallet::Wallet;
