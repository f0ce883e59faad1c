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

//! Wallet configuration
//!
//! Every field has a default, so a partial JSON document is enough:
//!
//! ```
//! # use hdwallet::WalletConfig;
//! let config = WalletConfig::from_json(r#"{ "network": "testnet", "gap_limit": 50 }"#)?;
//! assert_eq!(config.gap_limit, 50);
//! assert_eq!(config.required_confirmations, 6);
//! # Ok::<(), hdwallet::Error>(())
//! ```

use std::time::Duration;

use bitcoin::Network;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::{FeeRate, HdPurpose};

/// Configuration of a [`Wallet`](crate::wallet::Wallet)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct WalletConfig {
    /// Network the wallet lives on
    pub network: Network,
    /// Purpose of the account created with the wallet
    pub default_purpose: HdPurpose,
    /// Maximum number of consecutive unused addresses at the end of a chain
    pub gap_limit: u32,
    /// Number of addresses derived per round during discovery
    pub discovery_batch_size: u32,
    /// Depth a spending transaction must reach before its inputs are considered spent for good
    pub required_confirmations: u32,
    /// Capacity of the address request queue
    pub address_queue_size: usize,
    /// Seconds an address request can wait before failing
    pub address_request_timeout_secs: u64,
    /// Seconds between two rebroadcasts of the pending transactions
    pub rebroadcast_interval_secs: u64,
    /// Fee rate used when none is given and the fee oracle fails
    pub fee_rate_fallback: Option<FeeRate>,
}

impl Default for WalletConfig {
    fn default() -> Self {
        WalletConfig {
            network: Network::Regtest,
            default_purpose: HdPurpose::Segwit,
            gap_limit: 20,
            discovery_batch_size: 100,
            required_confirmations: 6,
            address_queue_size: 100,
            address_request_timeout_secs: 5,
            rebroadcast_interval_secs: 4 * 60 * 60,
            fee_rate_fallback: None,
        }
    }
}

impl WalletConfig {
    /// Parse a configuration from a JSON document, then validate it
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config: WalletConfig = serde_json::from_str(json)?;
        config.validate()?;

        Ok(config)
    }

    /// Check that every bound is usable
    pub fn validate(&self) -> Result<(), Error> {
        let zero = [
            ("gap_limit", self.gap_limit == 0),
            ("discovery_batch_size", self.discovery_batch_size == 0),
            ("required_confirmations", self.required_confirmations == 0),
            ("address_queue_size", self.address_queue_size == 0),
            (
                "address_request_timeout_secs",
                self.address_request_timeout_secs == 0,
            ),
            (
                "rebroadcast_interval_secs",
                self.rebroadcast_interval_secs == 0,
            ),
        ];
        if let Some((name, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(Error::InvalidConfig(format!("`{}` must be at least 1", name)));
        }
        if let Some(rate) = self.fee_rate_fallback {
            if !rate.is_valid() {
                return Err(Error::InvalidFeeRate(rate));
            }
        }

        Ok(())
    }

    /// Deadline of a single address request
    pub fn address_request_timeout(&self) -> Duration {
        Duration::from_secs(self.address_request_timeout_secs)
    }

    /// Period of the rebroadcast task
    pub fn rebroadcast_interval(&self) -> Duration {
        Duration::from_secs(self.rebroadcast_interval_secs)
    }
}
