// Copyright © 2025 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fmt;
use std::str::FromStr;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("failed to parse '{0}' as a PCI address")]
pub struct PciAddressParseError(String);

/// Address of one PCI function, the identity of an assignable device.
///
/// Orders lexicographically by (domain, bus, slot, function), which matches
/// the ordering of the canonical `dddd:bb:ss.f` text form.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PciAddress {
    pub domain: u32,
    pub bus: u32,
    pub slot: u32,
    pub function: u32,
}

impl PciAddress {
    pub fn new(domain: u32, bus: u32, slot: u32, function: u32) -> Self {
        PciAddress {
            domain,
            bus,
            slot,
            function,
        }
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.slot, self.function
        )
    }
}

impl FromStr for PciAddress {
    type Err = PciAddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || PciAddressParseError(s.to_string());

        let (domain, rest) = s.split_once(':').ok_or_else(err)?;
        let (bus, rest) = rest.split_once(':').ok_or_else(err)?;
        let (slot, function) = rest.split_once('.').ok_or_else(err)?;

        Ok(PciAddress {
            domain: u32::from_str_radix(domain, 16).map_err(|_| err())?,
            bus: u32::from_str_radix(bus, 16).map_err(|_| err())?,
            slot: u32::from_str_radix(slot, 16).map_err(|_| err())?,
            function: u32::from_str_radix(function, 16).map_err(|_| err())?,
        })
    }
}

impl Serialize for PciAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PciAddress {
    fn deserialize<D>(deserializer: D) -> Result<PciAddress, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(DeError::custom)
    }
}
