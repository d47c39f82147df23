// Copyright © 2025 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fmt;
use std::str::FromStr;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const MAC_ADDR_LEN: usize = 6;

#[derive(Debug, Error)]
#[error("failed to parse '{0}' as a MAC address")]
pub struct MacParseError(String);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MacAddr {
    bytes: [u8; MAC_ADDR_LEN],
}

impl MacAddr {
    pub fn new(bytes: [u8; MAC_ADDR_LEN]) -> Self {
        MacAddr { bytes }
    }

    pub fn from_bytes(src: &[u8]) -> Result<MacAddr, MacParseError> {
        if src.len() != MAC_ADDR_LEN {
            return Err(MacParseError(format!("{src:02x?}")));
        }
        let mut bytes = [0u8; MAC_ADDR_LEN];
        bytes.copy_from_slice(src);
        Ok(MacAddr { bytes })
    }

    pub fn get_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl FromStr for MacAddr {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || MacParseError(s.to_string());

        let mut bytes = [0u8; MAC_ADDR_LEN];
        let mut octets = s.split(':');
        for byte in bytes.iter_mut() {
            let octet = octets.next().ok_or_else(err)?;
            if octet.len() != 2 {
                return Err(err());
            }
            *byte = u8::from_str_radix(octet, 16).map_err(|_| err())?;
        }
        if octets.next().is_some() {
            return Err(err());
        }

        Ok(MacAddr { bytes })
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let b = &self.bytes;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl Serialize for MacAddr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D>(deserializer: D) -> Result<MacAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(DeError::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let mac: MacAddr = "12:34:56:78:9a:BC".parse().unwrap();
        assert_eq!(mac.get_bytes(), [0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc]);
        assert_eq!(mac.to_string(), "12:34:56:78:9a:bc");

        // wrong component counts and widths
        assert!("aa:aa:aa:aa:aa".parse::<MacAddr>().is_err());
        assert!("aa:aa:aa:aa:aa:aa:aa".parse::<MacAddr>().is_err());
        assert!("aa:aa:aa:aa:aa:b".parse::<MacAddr>().is_err());
        assert!("aa:aa:aa:aa:aa:bbb".parse::<MacAddr>().is_err());
        assert!("aa:aa:aa:aa:aa:ax".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_from_bytes() {
        assert!(MacAddr::from_bytes(&[1, 2, 3, 4, 5]).is_err());
        let mac = MacAddr::from_bytes(&[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(mac.to_string(), "01:02:03:04:05:06");
    }

    #[test]
    fn test_serde_round_trip() {
        let mac: MacAddr = serde_json::from_str("\"52:54:00:12:34:56\"").unwrap();
        assert_eq!(serde_json::to_string(&mac).unwrap(), "\"52:54:00:12:34:56\"");
    }
}
