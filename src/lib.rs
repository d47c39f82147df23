// Copyright © 2025 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Host device assignment management.
//!
//! Tracks which physical host devices (PCI, USB, SCSI) are owned by which
//! guest, and drives the kernel-level work needed to move a PCI device
//! between the host and a guest: stub-driver rebinding, device reset and
//! SR-IOV VF network reconfiguration. The PCI flows are transactional; a
//! failed prepare leaves the host as if the call never happened.
//!
//! The registries live in a process-wide [`HostdevManager`], obtained with
//! [`HostdevManager::get_default`]. Tests and embedders needing isolation
//! construct their own manager over explicit backends.

mod address;
mod config;
mod device;
mod error;
#[cfg(test)]
mod fake;
mod mac;
mod manager;
mod netdev;
mod netvf;
mod primitives;
mod set;
mod sysfs;

pub use self::address::{PciAddress, PciAddressParseError};
pub use self::config::{
    Dot1QbgPort, Dot1QbhPort, HostdevDef, HostdevMode, HostdevSource, MidonetPort,
    NetInterfaceParent, NetVlan, OpenVSwitchPort, PciHostdevBackend, PciHostdevSource,
    PrepareFlags, ScsiHostdevSource, UsbHostdevSource, VirtPortProfile,
};
pub use self::device::{
    DeviceOwner, PciHostDevice, PciOriginalState, ScsiHostDevice, StubDriver, UsbHostDevice,
};
pub use self::error::{Error, ErrorKind, Result};
pub use self::mac::{MacAddr, MacParseError, MAC_ADDR_LEN};
pub use self::manager::HostdevManager;
pub use self::netdev::IpLinkNetPrimitives;
pub use self::primitives::{DeviceError, NetPrimitives, PciPrimitives, VfNetConfig};
pub use self::set::{DeviceKey, DeviceSet};
pub use self::sysfs::SysfsPciPrimitives;
