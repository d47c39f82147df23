// Copyright © 2025 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Host-side primitive interfaces the manager drives. The Linux
//! implementations live in [`crate::sysfs`] and [`crate::netdev`]; tests
//! substitute in-memory fakes.

use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::address::PciAddress;
use crate::config::Dot1QbhPort;
use crate::device::{PciOriginalState, StubDriver};
use crate::mac::MacAddr;

/// Failures reported by the primitive layer, by kind rather than by
/// pre-rendered message. Callers wrap these with device context.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device or attribute not found")]
    NotFound,
    #[error("operation not supported by this device")]
    Unsupported,
    #[error("failed to parse host data: {0}")]
    Parse(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Saved host-side network state of one SR-IOV Virtual Function.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VfNetConfig {
    pub mac: MacAddr,
    pub vlan: u16,
}

/// Kernel-level operations on one PCI device.
///
/// Implementations must not consult the manager's registries; the policy
/// checks that need them live in the device facade, which receives the
/// registries by reference.
pub trait PciPrimitives: Send + Sync {
    fn device_exists(&self, address: &PciAddress) -> bool;

    /// Name of the driver currently bound, `None` when unbound.
    fn current_driver(&self, address: &PciAddress) -> Result<Option<String>, DeviceError>;

    /// Binds the device to the given stub driver and reports what has to be
    /// undone to restore the previous binding.
    fn bind_to_stub(
        &self,
        address: &PciAddress,
        stub: StubDriver,
    ) -> Result<PciOriginalState, DeviceError>;

    /// Undoes [`PciPrimitives::bind_to_stub`] according to the captured
    /// state, reprobing host drivers where the state asks for it.
    fn unbind_from_stub(
        &self,
        address: &PciAddress,
        stub: StubDriver,
        state: &PciOriginalState,
    ) -> Result<(), DeviceError>;

    /// Function-level or slot-level reset of the device.
    fn reset(&self, address: &PciAddress) -> Result<(), DeviceError>;

    /// Whether the device sits in an IOMMU group that can be handed to a
    /// guest. Strict mode additionally requires ACS isolation of every
    /// other function in the group.
    fn is_isolated(&self, address: &PciAddress, strict_acs: bool) -> Result<bool, DeviceError>;

    fn is_virtual_function(&self, address: &PciAddress) -> Result<bool, DeviceError>;

    /// For an SR-IOV VF, the parent PF netdev name and the VF index.
    fn vf_info(&self, address: &PciAddress) -> Result<(String, u32), DeviceError>;

    /// Netdev name of the device itself, when it is a network function.
    fn net_name(&self, address: &PciAddress) -> Result<String, DeviceError>;

    /// Whether a kernel claimant matching `tag` still holds resources of
    /// the device. One poll, no waiting.
    fn cleanup_pending(&self, address: &PciAddress, tag: &str) -> bool;
}

/// Host network configuration operations for SR-IOV Virtual Functions.
pub trait NetPrimitives: Send + Sync {
    /// Saves the current MAC/VLAN of the VF into `state_dir`, then applies
    /// the guest-requested values.
    fn replace_net_config(
        &self,
        linkdev: &str,
        vf: u32,
        mac: &MacAddr,
        vlan_id: u16,
        state_dir: &Path,
    ) -> Result<(), DeviceError>;

    /// Reads the state saved by `replace_net_config` from `state_dir` and
    /// pushes it back to the VF. [`DeviceError::Io`] with
    /// `ErrorKind::NotFound` signals a missing save file.
    fn restore_net_config(
        &self,
        linkdev: &str,
        vf: u32,
        state_dir: &Path,
    ) -> Result<(), DeviceError>;

    fn associate_port_profile(
        &self,
        linkdev: &str,
        vf: u32,
        profile: &Dot1QbhPort,
        mac: &MacAddr,
        instance_uuid: &Uuid,
    ) -> Result<(), DeviceError>;

    fn disassociate_port_profile(
        &self,
        linkdev: &str,
        vf: u32,
        profile: &Dot1QbhPort,
        mac: &MacAddr,
    ) -> Result<(), DeviceError>;
}
