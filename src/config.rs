// Copyright © 2025 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Host device definitions handed in by the domain-definition layer.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::PciAddress;
use crate::device::PciOriginalState;
use crate::mac::MacAddr;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum HostdevMode {
    Subsystem,
    Capabilities,
}

/// Which backend owns the device while it is assigned. VFIO gets the
/// `vfio-pci` stub, everything else the legacy `pci-stub`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum PciHostdevBackend {
    Default,
    Kvm,
    Vfio,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PciHostdevSource {
    pub address: PciAddress,
    pub backend: PciHostdevBackend,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct UsbHostdevSource {
    pub bus: u32,
    pub device: u32,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ScsiHostdevSource {
    pub adapter: String,
    pub bus: u32,
    pub target: u32,
    pub unit: u64,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum HostdevSource {
    Pci(PciHostdevSource),
    Usb(UsbHostdevSource),
    Scsi(ScsiHostdevSource),
}

/// Guest-requested VLAN configuration of a network interface.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct NetVlan {
    pub tags: Vec<u16>,
    pub trunk: bool,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct OpenVSwitchPort {
    pub interface_id: Uuid,
    pub profile_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Dot1QbgPort {
    pub manager_id: u8,
    pub type_id: u32,
    pub type_id_version: u8,
    pub instance_id: Uuid,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Dot1QbhPort {
    pub profile_id: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MidonetPort {
    pub interface_id: Uuid,
}

/// Port profile negotiated with the upstream switch for a passed-through
/// network interface. Only the 802.1Qbh variant is implemented; the matrix
/// is kept exhaustive so new variants fail loudly rather than silently.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum VirtPortProfile {
    OpenVSwitch(OpenVSwitchPort),
    Dot1Qbg(Dot1QbgPort),
    Dot1Qbh(Dot1QbhPort),
    Midonet(MidonetPort),
}

impl VirtPortProfile {
    pub fn type_name(&self) -> &'static str {
        match self {
            VirtPortProfile::OpenVSwitch(_) => "openvswitch",
            VirtPortProfile::Dot1Qbg(_) => "802.1Qbg",
            VirtPortProfile::Dot1Qbh(_) => "802.1Qbh",
            VirtPortProfile::Midonet(_) => "midonet",
        }
    }
}

/// The `<interface type='hostdev'>` parent of a PCI hostdev, when the
/// device was defined through a network interface rather than directly.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NetInterfaceParent {
    pub mac: MacAddr,
    pub vlan: Option<NetVlan>,
    pub virt_port: Option<VirtPortProfile>,
}

/// One host device requested by a domain definition.
///
/// `original_state` is an output: a successful PCI prepare writes the
/// kernel state captured at detach time back here so the caller can
/// persist it alongside the domain.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct HostdevDef {
    pub mode: HostdevMode,
    pub source: HostdevSource,
    pub managed: bool,
    pub net_parent: Option<NetInterfaceParent>,
    pub original_state: Option<PciOriginalState>,
}

impl HostdevDef {
    pub fn pci(address: PciAddress, backend: PciHostdevBackend, managed: bool) -> Self {
        HostdevDef {
            mode: HostdevMode::Subsystem,
            source: HostdevSource::Pci(PciHostdevSource { address, backend }),
            managed,
            net_parent: None,
            original_state: None,
        }
    }

    /// The PCI source of this hostdev, or `None` for anything that is not a
    /// PCI subsystem device. The PCI pipelines skip those entries.
    pub fn pci_source(&self) -> Option<&PciHostdevSource> {
        if self.mode != HostdevMode::Subsystem {
            return None;
        }
        match &self.source {
            HostdevSource::Pci(src) => Some(src),
            _ => None,
        }
    }

    pub fn pci_address(&self) -> Option<PciAddress> {
        self.pci_source().map(|src| src.address)
    }

    pub fn usb_source(&self) -> Option<&UsbHostdevSource> {
        if self.mode != HostdevMode::Subsystem {
            return None;
        }
        match &self.source {
            HostdevSource::Usb(src) => Some(src),
            _ => None,
        }
    }

    pub fn scsi_source(&self) -> Option<&ScsiHostdevSource> {
        if self.mode != HostdevMode::Subsystem {
            return None;
        }
        match &self.source {
            HostdevSource::Scsi(src) => Some(src),
            _ => None,
        }
    }
}

/// Behavior toggles for `prepare_pci_devices`.
#[derive(Clone, Copy, Debug, Default)]
pub struct PrepareFlags {
    /// Require full ACS isolation of the IOMMU group instead of the weaker
    /// default check.
    pub strict_acs_check: bool,
}
