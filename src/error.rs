// Copyright © 2025 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::address::PciAddress;
use crate::primitives::DeviceError;

/// Coarse error classes exposed to callers that do not care about the
/// precise failure, only about how to react to it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// The requested operation is not valid in the current device state.
    OperationInvalid,
    /// The host kernel or filesystem rejected the operation.
    OperationFailed,
    /// The device configuration asks for something this manager does not
    /// implement.
    ConfigUnsupported,
    /// An internal invariant was violated.
    Internal,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("PCI device {0} not found")]
    DeviceNotFound(PciAddress),

    #[error("PCI device {0} is not assignable")]
    NotAssignable(PciAddress),

    #[error("PCI device {address} is in use by driver {driver}, domain {domain}")]
    InUseByDomain {
        address: PciAddress,
        driver: String,
        domain: String,
    },

    #[error("PCI device {0} is already in use")]
    InUse(PciAddress),

    #[error("device {0} is already in list")]
    AlreadyInList(String),

    #[error("not detaching active device {0}")]
    DetachActiveDevice(PciAddress),

    #[error("not resetting active device {0}")]
    ResetActiveDevice(PciAddress),

    #[error("not reattaching active device {0}")]
    ReattachActiveDevice(PciAddress),

    #[error("active device {sibling} shares the reset scope of {address}, not resetting")]
    ResetSharedBus {
        address: PciAddress,
        sibling: PciAddress,
    },

    #[error("failed to detach PCI device {address}")]
    Detach {
        address: PciAddress,
        #[source]
        source: DeviceError,
    },

    #[error("failed to reset PCI device {address}")]
    Reset {
        address: PciAddress,
        #[source]
        source: DeviceError,
    },

    #[error("failed to re-attach PCI device {address}")]
    Reattach {
        address: PciAddress,
        #[source]
        source: DeviceError,
    },

    #[error("failed to query SR-IOV info of PCI device {address}")]
    VfIntrospection {
        address: PciAddress,
        #[source]
        source: DeviceError,
    },

    #[error("failed to create state dir '{path}'")]
    CreateStateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("virtualport type {0} is currently not supported on interfaces of type hostdev")]
    UnsupportedVirtPortType(&'static str),

    #[error("direct setting of the vlan tag is not allowed for hostdev devices using {0} mode")]
    VlanWithVirtPort(&'static str),

    #[error("vlan trunking is not supported by SR-IOV network devices")]
    VlanTrunking,

    #[error("vlan can only be set for SR-IOV VFs, but {0} is not a VF")]
    VlanOnNonVf(String),

    #[error("interface type hostdev is currently supported on SR-IOV Virtual Functions only")]
    NotVirtualFunction,

    #[error("failed to replace net config of VF {vf} on {linkdev}")]
    ReplaceNetConfig {
        linkdev: String,
        vf: u32,
        #[source]
        source: DeviceError,
    },

    #[error("failed to restore net config of VF {vf} on {linkdev}")]
    RestoreNetConfig {
        linkdev: String,
        vf: u32,
        #[source]
        source: DeviceError,
    },

    #[error("failed to associate port profile of VF {vf} on {linkdev}")]
    AssociatePortProfile {
        linkdev: String,
        vf: u32,
        #[source]
        source: DeviceError,
    },

    #[error("failed to disassociate port profile of VF {vf} on {linkdev}")]
    DisassociatePortProfile {
        linkdev: String,
        vf: u32,
        #[source]
        source: DeviceError,
    },

    #[error("USB device {name} is in use by driver {driver}, domain {domain}")]
    UsbInUse {
        name: String,
        driver: String,
        domain: String,
    },

    #[error("SCSI device {name} is in use by driver {driver}, domain {domain}")]
    ScsiInUse {
        name: String,
        driver: String,
        domain: String,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotAssignable(_)
            | Error::InUseByDomain { .. }
            | Error::InUse(_)
            | Error::AlreadyInList(_)
            | Error::DetachActiveDevice(_)
            | Error::ResetActiveDevice(_)
            | Error::ReattachActiveDevice(_)
            | Error::ResetSharedBus { .. }
            | Error::UsbInUse { .. }
            | Error::ScsiInUse { .. } => ErrorKind::OperationInvalid,

            Error::DeviceNotFound(_)
            | Error::Detach { .. }
            | Error::Reset { .. }
            | Error::Reattach { .. }
            | Error::VfIntrospection { .. }
            | Error::CreateStateDir { .. }
            | Error::ReplaceNetConfig { .. }
            | Error::RestoreNetConfig { .. }
            | Error::AssociatePortProfile { .. }
            | Error::DisassociatePortProfile { .. } => ErrorKind::OperationFailed,

            Error::UnsupportedVirtPortType(_)
            | Error::VlanWithVirtPort(_)
            | Error::VlanTrunking
            | Error::VlanOnNonVf(_)
            | Error::NotVirtualFunction => ErrorKind::ConfigUnsupported,

            Error::Internal(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
