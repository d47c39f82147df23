// Copyright © 2025 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Save/replace/restore of the host-side network state of SR-IOV Virtual
//! Functions that were defined through `<interface type='hostdev'>`.

use std::path::Path;

use uuid::Uuid;

use crate::address::PciAddress;
use crate::config::{HostdevDef, VirtPortProfile};
use crate::error::{Error, Result};
use crate::mac::MacAddr;
use crate::primitives::{NetPrimitives, PciPrimitives};

enum PortProfileOp<'a> {
    Associate(&'a Uuid),
    Disassociate,
}

/// PF netdev name and VF index of an SR-IOV VF, or the device's own netdev
/// name for a plain network function.
fn device_net_info(
    pci: &dyn PciPrimitives,
    address: &PciAddress,
) -> Result<(String, Option<u32>)> {
    let wrap = |source| Error::VfIntrospection {
        address: *address,
        source,
    };
    if pci.is_virtual_function(address).map_err(wrap)? {
        let (linkdev, vf) = pci.vf_info(address).map_err(wrap)?;
        Ok((linkdev, Some(vf)))
    } else {
        let linkdev = pci.net_name(address).map_err(wrap)?;
        Ok((linkdev, None))
    }
}

/// Runs the port-profile exchange for the one supported profile type.
/// The matrix over profile types stays exhaustive so that adding a variant
/// forces a decision here.
fn virt_port_op(
    net: &dyn NetPrimitives,
    linkdev: &str,
    vf: u32,
    profile: &VirtPortProfile,
    mac: &MacAddr,
    op: PortProfileOp,
) -> Result<()> {
    match profile {
        VirtPortProfile::OpenVSwitch(_)
        | VirtPortProfile::Dot1Qbg(_)
        | VirtPortProfile::Midonet(_) => {
            Err(Error::UnsupportedVirtPortType(profile.type_name()))
        }
        VirtPortProfile::Dot1Qbh(port) => match op {
            PortProfileOp::Associate(instance_uuid) => net
                .associate_port_profile(linkdev, vf, port, mac, instance_uuid)
                .map_err(|source| Error::AssociatePortProfile {
                    linkdev: linkdev.to_string(),
                    vf,
                    source,
                }),
            PortProfileOp::Disassociate => net
                .disassociate_port_profile(linkdev, vf, port, mac)
                .map_err(|source| Error::DisassociatePortProfile {
                    linkdev: linkdev.to_string(),
                    vf,
                    source,
                }),
        },
    }
}

/// Saves the current host-side MAC/VLAN of the hostdev's VF and applies the
/// guest-requested configuration, or associates the port profile when the
/// interface carries one. Hostdevs without a network parent are not ours to
/// touch.
pub(crate) fn replace(
    pci: &dyn PciPrimitives,
    net: &dyn NetPrimitives,
    hostdev: &HostdevDef,
    domain_uuid: &Uuid,
    state_dir: &Path,
) -> Result<()> {
    let Some(address) = hostdev.pci_address() else {
        return Ok(());
    };
    let Some(parent) = &hostdev.net_parent else {
        return Ok(());
    };

    if !pci.is_virtual_function(&address).unwrap_or(false) {
        return Err(Error::NotVirtualFunction);
    }
    let (linkdev, vf) = device_net_info(pci, &address)?;

    match &parent.virt_port {
        Some(profile) => {
            if parent.vlan.is_some() {
                return Err(Error::VlanWithVirtPort(profile.type_name()));
            }
            let Some(vf) = vf else {
                return Err(Error::NotVirtualFunction);
            };
            virt_port_op(
                net,
                &linkdev,
                vf,
                profile,
                &parent.mac,
                PortProfileOp::Associate(domain_uuid),
            )
        }
        None => {
            let vlan_id = match &parent.vlan {
                Some(vlan) => {
                    if vlan.tags.len() != 1 || vlan.trunk {
                        return Err(Error::VlanTrunking);
                    }
                    if vf.is_none() {
                        return Err(Error::VlanOnNonVf(linkdev));
                    }
                    vlan.tags[0]
                }
                // Clear whatever tag the VF carries from its last user.
                None => 0,
            };
            let Some(vf) = vf else {
                return Err(Error::NotVirtualFunction);
            };
            net.replace_net_config(&linkdev, vf, &parent.mac, vlan_id, state_dir)
                .map_err(|source| Error::ReplaceNetConfig {
                    linkdev: linkdev.clone(),
                    vf,
                    source,
                })
        }
    }
}

/// Puts the VF's host-side network state back: disassociates the port
/// profile when one was used, otherwise replays the state saved at replace
/// time, consulting `legacy_state_dir` when the manager's own state
/// directory has no save file (upgrade compatibility).
pub(crate) fn restore(
    pci: &dyn PciPrimitives,
    net: &dyn NetPrimitives,
    hostdev: &HostdevDef,
    state_dir: &Path,
    legacy_state_dir: Option<&Path>,
) -> Result<()> {
    let Some(address) = hostdev.pci_address() else {
        return Ok(());
    };
    let Some(parent) = &hostdev.net_parent else {
        return Ok(());
    };

    if !pci.is_virtual_function(&address).unwrap_or(false) {
        return Err(Error::NotVirtualFunction);
    }
    let (linkdev, vf) = device_net_info(pci, &address)?;
    let Some(vf) = vf else {
        return Err(Error::NotVirtualFunction);
    };

    match &parent.virt_port {
        Some(profile) => virt_port_op(
            net,
            &linkdev,
            vf,
            profile,
            &parent.mac,
            PortProfileOp::Disassociate,
        ),
        None => net
            .restore_net_config(&linkdev, vf, state_dir)
            .or_else(|primary_err| match legacy_state_dir {
                Some(legacy) => net.restore_net_config(&linkdev, vf, legacy),
                None => Err(primary_err),
            })
            .map_err(|source| Error::RestoreNetConfig {
                linkdev: linkdev.clone(),
                vf,
                source,
            }),
    }
}
