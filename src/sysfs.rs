// Copyright © 2025 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Linux implementation of the PCI device primitives over `/sys/bus/pci`.
//!
//! Driver moves use the `driver_override` mechanism: write the wanted
//! driver name into the device's `driver_override` attribute, unbind the
//! current driver and let `drivers_probe` pick the override up. The roots
//! are injectable so tests can run against a fabricated tree.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::address::PciAddress;
use crate::device::{PciOriginalState, StubDriver};
use crate::primitives::{DeviceError, PciPrimitives};

const PCI_SYSFS_ROOT: &str = "/sys/bus/pci";
const IOMEM_PATH: &str = "/proc/iomem";

pub struct SysfsPciPrimitives {
    devices_dir: PathBuf,
    drivers_dir: PathBuf,
    probe_path: PathBuf,
    rescan_path: PathBuf,
    iomem_path: PathBuf,
}

impl Default for SysfsPciPrimitives {
    fn default() -> Self {
        SysfsPciPrimitives::with_roots(Path::new(PCI_SYSFS_ROOT), Path::new(IOMEM_PATH))
    }
}

impl SysfsPciPrimitives {
    pub fn new() -> Self {
        Default::default()
    }

    /// Backend rooted somewhere other than the live `/sys/bus/pci`.
    pub fn with_roots(pci_root: &Path, iomem: &Path) -> Self {
        SysfsPciPrimitives {
            devices_dir: pci_root.join("devices"),
            drivers_dir: pci_root.join("drivers"),
            probe_path: pci_root.join("drivers_probe"),
            rescan_path: pci_root.join("rescan"),
            iomem_path: iomem.to_path_buf(),
        }
    }

    fn device_dir(&self, address: &PciAddress) -> PathBuf {
        self.devices_dir.join(address.to_string())
    }

    fn driver_link_name(device_dir: &Path) -> Result<Option<String>, DeviceError> {
        match fs::read_link(device_dir.join("driver")) {
            Ok(target) => {
                let name = target
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(String::from)
                    .ok_or_else(|| {
                        DeviceError::Parse(format!("driver link '{}' has no name", target.display()))
                    })?;
                Ok(Some(name))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn first_net_name(net_dir: &Path) -> Result<String, DeviceError> {
        let mut names: Vec<String> = match fs::read_dir(net_dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().to_str().map(String::from))
                .collect(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(DeviceError::NotFound),
            Err(e) => return Err(e.into()),
        };
        names.sort();
        names.into_iter().next().ok_or(DeviceError::NotFound)
    }
}

impl PciPrimitives for SysfsPciPrimitives {
    fn device_exists(&self, address: &PciAddress) -> bool {
        self.device_dir(address).is_dir()
    }

    fn current_driver(&self, address: &PciAddress) -> Result<Option<String>, DeviceError> {
        Self::driver_link_name(&self.device_dir(address))
    }

    fn bind_to_stub(
        &self,
        address: &PciAddress,
        stub: StubDriver,
    ) -> Result<PciOriginalState, DeviceError> {
        let device_dir = self.device_dir(address);
        let current = Self::driver_link_name(&device_dir)?;

        // Already sitting on the stub, e.g. pre-prepared by the admin.
        // Nothing to undo later.
        if current.as_deref() == Some(stub.name()) {
            return Ok(PciOriginalState::default());
        }

        fs::write(device_dir.join("driver_override"), stub.name())?;
        if current.is_some() {
            fs::write(device_dir.join("driver/unbind"), address.to_string())?;
        }
        fs::write(&self.probe_path, address.to_string())?;

        Ok(PciOriginalState {
            unbind_from_stub: true,
            remove_slot: false,
            reprobe: current.is_some(),
        })
    }

    fn unbind_from_stub(
        &self,
        address: &PciAddress,
        stub: StubDriver,
        state: &PciOriginalState,
    ) -> Result<(), DeviceError> {
        let device_dir = self.device_dir(address);

        // Handles detached through the legacy new_id flow want the slot
        // removed and rediscovered instead of a plain unbind.
        if state.remove_slot {
            fs::write(device_dir.join("remove"), "1")?;
            fs::write(&self.rescan_path, "1")?;
            return Ok(());
        }

        if state.unbind_from_stub
            && Self::driver_link_name(&device_dir)?.as_deref() == Some(stub.name())
        {
            fs::write(
                self.drivers_dir.join(stub.name()).join("unbind"),
                address.to_string(),
            )?;
        }

        if let Err(e) = fs::write(device_dir.join("driver_override"), "\n") {
            // Kernels without driver_override never saw the override either.
            if e.kind() != io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }

        if state.reprobe {
            fs::write(&self.probe_path, address.to_string())?;
        }
        Ok(())
    }

    fn reset(&self, address: &PciAddress) -> Result<(), DeviceError> {
        let reset_path = self.device_dir(address).join("reset");
        if !reset_path.exists() {
            return Err(DeviceError::Unsupported);
        }
        fs::write(reset_path, "1")?;
        Ok(())
    }

    fn is_isolated(&self, address: &PciAddress, strict_acs: bool) -> Result<bool, DeviceError> {
        let group_devices = self.device_dir(address).join("iommu_group/devices");
        if !group_devices.is_dir() {
            // No IOMMU group means no DMA isolation at all.
            return Ok(false);
        }
        if !strict_acs {
            return Ok(true);
        }

        let own_name = address.to_string();
        for entry in fs::read_dir(&group_devices).map_err(DeviceError::Io)? {
            let entry = entry.map_err(DeviceError::Io)?;
            let name = entry.file_name();
            if name.to_str() == Some(own_name.as_str()) {
                continue;
            }
            let sibling_dir = self.devices_dir.join(&name);
            match Self::driver_link_name(&sibling_dir)?.as_deref() {
                None | Some("vfio-pci") | Some("pci-stub") => continue,
                Some(_) => return Ok(false),
            }
        }
        Ok(true)
    }

    fn is_virtual_function(&self, address: &PciAddress) -> Result<bool, DeviceError> {
        match fs::symlink_metadata(self.device_dir(address).join("physfn")) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn vf_info(&self, address: &PciAddress) -> Result<(String, u32), DeviceError> {
        let physfn = match fs::read_link(self.device_dir(address).join("physfn")) {
            Ok(target) => target,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(DeviceError::NotFound),
            Err(e) => return Err(e.into()),
        };
        let pf_name = physfn
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from)
            .ok_or_else(|| {
                DeviceError::Parse(format!("physfn link '{}' has no name", physfn.display()))
            })?;
        let pf_dir = self.devices_dir.join(&pf_name);

        let own_name = address.to_string();
        let mut vf_index = None;
        for entry in fs::read_dir(&pf_dir).map_err(DeviceError::Io)? {
            let entry = entry.map_err(DeviceError::Io)?;
            let name = entry.file_name();
            let Some(index) = name
                .to_str()
                .and_then(|n| n.strip_prefix("virtfn"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            let target = fs::read_link(entry.path())?;
            if target.file_name().and_then(|n| n.to_str()) == Some(own_name.as_str()) {
                vf_index = Some(index);
                break;
            }
        }
        let vf_index = vf_index.ok_or(DeviceError::NotFound)?;

        let pf_netdev = Self::first_net_name(&pf_dir.join("net"))?;
        Ok((pf_netdev, vf_index))
    }

    fn net_name(&self, address: &PciAddress) -> Result<String, DeviceError> {
        Self::first_net_name(&self.device_dir(address).join("net"))
    }

    fn cleanup_pending(&self, address: &PciAddress, tag: &str) -> bool {
        let Ok(resource) = fs::read_to_string(self.device_dir(address).join("resource")) else {
            return false;
        };
        let ranges = parse_resource_ranges(&resource);
        if ranges.is_empty() {
            return false;
        }
        let Ok(iomem) = fs::read_to_string(&self.iomem_path) else {
            return false;
        };
        iomem_claims(&iomem, &ranges, tag)
    }
}

/// Parses the sysfs `resource` attribute: one `start end flags` hex triple
/// per line, all-zero lines marking unused BARs.
fn parse_resource_ranges(resource: &str) -> Vec<(u64, u64)> {
    let mut ranges = Vec::new();
    for line in resource.lines() {
        let mut fields = line.split_whitespace().map(|f| {
            u64::from_str_radix(f.trim_start_matches("0x"), 16).unwrap_or(0)
        });
        let (Some(start), Some(end)) = (fields.next(), fields.next()) else {
            continue;
        };
        if start == 0 && end == 0 {
            continue;
        }
        ranges.push((start, end));
    }
    ranges
}

/// Whether `/proc/iomem` lists a claimant whose name contains `tag` inside
/// any of the given resource ranges.
fn iomem_claims(iomem: &str, ranges: &[(u64, u64)], tag: &str) -> bool {
    for line in iomem.lines() {
        let Some((span, name)) = line.split_once(':') else {
            continue;
        };
        if !name.contains(tag) {
            continue;
        }
        let Some((start, end)) = span.trim().split_once('-') else {
            continue;
        };
        let (Ok(start), Ok(end)) = (
            u64::from_str_radix(start.trim(), 16),
            u64::from_str_radix(end.trim(), 16),
        ) else {
            continue;
        };
        if ranges.iter().any(|(s, e)| start <= *e && end >= *s) {
            return true;
        }
    }
    false
}
