// Copyright © 2025 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! The process-wide host device manager and the PCI assignment pipelines.

use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, error, warn};
use once_cell::sync::OnceCell;
use uuid::Uuid;

use crate::address::PciAddress;
use crate::config::{HostdevDef, PciHostdevBackend, PrepareFlags};
use crate::device::{
    DeviceOwner, PciHostDevice, ScsiHostDevice, StubDriver, UsbHostDevice,
};
use crate::error::{Error, Result};
use crate::netdev::IpLinkNetPrimitives;
use crate::netvf;
use crate::primitives::{NetPrimitives, PciPrimitives};
use crate::set::{DeviceKey, DeviceSet};
use crate::sysfs::SysfsPciPrimitives;

const HOSTDEV_STATE_DIR: &str = "/var/run/hostdev-manager/hostdevmgr";

/// Marker left in /proc/iomem by the kvm assignment path while it still
/// holds a device that was bound to pci-stub.
const KVM_CLEANUP_TAG: &str = "kvm_assigned_device";

/// Process-wide owner of the host device registries.
///
/// Holds one registry per device class plus the inactive-PCI registry for
/// devices that are detached from the host but not owned by any guest.
/// Each registry carries its own lock; the PCI pipelines take the active
/// lock before the inactive lock and hold both for the whole operation, so
/// every PCI state transition on the host is serialized.
pub struct HostdevManager {
    active_pci: Mutex<DeviceSet<PciHostDevice>>,
    inactive_pci: Mutex<DeviceSet<PciHostDevice>>,
    active_usb: Mutex<DeviceSet<UsbHostDevice>>,
    active_scsi: Mutex<DeviceSet<ScsiHostDevice>>,
    state_dir: PathBuf,
    pci: Arc<dyn PciPrimitives>,
    net: Arc<dyn NetPrimitives>,
}

enum RollbackFrom {
    Reattach,
    VfRestore,
}

impl HostdevManager {
    /// The shared manager backed by the live host, initialized once per
    /// process and kept for the process lifetime.
    pub fn get_default() -> Result<Arc<HostdevManager>> {
        static DEFAULT: OnceCell<Arc<HostdevManager>> = OnceCell::new();
        DEFAULT
            .get_or_try_init(|| {
                let manager = HostdevManager::new(
                    PathBuf::from(HOSTDEV_STATE_DIR),
                    Arc::new(SysfsPciPrimitives::new()),
                    Arc::new(IpLinkNetPrimitives::new()),
                )?;
                Ok(Arc::new(manager))
            })
            .map(Arc::clone)
    }

    /// A manager over explicit backends and state directory. The state
    /// directory is created if missing.
    pub fn new(
        state_dir: PathBuf,
        pci: Arc<dyn PciPrimitives>,
        net: Arc<dyn NetPrimitives>,
    ) -> Result<Self> {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&state_dir)
            .map_err(|source| Error::CreateStateDir {
                path: state_dir.clone(),
                source,
            })?;
        Ok(HostdevManager {
            active_pci: Mutex::new(DeviceSet::new()),
            inactive_pci: Mutex::new(DeviceSet::new()),
            active_usb: Mutex::new(DeviceSet::new()),
            active_scsi: Mutex::new(DeviceSet::new()),
            state_dir,
            pci,
            net,
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Builds the local working set for a PCI pipeline run: one handle per
    /// PCI hostdev, configured from the hostdev definition. Non-PCI
    /// entries are skipped.
    fn pci_working_set(&self, hostdevs: &[HostdevDef]) -> Result<DeviceSet<PciHostDevice>> {
        let mut devices = DeviceSet::new();
        for hostdev in hostdevs {
            let Some(source) = hostdev.pci_source() else {
                continue;
            };
            let mut device = PciHostDevice::new(self.pci.as_ref(), source.address)?;
            device.set_managed(hostdev.managed);
            device.set_stub_driver(match source.backend {
                PciHostdevBackend::Vfio => StubDriver::VfioPci,
                PciHostdevBackend::Default | PciHostdevBackend::Kvm => StubDriver::PciStub,
            });
            if let Err(duplicate) = devices.add(device) {
                return Err(Error::AlreadyInList(duplicate.address().to_string()));
            }
        }
        Ok(devices)
    }

    /// Transfers ownership of the listed PCI devices from the host to the
    /// given guest: validates, detaches managed devices, resets, applies
    /// VF network config and publishes the devices as active. Either every
    /// device ends up owned by the guest or the host is left as if the
    /// call never happened; rollback failures are logged, not reported.
    ///
    /// On success the kernel state captured at detach time is written back
    /// into each hostdev's `original_state`.
    pub fn prepare_pci_devices(
        &self,
        driver_name: &str,
        domain_name: &str,
        domain_uuid: &Uuid,
        hostdevs: &mut [HostdevDef],
        flags: PrepareFlags,
    ) -> Result<()> {
        if hostdevs.is_empty() {
            return Ok(());
        }

        let mut active = self.active_pci.lock().expect("failed to acquire lock");
        let mut inactive = self.inactive_pci.lock().expect("failed to acquire lock");

        let mut pcidevs = self.pci_working_set(hostdevs)?;

        // Every device must be detached before any of them is reset,
        // because a reset can touch all functions of a slot or bus, and
        // every device must be reset before any is marked active.

        // Validation. Nothing below this loop runs for a request that
        // cannot succeed as a whole.
        for device in pcidevs.iter() {
            if !device.is_assignable(self.pci.as_ref(), flags.strict_acs_check) {
                return Err(Error::NotAssignable(device.address()));
            }
            if let Some(other) = active.find(&device.address()) {
                return Err(match other.used_by() {
                    Some(owner) => Error::InUseByDomain {
                        address: device.address(),
                        driver: owner.driver.clone(),
                        domain: owner.domain.clone(),
                    },
                    None => Error::InUse(device.address()),
                });
            }
        }

        // Index of the last hostdev whose VF config was replaced. The
        // rollback below restores strictly less than this index.
        let mut last_processed_vf: Option<usize> = None;

        let failure: Option<(Error, RollbackFrom)> = 'transaction: {
            // Detach managed devices, binding them to their stub driver.
            for device in pcidevs.iter_mut() {
                if !device.managed() {
                    continue;
                }
                if let Err(e) = device.detach(self.pci.as_ref(), &active) {
                    break 'transaction Some((e, RollbackFrom::Reattach));
                }
            }

            // With every sibling detached, resets are safe.
            for device in pcidevs.iter() {
                if let Err(e) = device.reset(self.pci.as_ref(), &active, &inactive) {
                    break 'transaction Some((e, RollbackFrom::Reattach));
                }
            }

            // SR-IOV VF network configuration, in hostdev list order.
            for (i, hostdev) in hostdevs.iter().enumerate() {
                if hostdev.pci_source().is_none() {
                    continue;
                }
                if hostdev.net_parent.is_some() {
                    if let Err(e) = netvf::replace(
                        self.pci.as_ref(),
                        self.net.as_ref(),
                        hostdev,
                        domain_uuid,
                        &self.state_dir,
                    ) {
                        break 'transaction Some((e, RollbackFrom::VfRestore));
                    }
                }
                last_processed_vf = Some(i);
            }

            // Publish into the active registry. A collision here would
            // mean the validation above lied; pull the already published
            // copies back out before unwinding.
            let mut published: Vec<PciAddress> = Vec::with_capacity(pcidevs.len());
            for device in pcidevs.iter() {
                if let Err(duplicate) = active.add(device.clone()) {
                    for address in &published {
                        active.remove(address);
                    }
                    let e = Error::Internal(format!(
                        "PCI device {} became active during prepare",
                        duplicate.address()
                    ));
                    break 'transaction Some((e, RollbackFrom::VfRestore));
                }
                published.push(device.address());
            }

            None
        };

        if let Some((e, from)) = failure {
            if matches!(from, RollbackFrom::VfRestore) {
                if let Some(last) = last_processed_vf {
                    for hostdev in &hostdevs[..last] {
                        if let Err(e) = netvf::restore(
                            self.pci.as_ref(),
                            self.net.as_ref(),
                            hostdev,
                            &self.state_dir,
                            None,
                        ) {
                            warn!("failed to restore VF network config: {e}");
                        }
                    }
                }
            }
            // Unbind everything in the working set from its stub driver,
            // best effort. Devices whose reattach fails here need admin
            // attention and are reported through the log only.
            for device in pcidevs.iter_mut() {
                if let Err(e) = device.reattach(self.pci.as_ref(), &active, None) {
                    error!("failed to re-attach PCI device {}: {e}", device.address());
                }
            }
            return Err(e);
        }

        let addresses: Vec<PciAddress> = pcidevs.iter().map(|d| d.address()).collect();

        // The devices are no longer inactive, wherever they came from.
        for address in &addresses {
            inactive.remove(address);
        }

        // Stamp ownership on the registry copies.
        let owner = DeviceOwner::new(driver_name, domain_name);
        for address in &addresses {
            if let Some(device) = active.find_mut(address) {
                device.set_used_by(owner.clone());
            }
        }

        // Report the captured kernel state back to the caller, so it can
        // be persisted with the domain and survives a manager restart.
        for hostdev in hostdevs.iter_mut() {
            let Some(address) = hostdev.pci_address() else {
                continue;
            };
            if let Some(device) = pcidevs.find(&address) {
                hostdev.original_state = device.original_state();
            }
        }

        // The active registry owns the devices now; the local working
        // copies go away with the set.
        drop(pcidevs);

        Ok(())
    }

    /// Returns the listed PCI devices from the given guest to the host,
    /// best effort: VF network state is restored, devices are reset and
    /// unbound from their stub driver (managed) or parked in the inactive
    /// registry (unmanaged). Devices owned by some other guest are left
    /// untouched. Failures are logged, never reported.
    ///
    /// `legacy_state_dir` is consulted for VF state files written by older
    /// manager layouts.
    pub fn reattach_pci_devices(
        &self,
        driver_name: &str,
        domain_name: &str,
        hostdevs: &[HostdevDef],
        legacy_state_dir: Option<&Path>,
    ) {
        if hostdevs.is_empty() {
            return;
        }

        let mut active = self.active_pci.lock().expect("failed to acquire lock");
        let mut inactive = self.inactive_pci.lock().expect("failed to acquire lock");

        // Working set: copies of the caller's devices that are currently
        // active.
        let mut pcidevs: DeviceSet<PciHostDevice> = DeviceSet::new();
        for hostdev in hostdevs {
            let Some(address) = hostdev.pci_address() else {
                continue;
            };
            if let Some(device) = active.find(&address) {
                if pcidevs.add(device.clone()).is_err() {
                    debug!("PCI device {address} listed twice, ignoring the duplicate");
                }
            }
        }

        // Drop devices owned by some other guest from the working set;
        // everything the caller does own leaves the active registry here,
        // before any reset, so no observer sees an active device mid-reset.
        let addresses: Vec<PciAddress> = pcidevs.iter().map(|d| d.address()).collect();
        for address in &addresses {
            let owned_by_caller = active
                .find(address)
                .and_then(|d| d.used_by())
                .is_some_and(|owner| owner.matches(driver_name, domain_name));
            if owned_by_caller {
                active.remove(address);
            } else {
                debug!("not reattaching PCI device {address} used by another domain");
                pcidevs.remove(address);
            }
        }

        // Unset VF network config before reset and reattach.
        for hostdev in hostdevs {
            if let Err(e) = netvf::restore(
                self.pci.as_ref(),
                self.net.as_ref(),
                hostdev,
                &self.state_dir,
                legacy_state_dir,
            ) {
                warn!("failed to restore VF network config: {e}");
            }
        }

        for device in pcidevs.iter() {
            if let Err(e) = device.reset(self.pci.as_ref(), &active, &inactive) {
                error!("failed to reset PCI device {}: {e}", device.address());
            }
        }

        while let Some(device) = pcidevs.pop_first() {
            self.reattach_pci_device(device, &active, &mut inactive);
        }
    }

    /// Returns one device, already removed from the active registry, to
    /// the host. Swallows every error.
    fn reattach_pci_device(
        &self,
        mut device: PciHostDevice,
        active: &DeviceSet<PciHostDevice>,
        inactive: &mut DeviceSet<PciHostDevice>,
    ) {
        // An unmanaged device assigned to a guest must have come through
        // the inactive registry; park it there again.
        if !device.managed() {
            if let Err(duplicate) = inactive.add(device) {
                debug!("PCI device {} is already inactive", duplicate.address());
            }
            return;
        }

        // Give the kvm module time to let go of a pci-stub device before
        // pulling the stub out from under it.
        if device.stub_driver() == StubDriver::PciStub {
            device.wait_for_cleanup(self.pci.as_ref(), KVM_CLEANUP_TAG);
        }

        if let Err(e) = device.reattach(self.pci.as_ref(), active, Some(inactive)) {
            error!("failed to re-attach PCI device {}: {e}", device.address());
        }
    }

    /// Claims the listed USB devices for the given guest. USB devices need
    /// no detach or reset; the registry only enforces exclusivity, and the
    /// whole request is validated before anything is claimed.
    pub fn prepare_usb_devices(
        &self,
        driver_name: &str,
        domain_name: &str,
        hostdevs: &[HostdevDef],
    ) -> Result<()> {
        let mut usbdevs = Vec::new();
        for hostdev in hostdevs {
            let Some(source) = hostdev.usb_source() else {
                continue;
            };
            let device = UsbHostDevice::new(source.bus, source.device);
            if usbdevs.iter().any(|d: &UsbHostDevice| d.key() == device.key()) {
                return Err(Error::AlreadyInList(device.name()));
            }
            usbdevs.push(device);
        }
        if usbdevs.is_empty() {
            return Ok(());
        }

        let mut active = self.active_usb.lock().expect("failed to acquire lock");
        for device in &usbdevs {
            if let Some(other) = active.find(&device.key()) {
                if let Some(owner) = other.used_by() {
                    return Err(Error::UsbInUse {
                        name: device.name(),
                        driver: owner.driver.clone(),
                        domain: owner.domain.clone(),
                    });
                }
                return Err(Error::AlreadyInList(device.name()));
            }
        }

        let owner = DeviceOwner::new(driver_name, domain_name);
        for mut device in usbdevs {
            device.set_used_by(owner.clone());
            if let Err(duplicate) = active.add(device) {
                return Err(Error::Internal(format!(
                    "USB device {} became active during prepare",
                    duplicate.name()
                )));
            }
        }
        Ok(())
    }

    /// Releases the listed USB devices held by the given guest. Devices
    /// owned by another guest are skipped.
    pub fn reattach_usb_devices(
        &self,
        driver_name: &str,
        domain_name: &str,
        hostdevs: &[HostdevDef],
    ) {
        let mut active = self.active_usb.lock().expect("failed to acquire lock");
        for hostdev in hostdevs {
            let Some(source) = hostdev.usb_source() else {
                continue;
            };
            let key = (source.bus, source.device);
            let Some(device) = active.find(&key) else {
                continue;
            };
            let owned_by_caller = device
                .used_by()
                .is_some_and(|owner| owner.matches(driver_name, domain_name));
            if owned_by_caller {
                active.remove(&key);
            } else {
                debug!(
                    "not releasing USB device {} used by another domain",
                    device.name()
                );
            }
        }
    }

    /// Claims the listed SCSI devices for the given guest, mirroring the
    /// USB flow.
    pub fn prepare_scsi_devices(
        &self,
        driver_name: &str,
        domain_name: &str,
        hostdevs: &[HostdevDef],
    ) -> Result<()> {
        let mut scsidevs = Vec::new();
        for hostdev in hostdevs {
            let Some(source) = hostdev.scsi_source() else {
                continue;
            };
            let device =
                ScsiHostDevice::new(&source.adapter, source.bus, source.target, source.unit);
            if scsidevs.iter().any(|d: &ScsiHostDevice| d.key() == device.key()) {
                return Err(Error::AlreadyInList(device.name()));
            }
            scsidevs.push(device);
        }
        if scsidevs.is_empty() {
            return Ok(());
        }

        let mut active = self.active_scsi.lock().expect("failed to acquire lock");
        for device in &scsidevs {
            if let Some(other) = active.find(&device.key()) {
                if let Some(owner) = other.used_by() {
                    return Err(Error::ScsiInUse {
                        name: device.name(),
                        driver: owner.driver.clone(),
                        domain: owner.domain.clone(),
                    });
                }
                return Err(Error::AlreadyInList(device.name()));
            }
        }

        let owner = DeviceOwner::new(driver_name, domain_name);
        for mut device in scsidevs {
            device.set_used_by(owner.clone());
            if let Err(duplicate) = active.add(device) {
                return Err(Error::Internal(format!(
                    "SCSI device {} became active during prepare",
                    duplicate.name()
                )));
            }
        }
        Ok(())
    }

    /// Releases the listed SCSI devices held by the given guest.
    pub fn reattach_scsi_devices(
        &self,
        driver_name: &str,
        domain_name: &str,
        hostdevs: &[HostdevDef],
    ) {
        let mut active = self.active_scsi.lock().expect("failed to acquire lock");
        for hostdev in hostdevs {
            let Some(source) = hostdev.scsi_source() else {
                continue;
            };
            let key = (
                source.adapter.clone(),
                source.bus,
                source.target,
                source.unit,
            );
            let Some(device) = active.find(&key) else {
                continue;
            };
            let owned_by_caller = device
                .used_by()
                .is_some_and(|owner| owner.matches(driver_name, domain_name));
            if owned_by_caller {
                active.remove(&key);
            } else {
                debug!(
                    "not releasing SCSI device {} used by another domain",
                    device.name()
                );
            }
        }
    }
}
