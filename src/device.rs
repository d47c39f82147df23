// Copyright © 2025 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Device handles and the PCI device facade.

use std::fmt;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::PciAddress;
use crate::error::{Error, Result};
use crate::primitives::PciPrimitives;
use crate::set::{DeviceKey, DeviceSet};

const CLEANUP_RETRIES: u32 = 100;
const CLEANUP_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Placeholder kernel driver that owns a PCI device while it is assigned
/// to a guest.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum StubDriver {
    VfioPci,
    PciStub,
}

impl StubDriver {
    pub fn name(&self) -> &'static str {
        match self {
            StubDriver::VfioPci => "vfio-pci",
            StubDriver::PciStub => "pci-stub",
        }
    }
}

impl fmt::Display for StubDriver {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The guest currently holding a device.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceOwner {
    pub driver: String,
    pub domain: String,
}

impl DeviceOwner {
    pub fn new(driver: &str, domain: &str) -> Self {
        DeviceOwner {
            driver: driver.to_string(),
            domain: domain.to_string(),
        }
    }

    pub fn matches(&self, driver: &str, domain: &str) -> bool {
        self.driver == driver && self.domain == domain
    }
}

/// What has to be undone on reattach to restore the kernel binding the
/// slot had before the device was detached.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PciOriginalState {
    pub unbind_from_stub: bool,
    pub remove_slot: bool,
    pub reprobe: bool,
}

/// Handle for one assignable PCI function.
///
/// The handle itself is inert bookkeeping; the kernel-facing work is
/// delegated to a [`PciPrimitives`] implementation, while the active and
/// inactive registries are taken as plain references so the precondition
/// checks see the registry state the calling pipeline has locked.
#[derive(Clone, Debug)]
pub struct PciHostDevice {
    address: PciAddress,
    managed: bool,
    stub_driver: StubDriver,
    used_by: Option<DeviceOwner>,
    original_state: Option<PciOriginalState>,
}

impl DeviceKey for PciHostDevice {
    type Key = PciAddress;

    fn key(&self) -> PciAddress {
        self.address
    }
}

impl PciHostDevice {
    pub fn new(ops: &dyn PciPrimitives, address: PciAddress) -> Result<Self> {
        if !ops.device_exists(&address) {
            return Err(Error::DeviceNotFound(address));
        }
        Ok(PciHostDevice {
            address,
            managed: false,
            stub_driver: StubDriver::PciStub,
            used_by: None,
            original_state: None,
        })
    }

    pub fn address(&self) -> PciAddress {
        self.address
    }

    pub fn managed(&self) -> bool {
        self.managed
    }

    pub fn set_managed(&mut self, managed: bool) {
        self.managed = managed;
    }

    pub fn stub_driver(&self) -> StubDriver {
        self.stub_driver
    }

    pub fn set_stub_driver(&mut self, stub: StubDriver) {
        self.stub_driver = stub;
    }

    pub fn used_by(&self) -> Option<&DeviceOwner> {
        self.used_by.as_ref()
    }

    pub fn set_used_by(&mut self, owner: DeviceOwner) {
        self.used_by = Some(owner);
    }

    pub fn original_state(&self) -> Option<PciOriginalState> {
        self.original_state
    }

    /// Host-policy check whether the device may be handed to a guest at
    /// all. Probe failures count as not assignable.
    pub fn is_assignable(&self, ops: &dyn PciPrimitives, strict_acs_check: bool) -> bool {
        match ops.is_isolated(&self.address, strict_acs_check) {
            Ok(isolated) => isolated,
            Err(e) => {
                log::debug!("isolation probe of PCI device {} failed: {e}", self.address);
                false
            }
        }
    }

    /// Binds the device to its stub driver and captures the original
    /// binding state for the eventual reattach.
    pub fn detach(
        &mut self,
        ops: &dyn PciPrimitives,
        active: &DeviceSet<PciHostDevice>,
    ) -> Result<()> {
        if active.contains(&self.address) {
            return Err(Error::DetachActiveDevice(self.address));
        }
        let state = ops
            .bind_to_stub(&self.address, self.stub_driver)
            .map_err(|source| Error::Detach {
                address: self.address,
                source,
            })?;
        self.original_state = Some(state);
        Ok(())
    }

    /// Resets the device. Must only run once every function sharing the
    /// reset scope has been detached; a sibling still marked active means
    /// the reset would disturb a running guest or the host.
    pub fn reset(
        &self,
        ops: &dyn PciPrimitives,
        active: &DeviceSet<PciHostDevice>,
        _inactive: &DeviceSet<PciHostDevice>,
    ) -> Result<()> {
        if active.contains(&self.address) {
            return Err(Error::ResetActiveDevice(self.address));
        }
        for sibling in active.iter() {
            let other = sibling.address();
            if other.domain == self.address.domain && other.bus == self.address.bus {
                return Err(Error::ResetSharedBus {
                    address: self.address,
                    sibling: other,
                });
            }
        }
        ops.reset(&self.address).map_err(|source| Error::Reset {
            address: self.address,
            source,
        })
    }

    /// Unbinds the device from its stub driver, reprobing the original
    /// host driver when the captured state asks for it. A handle parked in
    /// the inactive registry is dropped from it first.
    pub fn reattach(
        &mut self,
        ops: &dyn PciPrimitives,
        active: &DeviceSet<PciHostDevice>,
        inactive: Option<&mut DeviceSet<PciHostDevice>>,
    ) -> Result<()> {
        if active.contains(&self.address) {
            return Err(Error::ReattachActiveDevice(self.address));
        }
        if let Some(inactive) = inactive {
            inactive.remove(&self.address);
        }
        let state = self.original_state.unwrap_or_default();
        ops.unbind_from_stub(&self.address, self.stub_driver, &state)
            .map_err(|source| Error::Reattach {
                address: self.address,
                source,
            })?;
        self.original_state = None;
        Ok(())
    }

    /// Polls the kernel until no claimant matching `tag` holds resources
    /// of the device, or the retry budget runs out.
    pub fn wait_for_cleanup(&self, ops: &dyn PciPrimitives, tag: &str) {
        let mut retries = CLEANUP_RETRIES;
        while retries > 0 && ops.cleanup_pending(&self.address, tag) {
            thread::sleep(CLEANUP_RETRY_DELAY);
            retries -= 1;
        }
    }
}

/// Handle for one assignable USB device, addressed by bus and device
/// number. No stub driver or reset is involved; the registry only tracks
/// exclusivity.
#[derive(Clone, Debug)]
pub struct UsbHostDevice {
    bus: u32,
    device: u32,
    used_by: Option<DeviceOwner>,
}

impl DeviceKey for UsbHostDevice {
    type Key = (u32, u32);

    fn key(&self) -> (u32, u32) {
        (self.bus, self.device)
    }
}

impl UsbHostDevice {
    pub fn new(bus: u32, device: u32) -> Self {
        UsbHostDevice {
            bus,
            device,
            used_by: None,
        }
    }

    pub fn name(&self) -> String {
        format!("{:03}:{:03}", self.bus, self.device)
    }

    pub fn used_by(&self) -> Option<&DeviceOwner> {
        self.used_by.as_ref()
    }

    pub fn set_used_by(&mut self, owner: DeviceOwner) {
        self.used_by = Some(owner);
    }
}

/// Handle for one assignable SCSI device, addressed by host adapter and
/// the (bus, target, unit) triple.
#[derive(Clone, Debug)]
pub struct ScsiHostDevice {
    adapter: String,
    bus: u32,
    target: u32,
    unit: u64,
    used_by: Option<DeviceOwner>,
}

impl DeviceKey for ScsiHostDevice {
    type Key = (String, u32, u32, u64);

    fn key(&self) -> (String, u32, u32, u64) {
        (self.adapter.clone(), self.bus, self.target, self.unit)
    }
}

impl ScsiHostDevice {
    pub fn new(adapter: &str, bus: u32, target: u32, unit: u64) -> Self {
        ScsiHostDevice {
            adapter: adapter.to_string(),
            bus,
            target,
            unit,
            used_by: None,
        }
    }

    pub fn name(&self) -> String {
        format!("{}:{}:{}:{}", self.adapter, self.bus, self.target, self.unit)
    }

    pub fn used_by(&self) -> Option<&DeviceOwner> {
        self.used_by.as_ref()
    }

    pub fn set_used_by(&mut self, owner: DeviceOwner) {
        self.used_by = Some(owner);
    }
}
