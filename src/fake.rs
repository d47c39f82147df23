// Copyright © 2025 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! In-memory primitive backends for tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use uuid::Uuid;

use crate::address::PciAddress;
use crate::config::Dot1QbhPort;
use crate::device::{PciOriginalState, StubDriver};
use crate::mac::MacAddr;
use crate::primitives::{DeviceError, NetPrimitives, PciPrimitives, VfNetConfig};

/// Scriptable state of one fake PCI device.
#[derive(Clone, Debug)]
pub(crate) struct FakeDevice {
    pub host_driver: Option<String>,
    pub driver: Option<String>,
    pub isolated: bool,
    pub isolated_strict: bool,
    pub vf: Option<(String, u32)>,
    pub net_name: Option<String>,
    pub fail_bind: bool,
    pub fail_reset: bool,
    pub cleanup_polls: u32,
    pub resets: u32,
}

impl FakeDevice {
    pub fn with_driver(driver: &str) -> Self {
        FakeDevice {
            host_driver: Some(driver.to_string()),
            driver: Some(driver.to_string()),
            isolated: true,
            isolated_strict: true,
            vf: None,
            net_name: None,
            fail_bind: false,
            fail_reset: false,
            cleanup_polls: 0,
            resets: 0,
        }
    }

    pub fn unbound() -> Self {
        FakeDevice {
            host_driver: None,
            driver: None,
            isolated: true,
            isolated_strict: true,
            vf: None,
            net_name: None,
            fail_bind: false,
            fail_reset: false,
            cleanup_polls: 0,
            resets: 0,
        }
    }

    pub fn vf_of(pf_netdev: &str, index: u32) -> Self {
        let mut dev = FakeDevice::with_driver("ixgbevf");
        dev.vf = Some((pf_netdev.to_string(), index));
        dev
    }
}

#[derive(Default)]
struct FakePciState {
    devices: BTreeMap<PciAddress, FakeDevice>,
    bind_log: Vec<(PciAddress, StubDriver)>,
    unbind_log: Vec<PciAddress>,
}

#[derive(Default)]
pub(crate) struct FakePciPrimitives {
    state: Mutex<FakePciState>,
}

impl FakePciPrimitives {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn insert(&self, address: PciAddress, device: FakeDevice) {
        self.state.lock().unwrap().devices.insert(address, device);
    }

    pub fn driver_of(&self, address: &PciAddress) -> Option<String> {
        self.state.lock().unwrap().devices[address].driver.clone()
    }

    pub fn reset_count(&self, address: &PciAddress) -> u32 {
        self.state.lock().unwrap().devices[address].resets
    }

    pub fn set_fail_reset(&self, address: &PciAddress, fail: bool) {
        self.state
            .lock()
            .unwrap()
            .devices
            .get_mut(address)
            .unwrap()
            .fail_reset = fail;
    }

    pub fn bind_log(&self) -> Vec<(PciAddress, StubDriver)> {
        self.state.lock().unwrap().bind_log.clone()
    }

    pub fn unbind_log(&self) -> Vec<PciAddress> {
        self.state.lock().unwrap().unbind_log.clone()
    }
}

impl PciPrimitives for FakePciPrimitives {
    fn device_exists(&self, address: &PciAddress) -> bool {
        self.state.lock().unwrap().devices.contains_key(address)
    }

    fn current_driver(&self, address: &PciAddress) -> Result<Option<String>, DeviceError> {
        let state = self.state.lock().unwrap();
        let dev = state.devices.get(address).ok_or(DeviceError::NotFound)?;
        Ok(dev.driver.clone())
    }

    fn bind_to_stub(
        &self,
        address: &PciAddress,
        stub: StubDriver,
    ) -> Result<PciOriginalState, DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.bind_log.push((*address, stub));
        let dev = state
            .devices
            .get_mut(address)
            .ok_or(DeviceError::NotFound)?;
        if dev.fail_bind {
            return Err(DeviceError::Io(io::Error::other("bind refused")));
        }
        if dev.driver.as_deref() == Some(stub.name()) {
            return Ok(PciOriginalState::default());
        }
        let reprobe = dev.driver.is_some();
        dev.driver = Some(stub.name().to_string());
        Ok(PciOriginalState {
            unbind_from_stub: true,
            remove_slot: false,
            reprobe,
        })
    }

    fn unbind_from_stub(
        &self,
        address: &PciAddress,
        _stub: StubDriver,
        state: &PciOriginalState,
    ) -> Result<(), DeviceError> {
        let mut fake = self.state.lock().unwrap();
        fake.unbind_log.push(*address);
        let dev = fake.devices.get_mut(address).ok_or(DeviceError::NotFound)?;
        if state.remove_slot {
            dev.driver = dev.host_driver.clone();
            return Ok(());
        }
        if state.unbind_from_stub {
            dev.driver = None;
        }
        if state.reprobe {
            dev.driver = dev.host_driver.clone();
        }
        Ok(())
    }

    fn reset(&self, address: &PciAddress) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        let dev = state
            .devices
            .get_mut(address)
            .ok_or(DeviceError::NotFound)?;
        if dev.fail_reset {
            return Err(DeviceError::Io(io::Error::other("reset refused")));
        }
        dev.resets += 1;
        Ok(())
    }

    fn is_isolated(&self, address: &PciAddress, strict_acs: bool) -> Result<bool, DeviceError> {
        let state = self.state.lock().unwrap();
        let dev = state.devices.get(address).ok_or(DeviceError::NotFound)?;
        Ok(if strict_acs {
            dev.isolated_strict
        } else {
            dev.isolated
        })
    }

    fn is_virtual_function(&self, address: &PciAddress) -> Result<bool, DeviceError> {
        let state = self.state.lock().unwrap();
        let dev = state.devices.get(address).ok_or(DeviceError::NotFound)?;
        Ok(dev.vf.is_some())
    }

    fn vf_info(&self, address: &PciAddress) -> Result<(String, u32), DeviceError> {
        let state = self.state.lock().unwrap();
        let dev = state.devices.get(address).ok_or(DeviceError::NotFound)?;
        dev.vf.clone().ok_or(DeviceError::NotFound)
    }

    fn net_name(&self, address: &PciAddress) -> Result<String, DeviceError> {
        let state = self.state.lock().unwrap();
        let dev = state.devices.get(address).ok_or(DeviceError::NotFound)?;
        dev.net_name.clone().ok_or(DeviceError::NotFound)
    }

    fn cleanup_pending(&self, address: &PciAddress, _tag: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(dev) = state.devices.get_mut(address) else {
            return false;
        };
        if dev.cleanup_polls > 0 {
            dev.cleanup_polls -= 1;
            true
        } else {
            false
        }
    }
}

#[derive(Default)]
struct FakeNetState {
    current: HashMap<(String, u32), VfNetConfig>,
    saved: HashMap<(PathBuf, String, u32), VfNetConfig>,
    applied: Vec<(String, u32, VfNetConfig)>,
    restored: Vec<(String, u32, PathBuf)>,
    associated: Vec<(String, u32, String)>,
    disassociated: Vec<(String, u32, String)>,
    fail_replace: HashSet<(String, u32)>,
}

#[derive(Default)]
pub(crate) struct FakeNetPrimitives {
    state: Mutex<FakeNetState>,
}

impl FakeNetPrimitives {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn set_current(&self, linkdev: &str, vf: u32, config: VfNetConfig) {
        self.state
            .lock()
            .unwrap()
            .current
            .insert((linkdev.to_string(), vf), config);
    }

    pub fn seed_saved(&self, dir: &Path, linkdev: &str, vf: u32, config: VfNetConfig) {
        self.state
            .lock()
            .unwrap()
            .saved
            .insert((dir.to_path_buf(), linkdev.to_string(), vf), config);
    }

    pub fn fail_replace_of(&self, linkdev: &str, vf: u32) {
        self.state
            .lock()
            .unwrap()
            .fail_replace
            .insert((linkdev.to_string(), vf));
    }

    pub fn saved_config(&self, dir: &Path, linkdev: &str, vf: u32) -> Option<VfNetConfig> {
        self.state
            .lock()
            .unwrap()
            .saved
            .get(&(dir.to_path_buf(), linkdev.to_string(), vf))
            .copied()
    }

    pub fn current_config(&self, linkdev: &str, vf: u32) -> Option<VfNetConfig> {
        self.state
            .lock()
            .unwrap()
            .current
            .get(&(linkdev.to_string(), vf))
            .copied()
    }

    pub fn applied(&self) -> Vec<(String, u32, VfNetConfig)> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn restored(&self) -> Vec<(String, u32, PathBuf)> {
        self.state.lock().unwrap().restored.clone()
    }

    pub fn associated(&self) -> Vec<(String, u32, String)> {
        self.state.lock().unwrap().associated.clone()
    }

    pub fn disassociated(&self) -> Vec<(String, u32, String)> {
        self.state.lock().unwrap().disassociated.clone()
    }
}

impl NetPrimitives for FakeNetPrimitives {
    fn replace_net_config(
        &self,
        linkdev: &str,
        vf: u32,
        mac: &MacAddr,
        vlan_id: u16,
        state_dir: &Path,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_replace.contains(&(linkdev.to_string(), vf)) {
            return Err(DeviceError::Io(io::Error::other("replace refused")));
        }
        let current = state
            .current
            .get(&(linkdev.to_string(), vf))
            .copied()
            .unwrap_or(VfNetConfig {
                mac: MacAddr::new([0; 6]),
                vlan: 0,
            });
        state
            .saved
            .insert((state_dir.to_path_buf(), linkdev.to_string(), vf), current);
        let new = VfNetConfig {
            mac: *mac,
            vlan: vlan_id,
        };
        state.applied.push((linkdev.to_string(), vf, new));
        state.current.insert((linkdev.to_string(), vf), new);
        Ok(())
    }

    fn restore_net_config(
        &self,
        linkdev: &str,
        vf: u32,
        state_dir: &Path,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        let key = (state_dir.to_path_buf(), linkdev.to_string(), vf);
        match state.saved.remove(&key) {
            Some(config) => {
                state.current.insert((linkdev.to_string(), vf), config);
                state
                    .restored
                    .push((linkdev.to_string(), vf, state_dir.to_path_buf()));
                Ok(())
            }
            None => Err(DeviceError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "no saved config",
            ))),
        }
    }

    fn associate_port_profile(
        &self,
        linkdev: &str,
        vf: u32,
        profile: &Dot1QbhPort,
        _mac: &MacAddr,
        _instance_uuid: &Uuid,
    ) -> Result<(), DeviceError> {
        self.state.lock().unwrap().associated.push((
            linkdev.to_string(),
            vf,
            profile.profile_id.clone(),
        ));
        Ok(())
    }

    fn disassociate_port_profile(
        &self,
        linkdev: &str,
        vf: u32,
        profile: &Dot1QbhPort,
        _mac: &MacAddr,
    ) -> Result<(), DeviceError> {
        self.state.lock().unwrap().disassociated.push((
            linkdev.to_string(),
            vf,
            profile.profile_id.clone(),
        ));
        Ok(())
    }
}
