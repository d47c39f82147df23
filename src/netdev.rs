// Copyright © 2025 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Linux implementation of the VF network primitives.
//!
//! Reads the current VF state by parsing `ip link show` output and applies
//! new state with `ip link set`. The saved state is one JSON blob per VF in
//! the manager's state directory, named `<pf>_vf<index>`, so a later
//! restore can run from a fresh process.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

use uuid::Uuid;

use crate::config::Dot1QbhPort;
use crate::mac::MacAddr;
use crate::primitives::{DeviceError, NetPrimitives, VfNetConfig};

#[derive(Default)]
pub struct IpLinkNetPrimitives;

impl IpLinkNetPrimitives {
    pub fn new() -> Self {
        Default::default()
    }

    fn run_ip(args: &[&str]) -> Result<String, DeviceError> {
        let output = Command::new("ip").args(args).output()?;
        if !output.status.success() {
            return Err(DeviceError::Io(io::Error::other(format!(
                "ip {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ))));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn set_vf_config(linkdev: &str, vf: u32, config: &VfNetConfig) -> Result<(), DeviceError> {
        let vf_index = vf.to_string();
        let mac = config.mac.to_string();
        Self::run_ip(&["link", "set", linkdev, "vf", &vf_index, "mac", &mac])?;
        let vlan = config.vlan.to_string();
        Self::run_ip(&["link", "set", linkdev, "vf", &vf_index, "vlan", &vlan])?;
        Ok(())
    }
}

fn state_file(state_dir: &Path, linkdev: &str, vf: u32) -> PathBuf {
    state_dir.join(format!("{linkdev}_vf{vf}"))
}

/// Extracts the MAC and VLAN of one VF from `ip link show` output, whose
/// VF lines look like
/// `    vf 3 MAC aa:bb:cc:dd:ee:ff, vlan 42, spoof checking on`.
fn parse_vf_config(output: &str, vf: u32) -> Option<VfNetConfig> {
    let prefix = format!("vf {vf} ");
    for line in output.lines() {
        let Some(rest) = line.trim_start().strip_prefix(&prefix) else {
            continue;
        };
        let mut mac = None;
        let mut vlan = 0u16;
        for field in rest.split(", ") {
            if let Some(value) = field.strip_prefix("MAC ") {
                mac = MacAddr::from_str(value.trim()).ok();
            } else if let Some(value) = field.strip_prefix("vlan ") {
                vlan = value.trim().parse().unwrap_or(0);
            }
        }
        return mac.map(|mac| VfNetConfig { mac, vlan });
    }
    None
}

impl NetPrimitives for IpLinkNetPrimitives {
    fn replace_net_config(
        &self,
        linkdev: &str,
        vf: u32,
        mac: &MacAddr,
        vlan_id: u16,
        state_dir: &Path,
    ) -> Result<(), DeviceError> {
        let show = Self::run_ip(&["link", "show", linkdev])?;
        let current = parse_vf_config(&show, vf).ok_or_else(|| {
            DeviceError::Parse(format!("no state for VF {vf} reported by {linkdev}"))
        })?;

        let path = state_file(state_dir, linkdev, vf);
        let blob = serde_json::to_string(&current)
            .map_err(|e| DeviceError::Parse(e.to_string()))?;
        fs::write(&path, blob)?;

        Self::set_vf_config(
            linkdev,
            vf,
            &VfNetConfig {
                mac: *mac,
                vlan: vlan_id,
            },
        )
    }

    fn restore_net_config(
        &self,
        linkdev: &str,
        vf: u32,
        state_dir: &Path,
    ) -> Result<(), DeviceError> {
        let path = state_file(state_dir, linkdev, vf);
        let blob = fs::read_to_string(&path)?;
        let saved: VfNetConfig =
            serde_json::from_str(&blob).map_err(|e| DeviceError::Parse(e.to_string()))?;

        Self::set_vf_config(linkdev, vf, &saved)?;
        if let Err(e) = fs::remove_file(&path) {
            log::warn!("failed to remove VF state file '{}': {e}", path.display());
        }
        Ok(())
    }

    fn associate_port_profile(
        &self,
        linkdev: &str,
        vf: u32,
        profile: &Dot1QbhPort,
        _mac: &MacAddr,
        _instance_uuid: &Uuid,
    ) -> Result<(), DeviceError> {
        // The 802.1Qbh exchange runs through an external port-profile
        // daemon that this host backend is not wired to.
        log::debug!(
            "no port-profile transport to associate profile '{}' of {linkdev} vf {vf}",
            profile.profile_id
        );
        Err(DeviceError::Unsupported)
    }

    fn disassociate_port_profile(
        &self,
        linkdev: &str,
        vf: u32,
        profile: &Dot1QbhPort,
        _mac: &MacAddr,
    ) -> Result<(), DeviceError> {
        log::debug!(
            "no port-profile transport to disassociate profile '{}' of {linkdev} vf {vf}",
            profile.profile_id
        );
        Err(DeviceError::Unsupported)
    }
}
