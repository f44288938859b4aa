//! Address and route setup for a freshly opened tunnel interface.

use crate::config::EtherAddress;
use crate::device::Variant;
use std::io;
use std::net::Ipv4Addr;
use std::process::Command;

/// Everything the configurator needs to bring an interface up or down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addressing {
    pub dev_name: String,
    pub variant: Variant,
    pub near: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    pub mtu: usize,
    /// Hardware address, only for Ethernet-framed drivers.
    pub ether: Option<EtherAddress>,
}

/// External collaborator that applies and removes interface addressing.
pub trait AddressConfigurator {
    fn apply(&mut self, addressing: &Addressing) -> io::Result<()>;
    fn revert(&mut self, addressing: &Addressing) -> io::Result<()>;
}

/// Configures interfaces by running `ifconfig(8)` and `route(8)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ifconfig;

impl Ifconfig {
    fn linux_style(variant: Variant) -> bool {
        matches!(variant, Variant::LinuxUniversal | Variant::LinuxEthertap)
    }

    /// Command lines that bring the interface up, in order.
    pub fn up_commands(a: &Addressing) -> Vec<Vec<String>> {
        let mut cmds = Vec::new();
        let linux = Self::linux_style(a.variant);

        if let Some(ether) = a.ether {
            let mut cmd = vec!["ifconfig".to_string(), a.dev_name.clone()];
            if linux {
                cmd.extend(["hw".to_string(), "ether".to_string()]);
            } else {
                cmd.push("ether".to_string());
            }
            cmd.push(ether.to_string());
            cmds.push(cmd);
        }

        let mut cmd = vec!["ifconfig".to_string(), a.dev_name.clone()];
        if !linux {
            cmd.push("inet".to_string());
        }
        cmd.push(a.near.to_string());
        cmd.extend([
            "netmask".to_string(),
            a.mask.to_string(),
            "mtu".to_string(),
            a.mtu.to_string(),
            "up".to_string(),
        ]);
        cmds.push(cmd);

        if let Some(gw) = a.gateway {
            cmds.push(Self::route_command("add", linux, gw));
        }
        cmds
    }

    /// Command lines that undo `up_commands`, in order.
    pub fn down_commands(a: &Addressing) -> Vec<Vec<String>> {
        let linux = Self::linux_style(a.variant);
        let mut cmds = Vec::new();
        if let Some(gw) = a.gateway {
            cmds.push(Self::route_command(if linux { "del" } else { "delete" }, linux, gw));
        }
        cmds.push(vec![
            "ifconfig".to_string(),
            a.dev_name.clone(),
            "down".to_string(),
        ]);
        cmds
    }

    fn route_command(action: &str, linux: bool, gw: Ipv4Addr) -> Vec<String> {
        let mut cmd = vec![
            "route".to_string(),
            "-n".to_string(),
            action.to_string(),
            "default".to_string(),
        ];
        if linux {
            cmd.push("gw".to_string());
        }
        cmd.push(gw.to_string());
        cmd
    }

    fn run(cmd: &[String]) -> io::Result<()> {
        tracing::debug!(command = %cmd.join(" "), "running");
        let output = Command::new(&cmd[0]).args(&cmd[1..]).output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(io::Error::other(format!(
                "{} failed: {}",
                cmd.join(" "),
                stderr.trim()
            )));
        }
        Ok(())
    }
}

impl AddressConfigurator for Ifconfig {
    fn apply(&mut self, addressing: &Addressing) -> io::Result<()> {
        for cmd in Self::up_commands(addressing) {
            Self::run(&cmd)?;
        }
        Ok(())
    }

    /// Runs every step even if an earlier one fails, reporting the first error.
    fn revert(&mut self, addressing: &Addressing) -> io::Result<()> {
        let mut first_err = None;
        for cmd in Self::down_commands(addressing) {
            if let Err(e) = Self::run(&cmd) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
