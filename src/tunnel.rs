// Copyright 2025 Stairwell, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Local `ssh` and `sshuttle` subprocesses that make remote controllers reachable.

use std::io;

use smol::process::{Child, Command, Stdio};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// A running tunnel subprocess.
pub trait TunnelProcess: Send {
    fn id(&self) -> u32;

    /// Asks the process to exit. Does not wait for it.
    fn terminate(&mut self) -> Result<()>;
}

/// Spawns tunnels. Both calls return as soon as the process is started; the tunnel may not be
/// usable yet.
pub trait TunnelLauncher: Send + Sync {
    fn port_forward(
        &self,
        local: &str,
        remote: &str,
        bastion: &str,
        jumps: &[String],
    ) -> Result<Box<dyn TunnelProcess>>;

    fn sshuttle(
        &self,
        subnets: &[String],
        bastion: &str,
        jumps: &[String],
    ) -> Result<Box<dyn TunnelProcess>>;
}

/// Launches the real `ssh` and `sshuttle` executables from `PATH`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemLauncher;

impl TunnelLauncher for SystemLauncher {
    fn port_forward(
        &self,
        local: &str,
        remote: &str,
        bastion: &str,
        jumps: &[String],
    ) -> Result<Box<dyn TunnelProcess>> {
        Ok(Box::new(ssh_port_forwarding_proc(local, remote, bastion, jumps)?))
    }

    fn sshuttle(
        &self,
        subnets: &[String],
        bastion: &str,
        jumps: &[String],
    ) -> Result<Box<dyn TunnelProcess>> {
        Ok(Box::new(sshuttle_proc(subnets, bastion, jumps)?))
    }
}

/// A spawned child with its output captured, so it never writes to our terminal.
///
/// Dropping it without calling [`TunnelProcess::terminate`] terminates the child, so a tunnel
/// never outlives a cancelled connect.
pub struct SystemProcess {
    child: Child,
    terminated: bool,
}

impl TunnelProcess for SystemProcess {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn terminate(&mut self) -> Result<()> {
        let pid = self.child.id();
        debug!(pid, "terminating tunnel");
        self.terminated = true;
        send_terminate(&mut self.child).map_err(|source| Error::Terminate { pid, source })
    }
}

impl Drop for SystemProcess {
    fn drop(&mut self) {
        if self.terminated {
            return;
        }
        if let Err(e) = self.terminate() {
            warn!(error = %e, "cleanup tunnel");
        }
    }
}

// sshuttle only restores the firewall rules it installed when it gets SIGTERM.
#[cfg(unix)]
fn send_terminate(child: &mut Child) -> io::Result<()> {
    use nix::{
        errno::Errno,
        sys::signal::{kill, Signal},
        unistd::Pid,
    };

    let pid = i32::try_from(child.id()).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(errno.into()),
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) -> io::Result<()> {
    child.kill()
}

fn jump_flags(jumps: &[String]) -> String {
    jumps
        .iter()
        .map(|jump| format!("-J {}", jump))
        .collect::<Vec<_>>()
        .join(" ")
}

/// `ssh -N -L <local>:<remote> <jump-arg> <bastion>`. The jump argument is always present, and
/// is the empty string when there are no jumps.
pub fn ssh_port_forwarding_cmd(
    local: &str,
    remote: &str,
    bastion: &str,
    jumps: &[String],
) -> Vec<String> {
    vec![
        "ssh".into(),
        "-N".into(),
        "-L".into(),
        format!("{}:{}", local, remote),
        jump_flags(jumps),
        bastion.into(),
    ]
}

/// `sshuttle -r <bastion> <jump-arg> <subnet>...`, where the jump argument overrides the ssh
/// command sshuttle uses.
pub fn sshuttle_cmd(subnets: &[String], bastion: &str, jumps: &[String]) -> Vec<String> {
    let jump_arg = if jumps.is_empty() {
        String::new()
    } else {
        format!("-e 'ssh {}'", jump_flags(jumps))
    };
    let mut cmd = vec!["sshuttle".into(), "-r".into(), bastion.into(), jump_arg];
    cmd.extend(subnets.iter().cloned());
    cmd
}

/// Forwards `local` (`host:port` or a bare port) to `remote` through `bastion`.
pub fn ssh_port_forwarding_proc(
    local: &str,
    remote: &str,
    bastion: &str,
    jumps: &[String],
) -> Result<SystemProcess> {
    spawn(&ssh_port_forwarding_cmd(local, remote, bastion, jumps))
}

/// Routes `subnets` through `bastion`.
pub fn sshuttle_proc(subnets: &[String], bastion: &str, jumps: &[String]) -> Result<SystemProcess> {
    if subnets.is_empty() {
        return Err(Error::validation("sshuttle needs at least one subnet"));
    }
    spawn(&sshuttle_cmd(subnets, bastion, jumps))
}

fn spawn(cmd: &[String]) -> Result<SystemProcess> {
    let Some((program, args)) = cmd.split_first() else {
        return Err(Error::validation("empty tunnel command"));
    };
    let child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| Error::Spawn {
            program: program.clone(),
            source,
        })?;
    info!(pid = child.id(), command = ?cmd, "spawned tunnel");
    Ok(SystemProcess {
        child,
        terminated: false,
    })
}
