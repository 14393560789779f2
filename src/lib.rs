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

//! Connection lifecycle for a multi-controller administration tool.
//!
//! [`ConnectManager`] keeps at most one live handle per controller. It reaches each controller
//! directly, through an `ssh -L` forward on a free local port, or through an `sshuttle` subnet
//! route, and it owns the subprocesses those tunnels run in.

pub mod config;
pub mod controller;
pub mod error;
pub mod manager;
pub mod ports;
pub mod retry;
pub mod tunnel;

pub use config::{Config, ConnectionConfig, ControllerConfig, PersonalConfig};
pub use controller::{Controller, ControllerFactory, TcpController};
pub use error::{Error, Result};
pub use manager::{ConnectManager, ConnectOptions, Connection, Registry};
pub use ports::{get_free_tcp_port, DEFAULT_PORT_RANGE};
pub use retry::RetryConfig;
pub use tunnel::{
    ssh_port_forwarding_proc, sshuttle_proc, SystemLauncher, TunnelLauncher, TunnelProcess,
};
