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

//! Controller descriptors and the YAML files they are loaded from.

use std::{collections::HashSet, fmt, fs, net::IpAddr, path::Path};

use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, Result};

/// How a controller is reached when it is not directly routable.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Bastion the tunnel terminates on, e.g. `ubuntu@bastion`.
    pub destination: String,
    /// Subnets routed through the bastion when using sshuttle.
    #[serde(default)]
    pub subnets: Vec<String>,
    /// SSH hops traversed, in order, before reaching `destination`.
    #[serde(default)]
    pub jumps: Vec<String>,
}

#[derive(Clone, Default, Deserialize)]
pub struct ControllerConfig {
    pub name: String,
    pub endpoint: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub ca_cert: String,
    #[serde(default)]
    pub connection: Option<ConnectionConfig>,
}

impl fmt::Debug for ControllerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerConfig")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl ControllerConfig {
    /// Checks that the descriptor identifies a controller well enough to connect to it.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("controller name is empty"));
        }
        if self.username.trim().is_empty() {
            return Err(Error::validation(format!(
                "controller {} has no username",
                self.name
            )));
        }
        let endpoint_re = Regex::new(r"^(\[[0-9A-Fa-f:.]+\]|[^\s:\[\]]+):[0-9]{1,5}$")
            .map_err(|e| Error::validation(format!("failed to compile regex: {}", e)))?;
        if !endpoint_re.is_match(&self.endpoint) {
            return Err(Error::validation(format!(
                "controller {} endpoint {:?} is not host:port",
                self.name, self.endpoint
            )));
        }
        if let Some(connection) = &self.connection {
            if connection.destination.trim().is_empty() {
                return Err(Error::validation(format!(
                    "controller {} connection has no destination",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub controllers: Vec<ControllerConfig>,
}

/// Per-user overrides, keyed by controller name.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PersonalConfig {
    #[serde(default)]
    pub controllers: Vec<PersonalController>,
}

#[derive(Clone, Default, Deserialize)]
pub struct PersonalController {
    pub name: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for PersonalController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersonalController")
            .field("name", &self.name)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

fn read_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let display = path.display().to_string();
    let text = fs::read_to_string(path).map_err(|e| Error::config(&display, e))?;
    serde_yaml::from_str(&text).map_err(|e| Error::config(&display, e))
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        read_yaml(path.as_ref())
    }

    /// Applies credential overrides from a personal config.
    pub fn merge(mut self, personal: PersonalConfig) -> Result<Self> {
        for entry in personal.controllers {
            let Some(controller) = self.controllers.iter_mut().find(|c| c.name == entry.name)
            else {
                return Err(Error::validation(format!(
                    "personal config refers to unknown controller {}",
                    entry.name
                )));
            };
            if let Some(username) = entry.username {
                controller.username = username;
            }
            if let Some(password) = entry.password {
                controller.password = password;
            }
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for controller in &self.controllers {
            controller.validate()?;
            if !seen.insert(controller.name.as_str()) {
                return Err(Error::validation(format!(
                    "duplicate controller name {}",
                    controller.name
                )));
            }
            for subnet in controller.connection.iter().flat_map(|c| &c.subnets) {
                if !is_cidr(subnet) {
                    return Err(Error::validation(format!(
                        "controller {} subnet {:?} is not in CIDR form",
                        controller.name, subnet
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn controller(&self, name: &str) -> Option<&ControllerConfig> {
        self.controllers.iter().find(|c| c.name == name)
    }
}

impl PersonalConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        read_yaml(path.as_ref())
    }
}

fn is_cidr(subnet: &str) -> bool {
    let Some((addr, prefix)) = subnet.split_once('/') else {
        return false;
    };
    let (Ok(addr), Ok(prefix)) = (addr.parse::<IpAddr>(), prefix.parse::<u8>()) else {
        return false;
    };
    match addr {
        IpAddr::V4(_) => prefix <= 32,
        IpAddr::V6(_) => prefix <= 128,
    }
}
