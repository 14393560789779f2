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

//! One live connection per controller name, with the tunnels those connections ride on.

use std::{collections::HashMap, fmt, ops::Range, sync::Arc};

use smol::lock::Mutex;
use tracing::{debug, info, warn};

use crate::{
    config::ControllerConfig,
    controller::{Controller, ControllerFactory},
    error::{Error, Result},
    ports::{get_free_tcp_port, DEFAULT_PORT_RANGE},
    retry::{retry_with_backoff, RetryConfig},
    tunnel::{SystemLauncher, TunnelLauncher, TunnelProcess},
};

/// A connected controller handle together with the tunnel process it depends on, if any.
pub struct Connection {
    controller: Arc<dyn Controller>,
    process: Option<Box<dyn TunnelProcess>>,
}

impl Connection {
    pub fn new(controller: Arc<dyn Controller>, process: Option<Box<dyn TunnelProcess>>) -> Self {
        Self {
            controller,
            process,
        }
    }

    pub fn controller(&self) -> &Arc<dyn Controller> {
        &self.controller
    }

    pub fn process_id(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.id())
    }

    /// Disconnects the handle and terminates the tunnel. Both are attempted; the first failure is
    /// returned.
    pub async fn release(self) -> Result<()> {
        let Connection {
            controller,
            mut process,
        } = self;
        let disconnected = controller.disconnect().await;
        let terminated = match process.as_mut() {
            Some(process) => process.terminate(),
            None => Ok(()),
        };
        disconnected.and(terminated)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("connected", &self.controller.is_connected())
            .field("process", &self.process_id())
            .finish()
    }
}

/// Live connections keyed by controller name. A missing key means "not connected".
#[derive(Default)]
pub struct Registry {
    connections: Mutex<HashMap<String, Connection>>,
}

impl Registry {
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Controller>> {
        let connections = self.connections.lock().await;
        connections.get(name).map(|c| c.controller.clone())
    }

    /// Stores `connection`, returning whatever was there before.
    pub async fn put(&self, name: impl Into<String>, connection: Connection) -> Option<Connection> {
        self.connections.lock().await.insert(name.into(), connection)
    }

    pub async fn remove(&self, name: &str) -> Option<Connection> {
        self.connections.lock().await.remove(name)
    }

    pub async fn drain(&self) -> Vec<(String, Connection)> {
        self.connections.lock().await.drain().collect()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.connections.lock().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct ConnectOptions {
    /// Candidate local ports for SSH forwards.
    pub port_range: Range<u16>,
    /// Drop any cached connection and connect again.
    pub reconnect: bool,
    /// Reach tunnelled controllers through sshuttle instead of a port forward.
    pub sshuttle: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            port_range: DEFAULT_PORT_RANGE,
            reconnect: false,
            sshuttle: false,
        }
    }
}

/// Hands out controller handles, reusing live ones and reconnecting stale ones.
///
/// At most one connection per controller name is kept. Calls for the same name are serialized;
/// calls for different names proceed independently.
pub struct ConnectManager {
    factory: Box<dyn ControllerFactory>,
    launcher: Box<dyn TunnelLauncher>,
    registry: Registry,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    retry: RetryConfig,
}

impl ConnectManager {
    /// A manager that tunnels through the system `ssh` and `sshuttle`.
    pub fn new(factory: impl ControllerFactory + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            launcher: Box::new(SystemLauncher),
            registry: Registry::default(),
            locks: Mutex::default(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_launcher(mut self, launcher: impl TunnelLauncher + 'static) -> Self {
        self.launcher = Box::new(launcher);
        self
    }

    /// Retry policy for the first connect through a freshly spawned tunnel.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    async fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(name.to_owned()).or_default().clone()
    }

    /// Returns a connected handle for `config`.
    ///
    /// A cached handle is reused when it still reports connected and `options.reconnect` is not
    /// set. Otherwise the cached connection is released and a new one is made.
    pub async fn get_controller(
        &self,
        config: &ControllerConfig,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn Controller>> {
        config.validate()?;
        let lock = self.name_lock(&config.name).await;
        let result = {
            let _guard = lock.lock().await;
            self.get_controller_locked(config, options).await
        };
        self.release_name_lock(&config.name, lock).await;
        result
    }

    /// Forgets the lock for `name` once no other call is holding or waiting on it.
    async fn release_name_lock(&self, name: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        // One reference in the map, one here.
        let ours = locks.get(name).is_some_and(|l| Arc::ptr_eq(l, &lock));
        if ours && Arc::strong_count(&lock) == 2 {
            locks.remove(name);
        }
    }

    async fn get_controller_locked(
        &self,
        config: &ControllerConfig,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn Controller>> {
        if let Some(existing) = self.registry.get(&config.name).await {
            if !options.reconnect && existing.is_connected() {
                debug!(controller = %config.name, "reusing connection");
                return Ok(existing);
            }
            debug!(
                controller = %config.name,
                reconnect = options.reconnect,
                "replacing connection"
            );
            if let Some(old) = self.registry.remove(&config.name).await {
                old.release().await?;
            }
        }

        let connection = self.connect(config, options).await?;
        let controller = connection.controller().clone();
        self.registry.put(config.name.clone(), connection).await;
        Ok(controller)
    }

    async fn connect(
        &self,
        config: &ControllerConfig,
        options: &ConnectOptions,
    ) -> Result<Connection> {
        let controller = self.factory.create(config);

        let Some(connection) = &config.connection else {
            debug!(controller = %config.name, endpoint = %config.endpoint, "connecting directly");
            connect_handle(&controller, config, &config.endpoint).await?;
            info!(controller = %config.name, endpoint = %config.endpoint, "connected");
            return Ok(Connection::new(controller, None));
        };

        let (mut process, endpoint) = if options.sshuttle {
            if connection.subnets.is_empty() {
                return Err(Error::validation(format!(
                    "controller {} has no subnets for sshuttle",
                    config.name
                )));
            }
            let process = self.launcher.sshuttle(
                &connection.subnets,
                &connection.destination,
                &connection.jumps,
            )?;
            (process, config.endpoint.clone())
        } else {
            let port = get_free_tcp_port(options.port_range.clone()).await?;
            let local = format!("localhost:{}", port);
            let process = self.launcher.port_forward(
                &local,
                &config.endpoint,
                &connection.destination,
                &connection.jumps,
            )?;
            (process, local)
        };
        debug!(
            controller = %config.name,
            pid = process.id(),
            sshuttle = options.sshuttle,
            %endpoint,
            "tunnel started"
        );

        let connected = retry_with_backoff(&self.retry, &config.name, || {
            connect_handle(&controller, config, &endpoint)
        })
        .await;
        if let Err(e) = connected {
            if let Err(term) = process.terminate() {
                warn!(controller = %config.name, error = %term, "failed to stop tunnel");
            }
            return Err(e);
        }
        info!(controller = %config.name, %endpoint, via = %connection.destination, "connected");
        Ok(Connection::new(controller, Some(process)))
    }

    /// Closes every connection and empties the registry. Failures do not stop the remaining
    /// connections from being closed; they are reported together at the end.
    pub async fn clean(&self) -> Result<()> {
        self.locks.lock().await.clear();
        let mut failures = Vec::new();
        for (name, connection) in self.registry.drain().await {
            debug!(controller = %name, "closing connection");
            if let Err(e) = connection.release().await {
                warn!(controller = %name, error = %e, "failed to close connection");
                failures.push((name, e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Cleanup(failures))
        }
    }
}

async fn connect_handle(
    controller: &Arc<dyn Controller>,
    config: &ControllerConfig,
    endpoint: &str,
) -> Result<()> {
    controller
        .connect(endpoint, &config.username, &config.password, &config.ca_cert)
        .await
}
