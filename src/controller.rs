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

//! The controller handle the manager hands out, and a reachability-only implementation of it.

use std::{
    io,
    net::Shutdown,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use smol::{lock::Mutex, net::TcpStream};
use tracing::debug;

use crate::{
    config::ControllerConfig,
    error::{Error, Result},
};

/// A client for one cluster controller. Implementations own the wire protocol; the manager only
/// opens, closes and health-checks them.
#[async_trait]
pub trait Controller: Send + Sync {
    async fn connect(
        &self,
        endpoint: &str,
        username: &str,
        password: &str,
        cacert: &str,
    ) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Whether the handle still believes it is connected. May turn false on its own.
    fn is_connected(&self) -> bool;
}

/// Builds a fresh, unconnected handle for a controller.
pub trait ControllerFactory: Send + Sync {
    fn create(&self, config: &ControllerConfig) -> Arc<dyn Controller>;
}

impl<F> ControllerFactory for F
where
    F: Fn(&ControllerConfig) -> Arc<dyn Controller> + Send + Sync,
{
    fn create(&self, config: &ControllerConfig) -> Arc<dyn Controller> {
        self(config)
    }
}

/// Holds a plain TCP connection to the controller endpoint. Credentials are accepted and
/// ignored.
#[derive(Default)]
pub struct TcpController {
    stream: Mutex<Option<TcpStream>>,
    connected: AtomicBool,
}

impl TcpController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory() -> impl ControllerFactory {
        |_: &ControllerConfig| -> Arc<dyn Controller> { Arc::new(TcpController::new()) }
    }
}

#[async_trait]
impl Controller for TcpController {
    async fn connect(
        &self,
        endpoint: &str,
        username: &str,
        _password: &str,
        _cacert: &str,
    ) -> Result<()> {
        let stream = TcpStream::connect(endpoint)
            .await
            .map_err(|e| Error::connect(endpoint, e))?;
        debug!(endpoint, username, "controller reachable");
        *self.stream.lock().await = Some(stream);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        let Some(stream) = self.stream.lock().await.take() else {
            return Ok(());
        };
        match stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(Error::disconnect(e)),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
