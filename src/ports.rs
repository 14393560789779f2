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

//! Local TCP port selection for SSH forwards.

use std::{future::Future, io, ops::Range};

use rand::{seq::SliceRandom, Rng};
use smol::net::TcpStream;
use tracing::trace;

use crate::error::{Error, Result};

/// Ports handed to SSH forwards unless the caller picks another range.
pub const DEFAULT_PORT_RANGE: Range<u16> = 17071..17170;

/// Returns a port from `range` that nothing on localhost is listening on.
///
/// Candidates are probed in random order so that concurrent callers do not all race for the
/// lowest port.
pub async fn get_free_tcp_port(range: Range<u16>) -> Result<u16> {
    let candidates = shuffled(range.clone(), &mut rand::thread_rng());
    first_free(candidates, is_port_free)
        .await
        .ok_or(Error::NoFreePort {
            start: range.start,
            end: range.end,
        })
}

fn shuffled(range: Range<u16>, rng: &mut impl Rng) -> Vec<u16> {
    let mut candidates: Vec<u16> = range.collect();
    candidates.shuffle(rng);
    candidates
}

async fn first_free<F, Fut>(candidates: impl IntoIterator<Item = u16>, mut probe: F) -> Option<u16>
where
    F: FnMut(u16) -> Fut,
    Fut: Future<Output = bool>,
{
    for port in candidates {
        if probe(port).await {
            return Some(port);
        }
    }
    None
}

/// A port is free when every address `localhost` resolves to refuses the connection. Anything
/// that accepts, or fails in some other way, counts as taken.
async fn is_port_free(port: u16) -> bool {
    let addrs = match smol::net::resolve(("localhost", port)).await {
        Ok(addrs) => addrs,
        Err(e) => {
            trace!(port, error = %e, "failed to resolve localhost");
            return false;
        }
    };
    let mut refused = false;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(_stream) => {
                trace!(port, %addr, "port in use");
                return false;
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => refused = true,
            Err(e) => trace!(port, %addr, error = %e, "probe failed"),
        }
    }
    refused
}
