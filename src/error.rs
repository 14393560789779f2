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

//! Error types for connection management.

use std::io;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The controller description is malformed. This is a caller bug and is never retried.
    #[error("invalid controller config: {0}")]
    Validation(String),

    /// Every candidate port in the range is already bound.
    #[error("no free TCP port in range {start}..{end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("failed to spawn {program}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("failed to disconnect: {reason}")]
    Disconnect { reason: String },

    #[error("failed to terminate tunnel process {pid}")]
    Terminate {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to load {path}: {reason}")]
    Config { path: String, reason: String },

    #[error("cleanup failed for {}", describe_failures(.0))]
    Cleanup(Vec<(String, Error)>),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn connect(endpoint: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connect {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }

    pub fn disconnect(reason: impl ToString) -> Self {
        Self::Disconnect {
            reason: reason.to_string(),
        }
    }

    pub fn config(path: impl Into<String>, reason: impl ToString) -> Self {
        Self::Config {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

fn describe_failures(failures: &[(String, Error)]) -> String {
    failures
        .iter()
        .map(|(name, err)| format!("{}: {}", name, err))
        .collect::<Vec<_>>()
        .join("; ")
}
