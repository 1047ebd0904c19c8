// Copyright 2025 jonefeewang@gmail.com
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

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};
use crate::network::{HEADER_SIZE, MAX_DECLARABLE_LEN};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub backlog: u32,
    pub max_connection: usize,
    /// size of the scratch buffer each read lands in
    pub recv_buffer_size: usize,
    /// 0 disables the timeout
    pub read_timeout_ms: u64,
    /// 0 disables the timeout
    pub write_timeout_ms: u64,
    pub keep_alive: bool,
    pub nodelay: bool,
    /// largest header-declared frame length accepted
    pub max_frame_size: usize,
    /// ceiling for bytes held by one connection while waiting for a frame to complete
    pub max_buffered_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "0.0.0.0".to_string(),
            port: 7070,
            backlog: 1024,
            max_connection: 10_000,
            recv_buffer_size: 4 * 1024,
            read_timeout_ms: 0,
            write_timeout_ms: 5_000,
            keep_alive: true,
            nodelay: true,
            max_frame_size: MAX_DECLARABLE_LEN,
            max_buffered_bytes: 64 * 1024,
        }
    }
}

impl NetworkConfig {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
    pub fn read_timeout(&self) -> Option<Duration> {
        millis(self.read_timeout_ms)
    }
    pub fn write_timeout(&self) -> Option<Duration> {
        millis(self.write_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStrategy {
    /// one task per frame
    PerMessage,
    /// fixed set of workers fed by a bounded queue
    WorkerPool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub strategy: DispatchStrategy,
    pub pool_size: usize,
    /// frames the worker pool holds across all connections before `dispatch` waits
    pub queue_capacity: usize,
    /// await per-message tasks on shutdown instead of abandoning them
    pub track_in_flight: bool,
    /// total time `stop` waits for connection handlers and queued frames
    pub drain_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            strategy: DispatchStrategy::WorkerPool,
            pool_size: num_cpus::get(),
            queue_capacity: 1024,
            track_in_flight: true,
            drain_timeout_ms: 5_000,
        }
    }
}

impl DispatchConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub dispatch: DispatchConfig,
}

impl ServerConfig {
    /// Reads a config file and overlays `SPA__<SECTION>__<KEY>` environment variables.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<ServerConfig> {
        let path = path.as_ref();
        let path_str = path.to_str().ok_or(AppError::InvalidValue(format!(
            "config file path: {}",
            path.to_string_lossy()
        )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix("SPA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.validate()?;
        Ok(server_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        let network = &self.network;
        if network.recv_buffer_size == 0 {
            return Err(AppError::InvalidValue(
                "network.recv_buffer_size must be positive".into(),
            ));
        }
        if network.max_connection == 0 {
            return Err(AppError::InvalidValue(
                "network.max_connection must be positive".into(),
            ));
        }
        if !(HEADER_SIZE..=MAX_DECLARABLE_LEN).contains(&network.max_frame_size) {
            return Err(AppError::InvalidValue(format!(
                "network.max_frame_size {} outside [{}, {}]",
                network.max_frame_size, HEADER_SIZE, MAX_DECLARABLE_LEN
            )));
        }
        // a partial frame plus one full read must always fit
        let needed = network.max_frame_size + network.recv_buffer_size;
        if network.max_buffered_bytes < needed {
            return Err(AppError::InvalidValue(format!(
                "network.max_buffered_bytes {} below max_frame_size + recv_buffer_size ({})",
                network.max_buffered_bytes, needed
            )));
        }
        if self.dispatch.pool_size == 0 {
            return Err(AppError::InvalidValue(
                "dispatch.pool_size must be positive".into(),
            ));
        }
        if self.dispatch.queue_capacity == 0 {
            return Err(AppError::InvalidValue(
                "dispatch.queue_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
