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

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio::time;
use tracing::{debug, trace};

use crate::{AppError, AppResult};

/// Write side of one terminal connection, shared with handlers for replies.
///
/// Reads happen on the connection task; writes go through here and are serialized
/// by an async mutex so replies from concurrent handlers never interleave.
#[derive(Debug)]
pub struct ClientHandle {
    connection_id: u64,
    peer: SocketAddr,
    connected_at: DateTime<Local>,
    alive: AtomicBool,
    write_timeout: Option<Duration>,
    writer: Mutex<BufWriter<OwnedWriteHalf>>,
}

impl ClientHandle {
    pub fn new(
        connection_id: u64,
        peer: SocketAddr,
        writer: OwnedWriteHalf,
        write_timeout: Option<Duration>,
    ) -> Self {
        ClientHandle {
            connection_id,
            peer,
            connected_at: Local::now(),
            alive: AtomicBool::new(true),
            write_timeout,
            writer: Mutex::new(BufWriter::new(writer)),
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn connected_at(&self) -> DateTime<Local> {
        self.connected_at
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Marks the connection dead. Returns false if it already was.
    pub(crate) fn mark_closed(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    /// Writes `bytes` to the terminal and flushes.
    pub async fn send(&self, bytes: &[u8]) -> AppResult<()> {
        if !self.is_alive() {
            return Err(AppError::ConnectionClosed(self.peer));
        }
        let mut writer = self.writer.lock().await;
        let write = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        };
        match self.write_timeout {
            Some(limit) => time::timeout(limit, write)
                .await
                .map_err(|_| AppError::Timeout("write", limit.as_millis() as u64))??,
            None => write.await?,
        }
        trace!(peer = %self.peer, len = bytes.len(), "reply written");
        Ok(())
    }

    /// Sends FIN to the peer. Further sends fail.
    ///
    /// If a handler is mid-write the write half is left alone; it closes when the
    /// last reference to the handle is dropped.
    pub(crate) async fn close(&self) {
        self.mark_closed();
        let Ok(mut writer) = self.writer.try_lock() else {
            debug!(peer = %self.peer, "write half busy, deferring close");
            return;
        };
        if let Err(e) = writer.shutdown().await {
            debug!(peer = %self.peer, "shutdown write half failed: {}", e);
        }
    }
}
