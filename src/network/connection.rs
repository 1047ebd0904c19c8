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

use std::io::{self, ErrorKind};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::time;

use super::{ConnectionBuffer, SpaFrame};
use crate::service::NetworkConfig;
use crate::{AppError, AppResult};

/// Read side of a terminal connection.
///
/// Each read lands in a fixed-size scratch buffer; the received slice is appended to
/// the connection's carry-over and frames are cut from the front of it.
#[derive(Debug)]
pub struct Connection<R = OwnedReadHalf> {
    reader: R,
    scratch: Vec<u8>,
    buffer: ConnectionBuffer,
    read_timeout: Option<Duration>,
}

impl<R: AsyncRead + Unpin> Connection<R> {
    pub fn new(reader: R, config: &NetworkConfig) -> Connection<R> {
        Connection {
            reader,
            scratch: vec![0; config.recv_buffer_size],
            buffer: ConnectionBuffer::new(
                config.recv_buffer_size,
                config.max_frame_size,
                config.max_buffered_bytes,
            ),
            read_timeout: config.read_timeout(),
        }
    }

    /// Reads the next complete frame.
    ///
    /// Frames already buffered by an earlier read are returned without touching the
    /// socket. A framing error means the stream can no longer be trusted and the
    /// connection must be closed.
    ///
    /// If the client closes the connection while a frame is being sent, an error is returned.
    /// If the client closes the connection gracefully, `None` is returned.
    pub async fn read_frame(&mut self) -> AppResult<Option<SpaFrame>> {
        loop {
            if let Some(frame) = self.buffer.next_frame()? {
                return Ok(Some(frame));
            }
            let n = self.read_chunk().await?;
            if n == 0 {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        format!("connection closed with {} bytes of a frame", self.buffer.len()),
                    )
                    .into())
                };
            }
            self.buffer.append(&self.scratch[..n])?;
        }
    }

    async fn read_chunk(&mut self) -> AppResult<usize> {
        match self.read_timeout {
            Some(limit) => time::timeout(limit, self.reader.read(&mut self.scratch))
                .await
                .map_err(|_| AppError::Timeout("read", limit.as_millis() as u64))?
                .map_err(AppError::from),
            None => Ok(self.reader.read(&mut self.scratch).await?),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
