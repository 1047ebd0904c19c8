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

use bytes::BytesMut;

use super::SpaFrame;
use crate::{AppError, AppResult};

/// Carry-over bytes for one connection.
///
/// After every drain the buffer is either empty or holds the prefix of a frame that
/// is still waiting for bytes. It never holds a complete frame.
#[derive(Debug)]
pub struct ConnectionBuffer {
    buffer: BytesMut,
    max_frame_size: usize,
    max_buffered_bytes: usize,
}

impl ConnectionBuffer {
    pub fn new(capacity: usize, max_frame_size: usize, max_buffered_bytes: usize) -> Self {
        ConnectionBuffer {
            buffer: BytesMut::with_capacity(capacity),
            max_frame_size,
            max_buffered_bytes,
        }
    }

    /// Appends freshly read bytes after the carry-over.
    ///
    /// Fails without modifying the buffer if the result would exceed the ceiling.
    pub fn append(&mut self, data: &[u8]) -> AppResult<()> {
        let total = self.buffer.len() + data.len();
        if total > self.max_buffered_bytes {
            return Err(AppError::BufferOverflow(total, self.max_buffered_bytes));
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Cuts the next complete frame off the front, if there is one.
    pub fn next_frame(&mut self) -> AppResult<Option<SpaFrame>> {
        SpaFrame::parse(&mut self.buffer, self.max_frame_size)
    }

    /// Extracts every complete frame currently buffered, in arrival order.
    pub fn drain_frames(&mut self) -> AppResult<Vec<SpaFrame>> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
