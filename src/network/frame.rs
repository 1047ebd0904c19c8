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

use bytes::{BufMut, Bytes, BytesMut};

use crate::{AppError, AppResult};

/// Every frame starts with a fixed 68-byte header.
pub const HEADER_SIZE: usize = 68;
/// Offset of the little-endian i16 holding the total frame length, header included.
pub const LENGTH_OFFSET: usize = 6;
/// The length field is a signed 16-bit value, so no frame can declare more than this.
pub const MAX_DECLARABLE_LEN: usize = i16::MAX as usize;

/// One complete terminal message: header plus payload.
///
/// The bytes are owned by the frame. The connection buffer it was cut from can be
/// appended to and split again without ever touching a frame already handed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaFrame {
    bytes: Bytes,
}

impl SpaFrame {
    /// Reads the declared total length out of a buffer holding at least a header.
    fn declared_len_of(buffer: &[u8]) -> i16 {
        i16::from_le_bytes([buffer[LENGTH_OFFSET], buffer[LENGTH_OFFSET + 1]])
    }

    /// Checks whether `buffer` starts with a complete frame.
    ///
    /// Returns the frame length when it does, `None` while more bytes are needed.
    /// A declared length that cannot describe a frame is a protocol violation; there
    /// is no way to find the next frame boundary after one, so the caller has to drop
    /// the connection.
    pub fn check(buffer: &[u8], max_frame_size: usize) -> AppResult<Option<usize>> {
        if buffer.len() < HEADER_SIZE {
            return Ok(None);
        }
        let declared = Self::declared_len_of(buffer);
        if declared <= 0 || (declared as usize) < HEADER_SIZE {
            return Err(AppError::MalformedFrame(declared));
        }
        let frame_len = declared as usize;
        if frame_len > max_frame_size {
            return Err(AppError::FrameTooLarge(frame_len, max_frame_size));
        }
        if buffer.len() < frame_len {
            return Ok(None);
        }
        Ok(Some(frame_len))
    }

    /// Splits one complete frame off the front of `buffer`, leaving the remainder in place.
    pub fn parse(buffer: &mut BytesMut, max_frame_size: usize) -> AppResult<Option<SpaFrame>> {
        match SpaFrame::check(&buffer[..], max_frame_size)? {
            Some(frame_len) => {
                let bytes = buffer.split_to(frame_len).freeze();
                Ok(Some(SpaFrame { bytes }))
            }
            None => Ok(None),
        }
    }

    /// Stateless extraction: the first frame in `buffer`, if complete, and whatever follows it.
    ///
    /// When no frame is produced the remainder is the whole input.
    pub fn extract(buffer: &[u8], max_frame_size: usize) -> AppResult<(Option<SpaFrame>, &[u8])> {
        match SpaFrame::check(buffer, max_frame_size)? {
            Some(frame_len) => {
                let (frame, rest) = buffer.split_at(frame_len);
                let frame = SpaFrame {
                    bytes: Bytes::copy_from_slice(frame),
                };
                Ok((Some(frame), rest))
            }
            None => Ok((None, buffer)),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn declared_len(&self) -> i16 {
        Self::declared_len_of(&self.bytes)
    }

    pub fn header(&self) -> &[u8] {
        &self.bytes[..HEADER_SIZE]
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_SIZE..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

/// Builds a frame from a header prefix and a payload.
///
/// The header is zero-padded (or truncated) to 68 bytes and its length field is
/// overwritten with the total frame length.
pub fn encode_frame(header_prefix: &[u8], payload: &[u8]) -> AppResult<Bytes> {
    let total = HEADER_SIZE + payload.len();
    if total > MAX_DECLARABLE_LEN {
        return Err(AppError::FrameTooLarge(total, MAX_DECLARABLE_LEN));
    }
    let mut buf = BytesMut::with_capacity(total);
    let prefix_len = header_prefix.len().min(HEADER_SIZE);
    buf.put_slice(&header_prefix[..prefix_len]);
    buf.put_bytes(0, HEADER_SIZE - prefix_len);
    buf[LENGTH_OFFSET..LENGTH_OFFSET + 2].copy_from_slice(&(total as i16).to_le_bytes());
    buf.put_slice(payload);
    Ok(buf.freeze())
}
