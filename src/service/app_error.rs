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

use std::borrow::Cow;
use std::net::SocketAddr;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalState(Cow<'static, str>),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// transport errors, scoped to one connection
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("{0} timed out after {1} ms")]
    Timeout(&'static str, u64),

    #[error("connection {0} is closed")]
    ConnectionClosed(SocketAddr),

    /// framing errors, the connection is dropped without resync
    #[error("malformed frame: declared length {0}")]
    MalformedFrame(i16),

    #[error("frame of length {0} exceeds the maximum {1}")]
    FrameTooLarge(usize, usize),

    #[error("unconsumed buffer of {0} bytes exceeds the ceiling {1}")]
    BufferOverflow(usize, usize),

    /// dispatch errors
    #[error("dispatcher is closed")]
    DispatcherClosed,

    #[error("handler error: {0}")]
    Handler(String),

    /// lifecycle errors
    #[error("failed to bind {0}: {1}")]
    Bind(String, std::io::Error),

    #[error("accept error: {0}")]
    Accept(String),
}

impl AppError {
    /// Protocol violations and buffer exhaustion. The connection that produced
    /// them is disconnected.
    pub fn is_framing_error(&self) -> bool {
        matches!(
            self,
            AppError::MalformedFrame(_) | AppError::FrameTooLarge(..) | AppError::BufferOverflow(..)
        )
    }

    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            AppError::IoError(_) | AppError::Timeout(..) | AppError::ConnectionClosed(_)
        )
    }
}
