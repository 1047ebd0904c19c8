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

//! Network Module Implementation
//!
//! Turns a TCP byte stream into terminal frames.
//!
//! # Components
//!
//! - `SpaFrame`: one complete message, validated against its 68-byte header
//! - `ConnectionBuffer`: per-connection carry-over between reads
//! - `Connection`: read half of a socket feeding the buffer
//! - `ClientHandle`: write half shared with handlers for replies
//! - `ClientRegistry`: live connections keyed by peer address
//!
//! A single read may hold zero, one, part of, or many frames. Extraction is
//! connection-local, so no state is shared across connections here apart from
//! the registry.

pub use client::ClientHandle;
pub use connection::Connection;
pub use connection_buffer::ConnectionBuffer;
pub use frame::{encode_frame, SpaFrame, HEADER_SIZE, LENGTH_OFFSET, MAX_DECLARABLE_LEN};
pub use registry::ClientRegistry;

mod client;
mod connection;
mod connection_buffer;
mod frame;
mod registry;
