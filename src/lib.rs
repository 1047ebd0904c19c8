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

pub mod dispatch;
pub mod network;
pub mod service;
pub mod utils;

pub use dispatch::{ConnectionLane, Dispatcher, MessageHandler, SessionListener};
pub use network::{encode_frame, ClientHandle, ClientRegistry, SpaFrame, HEADER_SIZE};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, DispatchConfig, DispatchStrategy,
    NetworkConfig, ServerConfig, Shutdown, SpaServer,
};
pub use utils::{RetryPolicy, Transient};
