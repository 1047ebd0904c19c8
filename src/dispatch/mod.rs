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

//! Hands complete frames to the application handler.
//!
//! Two interchangeable strategies share one entry point:
//!
//! - `PerMessage`: a task per frame, unbounded
//! - `WorkerPool`: `N` workers behind a bounded queue and an `N`-permit gate
//!
//! Both invoke the handler exactly once per frame, keep handler errors and panics
//! scoped to the frame, and run the frames of one connection in arrival order
//! through that connection's `ConnectionLane`. Nothing is ordered across
//! connections.

use std::sync::Arc;
use std::time::Duration;

pub use handler::{MessageHandler, SessionListener};
pub use lane::ConnectionLane;
pub use per_message::PerMessageDispatcher;
pub use worker_pool::WorkerPool;

use crate::network::{ClientHandle, SpaFrame};
use crate::service::{DispatchConfig, DispatchStrategy};
use crate::AppResult;

mod handler;
mod lane;
mod per_message;
mod worker_pool;

/// A frame together with the connection it came from.
#[derive(Debug)]
pub struct DispatchUnit {
    pub frame: SpaFrame,
    pub client: Arc<ClientHandle>,
}

pub enum Dispatcher<H: MessageHandler> {
    PerMessage(PerMessageDispatcher<H>),
    WorkerPool(WorkerPool<H>),
}

impl<H: MessageHandler> Dispatcher<H> {
    /// Must be called from within a tokio runtime; the pool strategy spawns its workers here.
    pub fn new(handler: Arc<H>, config: &DispatchConfig) -> Self {
        match config.strategy {
            DispatchStrategy::PerMessage => Dispatcher::PerMessage(PerMessageDispatcher::new(
                handler,
                config.track_in_flight,
            )),
            DispatchStrategy::WorkerPool => Dispatcher::WorkerPool(WorkerPool::new(
                handler,
                config.queue_capacity,
                config.pool_size,
            )),
        }
    }

    pub fn strategy(&self) -> DispatchStrategy {
        match self {
            Dispatcher::PerMessage(_) => DispatchStrategy::PerMessage,
            Dispatcher::WorkerPool(_) => DispatchStrategy::WorkerPool,
        }
    }

    /// Hands a frame over behind the earlier frames of the same `lane`.
    /// Fails with `DispatcherClosed` once shutdown has begun.
    pub async fn dispatch(&self, lane: &Arc<ConnectionLane>, unit: DispatchUnit) -> AppResult<()> {
        match self {
            Dispatcher::PerMessage(dispatcher) => dispatcher.dispatch(lane, unit),
            Dispatcher::WorkerPool(pool) => pool.send(lane, unit).await,
        }
    }

    pub async fn shutdown(&self, grace: Duration) {
        match self {
            Dispatcher::PerMessage(dispatcher) => dispatcher.shutdown(grace).await,
            Dispatcher::WorkerPool(pool) => pool.shutdown(grace).await,
        }
    }
}
