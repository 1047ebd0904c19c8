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


use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

use super::handler::invoke;
use super::{ConnectionLane, DispatchUnit, MessageHandler};
use crate::{AppError, AppResult};

/// Bounded pool of `N` workers.
///
/// The queue holds scheduled lanes, not frames, so a connection occupies at most
/// one queue entry and at most one worker at a time. A worker handles the head
/// frame of a lane and puts the lane back at the tail if more frames are waiting,
/// letting other connections take their turn in between. `queue_capacity` bounds
/// the frames waiting across all lanes; a full pool makes `send` wait.
pub struct WorkerPool<H: MessageHandler> {
    lane_tx: async_channel::Sender<Arc<ConnectionLane>>,
    slots: Arc<Semaphore>,
    capacity: usize,
    gate: Arc<Semaphore>,
    workers: Mutex<Vec<Worker>>,
    num_workers: usize,
    _handler: PhantomData<H>,
}

struct Worker {
    id: usize,
    handle: JoinHandle<()>,
}

impl<H: MessageHandler> WorkerPool<H> {
    pub fn new(handler: Arc<H>, capacity: usize, num_workers: usize) -> Self {
        let (lane_tx, lane_rx) = async_channel::unbounded();
        let gate = Arc::new(Semaphore::new(num_workers));
        let workers = (0..num_workers)
            .map(|id| {
                Self::spawn_worker(
                    id,
                    lane_tx.clone(),
                    lane_rx.clone(),
                    handler.clone(),
                    gate.clone(),
                )
            })
            .collect();
        WorkerPool {
            lane_tx,
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            gate,
            workers: Mutex::new(workers),
            num_workers,
            _handler: PhantomData,
        }
    }

    fn spawn_worker(
        id: usize,
        lane_tx: async_channel::Sender<Arc<ConnectionLane>>,
        lane_rx: async_channel::Receiver<Arc<ConnectionLane>>,
        handler: Arc<H>,
        gate: Arc<Semaphore>,
    ) -> Worker {
        let handle = tokio::spawn(async move {
            debug!("Worker {} started", id);
            // recv fails only once the queue is closed and empty, so scheduled lanes drain first
            while let Ok(mut lane) = lane_rx.recv().await {
                loop {
                    if let Some(unit) = lane.pop() {
                        // the gate is never closed, an error here cannot happen
                        let _permit = gate.acquire().await.ok();
                        invoke(handler.as_ref(), unit).await;
                    }
                    if !lane.advance() {
                        break;
                    }
                    match lane_tx.try_send(lane) {
                        Ok(()) => break,
                        // queue closed for shutdown, finish this lane here
                        Err(e) => lane = e.into_inner(),
                    }
                }
            }
            debug!("Worker {} exited", id);
        });
        Worker { id, handle }
    }

    /// Queues a frame behind the connection's earlier frames. Waits while the
    /// pool already holds `queue_capacity` frames.
    pub async fn send(&self, lane: &Arc<ConnectionLane>, unit: DispatchUnit) -> AppResult<()> {
        let slot = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::DispatcherClosed)?;
        if self.lane_tx.is_closed() {
            return Err(AppError::DispatcherClosed);
        }
        if lane.push(unit, Some(slot)) && self.lane_tx.try_send(lane.clone()).is_err() {
            lane.abandon();
            return Err(AppError::DispatcherClosed);
        }
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.num_workers
    }

    /// Frames waiting for a worker.
    pub fn queued(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    /// Handler invocations currently running.
    pub fn busy(&self) -> usize {
        self.num_workers - self.gate.available_permits()
    }

    /// Stops taking frames and lets the workers drain the queue for up to `grace`.
    /// Workers still running afterwards are aborted together with their handlers.
    pub async fn shutdown(&self, grace: Duration) {
        self.slots.close();
        self.lane_tx.close();
        let mut workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        let drained = time::timeout(grace, async {
            for worker in workers.iter_mut() {
                let _ = (&mut worker.handle).await;
            }
        })
        .await;
        if drained.is_ok() {
            debug!("worker pool drained");
            return;
        }
        warn!(
            queued = self.queued(),
            "worker pool did not drain within {:?}, aborting", grace
        );
        for worker in workers {
            if !worker.handle.is_finished() {
                debug!("aborting worker {}", worker.id);
                worker.handle.abort();
                // wait for the cancellation so no handler outlives shutdown
                let _ = worker.handle.await;
            }
        }
    }
}
