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


use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::handler::invoke;
use super::{ConnectionLane, DispatchUnit, MessageHandler};
use crate::{AppError, AppResult};

/// One task per frame, no upper bound on concurrency.
///
/// A connection has at most one frame task alive; when it finishes it spawns the
/// task for the next frame of that connection, if any.
pub struct PerMessageDispatcher<H: MessageHandler> {
    spawner: FrameSpawner<H>,
    closed: AtomicBool,
}

struct FrameSpawner<H> {
    handler: Arc<H>,
    tracker: Option<TaskTracker>,
}

impl<H> Clone for FrameSpawner<H> {
    fn clone(&self) -> Self {
        FrameSpawner {
            handler: self.handler.clone(),
            tracker: self.tracker.clone(),
        }
    }
}

impl<H: MessageHandler> FrameSpawner<H> {
    fn spawn(&self, lane: Arc<ConnectionLane>) {
        let spawner = self.clone();
        let task = async move {
            if let Some(unit) = lane.pop() {
                invoke(spawner.handler.as_ref(), unit).await;
            }
            if lane.advance() {
                spawner.spawn(lane);
            }
        };
        match &self.tracker {
            Some(tracker) => {
                tracker.spawn(task);
            }
            None => {
                tokio::spawn(task);
            }
        }
    }
}

impl<H: MessageHandler> PerMessageDispatcher<H> {
    pub fn new(handler: Arc<H>, track_in_flight: bool) -> Self {
        PerMessageDispatcher {
            spawner: FrameSpawner {
                handler,
                tracker: track_in_flight.then(TaskTracker::new),
            },
            closed: AtomicBool::new(false),
        }
    }

    pub fn dispatch(&self, lane: &Arc<ConnectionLane>, unit: DispatchUnit) -> AppResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AppError::DispatcherClosed);
        }
        if lane.push(unit, None) {
            self.spawner.spawn(lane.clone());
        }
        Ok(())
    }

    /// Number of tracked tasks still running. Always 0 when tracking is off.
    pub fn in_flight(&self) -> usize {
        self.spawner.tracker.as_ref().map_or(0, TaskTracker::len)
    }

    pub async fn shutdown(&self, grace: Duration) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(tracker) = &self.spawner.tracker else {
            debug!("per-message dispatcher closed, in-flight tasks are not tracked");
            return;
        };
        // a finishing frame task may still spawn its successor, the tracker stays non-empty until then
        tracker.close();
        if time::timeout(grace, tracker.wait()).await.is_err() {
            warn!(
                remaining = tracker.len(),
                "per-message tasks still running after {:?}, abandoning them", grace
            );
        } else {
            debug!("per-message dispatcher drained");
        }
    }
}
