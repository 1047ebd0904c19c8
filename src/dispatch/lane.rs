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


use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::OwnedSemaphorePermit;

use super::DispatchUnit;

/// Frames of one connection waiting for the handler.
///
/// A lane is either idle or scheduled. Only a scheduled lane is handed to an
/// executor, and only the executor holding it takes frames out, one at a time.
/// That keeps the frames of a connection in arrival order without parking a
/// worker on a frame whose turn has not come yet.
#[derive(Debug, Default)]
pub struct ConnectionLane {
    state: Mutex<LaneState>,
}

#[derive(Debug, Default)]
struct LaneState {
    pending: VecDeque<Pending>,
    scheduled: bool,
}

#[derive(Debug)]
struct Pending {
    unit: DispatchUnit,
    // frees a queue slot once the frame leaves the lane
    _slot: Option<OwnedSemaphorePermit>,
}

impl ConnectionLane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames queued and not yet taken by an executor.
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a frame. Returns `true` when the lane was idle; the caller then
    /// has to schedule it.
    pub(crate) fn push(&self, unit: DispatchUnit, slot: Option<OwnedSemaphorePermit>) -> bool {
        let mut state = self.state.lock();
        state.pending.push_back(Pending { unit, _slot: slot });
        !std::mem::replace(&mut state.scheduled, true)
    }

    /// Takes the head frame of a scheduled lane.
    pub(crate) fn pop(&self) -> Option<DispatchUnit> {
        self.state.lock().pending.pop_front().map(|pending| pending.unit)
    }

    /// Called once the frame returned by `pop` has been handled. Returns `true`
    /// if more frames are waiting and the lane stays scheduled, otherwise the
    /// lane goes idle.
    pub(crate) fn advance(&self) -> bool {
        let mut state = self.state.lock();
        if state.pending.is_empty() {
            state.scheduled = false;
            false
        } else {
            true
        }
    }

    /// Drops every pending frame and marks the lane idle. Used when a lane could
    /// not be scheduled.
    pub(crate) fn abandon(&self) -> usize {
        let mut state = self.state.lock();
        state.scheduled = false;
        let dropped = state.pending.len();
        state.pending.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::Semaphore;

    use super::*;
    use crate::network::{encode_frame, ClientHandle, SpaFrame};

    async fn unit(tag: u8) -> (DispatchUnit, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (socket, peer) = listener.accept().await.unwrap();
        let (_, writer) = socket.into_split();
        let bytes = encode_frame(&[], &[tag]).unwrap();
        let unit = DispatchUnit {
            frame: SpaFrame::extract(&bytes, 1024).unwrap().0.unwrap(),
            client: Arc::new(ClientHandle::new(1, peer, writer, None)),
        };
        (unit, remote)
    }

    #[tokio::test]
    async fn test_only_first_push_schedules() {
        let lane = ConnectionLane::new();
        let (u1, _r1) = unit(1).await;
        let (u2, _r2) = unit(2).await;
        assert!(lane.push(u1, None));
        assert!(!lane.push(u2, None));
        assert_eq!(lane.len(), 2);

        assert_eq!(lane.pop().unwrap().frame.payload(), &[1]);
        assert!(lane.advance());
        assert_eq!(lane.pop().unwrap().frame.payload(), &[2]);
        assert!(!lane.advance());
        assert!(lane.is_empty());

        // idle again, the next push schedules
        let (u3, _r3) = unit(3).await;
        assert!(lane.push(u3, None));
    }

    #[tokio::test]
    async fn test_push_while_running_keeps_lane_scheduled() {
        let lane = ConnectionLane::new();
        let (u1, _r1) = unit(1).await;
        let (u2, _r2) = unit(2).await;
        assert!(lane.push(u1, None));
        let _running = lane.pop().unwrap();
        // arrives while the head frame is being handled
        assert!(!lane.push(u2, None));
        assert!(lane.advance());
        assert_eq!(lane.pop().unwrap().frame.payload(), &[2]);
    }

    #[tokio::test]
    async fn test_slot_released_when_frame_leaves() {
        let slots = Arc::new(Semaphore::new(2));
        let lane = ConnectionLane::new();
        let (u1, _r1) = unit(1).await;
        let (u2, _r2) = unit(2).await;
        lane.push(u1, Some(slots.clone().acquire_owned().await.unwrap()));
        lane.push(u2, Some(slots.clone().acquire_owned().await.unwrap()));
        assert_eq!(slots.available_permits(), 0);

        lane.pop();
        assert_eq!(slots.available_permits(), 1);
        assert_eq!(lane.abandon(), 1);
        assert_eq!(slots.available_permits(), 2);
        assert!(lane.is_empty());
    }
}
