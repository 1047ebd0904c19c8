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

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{error, trace};

use super::DispatchUnit;
use crate::network::{ClientHandle, SpaFrame};
use crate::AppResult;

/// Connection lifecycle notifications, fired by the client registry.
pub trait SessionListener: Send + Sync + 'static {
    fn on_connect(&self, _client: &Arc<ClientHandle>) {}
    fn on_disconnect(&self, _client: &Arc<ClientHandle>) {}
}

/// Application logic run once per complete frame.
///
/// A handler may reply through `client`, but the connection can close while it
/// runs; `ClientHandle::send` then fails with `ConnectionClosed`. Slow work such
/// as database calls only ever occupies a dispatch slot, never the connection's
/// read loop.
pub trait MessageHandler: SessionListener {
    fn handle(
        &self,
        frame: SpaFrame,
        client: Arc<ClientHandle>,
    ) -> impl Future<Output = AppResult<()>> + Send;
}

/// Runs the handler for one frame. Errors and panics are logged and stay scoped
/// to this frame.
pub(crate) async fn invoke<H: MessageHandler>(handler: &H, unit: DispatchUnit) {
    let DispatchUnit { frame, client } = unit;
    let peer = client.peer();
    let connection_id = client.connection_id();
    let frame_len = frame.len();

    // runs in the caller's task, so aborting the caller cancels the handler too
    let result = AssertUnwindSafe(handler.handle(frame, client))
        .catch_unwind()
        .await;
    match result {
        Ok(Ok(())) => {
            trace!(%peer, connection_id, frame_len, "frame handled");
        }
        Ok(Err(e)) => {
            error!(%peer, connection_id, frame_len, "handler failed: {}", e);
        }
        Err(payload) => {
            error!(
                %peer,
                connection_id,
                frame_len,
                "handler panicked with message: {}",
                panic_message(&*payload)
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}
