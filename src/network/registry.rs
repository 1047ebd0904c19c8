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

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

use super::ClientHandle;
use crate::dispatch::SessionListener;

/// Live connections keyed by peer address.
///
/// Connect fires after a successful `add`, disconnect after a successful `remove`.
/// Both callbacks run outside the map's shard locks, so listeners may look the
/// registry up again.
pub struct ClientRegistry {
    clients: DashMap<SocketAddr, Arc<ClientHandle>>,
    listener: Arc<dyn SessionListener>,
}

impl ClientRegistry {
    pub fn new(listener: Arc<dyn SessionListener>) -> Self {
        ClientRegistry {
            clients: DashMap::new(),
            listener,
        }
    }

    /// Registers a connection. Returns false, without firing the connect callback,
    /// if the endpoint is already registered.
    pub fn add(&self, client: Arc<ClientHandle>) -> bool {
        let peer = client.peer();
        match self.clients.entry(peer) {
            Entry::Occupied(_) => {
                warn!(%peer, "endpoint already registered");
                return false;
            }
            Entry::Vacant(slot) => {
                slot.insert(client.clone());
            }
        }
        debug!(%peer, connection_id = client.connection_id(), "client registered");
        self.listener.on_connect(&client);
        true
    }

    /// Unregisters a connection. A second call for the same endpoint is a no-op.
    pub fn remove(&self, peer: &SocketAddr) -> Option<Arc<ClientHandle>> {
        let (_, client) = self.clients.remove(peer)?;
        debug!(%peer, connection_id = client.connection_id(), "client unregistered");
        self.listener.on_disconnect(&client);
        Some(client)
    }

    pub fn get(&self, peer: &SocketAddr) -> Option<Arc<ClientHandle>> {
        self.clients.get(peer).map(|entry| entry.value().clone())
    }

    pub fn endpoints(&self) -> Vec<SocketAddr> {
        self.clients.iter().map(|entry| *entry.key()).collect()
    }

    pub fn clients(&self) -> Vec<Arc<ClientHandle>> {
        self.clients.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &self.clients.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    #[derive(Default)]
    struct CountingListener {
        connects: AtomicUsize,
        disconnects: AtomicUsize,
    }

    impl SessionListener for CountingListener {
        fn on_connect(&self, _client: &Arc<ClientHandle>) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }
        fn on_disconnect(&self, _client: &Arc<ClientHandle>) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn client_handle(id: u64) -> (Arc<ClientHandle>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (socket, peer) = listener.accept().await.unwrap();
        let (_, writer) = socket.into_split();
        (Arc::new(ClientHandle::new(id, peer, writer, None)), remote)
    }

    #[tokio::test]
    async fn test_callbacks_fire_once() {
        let listener = Arc::new(CountingListener::default());
        let registry = ClientRegistry::new(listener.clone());
        let (client, _remote) = client_handle(1).await;
        let peer = client.peer();

        assert!(registry.add(client.clone()));
        assert!(!registry.add(client.clone()));
        assert_eq!(listener.connects.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.endpoints(), vec![peer]);
        assert_eq!(registry.get(&peer).unwrap().connection_id(), 1);

        assert!(registry.remove(&peer).is_some());
        assert!(registry.remove(&peer).is_none());
        assert_eq!(listener.disconnects.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
        assert!(registry.get(&peer).is_none());
    }

    #[tokio::test]
    async fn test_concurrent_add_remove() {
        let listener = Arc::new(CountingListener::default());
        let registry = Arc::new(ClientRegistry::new(listener.clone()));
        let mut clients = Vec::new();
        for id in 0..16 {
            clients.push(client_handle(id).await);
        }

        let mut tasks = Vec::new();
        for (client, _) in &clients {
            let registry = registry.clone();
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                registry.add(client.clone());
                tokio::task::yield_now().await;
                registry.remove(&client.peer());
                registry.remove(&client.peer());
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(registry.is_empty());
        assert_eq!(listener.connects.load(Ordering::SeqCst), 16);
        assert_eq!(listener.disconnects.load(Ordering::SeqCst), 16);
    }
}
