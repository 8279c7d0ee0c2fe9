//! Test doubles shared by the unit tests of this crate.

use {
    crate::{
        memory::MemoryTransport,
        transport::{Connection, Transport, TransportEvent},
        ConnectionOptions,
        Result,
    },
    async_trait::async_trait,
    core_api::storage::{KeyValueStorage, MemoryStorage},
    relay_rpc::rpc::{Params, Payload},
    serde_json::Value,
    std::sync::{Arc, Mutex as StdMutex, PoisonError},
    tokio::sync::mpsc,
};

/// Memory storage whose writes to one component can be made to fail.
#[derive(Debug, Default)]
pub struct FlakyStorage {
    inner: MemoryStorage,
    failing: StdMutex<Option<String>>,
}

impl FlakyStorage {
    /// Fails every write to the component stored under `name`, or none.
    pub fn fail_writes_to(&self, name: Option<&str>) {
        *self.failing.lock().unwrap_or_else(PoisonError::into_inner) =
            name.map(|name| format!("//{name}"));
    }

    fn is_failing(&self, key: &str) -> bool {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_deref()
            .is_some_and(|suffix| key.ends_with(suffix))
    }
}

#[async_trait]
impl KeyValueStorage for FlakyStorage {
    async fn keys(&self) -> core_api::Result<Vec<String>> {
        self.inner.keys().await
    }

    async fn has_item(&self, key: &str) -> core_api::Result<bool> {
        self.inner.has_item(key).await
    }

    async fn get_item(&self, key: &str) -> core_api::Result<Option<Value>> {
        self.inner.get_item(key).await
    }

    async fn set_item(&self, key: &str, value: Value) -> core_api::Result<()> {
        if self.is_failing(key) {
            return Err(core_api::Error::Storage(format!("write to {key} refused")));
        }
        self.inner.set_item(key, value).await
    }

    async fn remove_item(&self, key: &str) -> core_api::Result<()> {
        self.inner.remove_item(key).await
    }

    async fn clear(&self) -> core_api::Result<()> {
        self.inner.clear().await
    }
}

/// Transport recording the params of every relay request sent through it.
/// It either forwards to a memory relay or never answers at all.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    relay: Option<MemoryTransport>,
    requests: Arc<StdMutex<Vec<Params>>>,
    /// Keeps the sockets of a silent transport open.
    sockets: StdMutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
}

impl RecordingTransport {
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn forwarding(relay: MemoryTransport) -> Self {
        Self {
            relay: Some(relay),
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Arc<StdMutex<Vec<Params>>> {
        self.requests.clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn connect(&self, options: &ConnectionOptions) -> Result<Connection> {
        let (outbound, mut frames) = mpsc::unbounded_channel::<String>();
        let requests = self.requests.clone();

        let (forward, inbound) = match &self.relay {
            Some(relay) => {
                let connection = relay.connect(options).await?;
                (Some(connection.outbound), connection.inbound)
            }
            None => {
                let (events, inbound) = mpsc::unbounded_channel();
                self.sockets
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(events);
                (None, inbound)
            }
        };

        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                if let Ok(Payload::Request(request)) = serde_json::from_str(&frame) {
                    requests
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(request.params);
                }
                if let Some(forward) = &forward {
                    if forward.send(frame).is_err() {
                        break;
                    }
                }
            }
        });

        Ok(Connection { outbound, inbound })
    }
}
