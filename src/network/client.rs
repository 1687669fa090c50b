//! Client side of the device protocol.
//!
//! A [`Client`] keeps at most one multiplexed connection per server address.
//! Connections are opened lazily on first use and reopened after they drop.
//! Every call carries a deadline; when it elapses the caller gets
//! [`PqnError::Timeout`] and a late response is discarded.

use crate::config::ClientConfig;
use crate::device::DeviceInfo;
use crate::error::{PqnError, PqnResult};
use crate::network::directory::{Directory, StaticDirectory};
use crate::network::frame::{read_frame, write_frame};
use crate::network::protocol::{
    ControlRequest, ControlResponse, DeviceDescription, DeviceQuery, InvokeRequest, PingReply,
    RequestType,
};
use crate::network::proxy::RemoteDevice;
use once_cell::sync::OnceCell;
use parking_lot::Mutex as SyncMutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static GLOBAL: OnceCell<Client> = OnceCell::new();

type Pending = Arc<SyncMutex<HashMap<u32, oneshot::Sender<ControlResponse>>>>;

/// Connection to one address. Locked only while that address is (re)connecting.
type Slot = Arc<Mutex<Option<Arc<Connection>>>>;

/// One multiplexed TCP connection.
struct Connection {
    address: String,
    writer: Mutex<OwnedWriteHalf>,
    pending: Pending,
    next_id: AtomicU32,
    closed: CancellationToken,
    reader: JoinHandle<()>,
}

impl Connection {
    async fn connect(address: &str, connect_timeout: Duration) -> PqnResult<Self> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                PqnError::Connection(format!(
                    "connecting to {} timed out after {:?}",
                    address, connect_timeout
                ))
            })?
            .map_err(|e| PqnError::Connection(format!("connecting to {}: {}", address, e)))?;
        let _ = stream.set_nodelay(true);
        let (mut read_half, write_half) = stream.into_split();

        let pending: Pending = Arc::new(SyncMutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        let reader = {
            let pending = pending.clone();
            let closed = closed.clone();
            let address = address.to_string();
            tokio::spawn(async move {
                loop {
                    let frame = tokio::select! {
                        _ = closed.cancelled() => break,
                        frame = read_frame(&mut read_half) => frame,
                    };
                    match frame {
                        Ok(Some(bytes)) => match ControlResponse::decode(&bytes) {
                            Ok(response) => {
                                let waiter = pending.lock().remove(&response.request_id);
                                match waiter {
                                    Some(tx) => {
                                        let _ = tx.send(response);
                                    }
                                    None => debug!(
                                        request_id = response.request_id,
                                        "Discarding response with no waiting caller"
                                    ),
                                }
                            }
                            Err(e) => warn!(server = %address, error = %e, "Malformed response"),
                        },
                        Ok(None) => {
                            debug!(server = %address, "Server closed the connection");
                            break;
                        }
                        Err(e) => {
                            warn!(server = %address, error = %e, "Connection lost");
                            break;
                        }
                    }
                }
                closed.cancel();
                // Waiters see a closed channel and report a connection error.
                pending.lock().clear();
            })
        };

        info!(server = %address, "Connected");
        Ok(Self {
            address: address.to_string(),
            writer: Mutex::new(write_half),
            pending,
            next_id: AtomicU32::new(1),
            closed,
            reader,
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Send one request and wait for its response until `deadline`.
    ///
    /// A frame that is not written completely, because the deadline expired
    /// or the write failed, closes the connection.
    async fn request(
        &self,
        request_type: RequestType,
        payload: Vec<u8>,
        deadline: Instant,
        timeout: Duration,
    ) -> PqnResult<ControlResponse> {
        if self.is_closed() {
            return Err(PqnError::Connection(format!(
                "connection to {} is closed",
                self.address
            )));
        }

        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);

        let frame = ControlRequest::new(request_id, request_type, payload).encode();
        let mut writing = false;
        let exchange = async {
            {
                let mut writer = self.writer.lock().await;
                writing = true;
                write_frame(&mut *writer, &frame).await.map_err(|e| {
                    PqnError::Connection(format!("sending to {}: {}", self.address, e))
                })?;
                writing = false;
            }
            rx.await.map_err(|_| {
                PqnError::Connection(format!("connection to {} dropped", self.address))
            })
        };

        let outcome = match tokio::time::timeout_at(deadline, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PqnError::Timeout(timeout)),
        };
        if outcome.is_err() {
            self.pending.lock().remove(&request_id);
        }
        if writing {
            warn!(
                server = %self.address,
                request_id,
                "Request frame cut short, closing connection"
            );
            self.closed.cancel();
        }
        outcome
    }

    fn close(&self) {
        self.closed.cancel();
        self.reader.abort();
        self.pending.lock().clear();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

struct ClientInner {
    directory: Arc<dyn Directory>,
    config: ClientConfig,
    connections: SyncMutex<HashMap<String, Slot>>,
    shut_down: AtomicBool,
}

/// Handle to the connection pool. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("directory", &self.inner.directory)
            .field("config", &self.inner.config)
            .field("shut_down", &self.inner.shut_down.load(Ordering::SeqCst))
            .finish()
    }
}

impl Client {
    /// Client resolving server names through `directory`.
    pub fn new(directory: Arc<dyn Directory>, config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                directory,
                config,
                connections: SyncMutex::new(HashMap::new()),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Client resolving servers through a `[directory]` table.
    pub fn from_directory(entries: &BTreeMap<String, String>, config: ClientConfig) -> Self {
        Self::new(Arc::new(StaticDirectory::from_map(entries)), config)
    }

    /// Make `client` the process-wide instance returned by [`Client::global`].
    pub fn install_global(client: Client) -> PqnResult<()> {
        GLOBAL
            .set(client)
            .map_err(|_| PqnError::Configuration("global client already installed".to_string()))
    }

    /// The process-wide instance, if one was installed.
    pub fn global() -> PqnResult<Client> {
        GLOBAL
            .get()
            .cloned()
            .ok_or_else(|| PqnError::Configuration("no global client installed".to_string()))
    }

    /// Default per-call deadline.
    pub fn timeout(&self) -> Duration {
        self.inner.config.timeout
    }

    /// Settings this client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Whether [`Client::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    fn slot(&self, address: &str) -> Slot {
        self.inner
            .connections
            .lock()
            .entry(address.to_string())
            .or_default()
            .clone()
    }

    async fn connection(&self, server: &str) -> PqnResult<Arc<Connection>> {
        if self.is_shut_down() {
            return Err(PqnError::Connection("client is shut down".to_string()));
        }
        let address = self.inner.directory.resolve(server)?;

        let slot = self.slot(&address);
        let mut current = slot.lock().await;
        if let Some(existing) = current.as_ref() {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
            debug!(server, address = %address, "Reconnecting");
        }

        let connect_timeout = self.inner.config.connect_timeout;
        let connection = Arc::new(Connection::connect(&address, connect_timeout).await?);
        if self.is_shut_down() {
            connection.close();
            return Err(PqnError::Connection("client is shut down".to_string()));
        }
        *current = Some(connection.clone());
        Ok(connection)
    }

    /// Connect if needed and exchange one request, all within `timeout`.
    async fn request(
        &self,
        server: &str,
        request_type: RequestType,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> PqnResult<Value> {
        let deadline = Instant::now() + timeout;
        let connection = tokio::time::timeout_at(deadline, self.connection(server))
            .await
            .map_err(|_| PqnError::Timeout(timeout))??;
        connection
            .request(request_type, payload, deadline, timeout)
            .await?
            .into_result()
    }

    async fn request_as<T: DeserializeOwned>(
        &self,
        server: &str,
        request_type: RequestType,
        payload: Vec<u8>,
    ) -> PqnResult<T> {
        let value = self.request(server, request_type, payload, self.timeout()).await?;
        serde_json::from_value(value)
            .map_err(|e| PqnError::Protocol(format!("unexpected {:?} reply: {}", request_type, e)))
    }

    /// Round trip to `server`.
    pub async fn ping(&self, server: &str) -> PqnResult<PingReply> {
        self.request_as(server, RequestType::Ping, Vec::new()).await
    }

    /// Snapshot of every device on `server`.
    pub async fn list_devices(&self, server: &str) -> PqnResult<Vec<DeviceInfo>> {
        self.request_as(server, RequestType::ListDevices, Vec::new()).await
    }

    /// Fresh snapshot of one device.
    pub async fn device_info(&self, server: &str, device: &str) -> PqnResult<DeviceInfo> {
        let payload = serde_json::to_vec(&DeviceQuery {
            device: device.to_string(),
        })?;
        self.request_as(server, RequestType::DeviceInfo, payload).await
    }

    /// Identity and operation names of one device.
    pub async fn describe(&self, server: &str, device: &str) -> PqnResult<DeviceDescription> {
        let payload = serde_json::to_vec(&DeviceQuery {
            device: device.to_string(),
        })?;
        self.request_as(server, RequestType::DescribeDevice, payload).await
    }

    /// Proxy for `device` on `server`. Fails with `NotFound` when the server
    /// does not host it.
    pub async fn get_device(&self, server: &str, device: &str) -> PqnResult<RemoteDevice> {
        let description = self.describe(server, device).await?;
        Ok(RemoteDevice::new(self.clone(), server, description))
    }

    /// Invoke `call` on `server`, waiting at most `timeout`.
    pub async fn invoke(
        &self,
        server: &str,
        mut call: InvokeRequest,
        timeout: Duration,
    ) -> PqnResult<Value> {
        call.timeout_ms = Some(timeout.as_millis() as u64);
        let payload = serde_json::to_vec(&call)?;
        self.request(server, RequestType::Invoke, payload, timeout).await
    }

    /// Close every connection. Later calls fail with a connection error.
    pub async fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        let slots: Vec<(String, Slot)> = self.inner.connections.lock().drain().collect();
        for (address, slot) in slots {
            if let Some(connection) = slot.lock().await.take() {
                debug!(address = %address, "Closing connection");
                connection.close();
            }
        }
    }
}
