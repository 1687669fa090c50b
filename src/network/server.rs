//! TCP device server.
//!
//! Every accepted connection gets a session and a writer task. Each request
//! frame is handled on its own task so one slow operation never blocks the
//! connection; responses carry the request id and may arrive out of order.
//! Calls on a single device still serialize through the device's lock.

use crate::device::{value, CallArgs, DeviceRegistry};
use crate::error::{PqnError, PqnResult};
use crate::network::frame::{read_frame, write_frame};
use crate::network::protocol::{
    ControlRequest, ControlResponse, DeviceDescription, DeviceQuery, InvokeRequest, PingReply,
    RequestType,
};
use crate::network::session::SessionManager;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

const RESPONSE_QUEUE: usize = 64;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// State shared by all connection tasks.
struct ServerContext {
    name: String,
    registry: Arc<DeviceRegistry>,
    sessions: SessionManager,
    idle_timeout: Duration,
}

/// Serves one [`DeviceRegistry`] over TCP under a server name.
pub struct DeviceServer {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    shutdown: CancellationToken,
}

impl DeviceServer {
    /// Bind to `addr` and serve the devices in `registry` under `name`.
    pub async fn bind(
        addr: &str,
        name: impl Into<String>,
        registry: Arc<DeviceRegistry>,
    ) -> PqnResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let name = name.into();
        info!(server = %name, addr = %listener.local_addr()?, "Device server listening");

        Ok(Self {
            listener,
            ctx: Arc::new(ServerContext {
                name,
                registry,
                sessions: SessionManager::new(),
                idle_timeout: DEFAULT_IDLE_TIMEOUT,
            }),
            shutdown: CancellationToken::new(),
        })
    }

    /// Close connections that stay silent this long with nothing in flight.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        if let Some(ctx) = Arc::get_mut(&mut self.ctx) {
            ctx.idle_timeout = idle_timeout;
        }
        self
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> PqnResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Server name reported by `Ping`.
    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    /// Token that stops the accept loop and every connection when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Sessions of the currently connected clients.
    pub fn sessions(&self) -> SessionManager {
        self.ctx.sessions.clone()
    }

    /// Accept connections until the shutdown token fires.
    ///
    /// Devices stay registered afterwards; closing them is up to the owner of
    /// the registry.
    pub async fn run(self) -> PqnResult<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(server = %self.ctx.name, "Device server shutting down");
                    break;
                }
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let ctx = self.ctx.clone();
                            let token = self.shutdown.child_token();
                            tokio::spawn(async move {
                                handle_client(socket, addr, ctx, token).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Counts a request as in flight until dropped, even if its handler panics.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn handle_client(
    socket: TcpStream,
    addr: SocketAddr,
    ctx: Arc<ServerContext>,
    token: CancellationToken,
) {
    let session_id = Uuid::new_v4().to_string();
    ctx.sessions.create_session(session_id.clone(), addr.to_string()).await;
    let span = tracing::info_span!("session", id = %session_id, peer = %addr);

    async move {
        info!("Client connected");
        let _ = socket.set_nodelay(true);
        let (mut reader, mut writer) = socket.into_split();
        let (tx, mut rx) = mpsc::channel::<ControlResponse>(RESPONSE_QUEUE);

        tokio::spawn(
            async move {
                while let Some(response) = rx.recv().await {
                    if let Err(e) = write_frame(&mut writer, &response.encode()).await {
                        debug!(error = %e, "Dropping responses for closed connection");
                        break;
                    }
                }
            }
            .in_current_span(),
        );

        let (frame_tx, mut frames) = mpsc::channel(RESPONSE_QUEUE);
        let frame_reader = tokio::spawn(async move {
            loop {
                let frame = read_frame(&mut reader).await;
                let last = !matches!(frame, Ok(Some(_)));
                if frame_tx.send(frame).await.is_err() || last {
                    break;
                }
            }
        });

        // Cancels every in-flight request token once the connection is gone.
        let _disconnect = token.clone().drop_guard();
        let in_flight = Arc::new(AtomicUsize::new(0));

        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => break,
                frame = tokio::time::timeout(ctx.idle_timeout, frames.recv()) => frame,
            };

            match frame {
                Err(_) if in_flight.load(Ordering::SeqCst) > 0 => continue,
                Err(_) => {
                    info!(idle_timeout = ?ctx.idle_timeout, "Closing idle session");
                    break;
                }
                Ok(None) | Ok(Some(Ok(None))) => break,
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "Connection error");
                    break;
                }
                Ok(Some(Ok(Some(bytes)))) => {
                    ctx.sessions.touch(&session_id).await;
                    match ControlRequest::decode(&bytes) {
                        Ok(request) => {
                            let ctx = ctx.clone();
                            let tx = tx.clone();
                            let request_token = token.child_token();
                            let guard = InFlight::enter(&in_flight);
                            tokio::spawn(
                                async move {
                                    let _guard = guard;
                                    let response = run_isolated(ctx, request, request_token).await;
                                    let _ = tx.send(response).await;
                                }
                                .in_current_span(),
                            );
                        }
                        Err(e) => {
                            warn!(error = %e, "Rejecting malformed request");
                            let _ = tx.send(ControlResponse::error(0, &e)).await;
                        }
                    }
                }
            }
        }

        frame_reader.abort();
        ctx.sessions.remove_session(&session_id).await;
        info!("Client disconnected");
    }
    .instrument(span)
    .await
}

/// Run one request on its own task so a panicking handler still gets an answer.
async fn run_isolated(
    ctx: Arc<ServerContext>,
    request: ControlRequest,
    token: CancellationToken,
) -> ControlResponse {
    let request_id = request.request_id;
    let handler = tokio::spawn(
        async move { process_request(&ctx, request, token).await }.in_current_span(),
    );

    match handler.await {
        Ok(response) => response,
        Err(e) => {
            error!(request_id, error = %e, "Request handler aborted");
            let err = PqnError::Internal(format!("request {} aborted: {}", request_id, e));
            ControlResponse::error(request_id, &err)
        }
    }
}

async fn process_request(
    ctx: &ServerContext,
    request: ControlRequest,
    token: CancellationToken,
) -> ControlResponse {
    let request_id = request.request_id;
    debug!(request_id, request_type = ?request.request_type, "Processing request");

    let result = match request.request_type {
        RequestType::Ping => ping(ctx).await,
        RequestType::ListDevices => list_devices(ctx),
        RequestType::DescribeDevice => describe(ctx, &request),
        RequestType::DeviceInfo => device_info(ctx, &request),
        RequestType::Invoke => invoke(ctx, &request, token).await,
    };

    match result {
        Ok(result) => ControlResponse::success(request_id, &result),
        Err(e) => ControlResponse::error(request_id, &e),
    }
}

async fn ping(ctx: &ServerContext) -> PqnResult<Value> {
    Ok(serde_json::to_value(PingReply {
        server: ctx.name.clone(),
        devices: ctx.registry.len(),
        sessions: ctx.sessions.count().await,
    })?)
}

fn list_devices(ctx: &ServerContext) -> PqnResult<Value> {
    Ok(serde_json::to_value(ctx.registry.list_devices())?)
}

fn describe(ctx: &ServerContext, request: &ControlRequest) -> PqnResult<Value> {
    let query: DeviceQuery = request.json()?;
    let info = ctx.registry.get(&query.device)?.info();
    Ok(serde_json::to_value(DeviceDescription::from(&info))?)
}

fn device_info(ctx: &ServerContext, request: &ControlRequest) -> PqnResult<Value> {
    let query: DeviceQuery = request.json()?;
    Ok(serde_json::to_value(ctx.registry.get(&query.device)?.info())?)
}

async fn invoke(
    ctx: &ServerContext,
    request: &ControlRequest,
    token: CancellationToken,
) -> PqnResult<Value> {
    let call: InvokeRequest = request.json()?;
    for arg in call.args.iter().chain(call.kwargs.values()) {
        value::validate(arg)?;
    }

    // Ends the deadline watcher once the operation returns.
    let _done = token.clone().drop_guard();
    if let Some(ms) = call.timeout_ms {
        let deadline = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => deadline.cancel(),
                _ = deadline.cancelled() => {}
            }
        });
    }

    let args = CallArgs::new(call.args, call.kwargs).with_cancel(token);
    ctx.registry.dispatch(&call.device, &call.operation, args).await
}
