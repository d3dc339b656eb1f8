//! Network ingress: one listener per `(protocol, transport, port)`
//! binding, a cooperative task per TCP connection, and a bounded worker
//! pool for UDP datagrams. Frames flow codec -> pipeline/dispatcher; acks
//! flow back through the per-session writer.

pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch, Notify, Semaphore};
use tracing::{debug, error, info, warn};

use crate::domain::Device;
use crate::ports::StorageRepository;
use crate::protocol::{Decoded, Frame, ProtocolKind, SessionContext, MAX_BUFFER};
use crate::service::command_dispatcher::CommandDispatcher;
use crate::service::pipeline::PositionPipeline;
use crate::state::live_state::LiveStateStore;
use session::SessionRegistry;

/// A connection with no traffic for this long is closed.
const READ_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(300);

/// Concurrent datagram handlers per UDP listener.
const UDP_WORKERS: usize = 32;

/// Everything a listener needs, cloned per connection task.
pub struct Gateway {
    pub storage: Arc<dyn StorageRepository>,
    pub pipeline: Arc<PositionPipeline>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub sessions: Arc<SessionRegistry>,
    pub live: Arc<LiveStateStore>,
}

impl Gateway {
    /// Accept loop for one TCP listener.
    pub async fn run_tcp_listener(
        self: Arc<Self>,
        protocol: ProtocolKind,
        addr: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_tcp(protocol, listener, shutdown).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn serve_tcp(
        self: Arc<Self>,
        protocol: ProtocolKind,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(protocol = protocol.name(), %addr, "tcp listener started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(protocol = protocol.name(), %peer, "connection accepted");
                            metrics::counter!("gateway_connections_total", 1, "protocol" => protocol.name());
                            let gateway = self.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                gateway.handle_connection(protocol, stream, shutdown).await;
                            });
                        }
                        Err(err) => warn!("accept failed: {err}"),
                    }
                }
            }
        }
        info!(protocol = protocol.name(), "tcp listener stopped");
        Ok(())
    }

    async fn handle_connection(
        self: Arc<Self>,
        protocol: ProtocolKind,
        stream: TcpStream,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (mut reader, mut writer) = stream.into_split();

        // Writer task serialises every outbound byte for this socket:
        // decoder acks before login, login acks, and dispatcher commands
        // all go through this channel.
        let (write_tx, mut write_rx) = mpsc::channel::<Vec<u8>>(32);
        let writer_task = tokio::spawn(async move {
            while let Some(bytes) = write_rx.recv().await {
                if writer.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let close_signal = Arc::new(Notify::new());
        let mut ctx = SessionContext::default();
        let mut buffer: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 4096];
        let mut device: Option<Device> = None;
        let mut session_id: Option<u64> = None;

        'connection: loop {
            tokio::select! {
                _ = close_signal.notified() => {
                    debug!("session evicted, closing connection");
                    break 'connection;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break 'connection;
                    }
                }
                read = tokio::time::timeout(READ_TIMEOUT, reader.read(&mut chunk)) => {
                    let n = match read {
                        Ok(Ok(0)) => break 'connection,
                        Ok(Ok(n)) => n,
                        Ok(Err(err)) => {
                            debug!("read failed: {err}");
                            break 'connection;
                        }
                        Err(_) => {
                            debug!("connection idle timeout");
                            break 'connection;
                        }
                    };
                    buffer.extend_from_slice(&chunk[..n]);
                    if buffer.len() > MAX_BUFFER {
                        warn!(protocol = protocol.name(), "buffer cap exceeded, closing");
                        break 'connection;
                    }

                    loop {
                        let Decoded { frames, consumed, response } =
                            protocol.decode(&buffer, &mut ctx);
                        if consumed == 0 && frames.is_empty() {
                            break;
                        }
                        buffer.drain(..consumed);
                        if let Some(response) = response {
                            if write_tx.send(response).await.is_err() {
                                break 'connection;
                            }
                        }
                        for frame in frames {
                            let keep_going = self
                                .handle_frame(
                                    protocol,
                                    frame,
                                    &ctx,
                                    &write_tx,
                                    &close_signal,
                                    &mut device,
                                    &mut session_id,
                                )
                                .await;
                            if !keep_going {
                                break 'connection;
                            }
                        }
                        if buffer.is_empty() {
                            break;
                        }
                    }
                }
            }
        }

        if let (Some(device), Some(session_id)) = (&device, session_id) {
            self.sessions.unregister(device.id, session_id);
        }
        drop(write_tx);
        let _ = writer_task.await;
    }

    /// Returns false when the connection must close.
    #[allow(clippy::too_many_arguments)]
    async fn handle_frame(
        &self,
        protocol: ProtocolKind,
        frame: Frame,
        ctx: &SessionContext,
        write_tx: &mpsc::Sender<Vec<u8>>,
        close_signal: &Arc<Notify>,
        device: &mut Option<Device>,
        session_id: &mut Option<u64>,
    ) -> bool {
        match frame {
            Frame::Login { imei } => {
                match self.authenticate(&imei, protocol).await {
                    Some(found) => {
                        // Re-login on an already-bound connection only
                        // refreshes the ack; re-registering would evict
                        // this very session.
                        if device.as_ref().map(|d| d.id) != Some(found.id) {
                            let handle = self
                                .sessions
                                .register(found.id, write_tx.clone(), close_signal.clone())
                                .await;
                            *session_id = Some(handle.session_id);
                            *device = Some(found);
                        }
                        if let Some(ack) = protocol.login_ack(true, ctx) {
                            if write_tx.send(ack).await.is_err() {
                                return false;
                            }
                        }
                        true
                    }
                    None => {
                        info!(imei, protocol = protocol.name(), "rejecting unknown device");
                        metrics::counter!("gateway_logins_rejected_total", 1);
                        if let Some(ack) = protocol.login_ack(false, ctx) {
                            let _ = write_tx.send(ack).await;
                        }
                        false
                    }
                }
            }
            Frame::Position(position) => {
                // Protocols without a login handshake bind the session on
                // the first identified frame.
                if device.is_none() {
                    match self.authenticate(&position.imei, protocol).await {
                        Some(found) => {
                            let handle = self
                                .sessions
                                .register(found.id, write_tx.clone(), close_signal.clone())
                                .await;
                            *session_id = Some(handle.session_id);
                            *device = Some(found);
                        }
                        None => {
                            info!(
                                imei = %position.imei,
                                protocol = protocol.name(),
                                "position from unknown device, closing"
                            );
                            return false;
                        }
                    }
                }
                if let Some(device) = device.as_ref() {
                    if let Err(err) = self.pipeline.ingest(device, position).await {
                        error!(device_id = device.id, "position ingest failed: {err:#}");
                        metrics::counter!("pipeline_errors_total", 1);
                    }
                }
                true
            }
            Frame::Heartbeat => {
                if let Some(device) = device.as_ref() {
                    self.live.update(device.id, |s| {
                        s.last_update = Some(OffsetDateTime::now_utc());
                        s.is_online = true;
                    });
                }
                true
            }
            Frame::CommandAck { command_key, success, response } => {
                if let Some(device) = device.as_ref() {
                    self.dispatcher
                        .handle_ack(device.id, command_key.as_deref(), success, &response)
                        .await;
                }
                true
            }
            Frame::Error { reason } => {
                warn!(protocol = protocol.name(), reason, "frame error");
                metrics::counter!("gateway_frame_errors_total", 1, "protocol" => protocol.name());
                true
            }
        }
    }

    async fn authenticate(&self, imei: &str, protocol: ProtocolKind) -> Option<Device> {
        match self.storage.device_by_imei(imei, protocol.name()).await {
            Ok(Some(device)) if device.is_active => Some(device),
            Ok(_) => None,
            Err(err) => {
                error!(imei, "device lookup failed: {err:#}");
                None
            }
        }
    }

    /// Datagram loop for one UDP listener. Every datagram is a complete
    /// frame set; identity comes from the frames themselves and handlers
    /// run on a bounded pool.
    pub async fn run_udp_listener(
        self: Arc<Self>,
        protocol: ProtocolKind,
        addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!(protocol = protocol.name(), %addr, "udp listener started");
        let workers = Arc::new(Semaphore::new(UDP_WORKERS));
        let mut datagram = [0u8; 2048];
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = socket.recv_from(&mut datagram) => {
                    let (len, peer) = match received {
                        Ok(ok) => ok,
                        Err(err) => {
                            warn!("udp recv failed: {err}");
                            continue;
                        }
                    };
                    let permit = match workers.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let gateway = self.clone();
                    let socket = socket.clone();
                    let data = datagram[..len].to_vec();
                    tokio::spawn(async move {
                        let _permit = permit;
                        gateway.handle_datagram(protocol, &data, peer, &socket).await;
                    });
                }
            }
        }
        info!(protocol = protocol.name(), "udp listener stopped");
        Ok(())
    }

    async fn handle_datagram(
        &self,
        protocol: ProtocolKind,
        data: &[u8],
        peer: SocketAddr,
        socket: &UdpSocket,
    ) {
        let mut ctx = SessionContext::default();
        let mut offset = 0usize;
        while offset < data.len() {
            let Decoded { frames, consumed, response } =
                protocol.decode(&data[offset..], &mut ctx);
            if consumed == 0 && frames.is_empty() {
                break;
            }
            offset += consumed;
            if let Some(response) = response {
                let _ = socket.send_to(&response, peer).await;
            }
            for frame in frames {
                match frame {
                    Frame::Login { .. } | Frame::Heartbeat => {
                        if let Some(device) = self.datagram_device(&ctx, protocol).await {
                            self.live.update(device.id, |s| {
                                s.last_update = Some(OffsetDateTime::now_utc());
                                s.is_online = true;
                            });
                        }
                    }
                    Frame::Position(position) => {
                        let Some(device) = self.datagram_device(&ctx, protocol).await else {
                            debug!(peer = %peer, "datagram from unknown device dropped");
                            continue;
                        };
                        if let Err(err) = self.pipeline.ingest(&device, position).await {
                            error!(device_id = device.id, "position ingest failed: {err:#}");
                            metrics::counter!("pipeline_errors_total", 1);
                        }
                    }
                    Frame::CommandAck { .. } => {
                        // No live session over UDP, nothing in flight.
                    }
                    Frame::Error { reason } => {
                        warn!(protocol = protocol.name(), reason, "datagram frame error");
                    }
                }
            }
            if consumed == 0 {
                break;
            }
        }
    }

    async fn datagram_device(
        &self,
        ctx: &SessionContext,
        protocol: ProtocolKind,
    ) -> Option<Device> {
        let imei = ctx.imei.as_deref()?;
        self.authenticate(imei, protocol).await
    }
}
