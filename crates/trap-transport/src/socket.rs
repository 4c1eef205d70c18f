//! Raw TCP transport
//!
//! Frames are written back to back in the Trap wire format; the header
//! carries the length, so no extra framing is needed. One IO task per
//! connection selects between the outgoing queue and the read half.

use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};
use trap_core::{codec, Configuration, FrameDecoder, Message, TRANSPORT_PREFIX};

use crate::base::TransportCore;
use crate::error::{Result, TransportError};
use crate::traits::{ListenerDelegate, ListenerTransport, Transport, TransportState};

/// Transport name used in configuration keys
pub const SOCKET_NAME: &str = "socket";

pub const SOCKET_PRIORITY: i32 = 100;

/// Default channel buffer size for outgoing frames
const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 1000;

fn option_key(key: &str) -> String {
    format!("{}.{}.{}", TRANSPORT_PREFIX, SOCKET_NAME, key)
}

/// Socket configuration
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Host to connect to, or to bind on for listeners
    pub host: String,
    /// Port to connect to; 0 lets a listener pick a free one
    pub port: u16,
    /// Keep-alive interval in seconds (0 = disabled)
    pub keepalive_secs: u64,
    /// Initial read buffer size
    pub read_buffer_size: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            keepalive_secs: 30,
            read_buffer_size: 8192,
        }
    }
}

impl SocketConfig {
    fn apply(&mut self, config: &Configuration) {
        if let Some(host) = config.option(&option_key("host")) {
            self.host = host.to_string();
        }
        let port = config.int_option(&option_key("port"), self.port as i32);
        if let Ok(port) = u16::try_from(port) {
            self.port = port;
        }
    }
}

fn set_keepalive(stream: &TcpStream, secs: u64) {
    if secs > 0 {
        let socket = socket2::SockRef::from(stream);
        let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(secs));
        if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
            debug!("could not enable TCP keepalive: {}", e);
        }
    }
}

/// TCP transport, either connecting or accepted by a [`SocketListener`]
pub struct SocketTransport {
    core: TransportCore,
    me: Weak<SocketTransport>,
    config: Mutex<SocketConfig>,
    link: Mutex<Option<mpsc::Sender<Bytes>>>,
    generation: AtomicU64,
    accepted: bool,
}

impl SocketTransport {
    pub fn new() -> Arc<Self> {
        Self::build(SocketConfig::default(), false)
    }

    pub fn with_config(config: SocketConfig) -> Arc<Self> {
        Self::build(config, false)
    }

    fn build(config: SocketConfig, accepted: bool) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<SocketTransport>| {
            let handle: Weak<dyn Transport> = me.clone();
            Self {
                core: TransportCore::new(SOCKET_NAME, SOCKET_PRIORITY, handle),
                me: me.clone(),
                config: Mutex::new(config),
                link: Mutex::new(None),
                generation: AtomicU64::new(0),
                accepted,
            }
        })
    }

    pub fn config(&self) -> SocketConfig {
        self.config.lock().clone()
    }

    fn start(&self, stream: TcpStream, generation: u64) {
        set_keepalive(&stream, self.config.lock().keepalive_secs);

        let read_buffer_size = self.config.lock().read_buffer_size;
        let (outgoing_tx, outgoing_rx) = mpsc::channel::<Bytes>(DEFAULT_CHANNEL_BUFFER_SIZE);
        *self.link.lock() = Some(outgoing_tx);

        let me = self.me.clone();
        self.core.spawn(async move {
            let (reader, writer) = stream.into_split();
            let failed =
                run_socket_io_loop(reader, writer, outgoing_rx, me.clone(), read_buffer_size).await;

            if let Some(transport) = me.upgrade() {
                if transport.generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                transport.link.lock().take();
                if failed {
                    transport.core.set_state(TransportState::Error);
                } else {
                    transport.core.link_closed();
                }
            }
        });
    }

    fn start_accepted(&self, stream: TcpStream) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.start(stream, generation);
        self.core.set_state(TransportState::Connected);
    }
}

/// Shared IO loop for socket connections. Returns true when the link failed.
async fn run_socket_io_loop(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    mut outgoing_rx: mpsc::Receiver<Bytes>,
    transport: Weak<SocketTransport>,
    read_buffer_size: usize,
) -> bool {
    let mut decoder = FrameDecoder::new();
    decoder.buffer_mut().reserve(read_buffer_size);

    'io: loop {
        tokio::select! {
            outgoing = outgoing_rx.recv() => {
                match outgoing {
                    Some(data) => {
                        if let Err(e) = writer.write_all(&data).await {
                            error!("TCP write error: {}", e);
                            return true;
                        }
                    }
                    None => {
                        debug!("TCP link closed locally");
                        let _ = writer.shutdown().await;
                        break 'io;
                    }
                }
            }

            result = reader.read_buf(decoder.buffer_mut()) => {
                match result {
                    Ok(0) => {
                        debug!("TCP connection closed");
                        break 'io;
                    }
                    Ok(_) => loop {
                        match decoder.next_frame() {
                            Ok(Some(message)) => match transport.upgrade() {
                                Some(transport) => transport.core.receive(message),
                                None => break 'io,
                            },
                            Ok(None) => break,
                            Err(e) => {
                                error!("TCP malformed frame: {}", e);
                                return true;
                            }
                        }
                    },
                    Err(e) => {
                        error!("TCP read error: {}", e);
                        return true;
                    }
                }
            }
        }
    }

    false
}

impl Transport for SocketTransport {
    fn core(&self) -> &TransportCore {
        &self.core
    }

    fn can_connect(&self) -> bool {
        !self.accepted
    }

    fn configure(&self, config: &Configuration) {
        self.core.configure(config);
        if !self.accepted {
            self.config.lock().apply(config);
        }
    }

    fn connect(&self) -> Result<()> {
        if self.accepted {
            return Err(TransportError::Other(
                "accepted transports cannot reconnect".into(),
            ));
        }

        let config = self.config();
        if config.port == 0 {
            return Err(TransportError::NotConfigured(option_key("port")));
        }

        self.core.begin_connect()?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let addr = format!("{}:{}", config.host, config.port);
        let me = self.me.clone();

        info!("Connecting to TCP: {}", addr);
        self.core.spawn(async move {
            let result = TcpStream::connect(&addr).await;

            let Some(transport) = me.upgrade() else {
                return;
            };
            if transport.generation.load(Ordering::SeqCst) != generation {
                return;
            }

            match result {
                Ok(stream) => {
                    info!("TCP connected to {}", addr);
                    transport.start(stream, generation);
                    transport.core.set_state(TransportState::Connected);
                }
                Err(e) => {
                    warn!("TCP connect to {} failed: {}", addr, e);
                    transport.core.set_state(TransportState::Error);
                }
            }
        });

        Ok(())
    }

    fn internal_send(&self, message: &Message, _expect_more: bool) -> Result<()> {
        let frame = codec::encode(message)?;
        let link = self.link.lock();
        let tx = link.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::BufferFull,
            mpsc::error::TrySendError::Closed(_) => TransportError::ConnectionClosed,
        })
    }

    fn internal_disconnect(&self) {
        // Dropping the sender lets the IO task drain and shut down the
        // socket. Without a link a pending connect is abandoned instead.
        if self.link.lock().take().is_none() {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Accepts TCP connections and hands them out as [`SocketTransport`]s
pub struct SocketListener {
    config: Mutex<SocketConfig>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<AbortHandle>>,
    enabled: AtomicBool,
}

impl SocketListener {
    pub fn new() -> Arc<Self> {
        Self::with_config(SocketConfig::default())
    }

    pub fn with_config(config: SocketConfig) -> Arc<Self> {
        Arc::new(Self {
            config: Mutex::new(config),
            local_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
            enabled: AtomicBool::new(true),
        })
    }

    /// Bound address once listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

impl ListenerTransport for SocketListener {
    fn name(&self) -> &str {
        SOCKET_NAME
    }

    fn configure(&self, config: &Configuration) {
        self.set_enabled(config.bool_option(&option_key("enabled"), self.is_enabled()));
        self.config.lock().apply(config);
    }

    fn listen(&self, delegate: Weak<dyn ListenerDelegate>) -> Result<()> {
        let config = self.config.lock().clone();
        let runtime = Handle::try_current()
            .map_err(|_| TransportError::Other("socket listener needs a tokio runtime".into()))?;

        let std_listener = std::net::TcpListener::bind((config.host.as_str(), config.port))
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);

        info!("TCP server listening on {}", local_addr);

        let keepalive_secs = config.keepalive_secs;
        let task = runtime.spawn(async move {
            let listener = match TcpListener::from_std(std_listener) {
                Ok(listener) => listener,
                Err(e) => {
                    error!("TCP listener setup failed: {}", e);
                    return;
                }
            };

            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        info!("TCP connection accepted from {}", peer_addr);
                        let Some(delegate) = delegate.upgrade() else {
                            break;
                        };
                        let transport = SocketTransport::build(
                            SocketConfig {
                                keepalive_secs,
                                ..SocketConfig::default()
                            },
                            true,
                        );
                        delegate.incoming_transport(transport.clone());
                        transport.start_accepted(stream);
                    }
                    Err(e) => {
                        warn!("TCP accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        if let Some(previous) = self.accept_task.lock().replace(task.abort_handle()) {
            previous.abort();
        }
        Ok(())
    }

    fn client_configuration(&self, hostname: Option<&str>) -> Configuration {
        let mut config = Configuration::new();
        let Some(addr) = self.local_addr() else {
            warn!("socket listener asked for client configuration before listening");
            return config;
        };

        let host = match hostname {
            Some(hostname) => hostname.to_string(),
            None if addr.ip().is_unspecified() => {
                warn!("socket listener bound to {}, advertising 127.0.0.1", addr.ip());
                "127.0.0.1".to_string()
            }
            None => addr.ip().to_string(),
        };

        config.set_option(option_key("host"), host);
        config.set_option(option_key("port"), addr.port());
        config
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn close(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        self.local_addr.lock().take();
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
    }
}
