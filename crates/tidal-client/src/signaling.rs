//! Duplex signaling transport between the viewer and the streaming host.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tidal_common::{Error, Result, SignalMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, error, info, warn};

/// Lifecycle and data events delivered by a channel, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// One inbound text frame, not yet parsed.
    Message(String),
    Closed,
    Error(String),
}

/// The single handler a channel invokes for every inbound event.
pub type ChannelHandler = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

/// An open signaling channel.
pub trait SignalingChannel: Send + Sync {
    /// Queue a message for transmission. Fails with [`Error::ChannelClosed`]
    /// once the transport is gone.
    fn send(&self, message: &SignalMessage) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Close the transport. No events are delivered afterwards.
    fn close(&mut self);
}

/// Opens signaling channels.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, url: &str, handler: ChannelHandler)
        -> Result<Box<dyn SignalingChannel>>;
}

/// WebSocket transport, one JSON message per text frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl ChannelConnector for WebSocketConnector {
    async fn connect(
        &self,
        url: &str,
        handler: ChannelHandler,
    ) -> Result<Box<dyn SignalingChannel>> {
        let (ws_stream, _) = connect_async(url).await.map_err(|e| {
            warn!("failed to connect to signaling server {}: {}", url, e);
            Error::ChannelClosed
        })?;
        info!("connected to signaling server: {}", url);

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let open = Arc::new(AtomicBool::new(true));

        let writer_open = Arc::clone(&open);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = write.send(WsMessage::Text(text)).await {
                    error!("failed to send signaling message: {}", e);
                    break;
                }
            }
            writer_open.store(false, Ordering::SeqCst);
            let _ = write.close().await;
        });

        let reader_open = Arc::clone(&open);
        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => handler(ChannelEvent::Message(text)),
                    Ok(WsMessage::Close(_)) => break,
                    Ok(other) => debug!("ignoring non-text signaling frame ({} bytes)", other.len()),
                    Err(e) => {
                        reader_open.store(false, Ordering::SeqCst);
                        handler(ChannelEvent::Error(e.to_string()));
                        return;
                    }
                }
            }
            reader_open.store(false, Ordering::SeqCst);
            handler(ChannelEvent::Closed);
        });

        Ok(Box::new(WebSocketChannel {
            out_tx: Some(out_tx),
            open,
            reader,
        }))
    }
}

struct WebSocketChannel {
    out_tx: Option<mpsc::UnboundedSender<String>>,
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl SignalingChannel for WebSocketChannel {
    fn send(&self, message: &SignalMessage) -> Result<()> {
        let Some(out_tx) = self.out_tx.as_ref().filter(|_| self.is_open()) else {
            return Err(Error::ChannelClosed);
        };
        let text = message.encode()?;
        out_tx.send(text).map_err(|_| Error::ChannelClosed)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
        self.reader.abort();
        // Dropping the sender ends the writer task, which closes the socket.
        self.out_tx = None;
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[derive(Default)]
struct MemoryState {
    handler: Option<ChannelHandler>,
    open: bool,
    refuse: bool,
    sent: Vec<SignalMessage>,
}

/// In-process signaling transport. The connector doubles as the remote end:
/// it records what the viewer sent and can inject inbound frames.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    state: Arc<Mutex<MemoryState>>,
    connects: Arc<AtomicUsize>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make subsequent connects fail with [`Error::ChannelClosed`].
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse = refuse;
    }

    /// Deliver a raw inbound frame. Returns false when no channel is open.
    pub fn deliver_text(&self, text: impl Into<String>) -> bool {
        self.dispatch(ChannelEvent::Message(text.into()))
    }

    pub fn deliver(&self, message: &SignalMessage) -> bool {
        match message.encode() {
            Ok(text) => self.deliver_text(text),
            Err(_) => false,
        }
    }

    /// Simulate the host dropping the connection.
    pub fn close_remote(&self) -> bool {
        let delivered = self.dispatch(ChannelEvent::Closed);
        let mut state = self.lock();
        state.open = false;
        state.handler = None;
        delivered
    }

    pub fn fail(&self, reason: impl Into<String>) -> bool {
        let delivered = self.dispatch(ChannelEvent::Error(reason.into()));
        let mut state = self.lock();
        state.open = false;
        state.handler = None;
        delivered
    }

    fn dispatch(&self, event: ChannelEvent) -> bool {
        let handler = {
            let state = self.lock();
            if !state.open {
                return false;
            }
            state.handler.clone()
        };
        match handler {
            Some(handler) => {
                handler(event);
                true
            }
            None => false,
        }
    }

    /// Everything the viewer has sent so far, oldest first.
    pub fn sent(&self) -> Vec<SignalMessage> {
        self.lock().sent.clone()
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelConnector for MemoryConnector {
    async fn connect(
        &self,
        _url: &str,
        handler: ChannelHandler,
    ) -> Result<Box<dyn SignalingChannel>> {
        let mut state = self.lock();
        if state.refuse {
            return Err(Error::ChannelClosed);
        }
        state.open = true;
        state.handler = Some(handler);
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryChannel {
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }
}

struct MemoryChannel {
    state: Arc<Mutex<MemoryState>>,
    closed: bool,
}

impl SignalingChannel for MemoryChannel {
    fn send(&self, message: &SignalMessage) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if self.closed || !state.open {
            return Err(Error::ChannelClosed);
        }
        state.sent.push(message.clone());
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed && self.state.lock().map(|s| s.open).unwrap_or(false)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.open = false;
        state.handler = None;
    }
}
