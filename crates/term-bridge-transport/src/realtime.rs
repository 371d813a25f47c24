//! Realtime WebSocket channel.
//!
//! Opens `ws(s)://.../sessions/{id}/ws`, probes it with a ping, and pushes
//! every `output` frame to the owner through [`ChannelEvents`]. Pongs and
//! unknown frames are filtered out here. The channel never reconnects on
//! its own; an unexpected closure is reported once and the owner decides.

use std::{
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use term_bridge_core::{
    ActiveTransport, ChannelError, ChannelEvents, ChannelStatus, ProtocolMessage, ServerFrame,
    TransportChannel,
};
use tokio::{
    net::TcpStream,
    sync::{Mutex, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Default time allowed for the WebSocket handshake.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Persistent, bidirectional session channel.
pub struct RealtimeChannel {
    url: String,
    connect_timeout: Duration,
    events: ChannelEvents,
    sink: Mutex<Option<WsSink>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    status: Arc<watch::Sender<ChannelStatus>>,
}

impl RealtimeChannel {
    /// Create a channel for a WebSocket URL. Nothing connects until `open`.
    #[must_use]
    pub fn new(url: impl Into<String>, events: ChannelEvents) -> Self {
        let (status, _) = watch::channel(ChannelStatus::Connecting);
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            events,
            sink: Mutex::new(None),
            reader: StdMutex::new(None),
            status: Arc::new(status),
        }
    }

    /// Override the handshake timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Subscribe to status changes.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.subscribe()
    }

    fn fail(&self, error: String) -> ChannelError {
        self.status.send_replace(ChannelStatus::Errored);
        tracing::warn!(url = %self.url, "Realtime channel failed to open: {error}");
        ChannelError::Connection(error)
    }

    fn abort_reader(&self) {
        if let Some(handle) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    /// Route incoming frames until the connection ends.
    async fn read_loop(
        mut read: SplitStream<WsStream>,
        events: ChannelEvents,
        status: Arc<watch::Sender<ChannelStatus>>,
    ) {
        let reason = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => dispatch(&text, &events),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => dispatch(&text, &events),
                    Err(_) => tracing::warn!("Dropping non UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    break frame.map_or_else(
                        || "closed by remote".to_string(),
                        |f| format!("closed by remote: {} {}", f.code, f.reason),
                    );
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break format!("read error: {e}"),
                None => break "connection ended".to_string(),
            }
        };

        // A local close marks the channel closed before aborting this task,
        // so only remote-initiated endings get reported.
        let was_open = status.send_if_modified(|s| {
            if s.is_open() {
                *s = ChannelStatus::Closed;
                true
            } else {
                false
            }
        });
        if was_open {
            tracing::warn!(epoch = events.epoch(), "Realtime channel closed: {reason}");
            events.closed(reason);
        }
    }
}

/// Forward output frames; everything else stays in the transport.
fn dispatch(text: &str, events: &ChannelEvents) {
    match serde_json::from_str::<ServerFrame>(text) {
        Ok(ServerFrame::Output { content }) => events.output(content),
        Ok(ServerFrame::Pong) => tracing::trace!("pong"),
        Ok(ServerFrame::Error { message }) => tracing::warn!("Server error frame: {message}"),
        Ok(ServerFrame::Unknown) => tracing::debug!("Ignoring unknown frame: {text}"),
        Err(e) => tracing::warn!("Invalid server frame: {e}"),
    }
}

#[async_trait]
impl TransportChannel for RealtimeChannel {
    fn kind(&self) -> ActiveTransport {
        ActiveTransport::Realtime
    }

    async fn open(&self) -> Result<(), ChannelError> {
        if self.status().is_open() {
            return Ok(());
        }
        self.status.send_replace(ChannelStatus::Connecting);

        let (stream, _response) =
            match tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str())).await {
                Ok(Ok(connected)) => connected,
                Ok(Err(e)) => return Err(self.fail(e.to_string())),
                Err(_) => {
                    return Err(self.fail(format!("timed out after {:?}", self.connect_timeout)));
                }
            };

        let (write, read) = stream.split();
        *self.sink.lock().await = Some(write);
        self.status.send_replace(ChannelStatus::Open);

        let handle = tokio::spawn(Self::read_loop(
            read,
            self.events.clone(),
            Arc::clone(&self.status),
        ));
        *self.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        tracing::info!(url = %self.url, epoch = self.events.epoch(), "Realtime channel open");

        // Liveness probe only; a missing pong is not an error.
        if let Err(e) = self.send(&ProtocolMessage::Ping).await {
            tracing::debug!("Initial ping failed: {e}");
        }
        Ok(())
    }

    async fn send(&self, message: &ProtocolMessage) -> Result<(), ChannelError> {
        if !self.status().is_open() {
            return Err(ChannelError::NotOpen);
        }
        let frame = message.to_frame()?;

        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(ChannelError::NotOpen)?;
        if let Err(e) = sink.send(Message::Text(frame)).await {
            self.status.send_if_modified(|s| {
                let open = s.is_open();
                if open {
                    *s = ChannelStatus::Errored;
                }
                open
            });
            return Err(ChannelError::Send(e.to_string()));
        }
        Ok(())
    }

    async fn close(&self) {
        self.status.send_replace(ChannelStatus::Closed);

        if let Some(mut sink) = self.sink.lock().await.take() {
            let goodbye = sink.send(Message::Close(None));
            if tokio::time::timeout(self.connect_timeout, goodbye).await.is_err() {
                tracing::debug!("Close frame timed out");
            }
        }
        self.abort_reader();
        tracing::debug!(epoch = self.events.epoch(), "Realtime channel closed locally");
    }

    fn status(&self) -> ChannelStatus {
        *self.status.borrow()
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        self.abort_reader();
    }
}
