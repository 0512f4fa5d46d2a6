use crate::{pump::FrameSink, telemetry::Metrics};
use bytes::Bytes;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use guardian_proto::{decode_annotation, AnnotationMessage};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, Notify},
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::instrument;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// One frame plus a close request.
const OUTBOUND_CAPACITY: usize = 2;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Failed to connect to {url}: {source}")]
    ConnectFailed {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
    #[error("Channel is not open")]
    NotOpen,
    #[error("A frame is already in flight")]
    Busy,
    #[error("Channel was already used for a connection")]
    AlreadyUsed,
    #[error("Channel was closed while connecting")]
    Cancelled,
    #[error("Transport failure: {0}")]
    Transport(#[from] tungstenite::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Errored,
}

#[derive(Debug)]
pub enum ChannelEvent {
    Opened,
    Message(AnnotationMessage),
    Errored(String),
    Closed,
}

/// Fires once the frame handed to `send_binary` has left the socket.
pub struct SendCompletion {
    done: oneshot::Receiver<Result<(), ChannelError>>,
}

impl SendCompletion {
    pub async fn wait(self) -> Result<(), ChannelError> {
        self.done.await.unwrap_or(Err(ChannelError::NotOpen))
    }
}

impl From<oneshot::Receiver<Result<(), ChannelError>>> for SendCompletion {
    fn from(done: oneshot::Receiver<Result<(), ChannelError>>) -> Self {
        Self { done }
    }
}

enum Outbound {
    Frame(Bytes, oneshot::Sender<Result<(), ChannelError>>),
    Close,
}

struct Shared {
    state: Mutex<ChannelState>,
    in_flight: AtomicBool,
    closed_emitted: AtomicBool,
    cancel: Notify,
    reader: Mutex<Option<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    metrics: Arc<Metrics>,
}

impl Shared {
    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    fn emit_closed(&self) {
        if !self.closed_emitted.swap(true, Ordering::SeqCst) {
            self.emit(ChannelEvent::Closed);
        }
    }

    fn fail(&self, reason: String) {
        {
            let mut state = self.state.lock();
            if matches!(*state, ChannelState::Closed | ChannelState::Errored) {
                return;
            }
            *state = ChannelState::Errored;
        }
        tracing::error!("Channel error: {}", reason);
        self.emit(ChannelEvent::Errored(reason));
        self.emit_closed();
    }

    fn finish(&self) {
        {
            let mut state = self.state.lock();
            if *state != ChannelState::Errored {
                *state = ChannelState::Closed;
            }
        }
        tracing::info!("Channel closed");
        self.emit_closed();
    }

    fn deliver(&self, payload: &str) {
        match decode_annotation(payload) {
            Ok(message) => {
                self.metrics.record_annotation();
                self.emit(ChannelEvent::Message(message));
            }
            Err(e) => {
                self.metrics.record_malformed_annotation();
                tracing::warn!("Dropping malformed annotation: {}", e);
            }
        }
    }
}

/// Duplex connection to the inference backend.
///
/// Carries at most one outbound frame at a time: `send_binary` refuses with
/// [`ChannelError::Busy`] until the previous frame's completion has fired.
/// Inbound text is validated into [`AnnotationMessage`] before it is
/// surfaced; anything else is logged and dropped. A channel connects once and
/// never reconnects.
pub struct TransportChannel {
    shared: Arc<Shared>,
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    close_timeout: Duration,
}

impl TransportChannel {
    pub fn new(events: mpsc::UnboundedSender<ChannelEvent>, metrics: Arc<Metrics>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ChannelState::Idle),
                in_flight: AtomicBool::new(false),
                closed_emitted: AtomicBool::new(false),
                cancel: Notify::new(),
                reader: Mutex::new(None),
                events,
                metrics,
            }),
            outbound: Mutex::new(None),
            close_timeout: CLOSE_TIMEOUT,
        }
    }

    /// How long to wait for the backend to answer our close frame before the
    /// channel is declared closed anyway.
    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.lock()
    }

    #[instrument(skip(self))]
    pub async fn open(&self, url: &str) -> Result<(), ChannelError> {
        {
            let mut state = self.shared.state.lock();
            if *state != ChannelState::Idle {
                return Err(ChannelError::AlreadyUsed);
            }
            *state = ChannelState::Connecting;
        }
        tracing::info!("Connecting to {}", url);

        let connected = tokio::select! {
            connected = connect_async(url) => connected,
            _ = self.shared.cancel.notified() => {
                self.shared.finish();
                return Err(ChannelError::Cancelled);
            }
        };
        let mut socket = match connected {
            Ok((socket, _response)) => socket,
            Err(source) => {
                self.shared.fail(source.to_string());
                return Err(ChannelError::ConnectFailed {
                    url: url.to_string(),
                    source,
                });
            }
        };

        let cancelled = {
            let mut state = self.shared.state.lock();
            if *state == ChannelState::Closing {
                true
            } else {
                *state = ChannelState::Open;
                false
            }
        };
        if cancelled {
            let _ = socket.close(None).await;
            self.shared.finish();
            return Err(ChannelError::Cancelled);
        }

        let (sink, stream) = socket.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        *self.outbound.lock() = Some(outbound_tx);

        tracing::info!("Channel open");
        self.shared.emit(ChannelEvent::Opened);

        *self.shared.reader.lock() = Some(tokio::spawn(read_loop(stream, self.shared.clone())));
        tokio::spawn(write_loop(
            sink,
            outbound_rx,
            self.shared.clone(),
            self.close_timeout,
        ));

        Ok(())
    }

    /// Hands one encoded frame to the socket.
    pub fn send_binary(&self, frame: Bytes) -> Result<SendCompletion, ChannelError> {
        if self.state() != ChannelState::Open {
            return Err(ChannelError::NotOpen);
        }
        let sender = self.outbound.lock().clone().ok_or(ChannelError::NotOpen)?;

        if self
            .shared
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ChannelError::Busy);
        }

        let (done_tx, done_rx) = oneshot::channel();
        if sender.try_send(Outbound::Frame(frame, done_tx)).is_err() {
            self.shared.in_flight.store(false, Ordering::Release);
            return Err(ChannelError::NotOpen);
        }
        Ok(SendCompletion::from(done_rx))
    }

    pub fn is_sending(&self) -> bool {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Idempotent. A close during the handshake cancels it. Once open, the
    /// backend gets a bounded time to answer the close frame.
    pub fn close(&self) {
        let sender = self.outbound.lock().take();
        let mut state = self.shared.state.lock();
        match *state {
            ChannelState::Connecting => {
                *state = ChannelState::Closing;
                self.shared.cancel.notify_one();
                tracing::info!("Close requested during handshake");
            }
            ChannelState::Open => {
                *state = ChannelState::Closing;
                drop(state);
                if let Some(sender) = sender {
                    let _ = sender.try_send(Outbound::Close);
                }
                tracing::info!("Closing channel");
            }
            _ => {}
        }
    }
}

impl FrameSink for TransportChannel {
    fn send_frame(&self, frame: Bytes) -> Result<SendCompletion, ChannelError> {
        self.send_binary(frame)
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    shared: Arc<Shared>,
    close_timeout: Duration,
) {
    while let Some(command) = outbound.recv().await {
        match command {
            Outbound::Frame(frame, done) => {
                let result = sink.send(Message::Binary(frame)).await;
                shared.in_flight.store(false, Ordering::Release);
                match result {
                    Ok(()) => {
                        let _ = done.send(Ok(()));
                    }
                    Err(e) => {
                        shared.fail(e.to_string());
                        let _ = done.send(Err(ChannelError::Transport(e)));
                        return;
                    }
                }
            }
            Outbound::Close => {
                if let Err(e) = sink.send(Message::Close(None)).await {
                    tracing::debug!("Close frame not delivered: {}", e);
                }
                let reader = shared.reader.lock().take();
                if let Some(mut reader) = reader {
                    if timeout(close_timeout, &mut reader).await.is_err() {
                        tracing::warn!("Backend did not answer the close frame");
                        reader.abort();
                        shared.finish();
                    }
                }
                return;
            }
        }
    }
}

async fn read_loop(mut stream: SplitStream<WsStream>, shared: Arc<Shared>) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => shared.deliver(text.as_str()),
            Ok(Message::Binary(payload)) => match std::str::from_utf8(&payload) {
                Ok(text) => shared.deliver(text),
                Err(_) => {
                    shared.metrics.record_malformed_annotation();
                    tracing::warn!("Dropping non UTF-8 payload of {} bytes", payload.len());
                }
            },
            Ok(Message::Close(frame)) => {
                tracing::info!("Backend closed the channel: {:?}", frame);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                shared.fail(e.to_string());
                return;
            }
        }
    }
    shared.finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        routing::get,
        Router,
    };
    use std::{
        future::Future,
        sync::atomic::AtomicUsize,
        time::Duration,
    };
    use tokio::{net::TcpListener, time::timeout};

    async fn spawn_backend<F, Fut>(handler: F) -> String
    where
        F: Fn(WebSocket) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let app = Router::new().route(
            "/security/ws",
            get(move |ws: WebSocketUpgrade| {
                let handler = handler.clone();
                async move { ws.on_upgrade(handler) }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("ws://{}/security/ws", addr)
    }

    fn channel() -> (TransportChannel, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(Metrics::new().unwrap());
        (TransportChannel::new(tx, metrics), rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> ChannelEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for channel event")
            .expect("event stream ended")
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let url = spawn_backend(|mut socket: WebSocket| async move {
            let _ = socket.send(WsMessage::Text("{not json".into())).await;
            let _ = socket
                .send(WsMessage::Text(
                    r#"{"predictions":[{"box":[0,0,10,10],"label":"person","score":0.95}],"alerts":[]}"#.into(),
                ))
                .await;
            let _ = socket.close().await;
        })
        .await;
        let (channel, mut rx) = channel();

        channel.open(&url).await.unwrap();

        assert!(matches!(next_event(&mut rx).await, ChannelEvent::Opened));
        match next_event(&mut rx).await {
            ChannelEvent::Message(message) => {
                assert_eq!(message.predictions.len(), 1);
                assert_eq!(message.predictions[0].label, "person");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(next_event(&mut rx).await, ChannelEvent::Closed));
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_second_send_is_refused_while_in_flight() {
        let url = spawn_backend(|mut socket: WebSocket| async move {
            while let Some(Ok(_)) = socket.recv().await {}
        })
        .await;
        let (channel, mut rx) = channel();
        channel.open(&url).await.unwrap();
        assert!(matches!(next_event(&mut rx).await, ChannelEvent::Opened));

        let completion = channel.send_binary(Bytes::from_static(b"jpeg")).unwrap();
        assert!(matches!(
            channel.send_binary(Bytes::from_static(b"jpeg")),
            Err(ChannelError::Busy)
        ));

        completion.wait().await.unwrap();
        assert!(!channel.is_sending());
        assert!(channel.send_binary(Bytes::from_static(b"jpeg")).is_ok());
    }

    #[tokio::test]
    async fn test_close_twice_sends_one_close_frame() {
        let close_frames = Arc::new(AtomicUsize::new(0));
        let seen = close_frames.clone();
        let url = spawn_backend(move |mut socket: WebSocket| {
            let seen = seen.clone();
            async move {
                while let Some(Ok(message)) = socket.recv().await {
                    if let WsMessage::Close(_) = message {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        })
        .await;
        let (channel, mut rx) = channel();
        channel.open(&url).await.unwrap();
        assert!(matches!(next_event(&mut rx).await, ChannelEvent::Opened));

        channel.close();
        channel.close();

        assert!(matches!(next_event(&mut rx).await, ChannelEvent::Closed));
        assert_eq!(close_frames.load(Ordering::SeqCst), 1);
        assert_eq!(channel.state(), ChannelState::Closed);

        channel.close();
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_connect_failure_reports_error_then_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let (channel, mut rx) = channel();

        let result = channel.open(&format!("ws://{}/security/ws", addr)).await;

        assert!(matches!(result, Err(ChannelError::ConnectFailed { .. })));
        assert!(matches!(next_event(&mut rx).await, ChannelEvent::Errored(_)));
        assert!(matches!(next_event(&mut rx).await, ChannelEvent::Closed));
        assert_eq!(channel.state(), ChannelState::Errored);
        assert!(matches!(
            channel.send_binary(Bytes::new()),
            Err(ChannelError::NotOpen)
        ));
    }

    #[tokio::test]
    async fn test_unanswered_close_still_ends_closed() {
        let url = spawn_backend(|socket: WebSocket| async move {
            // Hold the socket without ever reading the close frame.
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        })
        .await;
        let (channel, mut rx) = channel();
        let channel = channel.with_close_timeout(Duration::from_millis(150));
        channel.open(&url).await.unwrap();
        assert!(matches!(next_event(&mut rx).await, ChannelEvent::Opened));

        channel.close();
        assert_eq!(channel.state(), ChannelState::Closing);

        assert!(matches!(next_event(&mut rx).await, ChannelEvent::Closed));
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_dropping_open_channel_emits_closed() {
        let url = spawn_backend(|mut socket: WebSocket| async move {
            while let Some(Ok(_)) = socket.recv().await {}
        })
        .await;
        let (channel, mut rx) = channel();
        channel.open(&url).await.unwrap();
        assert!(matches!(next_event(&mut rx).await, ChannelEvent::Opened));

        drop(channel);

        assert!(matches!(next_event(&mut rx).await, ChannelEvent::Closed));
    }

    #[tokio::test]
    async fn test_close_during_slow_handshake_cancels_promptly() {
        let app = Router::new().route(
            "/security/ws",
            get(|ws: WebSocketUpgrade| async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                ws.on_upgrade(|_socket: WebSocket| async {})
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let (channel, mut rx) = channel();
        let channel = Arc::new(channel);

        let opening = {
            let channel = channel.clone();
            let url = format!("ws://{}/security/ws", addr);
            tokio::spawn(async move { channel.open(&url).await })
        };
        while channel.state() != ChannelState::Connecting {
            tokio::task::yield_now().await;
        }
        channel.close();

        let result = timeout(Duration::from_millis(500), opening)
            .await
            .expect("open did not return after close")
            .unwrap();
        assert!(matches!(result, Err(ChannelError::Cancelled)));
        assert!(matches!(next_event(&mut rx).await, ChannelEvent::Closed));
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_channel_is_single_use() {
        let (channel, _rx) = channel();
        channel.close();
        assert_eq!(channel.state(), ChannelState::Idle);
        assert!(matches!(
            channel.send_binary(Bytes::new()),
            Err(ChannelError::NotOpen)
        ));
    }
}
