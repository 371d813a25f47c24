//! Session lifecycle controller.
//!
//! Owns one remote session at a time and the single transport channel that
//! carries its input. State machine:
//!
//! ```text
//! Idle -> Opening -> Active -> Closing -> Closed
//!            \          \
//!             Failed     (realtime lost: transport degrades to Fallback)
//! ```
//!
//! Every asynchronous continuation re-checks that its session generation
//! and transport epoch are still current before acting.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::{StreamExt, stream::BoxStream};
use term_bridge_core::{
    ActiveTransport, ChannelError, ChannelEvent, ChannelEvents, ChannelFactory, LaunchRequest,
    LifecycleState, OutputSink, ProtocolMessage, SessionApi, SessionError, StatusEvent,
    TransportChannel, keys, sink::normalize_chunk,
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_stream::wrappers::BroadcastStream;

/// Default buffer of the status notification channel.
const STATUS_CAPACITY: usize = 64;

/// Snapshot of the controller's session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    /// Remote identifier; present only while `Active` or `Closing`.
    pub session_id: Option<String>,
    pub lifecycle_state: LifecycleState,
    pub active_transport: ActiveTransport,
}

impl Session {
    const fn with_state(lifecycle_state: LifecycleState) -> Self {
        Self {
            session_id: None,
            lifecycle_state,
            active_transport: ActiveTransport::None,
        }
    }
}

/// Controller error surfaced to the host.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Session open failed: {0}")]
    Open(#[from] SessionError),
    #[error("Send failed: {0}")]
    Send(#[from] ChannelError),
    #[error("Session not active: {0:?}")]
    NotActive(LifecycleState),
    #[error("No transport available")]
    NoTransport,
    #[error("Session open cancelled")]
    Cancelled,
}

/// The channel currently carrying input.
#[derive(Clone)]
struct Installed {
    kind: ActiveTransport,
    epoch: u64,
    channel: Arc<dyn TransportChannel>,
}

struct State {
    session: Session,
    /// Bumped on every `start`.
    generation: u64,
    /// Last transport epoch handed out. Only events tagged with it reach
    /// the sink.
    epoch: u64,
    installed: Option<Installed>,
    pump: Option<JoinHandle<()>>,
}

impl State {
    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.session.lifecycle_state == LifecycleState::Active
    }

    fn next_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }
}

/// Outcome of establishing the realtime channel.
enum Establish {
    Installed,
    Stale,
    Failed(ChannelError),
}

struct Inner<A, F> {
    api: A,
    factory: F,
    sink: Arc<dyn OutputSink>,
    request: LaunchRequest,
    state: Mutex<State>,
    status_tx: broadcast::Sender<StatusEvent>,
}

/// Controller for one host component's terminal session.
///
/// Dropping a controller with a live session spawns the stop path on the
/// current tokio runtime so no channel or remote session is leaked.
pub struct SessionController<A, F>
where
    A: SessionApi + 'static,
    F: ChannelFactory + 'static,
{
    inner: Arc<Inner<A, F>>,
}

impl<A, F> SessionController<A, F>
where
    A: SessionApi + 'static,
    F: ChannelFactory + 'static,
{
    /// Create an idle controller.
    #[must_use]
    pub fn new(api: A, factory: F, sink: Arc<dyn OutputSink>, request: LaunchRequest) -> Self {
        Self::with_status_capacity(api, factory, sink, request, STATUS_CAPACITY)
    }

    /// Create an idle controller with a custom status buffer size.
    #[must_use]
    pub fn with_status_capacity(
        api: A,
        factory: F,
        sink: Arc<dyn OutputSink>,
        request: LaunchRequest,
        capacity: usize,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                api,
                factory,
                sink,
                request,
                state: Mutex::new(State {
                    session: Session::default(),
                    generation: 0,
                    epoch: 0,
                    installed: None,
                    pump: None,
                }),
                status_tx,
            }),
        }
    }

    /// Open a session and its realtime channel.
    ///
    /// A no-op returning the current session while one is already
    /// `Opening` or `Active`.
    ///
    /// # Errors
    /// Returns [`BridgeError::Open`] if the launch is rejected (the session
    /// ends `Failed`), or [`BridgeError::Cancelled`] if `stop` ran while
    /// the launch was in flight.
    pub async fn start(&self) -> Result<Session, BridgeError> {
        self.inner.start().await
    }

    /// Close the session. A no-op unless a session is opening or active.
    pub async fn stop(&self) {
        self.inner.stop().await;
    }

    /// Encode a raw input fragment and send it on the current transport.
    ///
    /// # Errors
    /// Returns error if no session is active or the send fails. A failed
    /// send never changes the lifecycle state.
    pub async fn send_raw(&self, raw: &str) -> Result<(), BridgeError> {
        self.inner.send(keys::encode(raw)).await
    }

    /// Send an already encoded message.
    ///
    /// # Errors
    /// Same as [`Self::send_raw`].
    pub async fn send_message(&self, message: ProtocolMessage) -> Result<(), BridgeError> {
        self.inner.send(message).await
    }

    /// Snapshot of the current session.
    #[must_use]
    pub fn session(&self) -> Session {
        self.inner.lock().session.clone()
    }

    #[must_use]
    pub fn lifecycle_state(&self) -> LifecycleState {
        self.inner.lock().session.lifecycle_state
    }

    #[must_use]
    pub fn active_transport(&self) -> ActiveTransport {
        self.inner.lock().session.active_transport
    }

    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.inner.lock().session.session_id.clone()
    }

    /// Receiver for status notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.status_tx.subscribe()
    }

    /// Status notifications as a stream. Lagged events are skipped.
    #[must_use]
    pub fn status_stream(&self) -> BoxStream<'static, StatusEvent> {
        BroadcastStream::new(self.subscribe())
            .filter_map(|res| async move { res.ok() })
            .boxed()
    }

    /// Call `listener` for every status notification.
    ///
    /// Abort the returned handle to unsubscribe.
    pub fn on_status_change<L>(&self, listener: L) -> JoinHandle<()>
    where
        L: Fn(StatusEvent) + Send + 'static,
    {
        let mut stream = self.status_stream();
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                listener(event);
            }
        })
    }
}

#[cfg(feature = "http")]
impl SessionController<crate::HttpSessionApi, term_bridge_transport::HttpChannelFactory> {
    /// Controller talking to the session server named in `config`.
    ///
    /// # Errors
    /// Returns error if the base URL is invalid or the HTTP client cannot be
    /// built.
    pub fn from_config(
        config: &term_bridge_core::BridgeConfig,
        sink: Arc<dyn OutputSink>,
        request: LaunchRequest,
    ) -> Result<Self, term_bridge_transport::TransportError> {
        Ok(Self::with_status_capacity(
            crate::HttpSessionApi::from_config(config)?,
            term_bridge_transport::HttpChannelFactory::from_config(config)?,
            sink,
            request,
            config.status_capacity,
        ))
    }
}

impl<A, F> Drop for SessionController<A, F>
where
    A: SessionApi + 'static,
    F: ChannelFactory + 'static,
{
    fn drop(&mut self) {
        let live = matches!(
            self.inner.lock().session.lifecycle_state,
            LifecycleState::Opening | LifecycleState::Active
        );
        if !live {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = Arc::clone(&self.inner);
            handle.spawn(async move { inner.stop().await });
        } else {
            tracing::warn!("Controller dropped outside a runtime; remote session left running");
            if let Some(pump) = self.inner.lock().pump.take() {
                pump.abort();
            }
        }
    }
}

impl<A, F> Inner<A, F>
where
    A: SessionApi + 'static,
    F: ChannelFactory + 'static,
{
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: StatusEvent) {
        let _ = self.status_tx.send(event);
    }

    async fn start(self: &Arc<Self>) -> Result<Session, BridgeError> {
        let generation = {
            let mut state = self.lock();
            if matches!(
                state.session.lifecycle_state,
                LifecycleState::Opening | LifecycleState::Active
            ) {
                tracing::debug!(state = ?state.session.lifecycle_state, "start ignored");
                return Ok(state.session.clone());
            }
            state.generation += 1;
            state.session = Session::with_state(LifecycleState::Opening);
            self.emit(StatusEvent::Lifecycle(LifecycleState::Opening));
            state.generation
        };
        tracing::info!(task_id = %self.request.task_id, "Opening session");

        let launched = self.api.launch(&self.request).await;

        let (session_id, orphan) = {
            let mut state = self.lock();
            let current = state.generation == generation
                && state.session.lifecycle_state == LifecycleState::Opening;
            match launched {
                Ok(id) if !current => (None, Some(id)),
                Err(e) if !current => {
                    tracing::debug!("Discarding launch failure for a cancelled open: {e}");
                    (None, None)
                }
                Err(e) => {
                    tracing::error!("Session open failed: {e}");
                    state.session = Session::with_state(LifecycleState::Failed);
                    self.emit(StatusEvent::Lifecycle(LifecycleState::Failed));
                    self.emit(StatusEvent::OpenFailed(e.to_string()));
                    return Err(BridgeError::Open(e));
                }
                Ok(id) => {
                    state.session.session_id = Some(id.clone());
                    state.session.lifecycle_state = LifecycleState::Active;
                    self.sink.clear();
                    self.emit(StatusEvent::Lifecycle(LifecycleState::Active));
                    (Some(id), None)
                }
            }
        };

        if let Some(id) = orphan {
            tracing::info!(session_id = %id, "Open completed after stop; releasing session");
            if let Err(e) = self.api.stop(&id).await {
                tracing::warn!(session_id = %id, "Failed to release cancelled session: {e}");
            }
        }
        let Some(session_id) = session_id else {
            return Err(BridgeError::Cancelled);
        };
        tracing::info!(session_id = %session_id, "Session active");

        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump(Arc::downgrade(self), generation, rx));
        {
            let mut state = self.lock();
            if state.is_current(generation) {
                state.pump = Some(pump);
            } else {
                pump.abort();
            }
        }

        self.connect_realtime(generation, &session_id, tx).await;
        Ok(self.lock().session.clone())
    }

    async fn connect_realtime(
        self: &Arc<Self>,
        generation: u64,
        session_id: &str,
        tx: mpsc::UnboundedSender<ChannelEvent>,
    ) {
        let epoch = self.lock().next_epoch();
        let channel = self
            .factory
            .realtime(session_id, ChannelEvents::new(epoch, tx));
        let opened = channel.open().await;

        let outcome = {
            let mut state = self.lock();
            if !state.is_current(generation)
                || state.session.active_transport == ActiveTransport::Fallback
            {
                Establish::Stale
            } else {
                match opened {
                    Ok(()) => {
                        state.installed = Some(Installed {
                            kind: ActiveTransport::Realtime,
                            epoch,
                            channel: Arc::clone(&channel),
                        });
                        state.session.active_transport = ActiveTransport::Realtime;
                        self.emit(StatusEvent::Transport(ActiveTransport::Realtime));
                        Establish::Installed
                    }
                    Err(e) => Establish::Failed(e),
                }
            }
        };

        match outcome {
            Establish::Installed => tracing::info!(epoch, "Realtime transport established"),
            Establish::Stale => channel.close().await,
            Establish::Failed(e) => {
                tracing::warn!("Realtime channel unavailable: {e}");
                channel.close().await;
                self.degrade(generation, None).await;
            }
        }
    }

    /// Replace the realtime channel with the fallback channel.
    ///
    /// `failed_epoch` names the channel that reported the failure; reports
    /// from a channel that was already replaced are ignored.
    async fn degrade(self: &Arc<Self>, generation: u64, failed_epoch: Option<u64>) {
        let (epoch, old, session_id) = {
            let mut state = self.lock();
            if !state.is_current(generation)
                || state.session.active_transport == ActiveTransport::Fallback
            {
                return;
            }
            if let (Some(installed), Some(epoch)) = (&state.installed, failed_epoch) {
                if installed.epoch != epoch {
                    return;
                }
            }
            state.session.active_transport = ActiveTransport::Fallback;
            (
                state.next_epoch(),
                state.installed.take(),
                state.session.session_id.clone(),
            )
        };
        let Some(session_id) = session_id else {
            return;
        };
        tracing::warn!(session_id = %session_id, "Realtime transport lost; switching to fallback");

        // At most one channel open at a time.
        if let Some(old) = old {
            old.channel.close().await;
        }

        let channel = self.factory.fallback(&session_id);
        let opened = channel.open().await;

        let stale = {
            let mut state = self.lock();
            if state.is_current(generation) {
                match opened {
                    Ok(()) => {
                        state.installed = Some(Installed {
                            kind: ActiveTransport::Fallback,
                            epoch,
                            channel: Arc::clone(&channel),
                        });
                        self.emit(StatusEvent::Transport(ActiveTransport::Fallback));
                    }
                    Err(e) => {
                        tracing::error!("Fallback channel unavailable: {e}");
                        state.session.active_transport = ActiveTransport::None;
                        self.emit(StatusEvent::Transport(ActiveTransport::None));
                    }
                }
                false
            } else {
                true
            }
        };
        if stale {
            channel.close().await;
        }
    }

    fn current(&self) -> Result<(u64, Option<Installed>), BridgeError> {
        let state = self.lock();
        match state.session.lifecycle_state {
            LifecycleState::Active => Ok((state.generation, state.installed.clone())),
            other => Err(BridgeError::NotActive(other)),
        }
    }

    async fn send(self: &Arc<Self>, message: ProtocolMessage) -> Result<(), BridgeError> {
        let (generation, mut installed) = self.current()?;

        let dead_realtime = installed
            .as_ref()
            .filter(|i| i.kind == ActiveTransport::Realtime && !i.channel.status().is_open())
            .map(|i| i.epoch);
        if let Some(epoch) = dead_realtime {
            self.degrade(generation, Some(epoch)).await;
            installed = self.current()?.1;
        }

        let Some(Installed {
            kind,
            epoch,
            channel,
        }) = installed
        else {
            self.emit(StatusEvent::SendFailed(BridgeError::NoTransport.to_string()));
            return Err(BridgeError::NoTransport);
        };

        let result = channel.send(&message).await;

        if !self.lock().is_current(generation) {
            tracing::debug!("Discarding send completion for an ended session");
            return Ok(());
        }
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(transport = ?kind, "Send failed: {e}");
                self.emit(StatusEvent::SendFailed(e.to_string()));
                if kind == ActiveTransport::Realtime && !channel.status().is_open() {
                    self.degrade(generation, Some(epoch)).await;
                }
                Err(BridgeError::Send(e))
            }
        }
    }

    async fn stop(&self) {
        let (generation, installed, pump, session_id) = {
            let mut state = self.lock();
            match state.session.lifecycle_state {
                LifecycleState::Active => {}
                LifecycleState::Opening => {
                    // The in-flight launch sees the state change and releases
                    // whatever session it gets back.
                    state.session = Session::with_state(LifecycleState::Closed);
                    self.emit(StatusEvent::Lifecycle(LifecycleState::Closed));
                    tracing::info!("Session open cancelled");
                    return;
                }
                _ => return,
            }
            state.session.lifecycle_state = LifecycleState::Closing;
            self.emit(StatusEvent::Lifecycle(LifecycleState::Closing));
            (
                state.generation,
                state.installed.take(),
                state.pump.take(),
                state.session.session_id.clone(),
            )
        };

        if let Some(pump) = pump {
            pump.abort();
        }
        // Channel first, then the remote session.
        if let Some(installed) = installed {
            installed.channel.close().await;
        }
        if let Some(id) = &session_id {
            if let Err(e) = self.api.stop(id).await {
                tracing::warn!(session_id = %id, "Session close failed: {e}");
                self.emit(StatusEvent::CloseFailed(e.to_string()));
            }
        }

        let mut state = self.lock();
        if state.generation != generation {
            // A new session was started while this one was closing.
            tracing::info!(session_id = ?session_id, "Session closed; successor left untouched");
            return;
        }
        state.session = Session::with_state(LifecycleState::Closed);
        self.emit(StatusEvent::Transport(ActiveTransport::None));
        self.emit(StatusEvent::Lifecycle(LifecycleState::Closed));
        tracing::info!(session_id = ?session_id, "Session closed");
    }

    fn forward_output(&self, generation: u64, epoch: u64, chunk: &str) {
        let state = self.lock();
        if !state.is_current(generation) {
            tracing::debug!("Dropping output outside an active session");
            return;
        }
        if state.epoch != epoch {
            tracing::debug!(epoch, "Dropping output from a replaced channel");
            return;
        }
        if chunk.is_empty() {
            return;
        }
        // Written under the lock so nothing reaches the sink after `stop`
        // leaves `Active`.
        self.sink.write(&normalize_chunk(chunk));
    }
}

/// Apply channel events for one session generation, in arrival order.
async fn pump<A, F>(
    inner: Weak<Inner<A, F>>,
    generation: u64,
    mut rx: mpsc::UnboundedReceiver<ChannelEvent>,
) where
    A: SessionApi + 'static,
    F: ChannelFactory + 'static,
{
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            ChannelEvent::Output { epoch, chunk } => inner.forward_output(generation, epoch, &chunk),
            ChannelEvent::Closed { epoch, reason } => {
                tracing::warn!(epoch, "Realtime channel closed unexpectedly: {reason}");
                inner.degrade(generation, Some(epoch)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use term_bridge_core::{BufferSink, ChannelStatus, Key};
    use tokio::sync::Notify;

    use super::*;

    const WAIT: Duration = Duration::from_secs(2);

    #[derive(Default)]
    struct ApiLog {
        launches: AtomicUsize,
        stops: Mutex<Vec<String>>,
        reject: AtomicBool,
        fail_stop: AtomicBool,
        gate: Option<Notify>,
        stop_gate: Option<Notify>,
    }

    #[derive(Clone, Default)]
    struct MockApi(Arc<ApiLog>);

    impl MockApi {
        fn gated() -> Self {
            Self(Arc::new(ApiLog {
                gate: Some(Notify::new()),
                ..ApiLog::default()
            }))
        }

        fn stop_gated() -> Self {
            Self(Arc::new(ApiLog {
                stop_gate: Some(Notify::new()),
                ..ApiLog::default()
            }))
        }

        fn stops(&self) -> Vec<String> {
            self.0.stops.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SessionApi for MockApi {
        async fn launch(&self, _request: &LaunchRequest) -> Result<String, SessionError> {
            let n = self.0.launches.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(gate) = &self.0.gate {
                gate.notified().await;
            }
            if self.0.reject.load(Ordering::SeqCst) {
                return Err(SessionError::Rejected("task not found".into()));
            }
            Ok(format!("s{n}"))
        }

        async fn stop(&self, session_id: &str) -> Result<(), SessionError> {
            self.0.stops.lock().unwrap().push(session_id.to_string());
            if let Some(gate) = &self.0.stop_gate {
                gate.notified().await;
            }
            if self.0.fail_stop.load(Ordering::SeqCst) {
                return Err(SessionError::Request("connection refused".into()));
            }
            Ok(())
        }
    }

    struct MockChannel {
        kind: ActiveTransport,
        fail_open: bool,
        fail_send: AtomicBool,
        send_gate: Option<Arc<Notify>>,
        in_flight: AtomicUsize,
        status: Mutex<ChannelStatus>,
        sent: Mutex<Vec<ProtocolMessage>>,
        closes: AtomicUsize,
    }

    impl MockChannel {
        fn new(
            kind: ActiveTransport,
            fail_open: bool,
            send_gate: Option<Arc<Notify>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                kind,
                fail_open,
                fail_send: AtomicBool::new(false),
                send_gate,
                in_flight: AtomicUsize::new(0),
                status: Mutex::new(ChannelStatus::Connecting),
                sent: Mutex::new(Vec::new()),
                closes: AtomicUsize::new(0),
            })
        }

        fn sent(&self) -> Vec<ProtocolMessage> {
            self.sent.lock().unwrap().clone()
        }

        fn set_status(&self, status: ChannelStatus) {
            *self.status.lock().unwrap() = status;
        }
    }

    #[async_trait]
    impl TransportChannel for MockChannel {
        fn kind(&self) -> ActiveTransport {
            self.kind
        }

        async fn open(&self) -> Result<(), ChannelError> {
            if self.fail_open {
                self.set_status(ChannelStatus::Errored);
                return Err(ChannelError::Connection("refused".into()));
            }
            self.set_status(ChannelStatus::Open);
            Ok(())
        }

        async fn send(&self, message: &ProtocolMessage) -> Result<(), ChannelError> {
            if !self.status().is_open() {
                return Err(ChannelError::NotOpen);
            }
            if let Some(gate) = &self.send_gate {
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                gate.notified().await;
                if !self.status().is_open() {
                    return Err(ChannelError::Send("channel closed mid-request".into()));
                }
            }
            if self.fail_send.load(Ordering::SeqCst) {
                return Err(ChannelError::Send("broken pipe".into()));
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.set_status(ChannelStatus::Closed);
        }

        fn status(&self) -> ChannelStatus {
            *self.status.lock().unwrap()
        }
    }

    #[derive(Default)]
    struct FactoryLog {
        realtime_fails: bool,
        send_gate: Option<Arc<Notify>>,
        realtimes: Mutex<Vec<(Arc<MockChannel>, ChannelEvents)>>,
        fallbacks: Mutex<Vec<Arc<MockChannel>>>,
    }

    #[derive(Clone, Default)]
    struct MockFactory(Arc<FactoryLog>);

    impl MockFactory {
        fn failing_realtime() -> Self {
            Self(Arc::new(FactoryLog {
                realtime_fails: true,
                ..FactoryLog::default()
            }))
        }

        fn gated_fallback(gate: &Arc<Notify>) -> Self {
            Self(Arc::new(FactoryLog {
                realtime_fails: true,
                send_gate: Some(Arc::clone(gate)),
                ..FactoryLog::default()
            }))
        }

        fn last_realtime(&self) -> (Arc<MockChannel>, ChannelEvents) {
            self.0.realtimes.lock().unwrap().last().cloned().unwrap()
        }

        fn last_fallback(&self) -> Arc<MockChannel> {
            self.0.fallbacks.lock().unwrap().last().cloned().unwrap()
        }

        fn fallback_count(&self) -> usize {
            self.0.fallbacks.lock().unwrap().len()
        }
    }

    impl ChannelFactory for MockFactory {
        fn realtime(&self, _session_id: &str, events: ChannelEvents) -> Arc<dyn TransportChannel> {
            let channel = MockChannel::new(
                ActiveTransport::Realtime,
                self.0.realtime_fails,
                self.0.send_gate.clone(),
            );
            self.0
                .realtimes
                .lock()
                .unwrap()
                .push((Arc::clone(&channel), events));
            channel
        }

        fn fallback(&self, _session_id: &str) -> Arc<dyn TransportChannel> {
            let channel =
                MockChannel::new(ActiveTransport::Fallback, false, self.0.send_gate.clone());
            self.0.fallbacks.lock().unwrap().push(Arc::clone(&channel));
            channel
        }
    }

    type Controller = SessionController<MockApi, MockFactory>;

    fn controller(api: &MockApi, factory: &MockFactory) -> (Controller, Arc<BufferSink>) {
        let sink = Arc::new(BufferSink::new());
        let controller = SessionController::new(
            api.clone(),
            factory.clone(),
            Arc::clone(&sink) as Arc<dyn OutputSink>,
            LaunchRequest::new("42", "CONTEXT.md"),
        );
        (controller, sink)
    }

    async fn wait_for(rx: &mut broadcast::Receiver<StatusEvent>, wanted: &StatusEvent) {
        tokio::time::timeout(WAIT, async {
            loop {
                match rx.recv().await {
                    Ok(event) if event == *wanted => break,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("status channel closed"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {wanted:?}"));
    }

    #[tokio::test]
    async fn test_start_opens_realtime_session() {
        let (api, factory) = (MockApi::default(), MockFactory::default());
        let (controller, sink) = controller(&api, &factory);
        sink.write("stale output\n");

        let session = controller.start().await.unwrap();

        assert_eq!(session.session_id.as_deref(), Some("s1"));
        assert_eq!(session.lifecycle_state, LifecycleState::Active);
        assert_eq!(session.active_transport, ActiveTransport::Realtime);
        assert!(sink.writes().is_empty());
        assert_eq!(factory.fallback_count(), 0);
    }

    #[tokio::test]
    async fn test_start_twice_opens_once() {
        let (api, factory) = (MockApi::default(), MockFactory::default());
        let (controller, _sink) = controller(&api, &factory);

        let first = controller.start().await.unwrap();
        let second = controller.start().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(api.0.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_while_opening_is_noop() {
        let (api, factory) = (MockApi::gated(), MockFactory::default());
        let (controller, _sink) = controller(&api, &factory);
        let controller = Arc::new(controller);

        let opening = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.start().await }
        });
        while controller.lifecycle_state() != LifecycleState::Opening {
            tokio::task::yield_now().await;
        }

        let during = controller.start().await.unwrap();
        assert_eq!(during.lifecycle_state, LifecycleState::Opening);
        assert_eq!(during.session_id, None);

        api.0.gate.as_ref().unwrap().notify_one();
        let opened = opening.await.unwrap().unwrap();
        assert_eq!(opened.session_id.as_deref(), Some("s1"));
        assert_eq!(api.0.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_keys_and_text_reach_realtime_channel() {
        let (api, factory) = (MockApi::default(), MockFactory::default());
        let (controller, _sink) = controller(&api, &factory);
        controller.start().await.unwrap();

        controller.send_raw("\r").await.unwrap();
        controller.send_raw("\x1b[A").await.unwrap();
        controller.send_raw("echo hi").await.unwrap();
        controller.send_message(ProtocolMessage::Ping).await.unwrap();

        let (realtime, _) = factory.last_realtime();
        assert_eq!(
            realtime.sent(),
            vec![
                ProtocolMessage::key(Key::Enter),
                ProtocolMessage::key(Key::Up),
                ProtocolMessage::input("echo hi"),
                ProtocolMessage::Ping,
            ]
        );
    }

    #[tokio::test]
    async fn test_output_is_normalized_in_order() {
        let (api, factory) = (MockApi::default(), MockFactory::default());
        let (controller, sink) = controller(&api, &factory);
        controller.start().await.unwrap();

        let (_, events) = factory.last_realtime();
        events.output("abc");
        events.output("");
        events.output("def\n");

        assert!(sink.wait_for_writes(2, WAIT).await);
        assert_eq!(sink.writes(), vec!["abc\n", "def\n"]);
    }

    #[tokio::test]
    async fn test_realtime_loss_degrades_to_fallback() {
        let (api, factory) = (MockApi::default(), MockFactory::default());
        let (controller, _sink) = controller(&api, &factory);
        controller.start().await.unwrap();
        let mut status = controller.subscribe();

        let (realtime, events) = factory.last_realtime();
        realtime.set_status(ChannelStatus::Closed);
        events.closed("remote hangup");
        wait_for(&mut status, &StatusEvent::Transport(ActiveTransport::Fallback)).await;

        assert_eq!(controller.lifecycle_state(), LifecycleState::Active);
        assert_eq!(controller.active_transport(), ActiveTransport::Fallback);
        assert_eq!(realtime.closes.load(Ordering::SeqCst), 1);

        controller.send_raw("ls\n").await.unwrap();
        assert_eq!(factory.last_fallback().sent(), vec![ProtocolMessage::input("ls\n")]);
        assert!(realtime.sent().is_empty());
    }

    #[tokio::test]
    async fn test_stale_close_report_is_ignored() {
        let (api, factory) = (MockApi::default(), MockFactory::default());
        let (controller, _sink) = controller(&api, &factory);
        controller.start().await.unwrap();

        let (realtime, events) = factory.last_realtime();
        realtime.set_status(ChannelStatus::Closed);
        events.closed("first");
        events.closed("duplicate");
        controller.send_raw("x").await.unwrap();
        tokio::task::yield_now().await;

        assert_eq!(factory.fallback_count(), 1);
    }

    #[tokio::test]
    async fn test_realtime_open_failure_uses_fallback() {
        let (api, factory) = (MockApi::default(), MockFactory::failing_realtime());
        let (controller, _sink) = controller(&api, &factory);

        let session = controller.start().await.unwrap();

        assert_eq!(session.lifecycle_state, LifecycleState::Active);
        assert_eq!(session.active_transport, ActiveTransport::Fallback);
        controller.send_raw("\t").await.unwrap();
        assert_eq!(factory.last_fallback().sent(), vec![ProtocolMessage::key(Key::Tab)]);
    }

    #[tokio::test]
    async fn test_send_on_dead_realtime_degrades_first() {
        let (api, factory) = (MockApi::default(), MockFactory::default());
        let (controller, _sink) = controller(&api, &factory);
        controller.start().await.unwrap();

        let (realtime, _events) = factory.last_realtime();
        realtime.set_status(ChannelStatus::Errored);

        controller.send_raw("pwd").await.unwrap();
        assert_eq!(controller.active_transport(), ActiveTransport::Fallback);
        assert_eq!(factory.last_fallback().sent(), vec![ProtocolMessage::input("pwd")]);
    }

    #[tokio::test]
    async fn test_send_failure_keeps_session_active() {
        let (api, factory) = (MockApi::default(), MockFactory::default());
        let (controller, _sink) = controller(&api, &factory);
        controller.start().await.unwrap();
        let mut status = controller.subscribe();

        let (realtime, _) = factory.last_realtime();
        realtime.fail_send.store(true, Ordering::SeqCst);

        let result = controller.send_raw("ls").await;
        assert!(matches!(result, Err(BridgeError::Send(_))));
        assert_eq!(
            status.try_recv().unwrap(),
            StatusEvent::SendFailed("Send failed: broken pipe".into())
        );
        assert_eq!(controller.lifecycle_state(), LifecycleState::Active);
        assert_eq!(controller.active_transport(), ActiveTransport::Realtime);
    }

    #[tokio::test]
    async fn test_open_failure_is_terminal_until_restart() {
        let (api, factory) = (MockApi::default(), MockFactory::default());
        api.0.reject.store(true, Ordering::SeqCst);
        let (controller, _sink) = controller(&api, &factory);
        let mut status = controller.subscribe();

        let result = controller.start().await;
        assert!(matches!(result, Err(BridgeError::Open(SessionError::Rejected(_)))));
        assert_eq!(controller.session(), Session::with_state(LifecycleState::Failed));
        wait_for(
            &mut status,
            &StatusEvent::OpenFailed("Session rejected: task not found".into()),
        )
        .await;
        assert!(matches!(
            controller.send_raw("x").await,
            Err(BridgeError::NotActive(LifecycleState::Failed))
        ));

        // Stopping a failed session does nothing.
        controller.stop().await;
        assert!(api.stops().is_empty());

        api.0.reject.store(false, Ordering::SeqCst);
        let session = controller.start().await.unwrap();
        assert_eq!(session.session_id.as_deref(), Some("s2"));
    }

    #[tokio::test]
    async fn test_stop_releases_everything() {
        let (api, factory) = (MockApi::default(), MockFactory::default());
        let (controller, sink) = controller(&api, &factory);
        controller.start().await.unwrap();
        let (realtime, events) = factory.last_realtime();

        controller.stop().await;

        assert_eq!(controller.session(), Session::with_state(LifecycleState::Closed));
        assert_eq!(realtime.closes.load(Ordering::SeqCst), 1);
        assert_eq!(api.stops(), vec!["s1"]);

        events.output("late");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sink.writes().is_empty());
        assert!(matches!(
            controller.send_raw("x").await,
            Err(BridgeError::NotActive(LifecycleState::Closed))
        ));
    }

    #[tokio::test]
    async fn test_output_from_replaced_channel_is_dropped() {
        let (api, factory) = (MockApi::default(), MockFactory::default());
        let (controller, sink) = controller(&api, &factory);
        controller.start().await.unwrap();
        let mut status = controller.subscribe();

        let (realtime, events) = factory.last_realtime();
        realtime.set_status(ChannelStatus::Closed);
        events.closed("remote hangup");
        wait_for(&mut status, &StatusEvent::Transport(ActiveTransport::Fallback)).await;

        events.output("late");
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(sink.writes().is_empty());
        assert_eq!(controller.lifecycle_state(), LifecycleState::Active);
    }

    #[tokio::test]
    async fn test_send_completing_after_stop_is_discarded() {
        let gate = Arc::new(Notify::new());
        let (api, factory) = (MockApi::default(), MockFactory::gated_fallback(&gate));
        let (controller, _sink) = controller(&api, &factory);
        let controller = Arc::new(controller);
        controller.start().await.unwrap();
        assert_eq!(controller.active_transport(), ActiveTransport::Fallback);
        let mut status = controller.subscribe();

        let sending = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.send_raw("ls\n").await }
        });
        let fallback = factory.last_fallback();
        while fallback.in_flight.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        controller.stop().await;
        gate.notify_one();

        assert!(sending.await.unwrap().is_ok());
        assert_eq!(controller.lifecycle_state(), LifecycleState::Closed);
        while let Ok(event) = status.try_recv() {
            assert!(!matches!(event, StatusEvent::SendFailed(_)), "unexpected {event:?}");
        }
        assert!(fallback.sent().is_empty());
    }

    #[tokio::test]
    async fn test_start_while_closing_keeps_new_session() {
        let (api, factory) = (MockApi::stop_gated(), MockFactory::default());
        let (controller, _sink) = controller(&api, &factory);
        let controller = Arc::new(controller);
        controller.start().await.unwrap();

        let closing = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.stop().await }
        });
        while controller.lifecycle_state() != LifecycleState::Closing {
            tokio::task::yield_now().await;
        }

        let session = controller.start().await.unwrap();
        assert_eq!(session.session_id.as_deref(), Some("s2"));
        let (second, _) = factory.last_realtime();

        let gate = api.0.stop_gate.as_ref().unwrap();
        gate.notify_one();
        closing.await.unwrap();

        assert_eq!(controller.session_id().as_deref(), Some("s2"));
        assert_eq!(controller.lifecycle_state(), LifecycleState::Active);
        assert_eq!(second.closes.load(Ordering::SeqCst), 0);

        gate.notify_one();
        controller.stop().await;
        assert_eq!(controller.lifecycle_state(), LifecycleState::Closed);
        assert_eq!(api.stops(), vec!["s1", "s2"]);
        assert_eq!(second.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let (api, factory) = (MockApi::default(), MockFactory::default());
        let (controller, _sink) = controller(&api, &factory);
        let mut status = controller.subscribe();

        controller.stop().await;

        assert_eq!(controller.lifecycle_state(), LifecycleState::Idle);
        assert!(status.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_failure_still_closes() {
        let (api, factory) = (MockApi::default(), MockFactory::default());
        api.0.fail_stop.store(true, Ordering::SeqCst);
        let (controller, _sink) = controller(&api, &factory);
        controller.start().await.unwrap();
        let mut status = controller.subscribe();

        controller.stop().await;

        assert_eq!(controller.lifecycle_state(), LifecycleState::Closed);
        assert_eq!(
            status.try_recv().unwrap(),
            StatusEvent::Lifecycle(LifecycleState::Closing)
        );
        assert!(matches!(status.try_recv().unwrap(), StatusEvent::CloseFailed(_)));
    }

    #[tokio::test]
    async fn test_stop_during_open_releases_late_session() {
        let (api, factory) = (MockApi::gated(), MockFactory::default());
        let (controller, _sink) = controller(&api, &factory);
        let controller = Arc::new(controller);

        let opening = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.start().await }
        });
        while controller.lifecycle_state() != LifecycleState::Opening {
            tokio::task::yield_now().await;
        }

        controller.stop().await;
        assert_eq!(controller.lifecycle_state(), LifecycleState::Closed);

        api.0.gate.as_ref().unwrap().notify_one();
        let result = opening.await.unwrap();
        assert!(matches!(result, Err(BridgeError::Cancelled)));
        assert_eq!(controller.session(), Session::with_state(LifecycleState::Closed));
        assert_eq!(api.stops(), vec!["s1"]);
        assert!(factory.0.realtimes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drop_releases_session() {
        let (api, factory) = (MockApi::default(), MockFactory::default());
        let (controller, _sink) = controller(&api, &factory);
        controller.start().await.unwrap();
        let (realtime, _) = factory.last_realtime();

        drop(controller);

        tokio::time::timeout(WAIT, async {
            while api.stops().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(api.stops(), vec!["s1"]);
        assert_eq!(realtime.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_status_listener_sees_lifecycle() {
        let (api, factory) = (MockApi::default(), MockFactory::default());
        let (controller, _sink) = controller(&api, &factory);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let listener = controller.on_status_change({
            let seen = Arc::clone(&seen);
            move |event| seen.lock().unwrap().push(event)
        });

        controller.start().await.unwrap();
        controller.stop().await;

        tokio::time::timeout(WAIT, async {
            while !seen
                .lock()
                .unwrap()
                .contains(&StatusEvent::Lifecycle(LifecycleState::Closed))
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        listener.abort();

        assert_eq!(
            seen.lock().unwrap().clone(),
            vec![
                StatusEvent::Lifecycle(LifecycleState::Opening),
                StatusEvent::Lifecycle(LifecycleState::Active),
                StatusEvent::Transport(ActiveTransport::Realtime),
                StatusEvent::Lifecycle(LifecycleState::Closing),
                StatusEvent::Transport(ActiveTransport::None),
                StatusEvent::Lifecycle(LifecycleState::Closed),
            ]
        );
    }
}
