//! Host component glue.
//!
//! Wires user input to a [`SessionController`] and folds status
//! notifications into a small view model (connection indicator,
//! fullscreen toggle, last error).

use term_bridge_core::{ActiveTransport, ChannelFactory, LifecycleState, SessionApi, StatusEvent};
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::controller::{BridgeError, Session, SessionController};

/// What the host renders around the terminal surface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewState {
    pub lifecycle: LifecycleState,
    pub transport: ActiveTransport,
    pub connected: bool,
    pub fullscreen: bool,
    pub last_error: Option<String>,
}

impl ViewState {
    /// Fold one notification into the view.
    pub fn apply(&mut self, event: &StatusEvent) {
        match event {
            StatusEvent::Lifecycle(state) => {
                self.lifecycle = *state;
                self.connected = *state == LifecycleState::Active;
                if *state == LifecycleState::Opening {
                    self.last_error = None;
                }
            }
            StatusEvent::Transport(transport) => self.transport = *transport,
            StatusEvent::OpenFailed(error)
            | StatusEvent::SendFailed(error)
            | StatusEvent::CloseFailed(error) => self.last_error = Some(error.clone()),
        }
    }

    /// Short label for a status line.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match (self.lifecycle, self.transport) {
            (LifecycleState::Active, ActiveTransport::Realtime) => "connected",
            (LifecycleState::Active, ActiveTransport::Fallback) => "connected (fallback)",
            (LifecycleState::Active, ActiveTransport::None) => "connected (no transport)",
            (LifecycleState::Opening, _) => "connecting",
            (LifecycleState::Closing, _) => "disconnecting",
            (LifecycleState::Failed, _) => "failed",
            (LifecycleState::Idle | LifecycleState::Closed, _) => "disconnected",
        }
    }
}

/// One mounted terminal view and the session it owns.
pub struct TerminalHost<A, F>
where
    A: SessionApi + 'static,
    F: ChannelFactory + 'static,
{
    controller: SessionController<A, F>,
    events: broadcast::Receiver<StatusEvent>,
    view: ViewState,
}

impl<A, F> TerminalHost<A, F>
where
    A: SessionApi + 'static,
    F: ChannelFactory + 'static,
{
    #[must_use]
    pub fn new(controller: SessionController<A, F>) -> Self {
        let events = controller.subscribe();
        Self {
            controller,
            events,
            view: ViewState::default(),
        }
    }

    /// Start the session for this view.
    ///
    /// # Errors
    /// Returns error if the session cannot be opened.
    pub async fn mount(&mut self) -> Result<Session, BridgeError> {
        let result = self.controller.start().await;
        self.refresh();
        result
    }

    /// Forward one captured input fragment.
    ///
    /// # Errors
    /// Returns error if the input could not be delivered.
    pub async fn handle_input(&mut self, raw: &str) -> Result<(), BridgeError> {
        let result = self.controller.send_raw(raw).await;
        self.refresh();
        result
    }

    /// User-requested stop; the view stays mounted.
    pub async fn stop(&mut self) {
        self.controller.stop().await;
        self.refresh();
    }

    /// Flip fullscreen and return the new value.
    pub fn toggle_fullscreen(&mut self) -> bool {
        self.view.fullscreen = !self.view.fullscreen;
        self.view.fullscreen
    }

    /// Apply pending notifications and return the current view.
    pub fn refresh(&mut self) -> &ViewState {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.view.apply(&event),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Status receiver lagged; resyncing view");
                    let session = self.controller.session();
                    self.view.lifecycle = session.lifecycle_state;
                    self.view.transport = session.active_transport;
                    self.view.connected = session.lifecycle_state == LifecycleState::Active;
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        &self.view
    }

    #[must_use]
    pub const fn view(&self) -> &ViewState {
        &self.view
    }

    #[must_use]
    pub const fn controller(&self) -> &SessionController<A, F> {
        &self.controller
    }

    /// Tear the view down, always releasing the session.
    pub async fn unmount(mut self) {
        self.controller.stop().await;
        self.refresh();
        tracing::debug!("Terminal host unmounted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_tracks_lifecycle_and_errors() {
        let mut view = ViewState::default();
        assert_eq!(view.label(), "disconnected");

        view.apply(&StatusEvent::Lifecycle(LifecycleState::Opening));
        assert_eq!(view.label(), "connecting");

        view.apply(&StatusEvent::Lifecycle(LifecycleState::Active));
        view.apply(&StatusEvent::Transport(ActiveTransport::Realtime));
        assert!(view.connected);
        assert_eq!(view.label(), "connected");

        view.apply(&StatusEvent::Transport(ActiveTransport::Fallback));
        view.apply(&StatusEvent::SendFailed("broken pipe".into()));
        assert_eq!(view.label(), "connected (fallback)");
        assert_eq!(view.last_error.as_deref(), Some("broken pipe"));

        view.apply(&StatusEvent::Lifecycle(LifecycleState::Closed));
        assert!(!view.connected);

        view.apply(&StatusEvent::Lifecycle(LifecycleState::Opening));
        assert_eq!(view.last_error, None);
    }
}
