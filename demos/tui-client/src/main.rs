//! Raw-mode terminal client for the bridge.
//!
//! Run with: cargo run -p tui-client -- <task-id> [context-file]
//!
//! Keystrokes go to the remote session through `TerminalHost`; output is
//! written straight to stdout. Ctrl+Q quits, F11 toggles the alternate
//! screen. Set `TERM_BRIDGE_BASE_URL` to point at a server.

mod input;

use std::{
    io::{self, Write},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use crossterm::{
    cursor::MoveTo,
    event::{self, DisableBracketedPaste, EnableBracketedPaste, Event},
    execute,
    terminal::{
        Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen, SetTitle, disable_raw_mode,
        enable_raw_mode,
    },
};
use term_bridge_core::{
    BridgeConfig, ChannelFactory, LaunchRequest, LifecycleState, OutputSink, SessionApi,
};
use term_bridge_session::{SessionController, TerminalHost};
use tokio::sync::mpsc;

use crate::input::Action;

/// Writes session output to the local terminal.
struct StdoutSink;

impl OutputSink for StdoutSink {
    fn write(&self, chunk: &str) {
        // Raw mode disables output post-processing.
        let text = chunk.replace('\n', "\r\n");
        let mut stdout = io::stdout().lock();
        if let Err(e) = stdout
            .write_all(text.as_bytes())
            .and_then(|()| stdout.flush())
        {
            tracing::debug!("stdout write failed: {e}");
        }
    }

    fn clear(&self) {
        if let Err(e) = execute!(io::stdout(), Clear(ClearType::All), MoveTo(0, 0)) {
            tracing::debug!("clear failed: {e}");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let task_id = args
        .next()
        .context("usage: tui-client <task-id> [context-file]")?;
    let context_file = args.next().unwrap_or_else(|| "CONTEXT.md".to_string());

    let config = BridgeConfig::from_env();
    let controller = SessionController::from_config(
        &config,
        Arc::new(StdoutSink),
        LaunchRequest::new(task_id, context_file),
    )?;
    let mut host = TerminalHost::new(controller);

    enable_raw_mode()?;
    execute!(io::stdout(), EnableBracketedPaste)?;
    let result = run(&mut host).await;

    if host.view().fullscreen {
        execute!(io::stdout(), LeaveAlternateScreen)?;
    }
    execute!(io::stdout(), DisableBracketedPaste)?;
    disable_raw_mode()?;
    let last_error = host.view().last_error.clone();
    host.unmount().await;

    if let Some(error) = last_error {
        eprintln!("last error: {error}");
    }
    result
}

async fn run<A, F>(host: &mut TerminalHost<A, F>) -> anyhow::Result<()>
where
    A: SessionApi + 'static,
    F: ChannelFactory + 'static,
{
    set_title("connecting")?;
    host.mount().await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    std::thread::spawn(move || read_events(&tx));

    let mut tick = tokio::time::interval(Duration::from_millis(250));
    let mut shown = "";
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                match input::translate(&event) {
                    Action::Quit => break,
                    Action::ToggleFullscreen => {
                        if host.toggle_fullscreen() {
                            execute!(io::stdout(), EnterAlternateScreen)?;
                        } else {
                            execute!(io::stdout(), LeaveAlternateScreen)?;
                        }
                    }
                    Action::Send(raw) => {
                        if let Err(e) = host.handle_input(&raw).await {
                            tracing::warn!("Input not delivered: {e}");
                        }
                    }
                    Action::Ignore => {}
                }
            }
            _ = tick.tick() => {}
        }

        let view = host.refresh();
        let label = view.label();
        let finished = matches!(
            view.lifecycle,
            LifecycleState::Closed | LifecycleState::Failed
        );
        if label != shown {
            shown = label;
            set_title(label)?;
        }
        if finished {
            break;
        }
    }
    Ok(())
}

/// Blocking crossterm reader; exits once the receiver is gone.
fn read_events(tx: &mpsc::UnboundedSender<Event>) {
    loop {
        match event::poll(Duration::from_millis(100)) {
            Ok(true) => match event::read() {
                Ok(event) => {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::error!("Terminal read failed: {e}");
                    return;
                }
            },
            Ok(false) if tx.is_closed() => return,
            Ok(false) => {}
            Err(e) => {
                tracing::error!("Terminal poll failed: {e}");
                return;
            }
        }
    }
}

fn set_title(label: &str) -> io::Result<()> {
    execute!(io::stdout(), SetTitle(format!("term-bridge: {label}")))
}
