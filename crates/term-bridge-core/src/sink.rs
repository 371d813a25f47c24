//! Output sink abstraction and line normalization.

use std::{
    borrow::Cow,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use tokio::sync::watch;

/// Terminal rendering surface that consumes session output.
pub trait OutputSink: Send + Sync {
    /// Write text, including any embedded control sequences.
    fn write(&self, text: &str);

    /// Clear the surface.
    fn clear(&self);
}

/// Ensure a chunk ends with a line terminator.
///
/// Consecutive unrelated chunks never merge onto one line.
#[must_use]
pub fn normalize_chunk(chunk: &str) -> Cow<'_, str> {
    if chunk.ends_with('\n') {
        Cow::Borrowed(chunk)
    } else {
        Cow::Owned(format!("{chunk}\n"))
    }
}

/// In-memory sink that records every write.
///
/// Useful for headless hosts and tests.
pub struct BufferSink {
    writes: Mutex<Vec<String>>,
    count: watch::Sender<usize>,
}

impl BufferSink {
    /// Create an empty buffer sink.
    #[must_use]
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            writes: Mutex::new(Vec::new()),
            count,
        }
    }

    /// Snapshot of the writes since the last clear.
    #[must_use]
    pub fn writes(&self) -> Vec<String> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// All writes concatenated.
    #[must_use]
    pub fn contents(&self) -> String {
        self.writes().concat()
    }

    /// Wait until at least `n` writes were recorded.
    ///
    /// Returns `false` if the timeout elapsed first.
    pub async fn wait_for_writes(&self, n: usize, timeout: Duration) -> bool {
        let mut rx = self.count.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|count| *count >= n))
            .await
            .is_ok_and(|res| res.is_ok())
    }
}

impl Default for BufferSink {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputSink for BufferSink {
    fn write(&self, text: &str) {
        let len = {
            let mut writes = self.writes.lock().unwrap_or_else(PoisonError::into_inner);
            writes.push(text.to_string());
            writes.len()
        };
        self.count.send_replace(len);
    }

    fn clear(&self) {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.count.send_replace(0);
    }
}
