//! Render coalescing.
//!
//! Deltas can arrive much faster than a view can usefully repaint. The
//! coalescer keeps one pending slot and at most one scheduled render: every
//! push overwrites the slot, and only a push that finds nothing scheduled
//! schedules a render for the next tick. The render publishes whatever the
//! slot holds at that moment, so intermediate values may be skipped but the
//! latest one never is.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::Duration;

use regex_lite::Regex;
use tokio::sync::watch;

/// One display refresh at 60 Hz.
pub const DEFAULT_TICK: Duration = Duration::from_millis(16);

static BOLD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*(.*?)\*\*").expect("bold pattern is valid"));

/// Lightweight markdown pass: `**bold**` and line breaks.
///
/// ```rust
/// use chat_relay_sdk::coalescer::format_markdown;
///
/// assert_eq!(format_markdown("**Hi**\nthere"), "<b>Hi</b><br>there");
/// ```
#[must_use]
pub fn format_markdown(text: &str) -> String {
    BOLD.replace_all(text, "<b>$1</b>").replace('\n', "<br>")
}

/// Observable render state: `Some(markup)` while a reply is in flight.
pub type RenderState = Option<String>;

/// Throttles in-flight renders to one per tick.
#[derive(Debug, Clone)]
pub struct RenderCoalescer {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    pending: Mutex<Option<String>>,
    scheduled: AtomicBool,
    closed: AtomicBool,
    renders: AtomicUsize,
    tick: Duration,
    tx: watch::Sender<RenderState>,
}

impl RenderCoalescer {
    /// Create a coalescer publishing into `tx`.
    pub fn new(tx: watch::Sender<RenderState>, tick: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(None),
                scheduled: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                renders: AtomicUsize::new(0),
                tick,
                tx,
            }),
        }
    }

    /// Record the latest full accumulation, scheduling a render if none is.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn push(&self, full: &str) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        *self.inner.lock_pending() = Some(full.to_owned());

        if !self.inner.scheduled.swap(true, Ordering::AcqRel) {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                tokio::time::sleep(inner.tick).await;
                inner.render_pending();
            });
        }
    }

    /// Publish the final value immediately and stop accepting pushes.
    ///
    /// Returns the rendered markup.
    pub fn finish(&self, full: &str) -> String {
        let markup = format_markdown(full);
        let mut pending = self.inner.lock_pending();
        self.inner.closed.store(true, Ordering::Release);
        pending.take();
        self.inner.publish(Some(markup.clone()));
        markup
    }

    /// Drop any pending render and clear the in-flight state.
    ///
    /// Nothing is published after this returns.
    pub fn cancel(&self) {
        let mut pending = self.inner.lock_pending();
        self.inner.closed.store(true, Ordering::Release);
        pending.take();
        self.inner.tx.send_replace(None);
    }

    /// Whether a render is currently scheduled.
    pub fn is_scheduled(&self) -> bool {
        self.inner.scheduled.load(Ordering::Acquire)
    }

    /// Number of renders published so far.
    pub fn render_count(&self) -> usize {
        self.inner.renders.load(Ordering::Acquire)
    }
}

impl Inner {
    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn render_pending(&self) {
        // Cleared before taking the slot so a concurrent push reschedules.
        self.scheduled.store(false, Ordering::Release);
        // Held through publish so a concurrent close cannot be overwritten.
        let mut pending = self.lock_pending();
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Some(text) = pending.take() {
            self.publish(Some(format_markdown(&text)));
        }
    }

    fn publish(&self, state: RenderState) {
        self.renders.fetch_add(1, Ordering::AcqRel);
        self.tx.send_replace(state);
    }
}
