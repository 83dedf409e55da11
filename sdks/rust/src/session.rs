//! Stream sessions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::coalescer::RenderCoalescer;

/// State of one outstanding request, from send until a terminal outcome.
///
/// The accumulator holds the reply received so far. It is never written to
/// a conversation; only a completed reply is committed.
#[derive(Debug)]
pub struct StreamSession {
    id: Uuid,
    conversation_id: String,
    prompt: String,
    token: CancellationToken,
    accumulated: Mutex<String>,
    chunks: AtomicUsize,
    coalescer: RenderCoalescer,
    started_at: DateTime<Utc>,
}

impl StreamSession {
    pub fn new(
        conversation_id: impl Into<String>,
        prompt: impl Into<String>,
        coalescer: RenderCoalescer,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.into(),
            prompt: prompt.into(),
            token: CancellationToken::new(),
            accumulated: Mutex::new(String::new()),
            chunks: AtomicUsize::new(0),
            coalescer,
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn coalescer(&self) -> &RenderCoalescer {
        &self.coalescer
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Text received so far.
    pub fn partial(&self) -> String {
        self.accumulated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of deltas received so far.
    pub fn chunk_count(&self) -> usize {
        self.chunks.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Record one delta and schedule a render of the accumulation.
    pub fn on_chunk(&self, delta: &str, full: &str) {
        if self.token.is_cancelled() {
            return;
        }
        let count = self.chunks.fetch_add(1, Ordering::AcqRel) + 1;
        if count <= 5 || count % 10 == 0 {
            debug!(
                session_id = %self.id,
                chunk = count,
                delta = %preview(delta, 30),
                "Stream chunk"
            );
        }

        full.clone_into(&mut self.accumulated.lock().unwrap_or_else(PoisonError::into_inner));
        self.coalescer.push(full);
    }

    /// Fire the token and clear the in-flight render.
    pub fn cancel(&self) {
        self.token.cancel();
        self.coalescer.cancel();
    }
}

fn preview(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
