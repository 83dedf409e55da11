//! Chat controller.
//!
//! [`ChatController`] is the caller-facing surface of the SDK. It owns the
//! conversation store and at most one [`StreamSession`], and it is the only
//! place a reply is committed.
//!
//! A reply is committed exactly once, and only when the relay ends it with
//! `[DONE]` before the session's token fires. Cancelled and failed exchanges
//! leave the store untouched; a failed prompt is remembered for
//! [`ChatController::retry`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::client::Client;
use crate::coalescer::{DEFAULT_TICK, RenderCoalescer, RenderState};
use crate::error::{Error, Result};
use crate::session::StreamSession;
use crate::store::{Conversation, ConversationStore, StorageError};
use crate::stream::StreamOutcome;
use crate::transcript::{self, TranscriptEntry};
use crate::types::{ChatRequest, Message};

/// How a send ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The reply was committed.
    Completed(Message),
    /// The session was stopped; nothing was committed.
    Cancelled,
}

/// Drives chat exchanges against a relay.
///
/// Methods take `&self`; share the controller behind an `Arc` to call
/// [`stop`](Self::stop) while a [`send`](Self::send) is in progress.
#[derive(Debug)]
pub struct ChatController {
    client: Client,
    store: Mutex<ConversationStore>,
    active: Mutex<Option<Arc<StreamSession>>>,
    last_failed: Mutex<Option<String>>,
    render_tx: watch::Sender<RenderState>,
    render_tick: Duration,
}

impl ChatController {
    pub fn new(client: Client, store: ConversationStore) -> Self {
        let (render_tx, _) = watch::channel(None);
        Self {
            client,
            store: Mutex::new(store),
            active: Mutex::new(None),
            last_failed: Mutex::new(None),
            render_tx,
            render_tick: DEFAULT_TICK,
        }
    }

    /// Override the render cadence (one display refresh by default).
    #[must_use]
    pub fn with_render_tick(mut self, tick: Duration) -> Self {
        self.render_tick = tick;
        self
    }

    /// Observe the in-flight render: `Some(markup)` while streaming.
    pub fn subscribe_render(&self) -> watch::Receiver<RenderState> {
        self.render_tx.subscribe()
    }

    pub fn is_streaming(&self) -> bool {
        lock(&self.active).is_some()
    }

    /// Send a prompt in the open conversation, creating one if needed.
    ///
    /// # Errors
    ///
    /// [`Error::EmptyPrompt`] and [`Error::SessionActive`] are raised before
    /// any request. Relay and stream failures are returned as-is after the
    /// prompt has been recorded for [`retry`](Self::retry).
    pub async fn send(&self, prompt: &str) -> Result<SendOutcome> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(Error::EmptyPrompt);
        }

        let (session, history) = {
            let mut active = lock(&self.active);
            if active.is_some() {
                return Err(Error::SessionActive);
            }
            let mut store = lock(&self.store);
            let conversation_id = match store.current_id() {
                Some(id) => id.to_string(),
                None => store.create(),
            };
            let history = store.history(&conversation_id);
            let coalescer = RenderCoalescer::new(self.render_tx.clone(), self.render_tick);
            let session = Arc::new(StreamSession::new(conversation_id, prompt, coalescer));
            *active = Some(Arc::clone(&session));
            (session, history)
        };
        let _active = ActiveGuard {
            slot: &self.active,
            id: session.id(),
        };

        let request = ChatRequest {
            prompt: prompt.to_string(),
            conversation_id: session.conversation_id().to_string(),
            messages: history,
        };
        let result = self
            .client
            .chat()
            .stream(&request, session.token(), |delta, full| {
                session.on_chunk(delta, full);
            })
            .await;

        self.settle(&session, result)
    }

    /// Resend the last prompt that failed.
    pub async fn retry(&self) -> Result<SendOutcome> {
        let prompt = lock(&self.last_failed).clone().ok_or(Error::NothingToRetry)?;
        self.send(&prompt).await
    }

    /// Stop the active session. Returns `false` if nothing was streaming.
    pub fn stop(&self) -> bool {
        let active = lock(&self.active);
        let Some(session) = active.as_ref() else {
            return false;
        };
        session.cancel();
        self.render_tx.send_replace(None);
        info!(
            name: "chat.stream.stopped",
            session_id = %session.id(),
            "Generation stopped"
        );
        true
    }

    /// Prompt recorded by the last failed send.
    pub fn last_failed_prompt(&self) -> Option<String> {
        lock(&self.last_failed).clone()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Conversations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn new_conversation(&self) -> String {
        lock(&self.store).create()
    }

    pub fn switch_conversation(&self, id: &str) -> bool {
        lock(&self.store).switch(id)
    }

    pub fn delete_conversation(&self, id: &str) -> bool {
        lock(&self.store).delete(id)
    }

    /// Remove every conversation. Returns how many were removed.
    pub fn clear_conversations(&self) -> usize {
        lock(&self.store).clear()
    }

    pub fn current_conversation_id(&self) -> Option<String> {
        lock(&self.store).current_id().map(ToString::to_string)
    }

    /// Conversations, newest first.
    pub fn conversations(&self) -> Vec<Conversation> {
        lock(&self.store).list().into_iter().cloned().collect()
    }

    pub fn export(&self) -> std::result::Result<String, StorageError> {
        lock(&self.store).export()
    }

    pub fn import(&self, json: &str) -> Result<usize> {
        Ok(lock(&self.store).import(json)?)
    }

    pub fn prune(&self, keep: usize) -> usize {
        lock(&self.store).prune(keep)
    }

    /// The open conversation, with the streaming exchange last if any.
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        let in_flight = lock(&self.active)
            .as_ref()
            .filter(|s| !s.is_cancelled())
            .map(|s| {
                (
                    s.conversation_id().to_string(),
                    s.prompt().to_string(),
                    s.partial(),
                )
            });

        let store = lock(&self.store);
        let Some(current) = store.current() else {
            return Vec::new();
        };
        let in_flight = in_flight
            .filter(|(id, _, _)| *id == current.id)
            .map(|(_, prompt, partial)| (prompt, partial));
        transcript::build(&current.messages, in_flight)
    }

    fn settle(&self, session: &StreamSession, result: Result<StreamOutcome>) -> Result<SendOutcome> {
        match result {
            Ok(StreamOutcome::Completed(full)) if !session.is_cancelled() => {
                session.coalescer().finish(&full);
                let assistant = Message::assistant(full);
                let committed = lock(&self.store).commit(
                    session.conversation_id(),
                    Message::user(session.prompt()),
                    assistant.clone(),
                );
                if !committed {
                    warn!(
                        conversation_id = %session.conversation_id(),
                        "Conversation deleted while streaming, reply dropped"
                    );
                }
                lock(&self.last_failed).take();
                self.render_tx.send_replace(None);
                info!(
                    name: "chat.stream.completed",
                    session_id = %session.id(),
                    chunks = session.chunk_count(),
                    chars = assistant.content.chars().count(),
                    elapsed_ms = (chrono::Utc::now() - session.started_at()).num_milliseconds(),
                    "Reply completed"
                );
                Ok(SendOutcome::Completed(assistant))
            }
            Ok(_) => {
                session.cancel();
                info!(
                    name: "chat.stream.cancelled",
                    session_id = %session.id(),
                    discarded_chars = session.partial().chars().count(),
                    "Request cancelled, partial reply discarded"
                );
                Ok(SendOutcome::Cancelled)
            }
            Err(e) => {
                session.cancel();
                *lock(&self.last_failed) = Some(session.prompt().to_string());
                warn!(
                    name: "chat.stream.failed",
                    session_id = %session.id(),
                    error = %e,
                    retryable = e.is_retryable(),
                    "Send failed"
                );
                Err(e)
            }
        }
    }
}

/// Clears the active slot however `send` exits, including when its future
/// is dropped. A dropped `send` cancels its session, which also stops any
/// scheduled render.
struct ActiveGuard<'a> {
    slot: &'a Mutex<Option<Arc<StreamSession>>>,
    id: Uuid,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let mut slot = lock(self.slot);
        if slot.as_ref().is_some_and(|s| s.id() == self.id) {
            if let Some(session) = slot.take() {
                session.cancel();
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
