//! Rust client for chat-relay
//!
//! Consumes the relay's event stream, accumulates it into a reply, throttles
//! in-flight renders, and commits completed replies to a conversation store.
//!
//! # Streaming a single reply
//!
//! ```rust,no_run
//! use chat_relay_sdk::{ChatRequest, Client, StreamOutcome};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new("http://localhost:3001")?;
//!     let request = ChatRequest {
//!         prompt: "Hello!".into(),
//!         conversation_id: "conv_1".into(),
//!         messages: vec![],
//!     };
//!
//!     let token = CancellationToken::new();
//!     if let StreamOutcome::Completed(reply) = client
//!         .chat()
//!         .stream(&request, &token, |delta, _full| print!("{delta}"))
//!         .await?
//!     {
//!         println!("\n{} chars", reply.len());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Conversations
//!
//! ```rust,no_run
//! use chat_relay_sdk::{ChatController, Client, ConversationStore, JsonFileStorage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = ConversationStore::open(JsonFileStorage::open("./chats")?);
//!     let controller = ChatController::new(Client::new("http://localhost:3001")?, store);
//!
//!     match controller.send("Hello!").await {
//!         Ok(outcome) => println!("{outcome:?}"),
//!         Err(e) if e.is_retryable() => println!("{} (retry available)", e.user_message()),
//!         Err(e) => println!("{}", e.user_message()),
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod coalescer;
pub mod controller;
pub mod error;
pub mod session;
pub mod store;
pub mod stream;
pub mod transcript;
pub mod types;

// Re-exports
pub use client::Client;
pub use coalescer::RenderCoalescer;
pub use controller::{ChatController, SendOutcome};
pub use error::Error;
pub use session::StreamSession;
pub use store::{
    Conversation, ConversationStorage, ConversationStore, JsonFileStorage, MemoryStorage,
    StorageError,
};
pub use stream::StreamOutcome;
pub use transcript::TranscriptEntry;
pub use types::*;
