//! # Session Module
//!
//! Everything that turns a participant's audio into a conversation.
//!
//! ## Components:
//! - **machine**: the session state machine and its transition table
//! - **conversation**: completed turns and the context handed to the dialogue engine
//! - **worker**: spawned stage workers (transcription, dialogue, synthesis) and cancellation
//! - **runtime**: the per-session task that ties frames, workers and state together
//! - **supervisor**: the table of sessions and the operations the outside world calls

pub mod conversation;
pub mod machine;
pub mod runtime;
pub mod supervisor;
pub mod worker;

pub use machine::SessionState;
pub use runtime::{AudioSink, CloseReason, SessionEvent, SessionId, SessionStatus};
pub use supervisor::SessionSupervisor;
