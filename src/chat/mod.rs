//! Chat module - transcript and streaming generation
//!
//! Module structure:
//! - types.rs: Message, Author
//! - transcript.rs: ConversationTranscript (observable)
//! - completion.rs: decode loop, stop-sequence stripping
//! - task_registry.rs: single cancellable decode task

pub mod types;
pub mod transcript;
pub mod completion;
pub mod task_registry;

pub use types::{Author, Message};
pub use transcript::ConversationTranscript;
pub use completion::{run_decode_loop, strip_stop_sequences, DecodeOutcome, StreamAccumulator};
pub use task_registry::{GenerationTask, TaskRegistry};
