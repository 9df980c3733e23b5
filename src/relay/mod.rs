pub mod continuation;
pub mod switchable;

pub use continuation::{ChatOutcome, ChatSession, Orchestrator};
pub use switchable::{OutputStream, SwitchableStream};
