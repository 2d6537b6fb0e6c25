pub mod anthropic;
pub mod canonical;
pub mod converter;
pub(crate) mod error_shapes;
pub mod framing;
pub mod gemini;
pub mod mapping;
pub mod ollama;
pub mod openai_chat;
pub mod openai_responses;

pub use converter::{IngressHints, ProtocolConverter, WireConverter};
