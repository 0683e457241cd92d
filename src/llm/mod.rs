//! Chat-completions client used by the LLM-backed generator.
//!
//! ```ignore
//! use taskrelay::llm::{ChatRequest, LlmProvider, Message, OpenAiCompatibleClient};
//!
//! let client = OpenAiCompatibleClient::from_env()?;
//! let request = ChatRequest::new("gpt-3.5-turbo", vec![Message::user("Hello")])
//!     .with_max_tokens(500);
//! let response = client.generate(request).await?;
//! ```

pub mod client;

pub use client::{
    ChatRequest, ChatResponse, Choice, LlmProvider, Message, OpenAiCompatibleClient, Usage,
    DEFAULT_MODEL,
};
