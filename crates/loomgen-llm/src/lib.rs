//! Generation adapter layer: a uniform interface over text-generation backends.
//!
//! Provides the `GenerationAdapter` trait, the `DynAdapter` wrapper, the
//! conversation/parameter types shared by all backends, retry/backoff policy,
//! and the `OpenAiAdapter` HTTP client.

mod adapter;
mod openai;
mod retry;
mod types;

pub use adapter::*;
pub use openai::*;
pub use retry::*;
pub use types::*;
