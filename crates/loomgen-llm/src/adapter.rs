use async_trait::async_trait;

use loomgen_types::{LoomError, Result};

use crate::{Conversation, GenerationParams};

// ---------------------------------------------------------------------------
// Request validation
// ---------------------------------------------------------------------------

/// Check the adapter-contract preconditions before any network call:
/// the conversation must contain at least one turn and the params must be
/// in range.
pub fn validate_request(conversation: &Conversation, params: &GenerationParams) -> Result<()> {
    if conversation.is_empty() {
        return Err(LoomError::Other(
            "conversation must contain at least one message".into(),
        ));
    }
    params.validate()
}

// ---------------------------------------------------------------------------
// GenerationAdapter
// ---------------------------------------------------------------------------

/// Uniform capability over any text-generation backend.
///
/// Implementations encapsulate their own retry and timeout policy; a
/// surfaced error means the local budget is already spent.
#[async_trait]
pub trait GenerationAdapter: Send + Sync {
    /// Generate a completion for one conversation.
    async fn generate(
        &self,
        conversation: &Conversation,
        params: &GenerationParams,
    ) -> Result<String>;

    /// Generate completions for several conversations. The output has the
    /// same length and order as the input, with per-item failures.
    async fn generate_many(
        &self,
        conversations: &[Conversation],
        params: &GenerationParams,
    ) -> Vec<Result<String>> {
        let mut outputs = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            outputs.push(self.generate(conversation, params).await);
        }
        outputs
    }

    /// Backend model identity, attached to emitted records for provenance.
    fn model_name(&self) -> &str;

    /// Serialize this adapter's constructor state plus its `type_info` tag.
    fn dump(&self) -> serde_json::Value;
}

// ---------------------------------------------------------------------------
// DynAdapter
// ---------------------------------------------------------------------------

pub struct DynAdapter(Box<dyn GenerationAdapter>);

impl DynAdapter {
    pub fn new(adapter: impl GenerationAdapter + 'static) -> Self {
        Self(Box::new(adapter))
    }

    pub async fn generate(
        &self,
        conversation: &Conversation,
        params: &GenerationParams,
    ) -> Result<String> {
        self.0.generate(conversation, params).await
    }

    pub async fn generate_many(
        &self,
        conversations: &[Conversation],
        params: &GenerationParams,
    ) -> Vec<Result<String>> {
        self.0.generate_many(conversations, params).await
    }

    pub fn model_name(&self) -> &str {
        self.0.model_name()
    }

    pub fn dump(&self) -> serde_json::Value {
        self.0.dump()
    }
}

// ---------------------------------------------------------------------------
// Bounded concurrent generation
// ---------------------------------------------------------------------------

use std::sync::Arc;

use tokio::sync::Semaphore;

/// Issue one generation call per conversation through a shared adapter, with
/// at most `concurrency` calls in flight. Results come back in input order
/// regardless of completion order, with per-item failures.
pub async fn generate_bounded(
    llm: &Arc<DynAdapter>,
    params: &GenerationParams,
    concurrency: usize,
    conversations: Vec<Conversation>,
) -> Vec<Result<String>> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut handles = Vec::with_capacity(conversations.len());
    for conversation in conversations {
        let llm = Arc::clone(llm);
        let params = params.clone();
        let semaphore = Arc::clone(&semaphore);
        handles.push(tokio::spawn(async move {
            match semaphore.acquire_owned().await {
                Ok(_permit) => llm.generate(&conversation, &params).await,
                Err(_) => Err(LoomError::Other("concurrency limiter closed".into())),
            }
        }));
    }

    let mut outputs = Vec::with_capacity(handles.len());
    for handle in handles {
        outputs.push(match handle.await {
            Ok(result) => result,
            Err(e) => Err(LoomError::Other(format!("generation task failed: {e}"))),
        });
    }
    outputs
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
