//! Caller-facing chat API.
//!
//! [`ChatAgent`] ties the pieces together: conversations keep their history
//! here, every submission borrows the slot's model through the
//! [`ModelLifecycleManager`] for exactly one [`GenerationSession::run`], and
//! the history is reconciled once that run ends:
//!
//! - a completed (or cancelled) run fills in the trailing turn;
//! - a hard stop removes the trailing turn;
//! - a failure leaves the trailing turn pending so it can be retried.
//!
//! A turn superseded by a later submission, undo or retry is never written
//! back.

use crate::config::{ConfigError, EngineConfig};
use crate::conversation::{ConversationContextManager, ConversationError};
use crate::generation::{
    terminal_event, GenerationError, GenerationOutcome, GenerationRequest, GenerationSession,
};
use crate::lifecycle::{
    DegradedState, ModelLifecycleManager, ModelLoader, ModelRequest, ModelSummary, SlotId,
    SlotStatus,
};
use crate::prompt::{ConventionPromptBuilder, PromptBuilder};
use crate::storage::FileOutputStore;
use crate::types::{
    ChatTurn, ConversationHistory, ConversationId, FinishReason, GenerationParameters,
    ParameterError, StreamEvent,
};
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use textgen_common::config::ValidatedConfig;
use textgen_common::error::{ErrorCategory, TextgenError};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Events of one submitted turn, ending with a single `Done` or `Failed`.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Errors returned by [`ChatAgent`].
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Conversation(#[from] ConversationError),

    #[error(transparent)]
    Parameters(#[from] ParameterError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl TextgenError for AgentError {
    fn category(&self) -> ErrorCategory {
        match self {
            AgentError::ConversationNotFound(_) => ErrorCategory::User,
            AgentError::Generation(e) => e.category(),
            AgentError::Conversation(e) => e.category(),
            AgentError::Parameters(e) => e.category(),
            AgentError::Config(e) => e.category(),
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            AgentError::ConversationNotFound(_) => "CONVERSATION_NOT_FOUND",
            AgentError::Generation(e) => e.error_code(),
            AgentError::Conversation(e) => e.error_code(),
            AgentError::Parameters(e) => e.error_code(),
            AgentError::Config(e) => e.error_code(),
        }
    }
}

#[derive(Debug)]
struct ConversationState {
    slot: SlotId,
    history: ConversationHistory,
    /// Incremented on every change that supersedes a running turn.
    generation: u64,
    active: Option<CancellationToken>,
}

impl ConversationState {
    fn supersede(&mut self) -> u64 {
        if let Some(token) = self.active.take() {
            token.cancel();
        }
        self.generation += 1;
        self.generation
    }
}

/// A turn registered with its conversation and ready to run.
struct Turn {
    id: ConversationId,
    slot: SlotId,
    generation: u64,
    history: ConversationHistory,
    user_text: String,
    params: GenerationParameters,
    cancel: CancellationToken,
}

struct AgentInner {
    manager: Arc<ModelLifecycleManager>,
    session: GenerationSession,
    contexts: ConversationContextManager,
    conversations: RwLock<HashMap<ConversationId, ConversationState>>,
    config: EngineConfig,
}

/// Multi-conversation chat front end over a [`ModelLifecycleManager`].
///
/// Cloning is cheap; clones share conversations and models.
#[derive(Clone)]
pub struct ChatAgent {
    inner: Arc<AgentInner>,
}

impl std::fmt::Debug for ChatAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatAgent")
            .field("config", &self.inner.config)
            .field("manager", &self.inner.manager)
            .finish_non_exhaustive()
    }
}

impl ChatAgent {
    pub fn new(
        manager: Arc<ModelLifecycleManager>,
        session: GenerationSession,
        prompts: Arc<dyn PromptBuilder>,
        config: EngineConfig,
    ) -> Self {
        let contexts = ConversationContextManager::new(prompts, config.context_budget_chars);
        Self {
            inner: Arc::new(AgentInner {
                manager,
                session,
                contexts,
                conversations: RwLock::new(HashMap::new()),
                config,
            }),
        }
    }

    /// Wire an agent from configuration with the default prompt builder.
    ///
    /// Generation output is appended under `save_dir` when it is set.
    pub fn from_config(
        config: EngineConfig,
        loader: Arc<dyn ModelLoader>,
    ) -> Result<Self, AgentError> {
        config.validate()?;

        let prompts: Arc<dyn PromptBuilder> = Arc::new(ConventionPromptBuilder);
        let manager = ModelLifecycleManager::new(loader)
            .with_conventions(config.prompt_conventions.clone())
            .with_debug(config.debug);

        let mut session = GenerationSession::new(config.session_config(), Arc::clone(&prompts));
        if let Some(dir) = &config.save_dir {
            info!(dir = %dir.display(), "Saving generation output");
            session = session.with_persistence(Arc::new(FileOutputStore::new(dir)));
        }

        Ok(Self::new(Arc::new(manager), session, prompts, config))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn manager(&self) -> &Arc<ModelLifecycleManager> {
        &self.inner.manager
    }

    pub fn session(&self) -> &GenerationSession {
        &self.inner.session
    }

    /// Start an empty conversation answered by the model in `slot`.
    pub async fn open_conversation(&self, slot: SlotId) -> ConversationId {
        let id = ConversationId::new();
        self.inner.conversations.write().await.insert(
            id,
            ConversationState {
                slot,
                history: ConversationHistory::new(),
                generation: 0,
                active: None,
            },
        );
        debug!(conversation = %id, %slot, "Opened conversation");
        id
    }

    pub async fn history(&self, id: ConversationId) -> Result<ConversationHistory, AgentError> {
        self.inner
            .conversations
            .read()
            .await
            .get(&id)
            .map(|state| state.history.clone())
            .ok_or(AgentError::ConversationNotFound(id))
    }

    /// Append a turn and stream its generation.
    ///
    /// With `stream_output` the stream carries the response so far as
    /// `PartialText` snapshots; otherwise it yields only the terminal event.
    /// The turn is recorded in the history before that event is delivered.
    /// Dropping the stream cancels the turn. Without `params` the configured
    /// defaults apply.
    pub async fn submit(
        &self,
        id: ConversationId,
        user_text: impl Into<String>,
        params: Option<GenerationParameters>,
    ) -> Result<EventStream, AgentError> {
        let params = self.parameters(params)?;
        let user_text = user_text.into();
        let contexts = &self.inner.contexts;
        let turn = self
            .begin_turn(id, params, |history| {
                Ok((contexts.append(history, user_text.clone()), user_text))
            })
            .await?;
        Ok(self.spawn_turn(turn))
    }

    /// Append a turn and wait for its final text.
    ///
    /// Recoverable failures return their diagnostic in place of the response.
    pub async fn generate(
        &self,
        id: ConversationId,
        user_text: impl Into<String>,
        params: Option<GenerationParameters>,
    ) -> Result<String, AgentError> {
        let params = self.parameters(params)?;
        let user_text = user_text.into();
        let contexts = &self.inner.contexts;
        let turn = self
            .begin_turn(id, params, |history| {
                Ok((contexts.append(history, user_text.clone()), user_text))
            })
            .await?;
        let outcome = Self::run_turn(Arc::clone(&self.inner), turn, None).await?;
        Ok(outcome.display_text().to_string())
    }

    /// Single instruction without history. Every returned sequence is kept.
    ///
    /// An `input` is joined to the instruction with a `:` separator.
    pub async fn complete(
        &self,
        slot: SlotId,
        instruction: &str,
        input: Option<&str>,
        params: Option<GenerationParameters>,
    ) -> Result<GenerationOutcome, AgentError> {
        let params = self.parameters(params)?;
        let user_text = ChatTurn::compose_user_text(instruction, input.unwrap_or_default());
        let lease = self.inner.manager.lease(slot).await;
        let request = GenerationRequest::new(user_text, params)
            .streaming(false)
            .chat(false);
        let outcome = self
            .inner
            .session
            .run(lease.as_deref(), &request, None, &CancellationToken::new())
            .await?;
        Ok(outcome)
    }

    /// Remove the last turn, cancelling its generation if still running.
    pub async fn undo(&self, id: ConversationId) -> Result<ConversationHistory, AgentError> {
        let mut conversations = self.inner.conversations.write().await;
        let state = conversations
            .get_mut(&id)
            .ok_or(AgentError::ConversationNotFound(id))?;
        state.supersede();
        state.history = self.inner.contexts.undo(&state.history);
        debug!(conversation = %id, turns = state.history.len(), "Undid last turn");
        Ok(state.history.clone())
    }

    /// Drop the last turn and submit its user text again.
    pub async fn retry(
        &self,
        id: ConversationId,
        params: Option<GenerationParameters>,
    ) -> Result<EventStream, AgentError> {
        let params = self.parameters(params)?;
        let contexts = &self.inner.contexts;
        let turn = self
            .begin_turn(id, params, |history| Ok(contexts.retry(history)?))
            .await?;
        info!(conversation = %id, "Retrying last turn");
        Ok(self.spawn_turn(turn))
    }

    /// Cancel the running turn. Returns whether one was running.
    pub async fn cancel(&self, id: ConversationId) -> Result<bool, AgentError> {
        let mut conversations = self.inner.conversations.write().await;
        let state = conversations
            .get_mut(&id)
            .ok_or(AgentError::ConversationNotFound(id))?;
        match state.active.take() {
            Some(token) => {
                token.cancel();
                info!(conversation = %id, "Cancelled generation");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replace the model in `slot`. Waits for generations using the current
    /// model to finish.
    pub async fn switch_model(
        &self,
        slot: SlotId,
        request: ModelRequest,
    ) -> Result<ModelSummary, DegradedState> {
        self.inner.manager.load(slot, request).await
    }

    pub async fn status(&self, slot: SlotId) -> SlotStatus {
        self.inner.manager.status(slot).await
    }

    pub async fn close_conversation(&self, id: ConversationId) -> Result<(), AgentError> {
        let mut state = self
            .inner
            .conversations
            .write()
            .await
            .remove(&id)
            .ok_or(AgentError::ConversationNotFound(id))?;
        state.supersede();
        debug!(conversation = %id, "Closed conversation");
        Ok(())
    }

    /// Cancel every running turn and release all models.
    pub async fn shutdown(&self) {
        for state in self.inner.conversations.write().await.values_mut() {
            state.supersede();
        }
        self.inner.manager.shutdown().await;
        info!("Chat agent shut down");
    }

    /// The caller's parameters or the configured defaults, validated.
    fn parameters(
        &self,
        params: Option<GenerationParameters>,
    ) -> Result<GenerationParameters, AgentError> {
        let params = params.unwrap_or_else(|| self.inner.config.default_parameters.clone());
        params.validate()?;
        Ok(params)
    }

    async fn begin_turn<F>(
        &self,
        id: ConversationId,
        params: GenerationParameters,
        update: F,
    ) -> Result<Turn, AgentError>
    where
        F: FnOnce(&ConversationHistory) -> Result<(ConversationHistory, String), AgentError>,
    {
        let mut conversations = self.inner.conversations.write().await;
        let state = conversations
            .get_mut(&id)
            .ok_or(AgentError::ConversationNotFound(id))?;

        let (history, user_text) = update(&state.history)?;
        let generation = state.supersede();
        let cancel = CancellationToken::new();
        state.history = history.clone();
        state.active = Some(cancel.clone());

        Ok(Turn {
            id,
            slot: state.slot,
            generation,
            history,
            user_text,
            params,
            cancel,
        })
    }

    fn spawn_turn(&self, turn: Turn) -> EventStream {
        let (sender, receiver) = mpsc::channel(self.inner.config.channel_capacity);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let id = turn.id;
            if let Err(e) = Self::run_turn(inner, turn, Some(sender)).await {
                error!(conversation = %id, error = %e, "Generation failed");
            }
        });
        Box::pin(ReceiverStream::new(receiver))
    }

    async fn run_turn(
        inner: Arc<AgentInner>,
        turn: Turn,
        events: Option<mpsc::Sender<StreamEvent>>,
    ) -> Result<GenerationOutcome, AgentError> {
        let lease = inner.manager.lease(turn.slot).await;
        let convention = lease
            .as_ref()
            .map(|handle| handle.convention())
            .unwrap_or_default();
        let context = inner.contexts.render_context(&turn.history, convention);

        let request = GenerationRequest::new(turn.user_text.clone(), turn.params.clone())
            .with_context(context)
            .streaming(inner.config.stream_output && events.is_some());

        let result = inner
            .session
            .run_partial(lease.as_deref(), &request, events.as_ref(), &turn.cancel)
            .await;
        drop(lease);

        // History is settled before the caller can see the turn end.
        inner.finish_turn(&turn, result.as_ref().ok()).await;
        if let (Some(events), Some(event)) = (&events, terminal_event(&result)) {
            if events.send(event).await.is_err() {
                debug!(conversation = %turn.id, "Event receiver dropped before terminal event");
            }
        }
        Ok(result?)
    }
}

impl AgentInner {
    /// Reconcile the history with the outcome of `turn` unless it has been
    /// superseded.
    async fn finish_turn(&self, turn: &Turn, outcome: Option<&GenerationOutcome>) {
        let mut conversations = self.conversations.write().await;
        let Some(state) = conversations.get_mut(&turn.id) else {
            return;
        };
        if state.generation != turn.generation {
            debug!(conversation = %turn.id, "Turn superseded, history left as is");
            return;
        }
        state.active = None;

        match outcome {
            Some(GenerationOutcome::Completed {
                text,
                finish_reason,
                ..
            }) => {
                if *finish_reason == FinishReason::Cancelled && text.is_empty() {
                    return;
                }
                match self.contexts.commit(&state.history, text.clone()) {
                    Ok(history) => state.history = history,
                    Err(e) => warn!(conversation = %turn.id, error = %e, "Could not record response"),
                }
            }
            Some(GenerationOutcome::HardStopped { .. }) => {
                warn!(conversation = %turn.id, "Hard stop triggered, dropping turn");
                state.history = self.contexts.undo(&state.history);
            }
            Some(GenerationOutcome::Failed { kind, .. }) => {
                debug!(conversation = %turn.id, %kind, "Turn left pending for retry");
            }
            None => {}
        }
    }
}
