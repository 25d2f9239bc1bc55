//! One generation request, end to end.
//!
//! [`GenerationSession::run`] renders the prompt, truncates it to the model's
//! budget, compiles stop specs for the active prompt convention and then
//! either streams through the [`TokenStreamAdapter`] or makes one blocking
//! batch call. Accelerator out-of-memory and known transient device errors are
//! absorbed here: buffers are released, the failure is logged and reported as
//! a [`GenerationOutcome::Failed`]. Strict mode re-raises them after cleanup.
//! Everything else propagates.

pub mod config;
pub mod error;


pub use config::SessionConfig;
pub use error::GenerationError;

use crate::backend::{Codec, ModelKind, PipelineTask, SequenceModel, StepControl};
use crate::conversation::tail_chars;
use crate::lifecycle::{DegradedState, ModelHandle};
use crate::prompt::{PromptBuilder, PromptConvention, TurnData};
use crate::stopper::{
    DeadlineStopper, EosStopper, HardStopDetector, MaxTokensStopper, StopSequenceMatcher, StopSpec,
    Stopper, StopperChain,
};
use crate::storage::{OutputRecord, PersistenceHook};
use crate::stream::{StreamRequest, TokenStreamAdapter};
use crate::types::{BackendError, ErrorKind, FinishReason, GenerationParameters, StreamEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Characters kept per prompt token before tokenizing.
const CHARS_PER_TOKEN: usize = 4;
/// Extra characters kept on top of the per-token allowance.
const CHAR_SLACK: usize = 120;

/// Input of one generation run.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub user_text: String,
    /// Bounded rendering of earlier turns.
    pub context: String,
    pub params: GenerationParameters,
    pub stream: bool,
    /// Chat requests always return a single sequence.
    pub chat: bool,
}

impl GenerationRequest {
    pub fn new(user_text: impl Into<String>, params: GenerationParameters) -> Self {
        Self {
            user_text: user_text.into(),
            context: String::new(),
            params,
            stream: true,
            chat: true,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn chat(mut self, chat: bool) -> Self {
        self.chat = chat;
        self
    }
}

/// Result of a run that did not raise an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// Generation ended normally or was cancelled; `text` is the extracted
    /// response and `sequences` every returned sequence (first equals `text`).
    Completed {
        text: String,
        finish_reason: FinishReason,
        sequences: Vec<String>,
    },
    /// A hard-stop phrase appeared; `partial` is the response up to that point.
    HardStopped { partial: String },
    /// A recoverable failure, with the diagnostic shown in place of output.
    Failed { kind: ErrorKind, diagnostic: String },
}

impl GenerationOutcome {
    fn failed(kind: ErrorKind) -> Self {
        Self::Failed {
            kind,
            diagnostic: kind.diagnostic().to_string(),
        }
    }

    /// Text to show the user: the response, or the diagnostic on failure.
    pub fn display_text(&self) -> &str {
        match self {
            GenerationOutcome::Completed { text, .. } => text,
            GenerationOutcome::HardStopped { partial } => partial,
            GenerationOutcome::Failed { diagnostic, .. } => diagnostic,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            GenerationOutcome::Completed { .. } => None,
            GenerationOutcome::HardStopped { .. } => Some(ErrorKind::HardStopTriggered),
            GenerationOutcome::Failed { kind, .. } => Some(*kind),
        }
    }
}

/// Prompt ids fitted to the model, with the text the model will actually see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedPrompt {
    pub input_ids: Vec<u32>,
    /// Decoded `input_ids`, used as the prefix for response extraction.
    pub decoded: String,
}

/// Fit `prompt` into `budget_tokens`, dropping the oldest content first.
///
/// The text is first cut to its last `budget_tokens * 4 + 120` characters so
/// very long histories are not tokenized in full, then the token sequence is
/// cut from the front.
pub fn prepare_prompt(
    prompt: &str,
    codec: &dyn Codec,
    budget_tokens: usize,
) -> Result<PreparedPrompt, BackendError> {
    let precut = tail_chars(prompt, budget_tokens * CHARS_PER_TOKEN + CHAR_SLACK);
    let mut input_ids = codec.encode(precut)?;
    if input_ids.len() > budget_tokens {
        let excess = input_ids.len() - budget_tokens;
        debug!(excess, budget_tokens, "Truncating prompt from the front");
        input_ids.drain(..excess);
    }
    let decoded = codec.decode(&input_ids, true)?;
    Ok(PreparedPrompt { input_ids, decoded })
}

/// Runs generation requests against borrowed model handles.
pub struct GenerationSession {
    config: SessionConfig,
    prompts: Arc<dyn PromptBuilder>,
    adapter: TokenStreamAdapter,
    persistence: Option<Arc<dyn PersistenceHook>>,
}

impl GenerationSession {
    pub fn new(config: SessionConfig, prompts: Arc<dyn PromptBuilder>) -> Self {
        let adapter = TokenStreamAdapter::new(config.stream_config());
        Self {
            config,
            prompts,
            adapter,
            persistence: None,
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn PersistenceHook>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn adapter(&self) -> &TokenStreamAdapter {
        &self.adapter
    }

    /// Run one request.
    ///
    /// When `events` is given, streaming runs send the extracted response so
    /// far as `PartialText` after every increment, and every run ends with one
    /// terminal `Done` or `Failed`. A closed receiver cancels the run.
    pub async fn run(
        &self,
        model: Result<&ModelHandle, &DegradedState>,
        request: &GenerationRequest,
        events: Option<&mpsc::Sender<StreamEvent>>,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome, GenerationError> {
        let result = self.run_partial(model, request, events, cancel).await;
        if let Some(event) = terminal_event(&result) {
            send(events, event).await;
        }
        result
    }

    /// Run one request, sending only `PartialText` snapshots to `events`.
    ///
    /// The terminal event is left to the caller, which reports it with
    /// [`terminal_event`] once it has acted on the result.
    pub async fn run_partial(
        &self,
        model: Result<&ModelHandle, &DegradedState>,
        request: &GenerationRequest,
        events: Option<&mpsc::Sender<StreamEvent>>,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome, GenerationError> {
        request.params.validate()?;
        let params = if request.chat {
            request.params.for_chat()
        } else {
            request.params.clone()
        };

        let handle = match model {
            Ok(handle) => handle,
            Err(degraded) => {
                warn!(slot = %degraded.slot, reason = %degraded.reason, "Generation requested without a model");
                if self.config.strict_accelerator_errors {
                    return Err(GenerationError::NoModel(degraded.reason.clone()));
                }
                return Ok(GenerationOutcome::failed(ErrorKind::NoModel));
            }
        };

        let convention = handle.convention();
        let prompt = self.prompts.render(&TurnData {
            convention,
            user_text: &request.user_text,
            context: &request.context,
        });
        debug!(model = %handle.name(), ?convention, prompt_chars = prompt.chars().count(), "Rendered prompt");

        let result = match handle.kind() {
            ModelKind::Pipeline { task } => {
                self.run_pipeline(handle, Arc::clone(task), &prompt, &params, cancel)
                    .await
            }
            ModelKind::Raw { model, codec } => {
                let raw = RawCall {
                    handle,
                    model: Arc::clone(model),
                    codec: Arc::clone(codec),
                    convention,
                };
                if request.stream {
                    self.run_streaming(raw, &prompt, &params, events, cancel)
                        .await
                } else {
                    self.run_batch(raw, &prompt, &params, cancel).await
                }
            }
        };

        let outcome = result?;
        if let GenerationOutcome::Completed {
            text,
            finish_reason,
            ..
        } = &outcome
        {
            if *finish_reason != FinishReason::Cancelled {
                self.persist(&prompt, text, handle.name()).await;
            }
            info!(model = %handle.name(), %finish_reason, chars = text.chars().count(), "Generation completed");
        }
        Ok(outcome)
    }

    async fn run_pipeline(
        &self,
        handle: &ModelHandle,
        task: Arc<dyn PipelineTask>,
        prompt: &str,
        params: &GenerationParameters,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome, GenerationError> {
        let exec_guard = tokio::select! {
            guard = handle.acquire_execution() => guard,
            _ = cancel.cancelled() => return Ok(cancelled(String::new())),
        };
        let prompt_owned = prompt.to_string();
        let max_length = params.max_new_tokens;
        let joined = tokio::task::spawn_blocking(move || {
            let _exec_guard = exec_guard;
            task.run(&prompt_owned, max_length)
        })
        .await;

        match joined {
            Ok(Ok(text)) => Ok(GenerationOutcome::Completed {
                sequences: vec![text.clone()],
                text,
                finish_reason: FinishReason::ModelFinished,
            }),
            Ok(Err(error)) => self.handle_backend_error(handle, error),
            Err(join) => Err(GenerationError::WorkerLost(join.to_string())),
        }
    }

    async fn run_streaming(
        &self,
        raw: RawCall<'_>,
        prompt: &str,
        params: &GenerationParameters,
        events: Option<&mpsc::Sender<StreamEvent>>,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome, GenerationError> {
        let prepared = self.prepare(&raw, prompt)?;
        let matcher = self.matcher(&raw)?;

        let exec_guard = tokio::select! {
            guard = raw.handle.acquire_execution() => guard,
            _ = cancel.cancelled() => return Ok(cancelled(String::new())),
        };

        let mut stream = self.adapter.start(StreamRequest {
            model: Arc::clone(&raw.model),
            codec: Arc::clone(&raw.codec),
            input_ids: prepared.input_ids.clone(),
            params: params.clone(),
            matcher,
            hard_stops: HardStopDetector::new(self.config.hard_stop_phrases.iter().cloned()),
            exec_guard,
        })?;

        let extract = |generated: &str| {
            self.prompts.extract_response(
                raw.convention,
                &format!("{}{}", prepared.decoded, generated),
                &prepared.decoded,
            )
        };

        let mut last_snapshot = String::new();
        loop {
            let event = tokio::select! {
                event = stream.next() => event,
                _ = cancel.cancelled() => {
                    stream.stop().await;
                    info!(model = %raw.handle.name(), "Generation cancelled");
                    return Ok(cancelled(extract(stream.text())));
                }
            };

            match event {
                Some(StreamEvent::PartialText(_)) => {
                    let snapshot = extract(stream.text());
                    if snapshot != last_snapshot {
                        last_snapshot = snapshot.clone();
                        if let Some(events) = events {
                            if events.send(StreamEvent::PartialText(snapshot)).await.is_err() {
                                debug!("Event receiver dropped, cancelling generation");
                                stream.stop().await;
                                return Ok(cancelled(extract(stream.text())));
                            }
                        }
                    }
                }
                Some(StreamEvent::Done(generated)) => {
                    let finish_reason = stream
                        .finish_reason()
                        .unwrap_or(FinishReason::ModelFinished);
                    stream.stop().await;
                    let text = extract(&generated);
                    return Ok(GenerationOutcome::Completed {
                        sequences: vec![text.clone()],
                        text,
                        finish_reason,
                    });
                }
                Some(StreamEvent::Failed(kind)) => {
                    let error = stream.take_error();
                    stream.stop().await;
                    return match (kind, error) {
                        (ErrorKind::HardStopTriggered, _) => Ok(GenerationOutcome::HardStopped {
                            partial: extract(self.before_hard_stop(stream.text())),
                        }),
                        (ErrorKind::Timeout, _) => {
                            warn!(model = %raw.handle.name(), "Generation timed out");
                            Ok(GenerationOutcome::failed(ErrorKind::Timeout))
                        }
                        (_, Some(error)) => self.handle_backend_error(raw.handle, error),
                        (kind, None) => Err(GenerationError::WorkerLost(format!(
                            "stream failed with {} and no error",
                            kind
                        ))),
                    };
                }
                None => {
                    return Err(GenerationError::WorkerLost(
                        "stream ended without a terminal event".to_string(),
                    ))
                }
            }
        }
    }

    async fn run_batch(
        &self,
        raw: RawCall<'_>,
        prompt: &str,
        params: &GenerationParameters,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome, GenerationError> {
        let prepared = self.prepare(&raw, prompt)?;
        let mut matcher = self.matcher(&raw)?;
        matcher.prime(&prepared.input_ids);

        let exec_guard = tokio::select! {
            guard = raw.handle.acquire_execution() => guard,
            _ = cancel.cancelled() => return Ok(cancelled(String::new())),
        };

        let model = Arc::clone(&raw.model);
        let eos = raw.codec.eos_token_id();
        let input_ids = prepared.input_ids.clone();
        let params_owned = params.clone();
        let worker_cancel = cancel.clone();

        let joined = tokio::task::spawn_blocking(move || {
            let _exec_guard = exec_guard;
            let mut stoppers = StopperChain::new(vec![
                Box::new(EosStopper::new(eos)),
                Box::new(matcher),
                Box::new(MaxTokensStopper::new(params_owned.max_new_tokens)),
                Box::new(DeadlineStopper::new(params_owned.max_time())),
            ]);
            let mut finish = None;
            let sequences = batch_generate(
                model.as_ref(),
                &input_ids,
                &params_owned,
                &mut stoppers,
                &worker_cancel,
                &mut finish,
            )?;
            Ok::<_, BackendError>((sequences, finish))
        })
        .await;

        let (sequences, finish) = match joined {
            Ok(Ok(result)) => result,
            Ok(Err(error)) => return self.handle_backend_error(raw.handle, error),
            Err(join) => return Err(GenerationError::WorkerLost(join.to_string())),
        };

        let mut texts = Vec::with_capacity(sequences.len());
        for sequence in &sequences {
            let generated = raw
                .codec
                .decode(sequence, true)
                .map_err(GenerationError::tokenization)?;
            texts.push(generated);
        }

        let mut hard_stops = HardStopDetector::new(self.config.hard_stop_phrases.iter().cloned());
        let extract = |generated: &str| {
            self.prompts.extract_response(
                raw.convention,
                &format!("{}{}", prepared.decoded, generated),
                &prepared.decoded,
            )
        };

        if let Some(first) = texts.first() {
            if hard_stops.observe(first).is_some() {
                return Ok(GenerationOutcome::HardStopped {
                    partial: extract(self.before_hard_stop(first)),
                });
            }
        }

        let extracted: Vec<String> = texts.iter().map(|t| extract(t)).collect();
        Ok(GenerationOutcome::Completed {
            text: extracted.first().cloned().unwrap_or_default(),
            finish_reason: finish.unwrap_or(FinishReason::ModelFinished),
            sequences: extracted,
        })
    }

    /// `text` up to the earliest hard-stop phrase.
    fn before_hard_stop<'t>(&self, text: &'t str) -> &'t str {
        self.config
            .hard_stop_phrases
            .iter()
            .filter_map(|phrase| text.find(phrase.as_str()))
            .min()
            .map_or(text, |index| &text[..index])
    }

    fn prepare(&self, raw: &RawCall<'_>, prompt: &str) -> Result<PreparedPrompt, GenerationError> {
        let budget = self.config.prompt_budget(raw.model.max_context_length());
        prepare_prompt(prompt, raw.codec.as_ref(), budget).map_err(GenerationError::tokenization)
    }

    fn matcher(&self, raw: &RawCall<'_>) -> Result<StopSequenceMatcher, GenerationError> {
        let rules = raw.convention.stop_rules();
        let specs = StopSpec::compile(&rules.pairs(), raw.codec.as_ref())
            .map_err(GenerationError::tokenization)?;
        Ok(StopSequenceMatcher::new(specs).with_policy(self.config.halt_policy))
    }

    /// Recover from a backend failure when its kind allows it.
    fn handle_backend_error(
        &self,
        handle: &ModelHandle,
        error: BackendError,
    ) -> Result<GenerationOutcome, GenerationError> {
        let kind = error.kind();
        if !matches!(
            kind,
            ErrorKind::AcceleratorOutOfMemory | ErrorKind::AcceleratorFault
        ) {
            warn!(model = %handle.name(), error = %error, "Unrecoverable generation failure");
            return Err(GenerationError::backend(error));
        }

        handle.kind().release_buffers();
        warn!(model = %handle.name(), %kind, error = %error, "Accelerator failure during generation, buffers released");

        if self.config.strict_accelerator_errors {
            Err(GenerationError::Backend {
                kind,
                source: error,
            })
        } else {
            Ok(GenerationOutcome::failed(kind))
        }
    }

    async fn persist(&self, prompt: &str, output: &str, model_name: &str) {
        let Some(hook) = &self.persistence else {
            return;
        };
        let record = OutputRecord::new(prompt, output, model_name);
        if let Err(e) = hook.save(&record).await {
            warn!(destination = %hook.destination().display(), error = %e, "Failed to save generation output");
        }
    }
}

impl std::fmt::Debug for GenerationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationSession")
            .field("config", &self.config)
            .field("persistence", &self.persistence.is_some())
            .finish_non_exhaustive()
    }
}

struct RawCall<'a> {
    handle: &'a ModelHandle,
    model: Arc<dyn SequenceModel>,
    codec: Arc<dyn Codec>,
    convention: PromptConvention,
}

fn cancelled(text: String) -> GenerationOutcome {
    GenerationOutcome::Completed {
        sequences: vec![text.clone()],
        text,
        finish_reason: FinishReason::Cancelled,
    }
}

fn batch_generate(
    model: &dyn SequenceModel,
    input_ids: &[u32],
    params: &GenerationParameters,
    stoppers: &mut StopperChain,
    cancel: &CancellationToken,
    finish: &mut Option<FinishReason>,
) -> Result<Vec<Vec<u32>>, BackendError> {
    model.generate(input_ids, params, &mut |token| {
        if cancel.is_cancelled() {
            finish.get_or_insert(FinishReason::Cancelled);
            return StepControl::Stop;
        }
        match stoppers.should_stop(token) {
            Some(reason) => {
                finish.get_or_insert(reason);
                StepControl::Stop
            }
            None => StepControl::Continue,
        }
    })
}

/// The event that ends a run's stream.
///
/// Invalid parameters are rejected before anything is streamed and have none.
pub fn terminal_event(
    result: &Result<GenerationOutcome, GenerationError>,
) -> Option<StreamEvent> {
    match result {
        Ok(GenerationOutcome::Completed { text, .. }) => Some(StreamEvent::Done(text.clone())),
        Ok(GenerationOutcome::HardStopped { .. }) => {
            Some(StreamEvent::Failed(ErrorKind::HardStopTriggered))
        }
        Ok(GenerationOutcome::Failed { kind, .. }) => Some(StreamEvent::Failed(*kind)),
        Err(GenerationError::InvalidParameters(_)) => None,
        Err(error) => Some(StreamEvent::Failed(error.kind())),
    }
}

async fn send(events: Option<&mpsc::Sender<StreamEvent>>, event: StreamEvent) {
    if let Some(events) = events {
        if events.send(event).await.is_err() {
            debug!("Event receiver dropped before terminal event");
        }
    }
}
