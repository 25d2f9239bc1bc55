//! Worker-thread generation with a bounded, ordered token channel.
//!
//! The worker owns the blocking model call. From the per-step callback it
//! checks the cancellation token, runs the stoppers and pushes each token into
//! a bounded channel, so a slow consumer applies back-pressure to generation.
//! The consumer decodes tokens into text increments on its side.
//!
//! Cancellation is cooperative at callback boundaries. [`StreamHandle::stop`]
//! waits up to the configured grace period for the worker to exit and detaches
//! it with an error log otherwise.

use super::decoder::IncrementalDecoder;
use crate::backend::{Codec, SequenceModel, StepControl};
use crate::generation::GenerationError;
use crate::stopper::{
    DeadlineStopper, EosStopper, HardStopDetector, MaxTokensStopper, StopSequenceMatcher, Stopper,
    StopperChain,
};
use crate::types::{classify_backend_error, BackendError, ErrorKind, FinishReason, GenerationParameters, StreamEvent};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use textgen_common::with_timeout;
use tokio::sync::{mpsc, oneshot, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Adapter settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    /// Tokens buffered between worker and consumer.
    pub channel_capacity: usize,
    /// How long `stop` waits for the worker before detaching it.
    pub cancel_grace: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            cancel_grace: Duration::from_millis(2000),
        }
    }
}

/// Everything a worker needs for one call.
pub struct StreamRequest {
    pub model: Arc<dyn SequenceModel>,
    pub codec: Arc<dyn Codec>,
    pub input_ids: Vec<u32>,
    pub params: GenerationParameters,
    pub matcher: StopSequenceMatcher,
    pub hard_stops: HardStopDetector,
    /// Exclusive-use guard for non-reentrant models, released when the
    /// worker returns.
    pub exec_guard: Option<OwnedMutexGuard<()>>,
}

#[derive(Debug)]
enum WorkerMessage {
    Token(u32),
    Finished(FinishReason),
    Failed(BackendError),
}

/// How a stopped stream released its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Joined,
    /// The worker did not exit within the grace period.
    Detached,
}

/// Decrements the live-worker count and signals completion however the
/// worker exits.
struct WorkerGuard {
    live: Arc<AtomicUsize>,
    done: Option<oneshot::Sender<()>>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

/// Starts generation workers and tracks how many are alive.
#[derive(Debug, Clone)]
pub struct TokenStreamAdapter {
    config: StreamConfig,
    live_workers: Arc<AtomicUsize>,
    next_worker: Arc<AtomicU64>,
}

impl TokenStreamAdapter {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            live_workers: Arc::new(AtomicUsize::new(0)),
            next_worker: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> StreamConfig {
        self.config
    }

    /// Worker threads that have not exited yet.
    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::SeqCst)
    }

    /// Launch generation on a dedicated worker thread.
    pub fn start(&self, request: StreamRequest) -> Result<StreamHandle, GenerationError> {
        let StreamRequest {
            model,
            codec,
            input_ids,
            params,
            mut matcher,
            hard_stops,
            exec_guard,
        } = request;

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let (done_tx, done_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let worker_id = self.next_worker.fetch_add(1, Ordering::SeqCst);

        matcher.prime(&input_ids);
        let stoppers = StopperChain::new(vec![
            Box::new(EosStopper::new(codec.eos_token_id())),
            Box::new(matcher),
            Box::new(MaxTokensStopper::new(params.max_new_tokens)),
            Box::new(DeadlineStopper::new(params.max_time())),
        ]);
        let deadline = Instant::now() + params.max_time() + self.config.cancel_grace;

        self.live_workers.fetch_add(1, Ordering::SeqCst);
        let guard = WorkerGuard {
            live: Arc::clone(&self.live_workers),
            done: Some(done_tx),
        };

        let worker_cancel = cancel.clone();
        let eos = codec.eos_token_id();
        let thread = std::thread::Builder::new()
            .name(format!("textgen-worker-{}", worker_id))
            .spawn(move || {
                let _guard = guard;
                let _exec_guard = exec_guard;
                run_worker(
                    worker_id,
                    model.as_ref(),
                    &input_ids,
                    &params,
                    stoppers,
                    eos,
                    &worker_cancel,
                    &tx,
                );
            })
            .map_err(|e| GenerationError::WorkerSpawn(e.to_string()))?;

        debug!(worker_id, "Generation worker started");

        Ok(StreamHandle {
            worker_id,
            receiver: Some(rx),
            decoder: IncrementalDecoder::new(codec),
            hard_stops,
            cancel,
            done: Some(done_rx),
            thread: Some(thread),
            deadline,
            grace: self.config.cancel_grace,
            queued: VecDeque::new(),
            finished: false,
            finish_reason: None,
            error: None,
        })
    }
}

impl Default for TokenStreamAdapter {
    fn default() -> Self {
        Self::new(StreamConfig::default())
    }
}

#[allow(clippy::too_many_arguments)]
fn run_worker(
    worker_id: u64,
    model: &dyn SequenceModel,
    input_ids: &[u32],
    params: &GenerationParameters,
    mut stoppers: StopperChain,
    eos: Option<u32>,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<WorkerMessage>,
) {
    let mut finish: Option<FinishReason> = None;

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        model.generate(input_ids, params, &mut |token| {
            if cancel.is_cancelled() {
                finish.get_or_insert(FinishReason::Cancelled);
                return StepControl::Stop;
            }
            let reason = stoppers.should_stop(token);
            if Some(token) != eos && tx.blocking_send(WorkerMessage::Token(token)).is_err() {
                finish.get_or_insert(FinishReason::Cancelled);
                return StepControl::Stop;
            }
            match reason {
                Some(reason) => {
                    finish.get_or_insert(reason);
                    StepControl::Stop
                }
                None => StepControl::Continue,
            }
        })
    }));

    let message = match outcome {
        Ok(Ok(_)) => {
            let reason = finish.unwrap_or(FinishReason::ModelFinished);
            debug!(worker_id, %reason, "Generation worker finished");
            WorkerMessage::Finished(reason)
        }
        Ok(Err(e)) => {
            warn!(worker_id, error = %e, "Generation call failed");
            WorkerMessage::Failed(e)
        }
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(worker_id, panic = %message, "Generation call panicked");
            WorkerMessage::Failed(BackendError::Panicked(message))
        }
    };

    if tx.blocking_send(message).is_err() {
        debug!(worker_id, "Consumer gone before final message");
    }
}

/// Consumer side of one generation call.
///
/// Yields zero or more [`StreamEvent::PartialText`] deltas followed by one
/// terminal event, then `None`.
pub struct StreamHandle {
    worker_id: u64,
    receiver: Option<mpsc::Receiver<WorkerMessage>>,
    decoder: IncrementalDecoder,
    hard_stops: HardStopDetector,
    cancel: CancellationToken,
    done: Option<oneshot::Receiver<()>>,
    thread: Option<JoinHandle<()>>,
    deadline: Instant,
    grace: Duration,
    queued: VecDeque<StreamEvent>,
    finished: bool,
    finish_reason: Option<FinishReason>,
    error: Option<BackendError>,
}

impl StreamHandle {
    /// Pull the next event.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if let Some(event) = self.queued.pop_front() {
            return Some(event);
        }
        if self.finished {
            return None;
        }

        loop {
            let receiver = self.receiver.as_mut()?;
            let message = match tokio::time::timeout_at(self.deadline, receiver.recv()).await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    warn!(worker_id = self.worker_id, "Worker exited without a final message");
                    return Some(self.fail(ErrorKind::Unrecoverable));
                }
                Err(_) => {
                    warn!(worker_id = self.worker_id, "Generation exceeded its time budget");
                    self.cancel.cancel();
                    return Some(self.fail(ErrorKind::Timeout));
                }
            };

            match message {
                WorkerMessage::Token(token) => match self.decoder.push(token) {
                    Ok(Some(delta)) => {
                        if self.hard_stops.observe(&delta).is_some() {
                            self.cancel.cancel();
                            return Some(self.fail(ErrorKind::HardStopTriggered));
                        }
                        return Some(StreamEvent::PartialText(delta));
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        self.cancel.cancel();
                        return Some(self.fail_with(e));
                    }
                },
                WorkerMessage::Finished(reason) => {
                    self.finish_reason = Some(reason);
                    self.finished = true;
                    let rest = match self.decoder.flush() {
                        Ok(rest) => rest,
                        Err(e) => return Some(self.fail_with(e)),
                    };
                    if let Some(rest) = &rest {
                        if self.hard_stops.observe(rest).is_some() {
                            return Some(self.fail(ErrorKind::HardStopTriggered));
                        }
                    }
                    let done = StreamEvent::Done(self.decoder.text().to_string());
                    return Some(match rest {
                        Some(rest) => {
                            self.queued.push_back(done);
                            StreamEvent::PartialText(rest)
                        }
                        None => done,
                    });
                }
                WorkerMessage::Failed(e) => return Some(self.fail_with(e)),
            }
        }
    }

    fn fail(&mut self, kind: ErrorKind) -> StreamEvent {
        self.finished = true;
        StreamEvent::Failed(kind)
    }

    fn fail_with(&mut self, error: BackendError) -> StreamEvent {
        let kind = classify_backend_error(&error);
        self.error = Some(error);
        self.fail(kind)
    }

    /// Text decoded so far.
    pub fn text(&self) -> &str {
        self.decoder.text()
    }

    /// Generated token ids received so far.
    pub fn tokens(&self) -> &[u32] {
        self.decoder.tokens()
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// The backend error behind a `Failed` event, if there was one.
    pub fn take_error(&mut self) -> Option<BackendError> {
        self.error.take()
    }

    pub fn is_finished(&self) -> bool {
        self.finished && self.queued.is_empty()
    }

    /// Cancel generation and reclaim the worker.
    ///
    /// No further events are yielded afterwards. Returns once the worker has
    /// exited, or after the grace period with the worker detached.
    pub async fn stop(&mut self) -> StopOutcome {
        self.cancel.cancel();
        self.receiver = None;
        self.queued.clear();
        if !self.finished {
            self.finish_reason.get_or_insert(FinishReason::Cancelled);
        }
        self.finished = true;

        let Some(done) = self.done.take() else {
            return StopOutcome::Joined;
        };

        match with_timeout(done, self.grace).await {
            Ok(()) | Err(textgen_common::TimeoutError::Operation(_)) => {
                if let Some(thread) = self.thread.take() {
                    let _ = tokio::task::spawn_blocking(move || thread.join()).await;
                }
                debug!(worker_id = self.worker_id, "Generation worker joined");
                StopOutcome::Joined
            }
            Err(textgen_common::TimeoutError::Timeout { duration }) => {
                error!(
                    worker_id = self.worker_id,
                    grace = ?duration,
                    "Generation worker did not stop within grace period, detaching"
                );
                self.thread.take();
                StopOutcome::Detached
            }
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if self.thread.is_some() && !self.finished {
            info!(worker_id = self.worker_id, "Stream dropped before completion, worker cancelled");
        }
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("worker_id", &self.worker_id)
            .field("finished", &self.finished)
            .field("finish_reason", &self.finish_reason)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::{ScriptedCodec, ScriptedModel};
    use crate::stopper::StopSpec;
    use tracing_test::traced_test;

    fn request(model: ScriptedModel, params: GenerationParameters) -> StreamRequest {
        let codec: Arc<dyn Codec> = Arc::new(model.codec());
        StreamRequest {
            model: Arc::new(model),
            codec,
            input_ids: Vec::new(),
            params,
            matcher: StopSequenceMatcher::new(Vec::new()),
            hard_stops: HardStopDetector::default(),
            exec_guard: None,
        }
    }

    async fn drain(handle: &mut StreamHandle) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = handle.next().await {
            events.push(event);
        }
        events
    }

    async fn wait_for_workers(adapter: &TokenStreamAdapter, expected: usize) {
        for _ in 0..200 {
            if adapter.live_workers() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(adapter.live_workers(), expected);
    }

    #[tokio::test]
    async fn test_streams_deltas_then_done() {
        let adapter = TokenStreamAdapter::default();
        let model = ScriptedModel::builder().reply("héllo wörld").build().unwrap();
        let mut handle = adapter
            .start(request(model, GenerationParameters::default()))
            .unwrap();

        let events = drain(&mut handle).await;
        let (last, deltas) = events.split_last().unwrap();
        let streamed: String = deltas
            .iter()
            .map(|e| match e {
                StreamEvent::PartialText(t) => t.as_str(),
                other => panic!("unexpected {:?}", other),
            })
            .collect();

        assert_eq!(streamed, "héllo wörld");
        assert_eq!(last, &StreamEvent::Done("héllo wörld".to_string()));
        assert_eq!(handle.finish_reason(), Some(FinishReason::EndOfSequence));
        assert_eq!(handle.stop().await, StopOutcome::Joined);
        assert_eq!(adapter.live_workers(), 0);
    }

    #[tokio::test]
    async fn test_token_budget_ends_stream() {
        let adapter = TokenStreamAdapter::default();
        let model = ScriptedModel::builder()
            .reply("abcdefghijklmnop")
            .build()
            .unwrap();
        let params = GenerationParameters::default().with_max_new_tokens(4);
        let mut handle = adapter.start(request(model, params)).unwrap();

        let events = drain(&mut handle).await;
        assert_eq!(events.last(), Some(&StreamEvent::Done("abcd".to_string())));
        assert_eq!(handle.finish_reason(), Some(FinishReason::MaxTokens));
    }

    #[tokio::test]
    async fn test_stop_sequence_ends_stream() {
        let adapter = TokenStreamAdapter::default();
        let model = ScriptedModel::builder()
            .reply("answer<human>: more text")
            .build()
            .unwrap();
        let codec = model.codec();
        let spec = StopSpec::compile_phrase("<human>:", 1, &codec)
            .unwrap()
            .unwrap();
        let mut req = request(model, GenerationParameters::default());
        req.matcher = StopSequenceMatcher::new(vec![spec]);

        let mut handle = adapter.start(req).unwrap();
        let events = drain(&mut handle).await;
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Done("answer<human>:".to_string()))
        );
        assert_eq!(handle.finish_reason(), Some(FinishReason::StopSequence));
    }

    #[tokio::test]
    async fn test_hard_stop_aborts() {
        let adapter = TokenStreamAdapter::default();
        let model = ScriptedModel::builder()
            .reply("fine so far FORBIDDEN and then some")
            .build()
            .unwrap();
        let mut req = request(model, GenerationParameters::default());
        req.hard_stops = HardStopDetector::new(["FORBIDDEN"]);

        let mut handle = adapter.start(req).unwrap();
        let events = drain(&mut handle).await;
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Failed(ErrorKind::HardStopTriggered))
        );
        assert!(handle.text().contains("FORBIDDEN"));
        handle.stop().await;
        wait_for_workers(&adapter, 0).await;
    }

    #[tokio::test]
    async fn test_hard_stop_in_flushed_tail_aborts() {
        let adapter = TokenStreamAdapter::default();
        let model = ScriptedModel::builder().reply("no 👋").build().unwrap();
        let ids = model.codec().encode("no 👋").unwrap();
        // Cut the emoji short so its bytes only come out on flush.
        let params = GenerationParameters::default().with_max_new_tokens(ids.len() - 1);
        let mut req = request(model, params);
        req.hard_stops = HardStopDetector::new(["\u{FFFD}"]);

        let mut handle = adapter.start(req).unwrap();
        let events = drain(&mut handle).await;
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Failed(ErrorKind::HardStopTriggered))
        );
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Done(_))));
    }

    #[tokio::test]
    async fn test_backend_failure_surfaces_kind() {
        let adapter = TokenStreamAdapter::default();
        let model = ScriptedModel::builder()
            .reply("abc")
            .fail_at(2, BackendError::OutOfMemory("no room".into()))
            .build()
            .unwrap();
        let mut handle = adapter
            .start(request(model, GenerationParameters::default()))
            .unwrap();

        let events = drain(&mut handle).await;
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Failed(ErrorKind::AcceleratorOutOfMemory))
        );
        assert!(matches!(
            handle.take_error(),
            Some(BackendError::OutOfMemory(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_mid_stream_reclaims_worker() {
        let adapter = TokenStreamAdapter::default();
        let model = ScriptedModel::builder()
            .reply("a long reply that keeps going and going")
            .step_delay(Duration::from_millis(5))
            .build()
            .unwrap();
        let mut handle = adapter
            .start(request(model, GenerationParameters::default()))
            .unwrap();

        assert!(matches!(
            handle.next().await,
            Some(StreamEvent::PartialText(_))
        ));
        assert_eq!(adapter.live_workers(), 1);

        assert_eq!(handle.stop().await, StopOutcome::Joined);
        assert_eq!(adapter.live_workers(), 0);
        assert_eq!(handle.next().await, None);
        assert_eq!(handle.finish_reason(), Some(FinishReason::Cancelled));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unresponsive_worker_is_detached_with_error_log() {
        let adapter = TokenStreamAdapter::new(StreamConfig {
            channel_capacity: 4,
            cancel_grace: Duration::from_millis(20),
        });
        let model = ScriptedModel::builder()
            .reply("xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx")
            .step_delay(Duration::from_millis(25))
            .ignore_stop()
            .build()
            .unwrap();
        let mut handle = adapter
            .start(request(model, GenerationParameters::default()))
            .unwrap();

        assert!(handle.next().await.is_some());
        assert_eq!(handle.stop().await, StopOutcome::Detached);
        assert!(logs_contain("did not stop within grace period"));

        // the detached worker still exits on its own
        wait_for_workers(&adapter, 0).await;
    }

    #[tokio::test]
    async fn test_wall_clock_budget_times_out_hung_worker() {
        let adapter = TokenStreamAdapter::new(StreamConfig {
            channel_capacity: 4,
            cancel_grace: Duration::from_millis(50),
        });
        let model = ScriptedModel::builder()
            .reply("ab")
            .step_delay(Duration::from_millis(1500))
            .build()
            .unwrap();
        let params = GenerationParameters::default().with_max_time(Duration::from_secs(1));
        let mut handle = adapter.start(request(model, params)).unwrap();

        assert_eq!(handle.next().await, Some(StreamEvent::Failed(ErrorKind::Timeout)));
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_dropping_handle_cancels_worker() {
        let adapter = TokenStreamAdapter::default();
        let model = ScriptedModel::builder()
            .reply("a long reply that keeps going and going")
            .step_delay(Duration::from_millis(5))
            .build()
            .unwrap();
        let handle = adapter
            .start(request(model, GenerationParameters::default()))
            .unwrap();
        drop(handle);
        wait_for_workers(&adapter, 0).await;
    }
}
