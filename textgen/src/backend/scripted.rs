//! Deterministic backend for tests and demos.
//!
//! Replays scripted replies token by token through the same blocking,
//! callback-driven contract a real model implements, so the engine can be
//! exercised end to end without weights or an accelerator.
//!
//! - [`ScriptedCodec`]: greedy longest-piece tokenizer with byte fallback.
//!   Multi-byte characters split across byte tokens, which is what makes
//!   incremental decoding non-trivial.
//! - [`ScriptedModel`]: replays replies, with optional per-step delay,
//!   failure injection and an "ignore stop" mode that behaves like a call
//!   that cannot be interrupted.
//! - [`ScriptedPipeline`]: fixed text-to-text task.
//! - [`ScriptedLoader`]: builds fresh instances per load and accounts device
//!   memory, refusing allocations that would exceed capacity.

use super::{Codec, Device, ModelKind, PipelineTask, SequenceModel, StepControl};
use crate::lifecycle::{ModelError, ModelHandle, ModelLoader, ModelRequest};
use crate::types::{BackendError, GenerationParameters};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

pub const PAD_TOKEN: u32 = 0;
pub const EOS_TOKEN: u32 = 1;
/// Leading whitespace marker some tokenizers add before text that starts
/// with a newline. Decodes to nothing.
pub const SPACE_MARKER_TOKEN: u32 = 2;
const BYTE_BASE: u32 = 3;
const PIECE_BASE: u32 = BYTE_BASE + 256;

const DEFAULT_PIECES: &[&str] = &[
    "<human>:", "<bot>:", "###", " Human:", " Assistant:", "Human:", " I", " am", " a", " the",
    " you", "?",
];

/// Greedy longest-match tokenizer over a fixed piece list.
#[derive(Debug, Clone)]
pub struct ScriptedCodec {
    pieces: Vec<String>,
    prepend_pad: bool,
    newline_marker: bool,
}

impl Default for ScriptedCodec {
    fn default() -> Self {
        Self::with_pieces(DEFAULT_PIECES.iter().copied())
    }
}

impl ScriptedCodec {
    pub fn with_pieces<I, S>(pieces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pieces: pieces.into_iter().map(Into::into).collect(),
            prepend_pad: false,
            newline_marker: false,
        }
    }

    /// Prefix every encoding with the padding token.
    pub fn prepend_pad(mut self) -> Self {
        self.prepend_pad = true;
        self
    }

    /// Emit [`SPACE_MARKER_TOKEN`] before text starting with a newline.
    pub fn newline_marker(mut self) -> Self {
        self.newline_marker = true;
        self
    }

    fn longest_piece(&self, rest: &str) -> Option<usize> {
        self.pieces
            .iter()
            .enumerate()
            .filter(|(_, piece)| !piece.is_empty() && rest.starts_with(piece.as_str()))
            .max_by_key(|(_, piece)| piece.len())
            .map(|(index, _)| index)
    }
}

impl Codec for ScriptedCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>, BackendError> {
        let mut ids = Vec::with_capacity(text.len());
        if self.prepend_pad {
            ids.push(PAD_TOKEN);
        }
        if self.newline_marker && text.starts_with('\n') {
            ids.push(SPACE_MARKER_TOKEN);
        }

        let mut position = 0;
        while position < text.len() {
            let rest = &text[position..];
            if let Some(index) = self.longest_piece(rest) {
                ids.push(PIECE_BASE + index as u32);
                position += self.pieces[index].len();
            } else {
                let ch = rest.chars().next().ok_or_else(|| {
                    BackendError::Codec(format!("no character at byte {}", position))
                })?;
                let mut buf = [0u8; 4];
                ids.extend(
                    ch.encode_utf8(&mut buf)
                        .bytes()
                        .map(|b| BYTE_BASE + u32::from(b)),
                );
                position += ch.len_utf8();
            }
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[u32], skip_special: bool) -> Result<String, BackendError> {
        let mut bytes = Vec::with_capacity(ids.len());
        for &id in ids {
            match id {
                PAD_TOKEN if !skip_special => bytes.extend_from_slice(b"<pad>"),
                EOS_TOKEN if !skip_special => bytes.extend_from_slice(b"</s>"),
                PAD_TOKEN | EOS_TOKEN | SPACE_MARKER_TOKEN => {}
                id if id < PIECE_BASE => bytes.push((id - BYTE_BASE) as u8),
                id => {
                    let piece = self
                        .pieces
                        .get((id - PIECE_BASE) as usize)
                        .ok_or_else(|| BackendError::Codec(format!("unknown token id {}", id)))?;
                    bytes.extend_from_slice(piece.as_bytes());
                }
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn pad_token_id(&self) -> Option<u32> {
        Some(PAD_TOKEN)
    }

    fn eos_token_id(&self) -> Option<u32> {
        Some(EOS_TOKEN)
    }
}

/// Tracks whether an instance still holds device memory.
#[derive(Debug, Default)]
struct Residency {
    offloaded: AtomicBool,
}

/// Builder for [`ScriptedModel`]; also the template a [`ScriptedLoader`]
/// instantiates on every load.
#[derive(Debug, Clone)]
pub struct ScriptedModelBuilder {
    codec: ScriptedCodec,
    replies: Vec<String>,
    append_eos: bool,
    step_delay: Duration,
    max_context_length: usize,
    footprint: u64,
    failure: Option<(usize, BackendError)>,
    ignore_stop: bool,
    reentrant: bool,
}

impl Default for ScriptedModelBuilder {
    fn default() -> Self {
        Self {
            codec: ScriptedCodec::default(),
            replies: Vec::new(),
            append_eos: true,
            step_delay: Duration::ZERO,
            max_context_length: 2048,
            footprint: 1,
            failure: None,
            ignore_stop: false,
            reentrant: false,
        }
    }
}

impl ScriptedModelBuilder {
    pub fn codec(mut self, codec: ScriptedCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Add a reply. Successive calls cycle through the replies in order.
    pub fn reply(mut self, text: impl Into<String>) -> Self {
        self.replies.push(text.into());
        self
    }

    /// Do not end replies with the end-of-sequence token.
    pub fn without_eos(mut self) -> Self {
        self.append_eos = false;
        self
    }

    pub fn step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn max_context_length(mut self, length: usize) -> Self {
        self.max_context_length = length;
        self
    }

    /// Device memory the model occupies, in arbitrary units.
    pub fn footprint(mut self, footprint: u64) -> Self {
        self.footprint = footprint;
        self
    }

    /// Fail with `error` instead of producing token `step`.
    pub fn fail_at(mut self, step: usize, error: BackendError) -> Self {
        self.failure = Some((step, error));
        self
    }

    /// Keep producing tokens after the callback asks to stop.
    pub fn ignore_stop(mut self) -> Self {
        self.ignore_stop = true;
        self
    }

    pub fn reentrant(mut self) -> Self {
        self.reentrant = true;
        self
    }

    /// Load a builder from a JSON model script.
    pub fn from_fixture(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BackendError::runtime(format!("failed to read {}: {}", path.display(), e))
        })?;
        let script: ModelScript = serde_json::from_str(&content).map_err(|e| {
            BackendError::runtime(format!("invalid model script {}: {}", path.display(), e))
        })?;
        Ok(script.into_builder())
    }

    pub fn build(self) -> Result<ScriptedModel, BackendError> {
        self.instantiate(Arc::new(Residency::default()))
    }

    fn instantiate(self, residency: Arc<Residency>) -> Result<ScriptedModel, BackendError> {
        let replies = self
            .replies
            .iter()
            .map(|reply| {
                let mut ids = self.codec.encode(reply)?;
                if self.append_eos {
                    ids.push(EOS_TOKEN);
                }
                Ok(ids)
            })
            .collect::<Result<Vec<_>, BackendError>>()?;

        Ok(ScriptedModel {
            codec: self.codec,
            replies,
            step_delay: self.step_delay,
            max_context_length: self.max_context_length,
            failure: self.failure,
            ignore_stop: self.ignore_stop,
            reentrant: self.reentrant,
            residency,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            last_input: Mutex::new(Vec::new()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct FailureScript {
    at_step: usize,
    kind: FailureKind,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FailureKind {
    OutOfMemory,
    Runtime,
}

#[derive(Debug, Deserialize)]
struct ModelScript {
    replies: Vec<String>,
    #[serde(default = "default_true")]
    append_eos: bool,
    #[serde(default)]
    step_delay_ms: u64,
    #[serde(default)]
    max_context_length: Option<usize>,
    #[serde(default)]
    footprint: Option<u64>,
    #[serde(default)]
    failure: Option<FailureScript>,
}

fn default_true() -> bool {
    true
}

impl ModelScript {
    fn into_builder(self) -> ScriptedModelBuilder {
        let mut builder = ScriptedModelBuilder {
            replies: self.replies,
            append_eos: self.append_eos,
            step_delay: Duration::from_millis(self.step_delay_ms),
            ..Default::default()
        };
        if let Some(length) = self.max_context_length {
            builder.max_context_length = length;
        }
        if let Some(footprint) = self.footprint {
            builder.footprint = footprint;
        }
        if let Some(failure) = self.failure {
            let error = match failure.kind {
                FailureKind::OutOfMemory => BackendError::OutOfMemory(failure.message),
                FailureKind::Runtime => BackendError::Runtime(failure.message),
            };
            builder.failure = Some((failure.at_step, error));
        }
        builder
    }
}

/// Scripted [`SequenceModel`].
#[derive(Debug)]
pub struct ScriptedModel {
    codec: ScriptedCodec,
    replies: Vec<Vec<u32>>,
    step_delay: Duration,
    max_context_length: usize,
    failure: Option<(usize, BackendError)>,
    ignore_stop: bool,
    reentrant: bool,
    residency: Arc<Residency>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    released: AtomicUsize,
    last_input: Mutex<Vec<u32>>,
}

impl ScriptedModel {
    pub fn builder() -> ScriptedModelBuilder {
        ScriptedModelBuilder::default()
    }

    pub fn codec(&self) -> ScriptedCodec {
        self.codec.clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping `generate` calls observed.
    pub fn max_concurrent_calls(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn buffer_releases(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn is_offloaded(&self) -> bool {
        self.residency.offloaded.load(Ordering::SeqCst)
    }

    /// Prompt ids of the most recent call.
    pub fn last_input(&self) -> Vec<u32> {
        self.last_input
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wrap into a [`ModelKind::Raw`] sharing this model's codec.
    pub fn into_kind(self) -> ModelKind {
        let codec = Arc::new(self.codec.clone());
        ModelKind::raw(Arc::new(self), codec)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SequenceModel for ScriptedModel {
    fn generate(
        &self,
        input_ids: &[u32],
        params: &GenerationParameters,
        on_token: &mut dyn FnMut(u32) -> StepControl,
    ) -> Result<Vec<Vec<u32>>, BackendError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .last_input
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = input_ids.to_vec();

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        let empty = Vec::new();
        let script = if self.replies.is_empty() {
            &empty
        } else {
            &self.replies[call % self.replies.len()]
        };

        let mut produced = Vec::new();
        for (step, &token) in script.iter().enumerate() {
            if let Some((at, error)) = &self.failure {
                if *at == step {
                    return Err(error.clone());
                }
            }
            if produced.len() >= params.max_new_tokens && !self.ignore_stop {
                break;
            }
            if !self.step_delay.is_zero() {
                std::thread::sleep(self.step_delay);
            }
            produced.push(token);
            if on_token(token) == StepControl::Stop && !self.ignore_stop {
                break;
            }
        }

        let sequences = params.num_return_sequences.max(1) as usize;
        Ok(vec![produced; sequences])
    }

    fn max_context_length(&self) -> usize {
        self.max_context_length
    }

    fn release_buffers(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn offload(&self) -> Result<(), BackendError> {
        self.residency.offloaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_reentrant(&self) -> bool {
        self.reentrant
    }
}

/// Scripted [`PipelineTask`] that always answers with the same text.
#[derive(Debug)]
pub struct ScriptedPipeline {
    output: String,
    residency: Arc<Residency>,
    runs: AtomicUsize,
}

impl ScriptedPipeline {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            residency: Arc::new(Residency::default()),
            runs: AtomicUsize::new(0),
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl PipelineTask for ScriptedPipeline {
    fn run(&self, _prompt: &str, max_length: usize) -> Result<String, BackendError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .output
            .split_whitespace()
            .take(max_length)
            .collect::<Vec<_>>()
            .join(" "))
    }

    fn offload(&self) -> Result<(), BackendError> {
        self.residency.offloaded.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum LoaderEntry {
    Model(ScriptedModelBuilder),
    Pipeline { output: String, footprint: u64 },
    Missing,
}

#[derive(Debug)]
struct Allocation {
    name: String,
    device: Device,
    footprint: u64,
    residency: Weak<Residency>,
}

impl Allocation {
    fn is_reclaimable(&self) -> bool {
        match self.residency.upgrade() {
            Some(residency) => residency.offloaded.load(Ordering::SeqCst),
            None => true,
        }
    }
}

/// Scripted [`ModelLoader`] with per-device memory accounting.
///
/// Memory held by a dropped or offloaded instance stays allocated until
/// `reclaim_memory` runs, so a manager that allocates before reclaiming runs
/// out of capacity.
#[derive(Debug)]
pub struct ScriptedLoader {
    capacity: u64,
    entries: HashMap<String, LoaderEntry>,
    rejected_adapters: HashSet<String>,
    allocations: Mutex<Vec<Allocation>>,
    instances: Mutex<Vec<(String, Weak<Residency>)>>,
    reclaims: AtomicUsize,
    loads: AtomicUsize,
}

impl ScriptedLoader {
    /// Loader for accelerators with `capacity` units of memory each.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            rejected_adapters: HashSet::new(),
            allocations: Mutex::new(Vec::new()),
            instances: Mutex::new(Vec::new()),
            reclaims: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn with_model(mut self, name: impl Into<String>, builder: ScriptedModelBuilder) -> Self {
        self.entries.insert(name.into(), LoaderEntry::Model(builder));
        self
    }

    pub fn with_pipeline(
        mut self,
        name: impl Into<String>,
        output: impl Into<String>,
        footprint: u64,
    ) -> Self {
        self.entries.insert(
            name.into(),
            LoaderEntry::Pipeline {
                output: output.into(),
                footprint,
            },
        );
        self
    }

    /// A model name whose weights are unavailable.
    pub fn with_missing(mut self, name: impl Into<String>) -> Self {
        self.entries.insert(name.into(), LoaderEntry::Missing);
        self
    }

    /// Adapter weights every base model rejects.
    pub fn with_rejected_adapter(mut self, adapter: impl Into<String>) -> Self {
        self.rejected_adapters.insert(adapter.into());
        self
    }

    /// Instances of `name` that are still alive anywhere.
    pub fn live_instances(&self, name: &str) -> usize {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(instance, residency)| instance == name && residency.strong_count() > 0)
            .count()
    }

    pub fn reclaim_count(&self) -> usize {
        self.reclaims.load(Ordering::SeqCst)
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    fn resolve_device(device: Device) -> Device {
        match device {
            Device::Auto => Device::Accelerator(0),
            other => other,
        }
    }

    fn allocated(&self, device: Device) -> u64 {
        self.allocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|a| a.device == device)
            .map(|a| a.footprint)
            .sum()
    }
}

#[async_trait]
impl ModelLoader for ScriptedLoader {
    async fn load(&self, request: &ModelRequest) -> Result<ModelHandle, ModelError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let name = request.base_model.as_str();
        let entry = self
            .entries
            .get(name)
            .cloned()
            .ok_or_else(|| ModelError::NotFound(name.to_string()))?;

        if let Some(adapter) = &request.adapter_weights {
            if self.rejected_adapters.contains(adapter) {
                return Err(ModelError::IncompatibleAdapter {
                    base_model: name.to_string(),
                    adapter: adapter.clone(),
                    reason: "tensor shapes do not match".to_string(),
                });
            }
        }

        let device = Self::resolve_device(request.device);
        let full_footprint = match &entry {
            LoaderEntry::Model(builder) => builder.footprint,
            LoaderEntry::Pipeline { footprint, .. } => *footprint,
            LoaderEntry::Missing => return Err(ModelError::NotFound(name.to_string())),
        };
        let footprint = if request.load_8bit {
            full_footprint.div_ceil(2)
        } else {
            full_footprint
        };

        if device.is_accelerator() {
            let in_use = self.allocated(device);
            if in_use + footprint > self.capacity {
                return Err(ModelError::Allocation {
                    device,
                    message: format!(
                        "requested {} with {} of {} in use",
                        footprint, in_use, self.capacity
                    ),
                });
            }
        }

        let residency = Arc::new(Residency::default());
        let kind = match entry {
            LoaderEntry::Model(builder) => builder
                .instantiate(Arc::clone(&residency))
                .map_err(|e| ModelError::new(e.to_string()))?
                .into_kind(),
            LoaderEntry::Pipeline { output, .. } => ModelKind::pipeline(Arc::new(ScriptedPipeline {
                output,
                residency: Arc::clone(&residency),
                runs: AtomicUsize::new(0),
            })),
            LoaderEntry::Missing => return Err(ModelError::NotFound(name.to_string())),
        };

        if device.is_accelerator() {
            self.allocations
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Allocation {
                    name: name.to_string(),
                    device,
                    footprint,
                    residency: Arc::downgrade(&residency),
                });
        }
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.to_string(), Arc::downgrade(&residency)));

        Ok(ModelHandle::new(name, kind, device)
            .with_adapter_weights(request.adapter_weights.clone()))
    }

    async fn reclaim_memory(&self, device: Device) {
        self.reclaims.fetch_add(1, Ordering::SeqCst);
        let mut allocations = self
            .allocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        allocations.retain(|a| {
            let keep = a.device != device || !a.is_reclaimable();
            if !keep {
                tracing::trace!(model = %a.name, %device, footprint = a.footprint, "Reclaimed device memory");
            }
            keep
        });
    }

    fn memory_in_use(&self, device: Device) -> Option<u64> {
        Some(self.allocated(device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_round_trip_with_multibyte_text() {
        let codec = ScriptedCodec::default();
        let text = "<human>: héllo 👋 I am a bot";
        let ids = codec.encode(text).unwrap();
        assert_eq!(codec.decode(&ids, true).unwrap(), text);
    }

    #[test]
    fn test_codec_special_tokens() {
        let codec = ScriptedCodec::default().prepend_pad();
        let mut ids = codec.encode("hi").unwrap();
        assert_eq!(ids[0], PAD_TOKEN);
        ids.push(EOS_TOKEN);
        assert_eq!(codec.decode(&ids, true).unwrap(), "hi");
        assert_eq!(codec.decode(&ids, false).unwrap(), "<pad>hi</s>");
    }

    #[test]
    fn test_newline_marker() {
        let codec = ScriptedCodec::default().newline_marker();
        let ids = codec.encode("\n<human>:").unwrap();
        assert_eq!(ids[0], SPACE_MARKER_TOKEN);
        assert_eq!(ids[1], BYTE_BASE + u32::from(b'\n'));
        assert_eq!(codec.decode(&ids, true).unwrap(), "\n<human>:");
    }

    #[test]
    fn test_model_replays_replies_in_order() {
        let model = ScriptedModel::builder()
            .reply("one")
            .reply("two")
            .build()
            .unwrap();
        let codec = model.codec();
        let params = GenerationParameters::default();

        let first = model.generate(&[], &params, &mut |_| StepControl::Continue).unwrap();
        let second = model.generate(&[], &params, &mut |_| StepControl::Continue).unwrap();
        assert_eq!(codec.decode(&first[0], true).unwrap(), "one");
        assert_eq!(codec.decode(&second[0], true).unwrap(), "two");
        assert_eq!(model.calls(), 2);
    }

    #[test]
    fn test_model_honours_stop_and_failure() {
        let model = ScriptedModel::builder()
            .reply("abcdef")
            .build()
            .unwrap();
        let params = GenerationParameters::default();
        let mut seen = 0;
        let out = model
            .generate(&[], &params, &mut |_| {
                seen += 1;
                if seen == 2 {
                    StepControl::Stop
                } else {
                    StepControl::Continue
                }
            })
            .unwrap();
        assert_eq!(out[0].len(), 2);

        let failing = ScriptedModel::builder()
            .reply("abc")
            .fail_at(1, BackendError::OutOfMemory("boom".into()))
            .build()
            .unwrap();
        let err = failing
            .generate(&[], &params, &mut |_| StepControl::Continue)
            .unwrap_err();
        assert!(matches!(err, BackendError::OutOfMemory(_)));
    }

    #[tokio::test]
    async fn test_loader_requires_reclaim_before_reuse() {
        let loader = ScriptedLoader::new(10)
            .with_model("big", ScriptedModel::builder().reply("x").footprint(8));
        let request = ModelRequest::new("big");

        let first = loader.load(&request).await.unwrap();
        assert_eq!(loader.memory_in_use(Device::Accelerator(0)), Some(8));
        drop(first);

        assert!(matches!(
            loader.load(&request).await,
            Err(ModelError::Allocation { .. })
        ));

        loader.reclaim_memory(Device::Accelerator(0)).await;
        assert_eq!(loader.memory_in_use(Device::Accelerator(0)), Some(0));
        assert!(loader.load(&request).await.is_ok());
    }

    #[tokio::test]
    async fn test_loader_errors() {
        let loader = ScriptedLoader::new(10)
            .with_model("m", ScriptedModel::builder().reply("x"))
            .with_missing("gone")
            .with_rejected_adapter("bad-lora");

        assert!(matches!(
            loader.load(&ModelRequest::new("gone")).await,
            Err(ModelError::NotFound(_))
        ));
        assert!(matches!(
            loader.load(&ModelRequest::new("unknown")).await,
            Err(ModelError::NotFound(_))
        ));
        assert!(matches!(
            loader
                .load(&ModelRequest::new("m").with_adapter_weights("bad-lora"))
                .await,
            Err(ModelError::IncompatibleAdapter { .. })
        ));
    }

    #[test]
    fn test_pipeline_limits_length() {
        let pipeline = ScriptedPipeline::new("a b c d e");
        assert_eq!(pipeline.run("ignored", 3).unwrap(), "a b c");
        assert_eq!(pipeline.runs(), 1);
    }
}
