//! Model lifecycle management.
//!
//! [`ModelLifecycleManager`] owns the active [`ModelHandle`] of each slot and
//! guarantees that at most one handle per slot holds device memory. Each slot
//! sits behind its own `RwLock`:
//!
//! - generation borrows the active handle through a read guard ([`ModelLease`])
//!   for exactly one call;
//! - `load` takes the write guard, so it waits for in-flight calls to finish
//!   and two loads on the same slot never overlap.
//!
//! The previous handle is offloaded, dropped and its memory reclaimed before
//! the loader is asked for the next one. A failed load leaves the slot in an
//! explicit no-model state instead of propagating the error.

pub mod handle;
pub mod loader;

pub use handle::{ModelHandle, ModelSummary};
pub use loader::{ModelError, ModelLoader, ModelRequest, REMOVE_MODEL};

use crate::prompt::PromptConvention;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tracing::{debug, info, warn};

/// Named position holding at most one active handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotId {
    #[default]
    Primary,
    /// Side-by-side comparison model.
    Secondary,
}

impl SlotId {
    fn index(self) -> usize {
        match self {
            SlotId::Primary => 0,
            SlotId::Secondary => 1,
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotId::Primary => f.write_str("primary"),
            SlotId::Secondary => f.write_str("secondary"),
        }
    }
}

/// Contents of a slot.
#[derive(Debug, Default)]
pub enum SlotState {
    #[default]
    Empty,
    Active(ModelHandle),
    /// The last load failed.
    NoModel { reason: String },
}

/// A slot without a usable model, with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("No model in {slot} slot: {reason}")]
pub struct DegradedState {
    pub slot: SlotId,
    pub reason: String,
}

/// Serializable view of a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SlotStatus {
    Empty,
    Active(ModelSummary),
    NoModel { reason: String },
}

/// Borrowed access to a slot's active handle for the duration of one call.
pub type ModelLease = OwnedRwLockReadGuard<SlotState, ModelHandle>;

const NOTHING_LOADED: &str = "no model is loaded";

/// Loads, swaps and releases model handles, one per slot.
pub struct ModelLifecycleManager {
    loader: Arc<dyn ModelLoader>,
    slots: [Arc<RwLock<SlotState>>; 2],
    conventions: HashMap<String, PromptConvention>,
    last_convention: Mutex<HashMap<SlotId, PromptConvention>>,
    debug: bool,
}

impl ModelLifecycleManager {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            slots: [
                Arc::new(RwLock::new(SlotState::Empty)),
                Arc::new(RwLock::new(SlotState::Empty)),
            ],
            conventions: HashMap::new(),
            last_convention: Mutex::new(HashMap::new()),
            debug: false,
        }
    }

    /// Model-name to convention table used when a request names no convention.
    /// Keys are matched case-insensitively.
    pub fn with_conventions(mut self, conventions: HashMap<String, PromptConvention>) -> Self {
        self.conventions = conventions
            .into_iter()
            .map(|(name, convention)| (name.to_lowercase(), convention))
            .collect();
        self
    }

    /// Log device memory readings around every swap.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    fn cell(&self, slot: SlotId) -> &Arc<RwLock<SlotState>> {
        &self.slots[slot.index()]
    }

    /// Replace the slot's handle with one built from `request`.
    ///
    /// Waits for outstanding leases on the slot. A removal request, or any
    /// load failure, leaves the slot without a model and reports why.
    pub async fn load(
        &self,
        slot: SlotId,
        request: ModelRequest,
    ) -> Result<ModelSummary, DegradedState> {
        let mut state = self.cell(slot).write().await;

        if let SlotState::Active(previous) = std::mem::take(&mut *state) {
            self.release(slot, previous).await;
        }

        if request.is_removal() {
            info!(%slot, "Model slot cleared");
            return Err(DegradedState {
                slot,
                reason: NOTHING_LOADED.to_string(),
            });
        }

        info!(%slot, model = %request.base_model, adapter = ?request.adapter_weights, "Loading model");
        match self.loader.load(&request).await {
            Ok(mut handle) => {
                let convention = self.resolve_convention(slot, &request);
                handle.set_convention(convention);
                if let Ok(mut last) = self.last_convention.lock() {
                    last.insert(slot, convention);
                }
                if self.debug {
                    debug!(%slot, device = %handle.device(), in_use = ?self.loader.memory_in_use(handle.device()), "Device memory after load");
                }
                let summary = handle.summary();
                info!(%slot, model = %summary.name, device = %summary.device, ?convention, "Model loaded");
                *state = SlotState::Active(handle);
                Ok(summary)
            }
            Err(e) => {
                warn!(%slot, model = %request.base_model, error = %e, "Model load failed, slot left without a model");
                let reason = e.to_string();
                *state = SlotState::NoModel {
                    reason: reason.clone(),
                };
                Err(DegradedState { slot, reason })
            }
        }
    }

    async fn release(&self, slot: SlotId, handle: ModelHandle) {
        let device = handle.device();
        let name = handle.name().to_string();
        if self.debug {
            debug!(%slot, %device, in_use = ?self.loader.memory_in_use(device), "Device memory before release");
        }
        if let Err(e) = handle.kind().offload() {
            warn!(%slot, model = %name, error = %e, "Failed to move model off the accelerator");
        }
        drop(handle);
        self.loader.reclaim_memory(device).await;
        if self.debug {
            debug!(%slot, %device, in_use = ?self.loader.memory_in_use(device), "Device memory after release");
        }
        info!(%slot, model = %name, "Model released");
    }

    fn resolve_convention(&self, slot: SlotId, request: &ModelRequest) -> PromptConvention {
        if let Some(convention) = self.conventions.get(&request.base_model.to_lowercase()) {
            return *convention;
        }
        if let Some(convention) = request.convention {
            return convention;
        }
        self.last_convention
            .lock()
            .ok()
            .and_then(|last| last.get(&slot).copied())
            .unwrap_or_default()
    }

    /// Free the slot.
    pub async fn unload(&self, slot: SlotId) {
        let _ = self.load(slot, ModelRequest::remove()).await;
    }

    /// Borrow the slot's active handle.
    pub async fn lease(&self, slot: SlotId) -> Result<ModelLease, DegradedState> {
        let guard = Arc::clone(self.cell(slot)).read_owned().await;
        OwnedRwLockReadGuard::try_map(guard, |state| match state {
            SlotState::Active(handle) => Some(handle),
            _ => None,
        })
        .map_err(|guard| DegradedState {
            slot,
            reason: match &*guard {
                SlotState::NoModel { reason } => reason.clone(),
                _ => NOTHING_LOADED.to_string(),
            },
        })
    }

    pub async fn active_name(&self, slot: SlotId) -> Option<String> {
        match &*self.cell(slot).read().await {
            SlotState::Active(handle) => Some(handle.name().to_string()),
            _ => None,
        }
    }

    pub async fn status(&self, slot: SlotId) -> SlotStatus {
        match &*self.cell(slot).read().await {
            SlotState::Empty => SlotStatus::Empty,
            SlotState::Active(handle) => SlotStatus::Active(handle.summary()),
            SlotState::NoModel { reason } => SlotStatus::NoModel {
                reason: reason.clone(),
            },
        }
    }

    /// Release every slot.
    pub async fn shutdown(&self) {
        for slot in [SlotId::Primary, SlotId::Secondary] {
            let mut state = self.cell(slot).write().await;
            if let SlotState::Active(handle) = std::mem::take(&mut *state) {
                self.release(slot, handle).await;
            }
        }
    }
}

impl fmt::Debug for ModelLifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelLifecycleManager")
            .field("conventions", &self.conventions)
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Device, ScriptedLoader, ScriptedModel};
    use std::time::Duration;

    fn loader() -> Arc<ScriptedLoader> {
        Arc::new(
            ScriptedLoader::new(100)
                .with_model("m1", ScriptedModel::builder().reply("one").footprint(60))
                .with_model("m2", ScriptedModel::builder().reply("two").footprint(60))
                .with_missing("broken"),
        )
    }

    #[tokio::test]
    async fn test_second_load_replaces_first() {
        let loader = loader();
        let manager = ModelLifecycleManager::new(loader.clone());

        manager
            .load(SlotId::Primary, ModelRequest::new("m1"))
            .await
            .unwrap();
        manager
            .load(SlotId::Primary, ModelRequest::new("m2"))
            .await
            .unwrap();

        assert_eq!(
            manager.active_name(SlotId::Primary).await.as_deref(),
            Some("m2")
        );
        assert_eq!(loader.live_instances("m1"), 0);
        assert_eq!(loader.live_instances("m2"), 1);
        assert_eq!(loader.reclaim_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_load_degrades_slot() {
        let manager = ModelLifecycleManager::new(loader());
        manager
            .load(SlotId::Primary, ModelRequest::new("m1"))
            .await
            .unwrap();

        let degraded = manager
            .load(SlotId::Primary, ModelRequest::new("broken"))
            .await
            .unwrap_err();
        assert_eq!(degraded.slot, SlotId::Primary);
        assert!(degraded.reason.contains("broken"));

        assert!(matches!(
            manager.status(SlotId::Primary).await,
            SlotStatus::NoModel { .. }
        ));
        let err = manager.lease(SlotId::Primary).await.unwrap_err();
        assert_eq!(err.reason, degraded.reason);
    }

    #[tokio::test]
    async fn test_removal_sentinel_frees_slot() {
        let loader = loader();
        let manager = ModelLifecycleManager::new(loader.clone());
        manager
            .load(SlotId::Primary, ModelRequest::new("m1"))
            .await
            .unwrap();

        assert!(manager
            .load(SlotId::Primary, ModelRequest::remove())
            .await
            .is_err());
        assert_eq!(manager.status(SlotId::Primary).await, SlotStatus::Empty);
        assert_eq!(loader.live_instances("m1"), 0);
        assert_eq!(loader.memory_in_use(Device::Accelerator(0)), Some(0));
    }

    #[tokio::test]
    async fn test_slots_are_independent() {
        let loader = Arc::new(
            ScriptedLoader::new(1000)
                .with_model("m1", ScriptedModel::builder().reply("one"))
                .with_model("m2", ScriptedModel::builder().reply("two")),
        );
        let manager = ModelLifecycleManager::new(loader);
        manager
            .load(SlotId::Primary, ModelRequest::new("m1"))
            .await
            .unwrap();
        manager
            .load(SlotId::Secondary, ModelRequest::new("m2"))
            .await
            .unwrap();

        assert_eq!(manager.active_name(SlotId::Primary).await.as_deref(), Some("m1"));
        assert_eq!(manager.active_name(SlotId::Secondary).await.as_deref(), Some("m2"));
    }

    #[tokio::test]
    async fn test_load_waits_for_outstanding_lease() {
        let manager = Arc::new(ModelLifecycleManager::new(loader()));
        manager
            .load(SlotId::Primary, ModelRequest::new("m1"))
            .await
            .unwrap();

        let lease = manager.lease(SlotId::Primary).await.unwrap();
        let swapper = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.load(SlotId::Primary, ModelRequest::new("m2")).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!swapper.is_finished());
        assert_eq!(lease.name(), "m1");

        drop(lease);
        let summary = swapper.await.unwrap().unwrap();
        assert_eq!(summary.name, "m2");
    }

    #[tokio::test]
    async fn test_convention_resolution_order() {
        let mut table = HashMap::new();
        table.insert("M1".to_string(), PromptConvention::HumanBot);
        let manager = ModelLifecycleManager::new(loader()).with_conventions(table);

        let summary = manager
            .load(
                SlotId::Primary,
                ModelRequest::new("m1").with_convention(PromptConvention::Instruct),
            )
            .await
            .unwrap();
        assert_eq!(summary.convention, PromptConvention::HumanBot);

        let summary = manager
            .load(
                SlotId::Primary,
                ModelRequest::new("m2").with_convention(PromptConvention::InstructVicuna),
            )
            .await
            .unwrap();
        assert_eq!(summary.convention, PromptConvention::InstructVicuna);

        let summary = manager
            .load(SlotId::Primary, ModelRequest::new("m1").with_8bit(true))
            .await
            .unwrap();
        assert_eq!(summary.convention, PromptConvention::HumanBot);

        let summary = manager
            .load(SlotId::Primary, ModelRequest::new("m2"))
            .await
            .unwrap();
        assert_eq!(summary.convention, PromptConvention::HumanBot);
    }
}
