//! Delta application engine.
//!
//! Applies code deltas to loaded modules through the [`HostRuntime`], runs
//! the discovered update handlers afterwards, and replays buffered deltas
//! onto modules that finish loading later.
//!
//! # Delta ledger
//!
//! Every received delta is buffered per [`ModuleId`]. Each loaded module
//! instance records how many of its module's buffered deltas it has been
//! given, so a delta is applied to an instance at most once no matter how
//! often the same batch arrives or how a batch races a module load.
//!
//! Claiming and patching happen under one patch lock, so every instance
//! receives its module's deltas in the order they were buffered. The host
//! must not report a module load synchronously from inside `apply_patch`.
//!
//! # Handler cache
//!
//! Handler discovery runs lazily and is cached until the next module load.
//! A generation counter keeps a discovery that raced an invalidation from
//! being stored; the next caller simply rediscovers.
//!
//! # Failure
//!
//! A patch rejected by the runtime fails the batch (no rollback of deltas
//! already applied) and marks the engine failed for the rest of the process:
//! later batches are refused and later module loads are not patched.

pub mod handlers;
pub mod host;
pub mod reporter;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::protocol::{
    ModuleId, ResponseLoggingLevel, StaticAssetUpdate, UpdateDelta, UpdateResponse,
};

use handlers::UpdateHandlerActions;
use host::{HandlerArgs, HostRuntime, LoadedModule, ModuleHandle, ModuleLoadSubscription};
use reporter::Reporter;

/// Log entry appended once the engine stops applying changes.
pub const NO_FURTHER_CHANGES: &str = "Further changes won't be applied to this process.";

#[derive(Debug, Default)]
struct DeltaLedger {
    pending: HashMap<ModuleId, Vec<Arc<UpdateDelta>>>,
    applied: HashMap<u64, usize>,
}

impl DeltaLedger {
    fn buffer(&mut self, delta: &UpdateDelta) {
        let buffered = self.pending.entry(delta.module_id).or_default();
        if !buffered.iter().any(|known| known.as_ref() == delta) {
            buffered.push(Arc::new(delta.clone()));
        }
    }

    /// Reserve the buffered deltas `module` has not received yet.
    fn claim(&mut self, module: &dyn LoadedModule) -> Vec<Arc<UpdateDelta>> {
        let Some(buffered) = self.pending.get(&module.module_id()) else {
            return Vec::new();
        };
        let applied = self.applied.entry(module.instance_id()).or_insert(0);
        let claimed = buffered.get(*applied..).unwrap_or_default().to_vec();
        *applied = buffered.len();
        claimed
    }
}

#[derive(Debug, Default)]
struct HandlerCache {
    actions: Mutex<Option<Arc<UpdateHandlerActions>>>,
    generation: AtomicU64,
}

impl HandlerCache {
    fn get_or_discover(
        &self,
        host: &dyn HostRuntime,
        reporter: &Reporter,
    ) -> Arc<UpdateHandlerActions> {
        let generation = self.generation.load(Ordering::SeqCst);
        if let Some(actions) = self.lock().as_ref() {
            return Arc::clone(actions);
        }

        let actions = Arc::new(handlers::discover(host, reporter));
        let mut slot = self.lock();
        if self.generation.load(Ordering::SeqCst) == generation {
            *slot = Some(Arc::clone(&actions));
        }
        actions
    }

    fn invalidate(&self) {
        let mut slot = self.lock();
        self.generation.fetch_add(1, Ordering::SeqCst);
        *slot = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Arc<UpdateHandlerActions>>> {
        self.actions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Applies deltas and runs update handlers for one process.
pub struct DeltaEngine {
    host: Arc<dyn HostRuntime>,
    reporter: Reporter,
    handlers: HandlerCache,
    ledger: Mutex<DeltaLedger>,
    patching: Mutex<()>,
    failed: AtomicBool,
}

impl std::fmt::Debug for DeltaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaEngine")
            .field("failed", &self.failed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl DeltaEngine {
    /// Create an engine over `host`.
    pub fn new(host: Arc<dyn HostRuntime>) -> Self {
        Self {
            host,
            reporter: Reporter::new(),
            handlers: HandlerCache::default(),
            ledger: Mutex::new(DeltaLedger::default()),
            patching: Mutex::new(()),
            failed: AtomicBool::new(false),
        }
    }

    /// Capabilities announced to the server.
    pub fn capabilities(&self) -> String {
        self.host.capabilities()
    }

    /// Whether a patch has been rejected in this process.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Subscribe to the host's module loads.
    ///
    /// The callback holds only a weak reference, so the subscription never
    /// keeps the engine alive. Dropping the returned handle detaches it.
    pub fn observe_module_loads(self: &Arc<Self>) -> ModuleLoadSubscription {
        let engine = Arc::downgrade(self);
        self.host.subscribe_module_loads(Arc::new(move |module: ModuleHandle| {
            if let Some(engine) = engine.upgrade() {
                engine.on_module_loaded(module);
            }
        }))
    }

    /// Apply a batch of code deltas, then run `ClearCache` and
    /// `UpdateApplication` handlers.
    ///
    /// Deltas for modules that are not loaded are kept and applied when the
    /// module loads. A rejected patch stops the batch, skips the handlers and
    /// fails this and every later batch.
    pub fn apply_managed_code_updates(
        &self,
        deltas: &[UpdateDelta],
        level: ResponseLoggingLevel,
    ) -> UpdateResponse {
        if self.has_failed() {
            self.reporter.error(NO_FURTHER_CHANGES);
            return self.respond(false, level);
        }

        self.reporter.verbose(format!("Applying {} delta(s).", deltas.len()));

        for delta in deltas {
            self.lock_ledger().buffer(delta);

            let mut matched = false;
            for module in self.host.loaded_modules() {
                if module.module_id() != delta.module_id {
                    continue;
                }
                matched = true;
                if !self.patch_pending(&module) {
                    return self.respond(false, level);
                }
            }
            if !matched {
                self.reporter.verbose(format!(
                    "Module {} is not loaded; its delta will be applied when it loads.",
                    delta.module_id
                ));
            }
        }

        let actions = self.handlers.get_or_discover(self.host.as_ref(), &self.reporter);
        for action in &actions.clear_cache {
            action.invoke(HandlerArgs::UpdatedTypes(None), &self.reporter);
        }
        for action in &actions.update_application {
            action.invoke(HandlerArgs::UpdatedTypes(None), &self.reporter);
        }

        self.reporter.verbose("Deltas applied.");
        self.respond(true, level)
    }

    /// Run `UpdateContent` handlers for a changed static asset.
    ///
    /// Always succeeds; handler failures are reported as warnings.
    pub fn apply_static_asset_update(
        &self,
        update: &StaticAssetUpdate,
        level: ResponseLoggingLevel,
    ) -> UpdateResponse {
        let actions = self.handlers.get_or_discover(self.host.as_ref(), &self.reporter);
        let args = HandlerArgs::Content {
            assembly_name: &update.assembly_name,
            is_application_project: update.is_application_project,
            relative_path: &update.relative_path,
            contents: update.contents.as_deref().unwrap_or_default(),
        };
        for action in &actions.update_content {
            action.invoke(args, &self.reporter);
        }

        self.reporter.verbose(format!(
            "Static asset '{}' updated ({} handler(s)).",
            update.relative_path,
            actions.update_content.len()
        ));
        self.respond(true, level)
    }

    /// React to a module finishing its load.
    ///
    /// Invalidates the handler cache and applies any buffered deltas the new
    /// instance has not received yet. Log entries go out with the next
    /// response.
    pub fn on_module_loaded(&self, module: ModuleHandle) {
        self.handlers.invalidate();
        if self.has_failed() {
            return;
        }
        log::trace!("[Engine] Module loaded: {}", module.name());
        self.patch_pending(&module);
    }

    /// Patch `module` with everything it has not received yet.
    ///
    /// Returns `false` once the engine has failed, here or on another thread.
    fn patch_pending(&self, module: &ModuleHandle) -> bool {
        let _patching = self.patching.lock().unwrap_or_else(PoisonError::into_inner);
        if self.has_failed() {
            return false;
        }

        let claimed = self.lock_ledger().claim(module.as_ref());
        for delta in &claimed {
            let result = self.host.apply_patch(
                module.as_ref(),
                &delta.metadata_delta,
                &delta.il_delta,
                &delta.pdb_delta,
            );
            if let Err(e) = result {
                self.failed.store(true, Ordering::SeqCst);
                self.reporter.error(format!(
                    "Failed to apply delta to module '{}' ({}): {e}",
                    module.name(),
                    delta.module_id
                ));
                self.reporter.error(NO_FURTHER_CHANGES);
                return false;
            }
        }
        if !claimed.is_empty() {
            self.reporter.verbose(format!(
                "Applied {} delta(s) to module '{}'.",
                claimed.len(),
                module.name()
            ));
        }
        true
    }

    fn respond(&self, success: bool, level: ResponseLoggingLevel) -> UpdateResponse {
        UpdateResponse {
            success,
            log_entries: self.reporter.take_entries(level),
        }
    }

    fn lock_ledger(&self) -> std::sync::MutexGuard<'_, DeltaLedger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
