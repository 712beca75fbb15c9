//! Tests for the delta application engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use uuid::Uuid;

use super::handlers::{discover, topological_sort};
use super::host::{
    AttributeArg, AttributeData, HandlerArgs, HostRuntime, LoadedModule, MethodSignature,
    ModuleHandle, ModuleLoadCallback, ModuleLoadSubscription, ParamType, PatchRejected,
    StaticMethod, TypeRef,
};
use super::reporter::Reporter;
use super::*;
use crate::constants::UPDATE_HANDLER_ATTRIBUTE;
use crate::protocol::{MessageSeverity, ModuleId};

// === Fake host ===

struct FakeModule {
    instance: u64,
    id: ModuleId,
    name: String,
    references: Vec<String>,
    attributes: Vec<AttributeData>,
}

impl LoadedModule for FakeModule {
    fn instance_id(&self) -> u64 {
        self.instance
    }

    fn module_id(&self) -> ModuleId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn referenced_modules(&self) -> Vec<String> {
        self.references.clone()
    }

    fn custom_attributes(&self) -> Vec<AttributeData> {
        self.attributes.clone()
    }
}

/// Holds `apply_patch` for one delta until the test releases it.
struct PatchGate {
    marker: u8,
    entered: mpsc::Sender<()>,
    release: mpsc::Receiver<()>,
}

#[derive(Default)]
struct FakeHost {
    modules: Mutex<Vec<ModuleHandle>>,
    methods: Mutex<HashMap<String, Vec<StaticMethod>>>,
    /// (instance id, metadata delta) per successful patch.
    patches: Mutex<Vec<(u64, Vec<u8>)>>,
    reject_patches: Mutex<bool>,
    /// Reject only the delta with this metadata marker.
    reject_marker: Mutex<Option<u8>>,
    gate: Mutex<Option<PatchGate>>,
    subscribers: Arc<Mutex<HashMap<u64, ModuleLoadCallback>>>,
    next_subscriber: AtomicU64,
}

impl FakeHost {
    fn add_module(&self, module: FakeModule) -> ModuleHandle {
        let handle: ModuleHandle = Arc::new(module);
        self.modules.lock().unwrap().push(Arc::clone(&handle));
        handle
    }

    /// Add a module and notify subscribers, like a runtime finishing a load.
    fn load(&self, module: FakeModule) {
        let handle = self.add_module(module);
        let callbacks: Vec<_> = self.subscribers.lock().unwrap().values().cloned().collect();
        for callback in callbacks {
            callback(Arc::clone(&handle));
        }
    }

    fn add_methods(&self, type_name: &str, methods: Vec<StaticMethod>) {
        self.methods
            .lock()
            .unwrap()
            .insert(type_name.to_string(), methods);
    }

    fn patch_count(&self) -> usize {
        self.patches.lock().unwrap().len()
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

impl HostRuntime for FakeHost {
    fn capabilities(&self) -> String {
        "Baseline AddMethodToExistingType".to_string()
    }

    fn loaded_modules(&self) -> Vec<ModuleHandle> {
        self.modules.lock().unwrap().clone()
    }

    fn apply_patch(
        &self,
        module: &dyn LoadedModule,
        metadata_delta: &[u8],
        _il_delta: &[u8],
        _pdb_delta: &[u8],
    ) -> Result<(), PatchRejected> {
        let gate = {
            let mut slot = self.gate.lock().unwrap();
            if slot.as_ref().is_some_and(|g| metadata_delta == [g.marker]) {
                slot.take()
            } else {
                None
            }
        };
        if let Some(gate) = gate {
            gate.entered.send(()).unwrap();
            gate.release.recv().unwrap();
        }

        let rejected_marker = *self.reject_marker.lock().unwrap();
        if *self.reject_patches.lock().unwrap()
            || rejected_marker.is_some_and(|m| metadata_delta == [m])
        {
            return Err(PatchRejected::new("edit not supported"));
        }
        self.patches
            .lock()
            .unwrap()
            .push((module.instance_id(), metadata_delta.to_vec()));
        Ok(())
    }

    fn static_methods(&self, ty: &TypeRef) -> Vec<StaticMethod> {
        self.methods
            .lock()
            .unwrap()
            .get(&ty.full_name)
            .cloned()
            .unwrap_or_default()
    }

    fn subscribe_module_loads(&self, callback: ModuleLoadCallback) -> ModuleLoadSubscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().unwrap().insert(id, callback);
        let subscribers = Arc::clone(&self.subscribers);
        ModuleLoadSubscription::new(move || {
            subscribers.lock().unwrap().remove(&id);
        })
    }
}

// === Helpers ===

type CallLog = Arc<Mutex<Vec<String>>>;

fn module_id(n: u8) -> ModuleId {
    ModuleId(Uuid::from_bytes([n; 16]))
}

fn module(instance: u64, id: u8, name: &str, references: &[&str]) -> FakeModule {
    FakeModule {
        instance,
        id: module_id(id),
        name: name.to_string(),
        references: references.iter().map(|r| r.to_string()).collect(),
        attributes: Vec::new(),
    }
}

fn with_handler(mut module: FakeModule, type_name: &str) -> FakeModule {
    let ty = TypeRef::new(type_name, module.name.clone());
    module.attributes.push(AttributeData::new(
        UPDATE_HANDLER_ATTRIBUTE,
        vec![AttributeArg::Type(ty)],
    ));
    module
}

fn recording_method(name: &str, signature: MethodSignature, tag: &str, log: &CallLog) -> StaticMethod {
    let log = Arc::clone(log);
    let tag = tag.to_string();
    StaticMethod {
        name: name.to_string(),
        signature,
        callable: Arc::new(move |_args: HandlerArgs<'_>| -> anyhow::Result<()> {
            log.lock().unwrap().push(tag.clone());
            Ok(())
        }),
    }
}

fn cache_and_update(type_name: &str, log: &CallLog) -> Vec<StaticMethod> {
    vec![
        recording_method(
            "ClearCache",
            MethodSignature::type_array_action(),
            &format!("{type_name}.ClearCache"),
            log,
        ),
        recording_method(
            "UpdateApplication",
            MethodSignature::type_array_action(),
            &format!("{type_name}.UpdateApplication"),
            log,
        ),
    ]
}

fn delta(id: u8, marker: u8) -> UpdateDelta {
    UpdateDelta {
        module_id: module_id(id),
        metadata_delta: vec![marker],
        il_delta: vec![marker, marker],
        pdb_delta: Vec::new(),
        updated_types: Vec::new(),
    }
}

fn engine(host: &Arc<FakeHost>) -> Arc<DeltaEngine> {
    Arc::new(DeltaEngine::new(Arc::clone(host) as Arc<dyn HostRuntime>))
}

fn messages(response: &UpdateResponse, severity: MessageSeverity) -> Vec<String> {
    response
        .log_entries
        .iter()
        .filter(|e| e.severity == severity)
        .map(|e| e.message.clone())
        .collect()
}

// === Topological order ===

#[test]
fn test_dependencies_sorted_before_dependents() {
    let modules: Vec<ModuleHandle> = vec![
        Arc::new(module(1, 1, "App", &["Web", "Core", "System.Runtime"])),
        Arc::new(module(2, 2, "Web", &["Core"])),
        Arc::new(module(3, 3, "Core", &[])),
    ];
    let order: Vec<_> = topological_sort(&modules)
        .iter()
        .map(|m| m.name().to_string())
        .collect();
    assert_eq!(order, ["Core", "Web", "App"]);
}

#[test]
fn test_cycle_visits_each_module_once() {
    let modules: Vec<ModuleHandle> = vec![
        Arc::new(module(1, 1, "A", &["B"])),
        Arc::new(module(2, 2, "B", &["A"])),
        Arc::new(module(3, 3, "C", &["C"])),
    ];
    let order: Vec<_> = topological_sort(&modules)
        .iter()
        .map(|m| m.name().to_string())
        .collect();
    assert_eq!(order, ["B", "A", "C"]);
}

#[test]
fn test_duplicate_module_name_sorted_once() {
    let modules: Vec<ModuleHandle> = vec![
        Arc::new(module(1, 1, "Lib", &[])),
        Arc::new(module(2, 1, "Lib", &[])),
    ];
    let order = topological_sort(&modules);
    assert_eq!(order.len(), 1);
    assert_eq!(order[0].instance_id(), 1);
}

/// Handlers run ClearCache across all modules first, then UpdateApplication,
/// each list in dependency order.
#[test]
fn test_handlers_run_in_dependency_order() {
    let host = Arc::new(FakeHost::default());
    let log = CallLog::default();
    host.add_module(with_handler(module(1, 1, "App", &["Core", "Web"]), "App.Handler"));
    host.add_module(with_handler(module(2, 2, "Web", &["Core"]), "Web.Handler"));
    host.add_module(with_handler(module(3, 3, "Core", &[]), "Core.Handler"));
    for name in ["App.Handler", "Web.Handler", "Core.Handler"] {
        host.add_methods(name, cache_and_update(name, &log));
    }

    let response = engine(&host).apply_managed_code_updates(&[delta(1, 7)], ResponseLoggingLevel::Verbose);
    assert!(response.success);
    assert_eq!(
        *log.lock().unwrap(),
        [
            "Core.Handler.ClearCache",
            "Web.Handler.ClearCache",
            "App.Handler.ClearCache",
            "Core.Handler.UpdateApplication",
            "Web.Handler.UpdateApplication",
            "App.Handler.UpdateApplication",
        ]
    );
}

// === Discovery ===

/// A type with only ClearCache registers one action and no diagnostics.
#[test]
fn test_partial_handler_type_is_not_diagnosed() {
    let host = FakeHost::default();
    let log = CallLog::default();
    host.add_module(with_handler(module(1, 1, "App", &[]), "Foo"));
    host.add_methods(
        "Foo",
        vec![recording_method("ClearCache", MethodSignature::type_array_action(), "Foo", &log)],
    );

    let reporter = Reporter::new();
    let actions = discover(&host, &reporter);
    assert_eq!(actions.clear_cache.len(), 1);
    assert!(actions.update_application.is_empty());
    assert!(actions.update_content.is_empty());
    assert!(reporter.take_entries(ResponseLoggingLevel::WarningsAndErrors).is_empty());
}

#[test]
fn test_handler_type_without_methods_is_diagnosed() {
    let host = FakeHost::default();
    host.add_module(with_handler(module(1, 1, "App", &[]), "App.Empty"));

    let reporter = Reporter::new();
    let actions = discover(&host, &reporter);
    assert!(actions.is_empty());

    let entries = reporter.take_entries(ResponseLoggingLevel::WarningsAndErrors);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].severity, MessageSeverity::Warning);
    assert_eq!(
        entries[0].message,
        "Expected to find a static method 'ClearCache', 'UpdateApplication' or 'UpdateContent' \
         on type 'App.Empty' but neither exists."
    );
}

#[test]
fn test_wrong_signature_is_diagnosed_and_skipped() {
    let host = FakeHost::default();
    let log = CallLog::default();
    host.add_module(with_handler(module(1, 1, "App", &[]), "App.Typo"));
    host.add_methods(
        "App.Typo",
        vec![
            recording_method(
                "UpdateApplication",
                MethodSignature {
                    parameters: vec![ParamType::Other("System.Object".into())],
                    returns_void: true,
                },
                "bad",
                &log,
            ),
            recording_method(
                "ClearCache",
                MethodSignature {
                    parameters: vec![ParamType::TypeArray],
                    returns_void: false,
                },
                "bad",
                &log,
            ),
        ],
    );

    let reporter = Reporter::new();
    let actions = discover(&host, &reporter);
    assert!(actions.is_empty());

    let warnings: Vec<_> = reporter
        .take_entries(ResponseLoggingLevel::WarningsAndErrors)
        .into_iter()
        .map(|e| e.message)
        .collect();
    assert_eq!(warnings.len(), 2, "{warnings:?}");
    assert!(warnings.iter().all(|w| w.contains("does not match the required signature")));
    // A matching name exists, so the "neither exists" diagnostic is not emitted.
    assert!(!warnings.iter().any(|w| w.contains("neither exists")));
}

#[test]
fn test_overload_with_matching_signature_is_chosen() {
    let host = FakeHost::default();
    let log = CallLog::default();
    host.add_module(with_handler(module(1, 1, "App", &[]), "App.Overloads"));
    host.add_methods(
        "App.Overloads",
        vec![
            recording_method(
                "ClearCache",
                MethodSignature {
                    parameters: Vec::new(),
                    returns_void: true,
                },
                "no-args",
                &log,
            ),
            recording_method("ClearCache", MethodSignature::type_array_action(), "typed", &log),
        ],
    );

    let reporter = Reporter::new();
    let actions = discover(&host, &reporter);
    assert_eq!(actions.clear_cache.len(), 1);
    actions.clear_cache[0].invoke(HandlerArgs::UpdatedTypes(None), &reporter);
    assert_eq!(*log.lock().unwrap(), ["typed"]);
    assert!(reporter.take_entries(ResponseLoggingLevel::WarningsAndErrors).is_empty());
}

#[test]
fn test_marker_with_bad_argument_is_skipped() {
    let host = FakeHost::default();
    let mut app = module(1, 1, "App", &[]);
    app.attributes.push(AttributeData::new(
        UPDATE_HANDLER_ATTRIBUTE,
        vec![AttributeArg::String("App.Handler".into())],
    ));
    app.attributes.push(AttributeData::new(UPDATE_HANDLER_ATTRIBUTE, Vec::new()));
    host.add_module(app);

    let reporter = Reporter::new();
    assert!(discover(&host, &reporter).is_empty());
    let warnings = reporter.take_entries(ResponseLoggingLevel::WarningsAndErrors);
    assert_eq!(warnings.len(), 2);
    assert!(warnings[0].message.contains("must have a single type argument"));
}

#[test]
fn test_marker_matched_by_name_only() {
    let host = FakeHost::default();
    let log = CallLog::default();
    let mut app = module(1, 1, "App", &[]);
    let handler = TypeRef::new("App.Handler", "App");
    // Same simple name, different namespace: not the marker.
    app.attributes.push(AttributeData::new(
        "Custom.MetadataUpdateHandlerAttribute",
        vec![AttributeArg::Type(handler.clone())],
    ));
    host.add_module(app);
    host.add_methods("App.Handler", cache_and_update("App.Handler", &log));

    let reporter = Reporter::new();
    assert!(discover(&host, &reporter).is_empty());
}

// === Handler isolation ===

#[test]
fn test_failing_handlers_do_not_stop_the_rest() {
    let host = Arc::new(FakeHost::default());
    let log = CallLog::default();
    host.add_module(with_handler(module(1, 1, "App", &[]), "App.Handler"));

    let after_error = Arc::clone(&log);
    let after_panic = Arc::clone(&log);
    host.add_methods(
        "App.Handler",
        vec![
            StaticMethod {
                name: "ClearCache".into(),
                signature: MethodSignature::type_array_action(),
                callable: Arc::new(move |_: HandlerArgs<'_>| -> anyhow::Result<()> {
                    after_error.lock().unwrap().push("clear".into());
                    anyhow::bail!("cache is locked")
                }),
            },
            StaticMethod {
                name: "UpdateApplication".into(),
                signature: MethodSignature::type_array_action(),
                callable: Arc::new(move |_: HandlerArgs<'_>| -> anyhow::Result<()> {
                    after_panic.lock().unwrap().push("update".into());
                    panic!("render failed")
                }),
            },
        ],
    );
    let other = with_handler(module(2, 2, "Other", &["App"]), "Other.Handler");
    host.add_module(other);
    host.add_methods("Other.Handler", cache_and_update("Other.Handler", &log));

    let response =
        engine(&host).apply_managed_code_updates(&[delta(1, 1)], ResponseLoggingLevel::WarningsAndErrors);
    assert!(response.success);
    assert_eq!(
        *log.lock().unwrap(),
        [
            "clear",
            "Other.Handler.ClearCache",
            "update",
            "Other.Handler.UpdateApplication"
        ]
    );

    let warnings = messages(&response, MessageSeverity::Warning);
    assert_eq!(
        warnings,
        [
            "Exception from 'App.Handler.ClearCache': cache is locked",
            "Exception from 'App.Handler.UpdateApplication': render failed",
        ]
    );
}

// === Managed code updates ===

/// Only the loaded module is patched; the other delta is skipped quietly.
#[test]
fn test_unloaded_module_is_skipped_without_error() {
    let host = Arc::new(FakeHost::default());
    host.add_module(module(10, 0x11, "Loaded", &[]));

    let response = engine(&host).apply_managed_code_updates(
        &[delta(0x11, 1), delta(0x22, 2)],
        ResponseLoggingLevel::Verbose,
    );
    assert!(response.success);
    assert_eq!(*host.patches.lock().unwrap(), [(10, vec![1])]);
    assert!(messages(&response, MessageSeverity::Error).is_empty());
    assert!(messages(&response, MessageSeverity::Warning).is_empty());
    assert!(messages(&response, MessageSeverity::Verbose).contains(&"Deltas applied.".to_string()));
}

#[test]
fn test_repeated_batch_patches_once() {
    let host = Arc::new(FakeHost::default());
    host.add_module(module(10, 1, "Lib", &[]));
    let engine = engine(&host);

    let batch = [delta(1, 5)];
    assert!(engine.apply_managed_code_updates(&batch, ResponseLoggingLevel::Verbose).success);
    assert!(engine.apply_managed_code_updates(&batch, ResponseLoggingLevel::Verbose).success);
    assert_eq!(host.patch_count(), 1);

    // A new delta for the same module is still applied.
    engine.apply_managed_code_updates(&[delta(1, 6)], ResponseLoggingLevel::Verbose);
    assert_eq!(*host.patches.lock().unwrap(), [(10, vec![5]), (10, vec![6])]);
}

#[test]
fn test_each_loaded_instance_is_patched() {
    let host = Arc::new(FakeHost::default());
    host.add_module(module(10, 1, "Lib", &[]));
    host.add_module(module(11, 1, "Lib", &[]));

    engine(&host).apply_managed_code_updates(&[delta(1, 3), delta(1, 4)], ResponseLoggingLevel::Verbose);
    assert_eq!(
        *host.patches.lock().unwrap(),
        [(10, vec![3]), (11, vec![3]), (10, vec![4]), (11, vec![4])]
    );
}

#[test]
fn test_deltas_applied_in_received_order() {
    let host = Arc::new(FakeHost::default());
    host.add_module(module(10, 1, "A", &[]));
    host.add_module(module(20, 2, "B", &[]));

    let response = engine(&host).apply_managed_code_updates(
        &[delta(1, 1), delta(2, 2), delta(1, 3)],
        ResponseLoggingLevel::Verbose,
    );
    assert!(response.success);
    assert_eq!(
        *host.patches.lock().unwrap(),
        [(10, vec![1]), (20, vec![2]), (10, vec![3])]
    );
}

/// Deltas before the rejected one are applied, including other modules'.
#[test]
fn test_rejection_stops_at_the_rejected_delta() {
    let host = Arc::new(FakeHost::default());
    host.add_module(module(10, 1, "A", &[]));
    host.add_module(module(20, 2, "B", &[]));
    *host.reject_marker.lock().unwrap() = Some(3);

    let response = engine(&host).apply_managed_code_updates(
        &[delta(1, 1), delta(2, 2), delta(1, 3), delta(2, 4)],
        ResponseLoggingLevel::WarningsAndErrors,
    );
    assert!(!response.success);
    assert_eq!(*host.patches.lock().unwrap(), [(10, vec![1]), (20, vec![2])]);
}

#[test]
fn test_rejected_patch_fails_batch_and_later_batches() {
    let host = Arc::new(FakeHost::default());
    let log = CallLog::default();
    host.add_module(with_handler(module(10, 1, "Lib", &[]), "Lib.Handler"));
    host.add_methods("Lib.Handler", cache_and_update("Lib.Handler", &log));
    *host.reject_patches.lock().unwrap() = true;
    let engine = engine(&host);

    let response =
        engine.apply_managed_code_updates(&[delta(1, 1)], ResponseLoggingLevel::WarningsAndErrors);
    assert!(!response.success);
    assert!(engine.has_failed());
    let errors = messages(&response, MessageSeverity::Error);
    assert!(errors[0].contains("edit not supported"), "{errors:?}");
    assert_eq!(errors.last().map(String::as_str), Some(NO_FURTHER_CHANGES));
    // Handlers do not run for a failed batch.
    assert!(log.lock().unwrap().is_empty());

    *host.reject_patches.lock().unwrap() = false;
    let response =
        engine.apply_managed_code_updates(&[delta(1, 2)], ResponseLoggingLevel::WarningsAndErrors);
    assert!(!response.success);
    assert_eq!(messages(&response, MessageSeverity::Error), [NO_FURTHER_CHANGES]);
    assert_eq!(host.patch_count(), 0);
}

#[test]
fn test_empty_batch_runs_handlers() {
    let host = Arc::new(FakeHost::default());
    let log = CallLog::default();
    host.add_module(with_handler(module(1, 1, "App", &[]), "App.Handler"));
    host.add_methods("App.Handler", cache_and_update("App.Handler", &log));

    let response = engine(&host).apply_managed_code_updates(&[], ResponseLoggingLevel::WarningsAndErrors);
    assert!(response.success);
    assert!(response.log_entries.is_empty());
    assert_eq!(log.lock().unwrap().len(), 2);
}

// === Module loads ===

/// A delta received before its module loads is applied on load.
#[test]
fn test_buffered_delta_applied_when_module_loads() {
    let host = Arc::new(FakeHost::default());
    let engine = engine(&host);
    let _subscription = engine.observe_module_loads();

    let response = engine.apply_managed_code_updates(&[delta(3, 9)], ResponseLoggingLevel::Verbose);
    assert!(response.success);
    assert_eq!(host.patch_count(), 0);

    host.load(module(30, 3, "Late", &[]));
    assert_eq!(*host.patches.lock().unwrap(), [(30, vec![9])]);

    // The batch arriving again does not patch the instance a second time.
    engine.apply_managed_code_updates(&[delta(3, 9)], ResponseLoggingLevel::Verbose);
    assert_eq!(host.patch_count(), 1);
}

#[test]
fn test_repeated_load_notification_patches_once() {
    let host = Arc::new(FakeHost::default());
    let engine = engine(&host);
    engine.apply_managed_code_updates(&[delta(3, 9)], ResponseLoggingLevel::Verbose);

    let late: ModuleHandle = Arc::new(module(30, 3, "Late", &[]));
    engine.on_module_loaded(Arc::clone(&late));
    engine.on_module_loaded(late);
    assert_eq!(host.patch_count(), 1);
}

#[test]
fn test_module_load_refreshes_handler_cache() {
    let host = Arc::new(FakeHost::default());
    let log = CallLog::default();
    let engine = engine(&host);
    let _subscription = engine.observe_module_loads();

    engine.apply_managed_code_updates(&[], ResponseLoggingLevel::Verbose);
    assert!(log.lock().unwrap().is_empty());

    host.add_methods("Plugin.Handler", cache_and_update("Plugin.Handler", &log));
    host.load(with_handler(module(5, 5, "Plugin", &[]), "Plugin.Handler"));

    engine.apply_managed_code_updates(&[], ResponseLoggingLevel::Verbose);
    assert_eq!(
        *log.lock().unwrap(),
        ["Plugin.Handler.ClearCache", "Plugin.Handler.UpdateApplication"]
    );
}

#[test]
fn test_failed_engine_does_not_patch_on_load() {
    let host = Arc::new(FakeHost::default());
    host.add_module(module(10, 1, "Lib", &[]));
    *host.reject_patches.lock().unwrap() = true;
    let engine = engine(&host);
    let _subscription = engine.observe_module_loads();

    engine.apply_managed_code_updates(&[delta(1, 1)], ResponseLoggingLevel::Verbose);
    *host.reject_patches.lock().unwrap() = false;

    host.load(module(11, 1, "Lib", &[]));
    assert_eq!(host.patch_count(), 0);
}

#[test]
fn test_dropping_subscription_detaches() {
    let host = Arc::new(FakeHost::default());
    let engine = engine(&host);
    let subscription = engine.observe_module_loads();
    assert_eq!(host.subscriber_count(), 1);
    drop(subscription);
    assert_eq!(host.subscriber_count(), 0);

    engine.apply_managed_code_updates(&[delta(3, 9)], ResponseLoggingLevel::Verbose);
    host.load(module(30, 3, "Late", &[]));
    assert_eq!(host.patch_count(), 0);
}

// === Static assets ===

#[test]
fn test_static_asset_passes_content_to_handlers() {
    let host = Arc::new(FakeHost::default());
    let seen: Arc<Mutex<Vec<(String, bool, String, Vec<u8>)>>> = Arc::default();
    let sink = Arc::clone(&seen);
    host.add_module(with_handler(module(1, 1, "App", &[]), "App.Assets"));
    host.add_methods(
        "App.Assets",
        vec![StaticMethod {
            name: "UpdateContent".into(),
            signature: MethodSignature::content_action(),
            callable: Arc::new(move |args: HandlerArgs<'_>| -> anyhow::Result<()> {
                if let HandlerArgs::Content {
                    assembly_name,
                    is_application_project,
                    relative_path,
                    contents,
                } = args
                {
                    sink.lock().unwrap().push((
                        assembly_name.to_string(),
                        is_application_project,
                        relative_path.to_string(),
                        contents.to_vec(),
                    ));
                }
                Ok(())
            }),
        }],
    );
    let engine = engine(&host);

    let changed = StaticAssetUpdate {
        assembly_name: "App".into(),
        relative_path: "css/site.css".into(),
        contents: Some(b"body{}".to_vec()),
        is_application_project: true,
    };
    assert!(engine.apply_static_asset_update(&changed, ResponseLoggingLevel::Verbose).success);

    let deleted = StaticAssetUpdate {
        contents: None,
        ..changed
    };
    assert!(engine.apply_static_asset_update(&deleted, ResponseLoggingLevel::Verbose).success);

    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        [
            ("App".to_string(), true, "css/site.css".to_string(), b"body{}".to_vec()),
            ("App".to_string(), true, "css/site.css".to_string(), Vec::new()),
        ]
    );
}

#[test]
fn test_static_asset_handler_failure_still_succeeds() {
    let host = Arc::new(FakeHost::default());
    host.add_module(with_handler(module(1, 1, "App", &[]), "App.Assets"));
    host.add_methods(
        "App.Assets",
        vec![StaticMethod {
            name: "UpdateContent".into(),
            signature: MethodSignature::content_action(),
            callable: Arc::new(|_: HandlerArgs<'_>| -> anyhow::Result<()> {
                anyhow::bail!("browser went away")
            }),
        }],
    );

    let response = engine(&host).apply_static_asset_update(
        &StaticAssetUpdate {
            assembly_name: "App".into(),
            relative_path: "index.html".into(),
            contents: Some(Vec::new()),
            is_application_project: false,
        },
        ResponseLoggingLevel::WarningsAndErrors,
    );
    assert!(response.success);
    assert_eq!(
        messages(&response, MessageSeverity::Warning),
        ["Exception from 'App.Assets.UpdateContent': browser went away"]
    );
}

#[test]
fn test_static_asset_does_not_run_code_handlers() {
    let host = Arc::new(FakeHost::default());
    let log = CallLog::default();
    host.add_module(with_handler(module(1, 1, "App", &[]), "App.Handler"));
    host.add_methods("App.Handler", cache_and_update("App.Handler", &log));

    let response = engine(&host).apply_static_asset_update(
        &StaticAssetUpdate {
            assembly_name: "App".into(),
            relative_path: "a.js".into(),
            contents: None,
            is_application_project: true,
        },
        ResponseLoggingLevel::WarningsAndErrors,
    );
    assert!(response.success);
    assert!(log.lock().unwrap().is_empty());
}

// === Concurrency ===

/// A batch arriving while a load replay is inside `apply_patch` waits for it,
/// so the instance still sees its deltas in order.
#[test]
fn test_batch_waits_for_in_flight_load_replay() {
    let host = Arc::new(FakeHost::default());
    let engine = engine(&host);
    engine.apply_managed_code_updates(&[delta(1, 0)], ResponseLoggingLevel::Verbose);
    assert_eq!(host.patch_count(), 0);

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    *host.gate.lock().unwrap() = Some(PatchGate {
        marker: 0,
        entered: entered_tx,
        release: release_rx,
    });
    let lib = host.add_module(module(10, 1, "Lib", &[]));

    let loader = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || engine.on_module_loaded(lib))
    };
    entered_rx.recv().unwrap();

    let batch = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            engine.apply_managed_code_updates(&[delta(1, 1)], ResponseLoggingLevel::Verbose)
        })
    };
    // Give the batch time to reach the patch step before the replay finishes.
    thread::sleep(Duration::from_millis(50));
    release_tx.send(()).unwrap();

    loader.join().unwrap();
    let response = batch.join().unwrap();
    assert!(response.success);
    assert_eq!(*host.patches.lock().unwrap(), [(10, vec![0]), (10, vec![1])]);
}

#[test]
fn test_racing_loads_and_batches_patch_each_delta_once() {
    let host = Arc::new(FakeHost::default());
    let engine = engine(&host);
    let lib = host.add_module(module(10, 1, "Lib", &[]));

    let loaders: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let lib = Arc::clone(&lib);
            thread::spawn(move || {
                for _ in 0..20 {
                    engine.on_module_loaded(Arc::clone(&lib));
                }
            })
        })
        .collect();
    for marker in 0..10 {
        let response = engine
            .apply_managed_code_updates(&[delta(1, marker)], ResponseLoggingLevel::Verbose);
        assert!(response.success);
    }
    for loader in loaders {
        loader.join().unwrap();
    }

    let expected: Vec<(u64, Vec<u8>)> = (0..10).map(|marker| (10, vec![marker])).collect();
    assert_eq!(*host.patches.lock().unwrap(), expected);
}
