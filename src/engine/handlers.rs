//! Update handler discovery.
//!
//! Modules opt in to update notifications with a module-level marker
//! attribute naming a handler type. The handler type declares any of three
//! static methods:
//!
//! - `ClearCache(Type[])`: drop caches derived from the old code
//! - `UpdateApplication(Type[])`: refresh application state (re-render etc.)
//! - `UpdateContent(string, bool, string, byte[])`: a static asset changed
//!
//! Discovery walks the loaded modules in dependency order so that a handler
//! in a foundational module runs before handlers in modules that build on it.
//! The marker is matched by its fully qualified name, so independently
//! compiled copies of the attribute type are all recognised.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::constants::{
    CLEAR_CACHE_METHOD, UPDATE_APPLICATION_METHOD, UPDATE_CONTENT_METHOD,
    UPDATE_HANDLER_ATTRIBUTE,
};

use super::host::{
    AttributeArg, HandlerArgs, HandlerCallable, HostRuntime, MethodSignature, ModuleHandle,
    StaticMethod, TypeRef,
};
use super::reporter::Reporter;

/// One discovered handler method, wrapped so failures never escape.
#[derive(Clone)]
pub struct HandlerAction {
    handler_type: String,
    method: String,
    callable: HandlerCallable,
}

impl HandlerAction {
    fn new(handler_type: &TypeRef, method: &StaticMethod) -> Self {
        Self {
            handler_type: handler_type.full_name.clone(),
            method: method.name.clone(),
            callable: Arc::clone(&method.callable),
        }
    }

    /// `Type.Method` label used in diagnostics.
    pub fn label(&self) -> String {
        format!("{}.{}", self.handler_type, self.method)
    }

    /// Invoke the handler, reporting an error or panic as a warning.
    ///
    /// Returns `true` if the handler completed normally.
    pub fn invoke(&self, args: HandlerArgs<'_>, reporter: &Reporter) -> bool {
        let outcome = catch_unwind(AssertUnwindSafe(|| (self.callable)(args)));
        let error = match outcome {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => format!("{e:#}"),
            Err(panic_info) => panic_message(panic_info.as_ref()).to_string(),
        };
        reporter.warning(format!("Exception from '{}': {error}", self.label()));
        false
    }
}

impl fmt::Debug for HandlerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HandlerAction").field(&self.label()).finish()
    }
}

fn panic_message(panic_info: &(dyn Any + Send)) -> &str {
    panic_info
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic_info.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
}

/// Handler actions in execution order, grouped by kind.
#[derive(Debug, Clone, Default)]
pub struct UpdateHandlerActions {
    /// `ClearCache` actions.
    pub clear_cache: Vec<HandlerAction>,
    /// `UpdateApplication` actions.
    pub update_application: Vec<HandlerAction>,
    /// `UpdateContent` actions.
    pub update_content: Vec<HandlerAction>,
}

impl UpdateHandlerActions {
    /// Whether nothing was discovered.
    pub fn is_empty(&self) -> bool {
        self.clear_cache.is_empty()
            && self.update_application.is_empty()
            && self.update_content.is_empty()
    }

    fn register_handler_type(
        &mut self,
        host: &dyn HostRuntime,
        handler_type: &TypeRef,
        reporter: &Reporter,
    ) {
        let methods = host.static_methods(handler_type);
        let mut any_named = false;

        let wanted = [
            (
                CLEAR_CACHE_METHOD,
                MethodSignature::type_array_action(),
                &mut self.clear_cache,
            ),
            (
                UPDATE_APPLICATION_METHOD,
                MethodSignature::type_array_action(),
                &mut self.update_application,
            ),
            (
                UPDATE_CONTENT_METHOD,
                MethodSignature::content_action(),
                &mut self.update_content,
            ),
        ];

        for (name, signature, list) in wanted {
            let mut named = methods.iter().filter(|m| m.name == name).peekable();
            if named.peek().is_none() {
                continue;
            }
            any_named = true;

            match named.find(|m| m.signature == signature) {
                Some(method) => list.push(HandlerAction::new(handler_type, method)),
                None => reporter.warning(format!(
                    "Type '{}' has method '{name}' that does not match the required signature.",
                    handler_type.full_name
                )),
            }
        }

        if !any_named {
            reporter.warning(format!(
                "Expected to find a static method '{CLEAR_CACHE_METHOD}', \
                 '{UPDATE_APPLICATION_METHOD}' or '{UPDATE_CONTENT_METHOD}' on type '{}' \
                 but neither exists.",
                handler_type.full_name
            ));
        }
    }
}

/// Discover handler actions across all currently loaded modules.
pub fn discover(host: &dyn HostRuntime, reporter: &Reporter) -> UpdateHandlerActions {
    let modules = host.loaded_modules();
    let mut actions = UpdateHandlerActions::default();

    for module in topological_sort(&modules) {
        for attribute in module.custom_attributes() {
            if attribute.attribute_type != UPDATE_HANDLER_ATTRIBUTE {
                continue;
            }
            match attribute.constructor_args.as_slice() {
                [AttributeArg::Type(handler_type)] => {
                    actions.register_handler_type(host, handler_type, reporter);
                }
                args => reporter.warning(format!(
                    "'{UPDATE_HANDLER_ATTRIBUTE}' on module '{}' must have a single type \
                     argument (found {} argument(s)); ignoring it.",
                    module.name(),
                    args.len()
                )),
            }
        }
    }

    log::debug!(
        "[Handlers] Discovered {} ClearCache, {} UpdateApplication, {} UpdateContent action(s)",
        actions.clear_cache.len(),
        actions.update_application.len(),
        actions.update_content.len()
    );
    actions
}

/// Order modules so every module follows the modules it references.
///
/// Depth-first post-order over references, keyed by module name. Names that
/// do not resolve to a loaded module are ignored; a name seen twice (another
/// load of the same module, or a reference cycle) is not descended again.
pub fn topological_sort(modules: &[ModuleHandle]) -> Vec<ModuleHandle> {
    let mut by_name: HashMap<&str, &ModuleHandle> = HashMap::with_capacity(modules.len());
    for module in modules {
        by_name.entry(module.name()).or_insert(module);
    }

    let mut visited = HashSet::with_capacity(modules.len());
    let mut order = Vec::with_capacity(by_name.len());
    for module in modules {
        visit(module, &by_name, &mut visited, &mut order);
    }
    order
}

fn visit<'a>(
    module: &'a ModuleHandle,
    by_name: &HashMap<&'a str, &'a ModuleHandle>,
    visited: &mut HashSet<&'a str>,
    order: &mut Vec<ModuleHandle>,
) {
    if !visited.insert(module.name()) {
        return;
    }
    for reference in module.referenced_modules() {
        if let Some(dependency) = by_name.get(reference.as_str()) {
            visit(*dependency, by_name, visited, order);
        }
    }
    order.push(Arc::clone(module));
}
