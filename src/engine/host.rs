//! Host runtime seam.
//!
//! The agent never patches code or reflects over types itself. The process
//! that loads the agent supplies a [`HostRuntime`] that enumerates loaded
//! modules, applies raw deltas, exposes static methods of handler types and
//! reports module loads. Tests substitute an in-memory implementation.

use std::fmt;
use std::sync::Arc;

use scopeguard::ScopeGuard;
use thiserror::Error;

pub use crate::protocol::ModuleId;

/// A module currently loaded in the process.
pub trait LoadedModule: Send + Sync {
    /// Identity of this loaded instance.
    ///
    /// The same module (same [`ModuleId`]) may be loaded more than once;
    /// each instance is patched independently.
    fn instance_id(&self) -> u64;

    /// Version id that deltas are addressed to.
    fn module_id(&self) -> ModuleId;

    /// Simple name, used to resolve references between modules.
    fn name(&self) -> &str;

    /// Simple names of the modules this one references.
    fn referenced_modules(&self) -> Vec<String>;

    /// Module-level custom attributes.
    fn custom_attributes(&self) -> Vec<AttributeData>;
}

/// Shared handle to a loaded module.
pub type ModuleHandle = Arc<dyn LoadedModule>;

/// Reference to a type in some module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeRef {
    /// Namespace-qualified type name.
    pub full_name: String,
    /// Name of the defining module.
    pub module_name: String,
}

impl TypeRef {
    /// Create a type reference.
    pub fn new(full_name: impl Into<String>, module_name: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            module_name: module_name.into(),
        }
    }

    /// Type name without its namespace.
    pub fn short_name(&self) -> &str {
        self.full_name
            .rsplit('.')
            .next()
            .unwrap_or(&self.full_name)
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.full_name, self.module_name)
    }
}

/// A constructor argument recorded in attribute metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeArg {
    /// `typeof(..)` argument.
    Type(TypeRef),
    /// String literal.
    String(String),
    /// Integer literal.
    Int(i64),
    /// Boolean literal.
    Bool(bool),
    /// Null literal.
    Null,
}

/// Custom attribute instance as recorded in module metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeData {
    /// Fully qualified name of the attribute type.
    pub attribute_type: String,
    /// Positional constructor arguments.
    pub constructor_args: Vec<AttributeArg>,
}

impl AttributeData {
    /// Create an attribute record.
    pub fn new(attribute_type: impl Into<String>, constructor_args: Vec<AttributeArg>) -> Self {
        Self {
            attribute_type: attribute_type.into(),
            constructor_args,
        }
    }
}

/// Parameter type of a handler method, as far as discovery cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    /// Array of type references.
    TypeArray,
    /// String.
    String,
    /// Boolean.
    Bool,
    /// Byte array.
    ByteArray,
    /// Anything else, by name.
    Other(String),
}

/// Shape of a static method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSignature {
    /// Parameter types in order.
    pub parameters: Vec<ParamType>,
    /// Whether the method returns no value.
    pub returns_void: bool,
}

impl MethodSignature {
    /// `void M(Type[])`.
    pub fn type_array_action() -> Self {
        Self {
            parameters: vec![ParamType::TypeArray],
            returns_void: true,
        }
    }

    /// `void M(string, bool, string, byte[])`.
    pub fn content_action() -> Self {
        Self {
            parameters: vec![
                ParamType::String,
                ParamType::Bool,
                ParamType::String,
                ParamType::ByteArray,
            ],
            returns_void: true,
        }
    }
}

/// Arguments passed to a handler method.
#[derive(Debug, Clone, Copy)]
pub enum HandlerArgs<'a> {
    /// `ClearCache` / `UpdateApplication`: the updated types, if known.
    UpdatedTypes(Option<&'a [TypeRef]>),
    /// `UpdateContent`: a changed static asset.
    Content {
        /// Owning module name.
        assembly_name: &'a str,
        /// Whether the asset belongs to the application project.
        is_application_project: bool,
        /// Asset path relative to the web root.
        relative_path: &'a str,
        /// New contents (empty when deleted).
        contents: &'a [u8],
    },
}

/// Invokable body of a handler method.
pub type HandlerCallable = Arc<dyn Fn(HandlerArgs<'_>) -> anyhow::Result<()> + Send + Sync>;

/// A static method exposed by a handler type.
#[derive(Clone)]
pub struct StaticMethod {
    /// Method name.
    pub name: String,
    /// Method shape.
    pub signature: MethodSignature,
    /// Invokes the method.
    pub callable: HandlerCallable,
}

impl fmt::Debug for StaticMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticMethod")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

/// The runtime refused to apply a delta (for example an unsupported edit).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct PatchRejected {
    /// Runtime-provided reason.
    pub message: String,
}

impl PatchRejected {
    /// Create a rejection with the given reason.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Callback invoked by the host after a module finishes loading.
pub type ModuleLoadCallback = Arc<dyn Fn(ModuleHandle) + Send + Sync>;

/// Active module-load subscription. Dropping it detaches the callback.
pub struct ModuleLoadSubscription {
    _guard: ScopeGuard<(), Box<dyn FnOnce(()) + Send>>,
}

impl ModuleLoadSubscription {
    /// Wrap the host's detach action.
    pub fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        let detach: Box<dyn FnOnce(()) + Send> = Box::new(move |()| detach());
        Self {
            _guard: scopeguard::guard((), detach),
        }
    }

    /// A subscription with nothing to detach.
    pub fn noop() -> Self {
        Self::new(|| {})
    }
}

impl fmt::Debug for ModuleLoadSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleLoadSubscription").finish_non_exhaustive()
    }
}

/// Capabilities the agent needs from the process it runs in.
pub trait HostRuntime: Send + Sync {
    /// Space-separated edit capabilities of this runtime build.
    fn capabilities(&self) -> String;

    /// Snapshot of all loaded modules, in load order.
    fn loaded_modules(&self) -> Vec<ModuleHandle>;

    /// Apply one delta to a loaded module instance.
    fn apply_patch(
        &self,
        module: &dyn LoadedModule,
        metadata_delta: &[u8],
        il_delta: &[u8],
        pdb_delta: &[u8],
    ) -> Result<(), PatchRejected>;

    /// Public and non-public static methods declared on `ty`.
    fn static_methods(&self, ty: &TypeRef) -> Vec<StaticMethod>;

    /// Register `callback` to run after each module load.
    fn subscribe_module_loads(&self, callback: ModuleLoadCallback) -> ModuleLoadSubscription;
}
