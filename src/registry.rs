//! Function registry.
//!
//! Maps `(namespace, durable, name)` to a handler. Registration happens
//! while the process starts, before any listener runs; afterwards the
//! registry is shared read-only behind an `Arc`.
//!
//! There is one canonical entry point, [`Registry::register_handler`].
//! [`Registry::register`] and [`Registry::register_with`] accept types
//! generated by `#[remote_fn]` and resolve their declared name and options
//! before delegating to it.
//!
//! ```ignore
//! #[remote_fn]
//! fn add(a: i64, b: i64) -> i64 { a + b }
//!
//! #[remote_fn(namespace = "math", name = "mul")]
//! fn multiply(a: i64, b: i64) -> i64 { a * b }
//!
//! let mut registry = Registry::with_namespace("calc");
//! registry.register(add)?;                                      // calc.add
//! registry.register(multiply)?;                                 // math.mul
//! registry.register_with(Registration::new().durable(true), add)?; // calc.js.add
//! registry.register_handler(
//!     Registration::new().name("echo"),
//!     Handler::blocking(|req| Ok(req.args.into())),
//! )?;
//! ```

use std::collections::{BTreeSet, HashMap};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use crate::envelope::CallRequest;
use crate::handler::{BlockingPool, ExecutionContext, Handler, HandlerFuture, Inline};
use crate::settings::Settings;
use crate::subject;

/// Namespace used when neither the registration nor the registry names one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Error raised while registering a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// The resolved key is already registered.
    Duplicate(String),
    /// A namespace or name cannot be used as a subject token.
    InvalidName {
        field: &'static str,
        value: String,
        reason: &'static str,
    },
    /// No name was given and the handler declares none.
    MissingName,
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationError::Duplicate(subject) => {
                write!(f, "duplicated function key `{}`", subject)
            }
            RegistrationError::InvalidName {
                field,
                value,
                reason,
            } => write!(f, "invalid {} `{}`: {}", field, value, reason),
            RegistrationError::MissingName => write!(f, "function name is required"),
        }
    }
}

impl Error for RegistrationError {}

/// Identity of a registered function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionKey {
    pub namespace: String,
    pub durable: bool,
    pub name: String,
}

impl FunctionKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, durable: bool) -> Self {
        Self {
            namespace: namespace.into(),
            durable,
            name: name.into(),
        }
    }

    /// Subject this function is addressed by.
    pub fn subject(&self) -> String {
        subject::function_subject(&self.namespace, &self.name, self.durable)
    }
}

impl fmt::Display for FunctionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.subject())
    }
}

/// A function as stored in the registry. Immutable once registered.
pub struct RegisteredFunction {
    key: FunctionKey,
    subject: String,
    handler: Handler,
    execution: Arc<dyn ExecutionContext>,
}

impl RegisteredFunction {
    pub fn key(&self) -> &FunctionKey {
        &self.key
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn namespace(&self) -> &str {
        &self.key.namespace
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn is_durable(&self) -> bool {
        self.key.durable
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    /// Run the handler in its execution context.
    pub fn invoke(&self, request: CallRequest) -> HandlerFuture {
        self.handler.invoke(request, self.execution.as_ref())
    }
}

impl fmt::Debug for RegisteredFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredFunction")
            .field("subject", &self.subject)
            .field("handler", &self.handler)
            .finish()
    }
}

/// Options for one registration. Unset fields fall back to what the
/// function declares, then to registry defaults.
#[derive(Clone, Default)]
pub struct Registration {
    namespace: Option<String>,
    name: Option<String>,
    durable: Option<bool>,
    execution: Option<Arc<dyn ExecutionContext>>,
}

impl Registration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Consume through a durable pull consumer (`{namespace}.js.{name}`).
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = Some(durable);
        self
    }

    /// Execution context for a blocking handler.
    pub fn execution(mut self, execution: Arc<dyn ExecutionContext>) -> Self {
        self.execution = Some(execution);
        self
    }

    /// Run a blocking handler directly on the listener task.
    pub fn inline(self) -> Self {
        self.execution(Arc::new(Inline))
    }

    /// Fill unset fields from `fallback`.
    fn or(self, fallback: Registration) -> Self {
        Self {
            namespace: self.namespace.or(fallback.namespace),
            name: self.name.or(fallback.name),
            durable: self.durable.or(fallback.durable),
            execution: self.execution.or(fallback.execution),
        }
    }
}

/// A function type produced by `#[remote_fn]`.
pub trait RemoteFunction {
    /// Declared name, the identifier of the annotated fn unless overridden.
    const NAME: &'static str;

    /// Options declared on the annotation.
    fn registration(&self) -> Registration {
        Registration::new()
    }

    fn into_handler(self) -> Handler;
}

/// In-memory function registry.
pub struct Registry {
    default_namespace: String,
    functions: HashMap<String, Arc<RegisteredFunction>>,
    blocking_pool: Arc<BlockingPool>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Registry whose default namespace is `default`.
    pub fn new() -> Self {
        Self::with_namespace(DEFAULT_NAMESPACE)
    }

    /// Registry with a custom default namespace.
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            default_namespace: namespace.into(),
            functions: HashMap::new(),
            blocking_pool: Arc::new(BlockingPool::default()),
        }
    }

    /// Registry using the configured namespace as its default.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::with_namespace(settings.namespace.clone())
    }

    /// Replace the pool shared by blocking handlers registered afterwards
    /// without an explicit execution context.
    pub fn with_blocking_pool(mut self, pool: BlockingPool) -> Self {
        self.blocking_pool = Arc::new(pool);
        self
    }

    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    /// Register a handler. The single entry point all sugar funnels into.
    ///
    /// Fails without touching the existing entry when the key is taken.
    pub fn register_handler(
        &mut self,
        registration: Registration,
        handler: Handler,
    ) -> Result<Arc<RegisteredFunction>, RegistrationError> {
        let namespace = registration
            .namespace
            .unwrap_or_else(|| self.default_namespace.clone());
        let name = registration.name.ok_or(RegistrationError::MissingName)?;
        let durable = registration.durable.unwrap_or(false);

        check_token("namespace", &namespace)?;
        check_token("name", &name)?;

        let key = FunctionKey::new(namespace, name, durable);
        let subject = key.subject();
        if self.functions.contains_key(&subject) {
            return Err(RegistrationError::Duplicate(subject));
        }

        let execution = registration
            .execution
            .unwrap_or_else(|| self.blocking_pool.clone() as Arc<dyn ExecutionContext>);

        let function = Arc::new(RegisteredFunction {
            key,
            subject: subject.clone(),
            handler,
            execution,
        });
        tracing::debug!(subject = %subject, "registered function");
        self.functions.insert(subject, Arc::clone(&function));
        Ok(function)
    }

    /// Register a `#[remote_fn]` with its declared options.
    pub fn register<F: RemoteFunction>(
        &mut self,
        function: F,
    ) -> Result<Arc<RegisteredFunction>, RegistrationError> {
        self.register_with(Registration::new(), function)
    }

    /// Register a `#[remote_fn]`, overriding its declared options.
    pub fn register_with<F: RemoteFunction>(
        &mut self,
        registration: Registration,
        function: F,
    ) -> Result<Arc<RegisteredFunction>, RegistrationError> {
        let registration = registration
            .or(function.registration())
            .or(Registration::new().name(F::NAME));
        self.register_handler(registration, function.into_handler())
    }

    /// Look up a function by subject.
    pub fn resolve(&self, subject: &str) -> Option<&Arc<RegisteredFunction>> {
        self.functions.get(subject)
    }

    /// Look up a function by key.
    pub fn get(&self, key: &FunctionKey) -> Option<&Arc<RegisteredFunction>> {
        self.functions.get(&key.subject())
    }

    /// All registered subjects, in no particular order.
    pub fn subjects(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn functions(&self) -> impl Iterator<Item = &Arc<RegisteredFunction>> {
        self.functions.values()
    }

    /// Every namespace with a registered function, sorted.
    pub fn namespaces(&self) -> BTreeSet<&str> {
        self.functions.values().map(|f| f.namespace()).collect()
    }

    /// Durable functions, each served by its own pull consumer.
    pub fn durable_functions(&self) -> impl Iterator<Item = &Arc<RegisteredFunction>> {
        self.functions.values().filter(|f| f.is_durable())
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

fn check_token(field: &'static str, value: &str) -> Result<(), RegistrationError> {
    subject::validate_token(value).map_err(|reason| RegistrationError::InvalidName {
        field,
        value: value.to_string(),
        reason,
    })
}
