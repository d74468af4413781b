//! rhai script host.
//!
//! Every script attached to a component gets its own [`Scope`] holding the
//! constant `component`, a [`ComponentHandle`] limited to the component's
//! capabilities. A script may define any of three hooks:
//!
//! ```text
//! fn on_add() { ... }           // once, right after the script loads
//! fn on_message(event) { ... }  // once per observed event
//! fn on_remove() { ... }        // once, when the component is removed
//! ```
//!
//! Hooks run with `this` bound to the component handle, so `this.id`,
//! `this.kind`, `this.start()` and `this.stop()` are available inside them.
//! Events arrive as plain maps (`event["type"]`, `event.method`,
//! `event.headers.host`, ...) with no link back to host state.

use super::error::{ComponentError, ScriptError};
use super::Component;
use crate::event::Event;
use rhai::{CallFnOptions, Dynamic, Engine, Scope, AST};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Default operation budget per script call.
pub const DEFAULT_MAX_OPERATIONS: u64 = 1_000_000;

/// Default maximum call depth inside a script.
pub const DEFAULT_MAX_CALL_LEVELS: usize = 32;

/// Resource limits applied to every script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptLimits {
    /// Operations allowed per evaluation (0 = unlimited).
    pub max_operations: u64,
    /// Maximum function call depth.
    pub max_call_levels: usize,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            max_operations: DEFAULT_MAX_OPERATIONS,
            max_call_levels: DEFAULT_MAX_CALL_LEVELS,
        }
    }
}

/// Hooks a script defines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookSet {
    /// `fn on_add()`
    pub on_add: bool,
    /// `fn on_message(event)`
    pub on_message: bool,
    /// `fn on_remove()`
    pub on_remove: bool,
}

/// Script-facing view of a component.
#[derive(Clone)]
pub struct ComponentHandle {
    component: Arc<dyn Component>,
    runtime: Option<Handle>,
}

#[derive(Debug, Clone, Copy)]
enum Control {
    Start,
    Stop,
}

type ControlFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ComponentError>> + Send + 'a>>;

impl ComponentHandle {
    pub(crate) fn new(component: Arc<dyn Component>, runtime: Option<Handle>) -> Self {
        Self { component, runtime }
    }

    /// Component id as a string.
    pub fn id(&self) -> String {
        self.component.id().to_string()
    }

    /// Component kind.
    pub fn kind(&self) -> String {
        self.component.kind().to_string()
    }

    /// Request a start; runs in the background.
    pub fn start(&self) {
        self.control(Control::Start);
    }

    /// Request a stop; runs in the background.
    pub fn stop(&self) {
        self.control(Control::Stop);
    }

    fn control(&self, action: Control) {
        if self.component.controls().is_none() {
            warn!(
                "Component {} ({}) cannot {:?}",
                self.component.id(),
                self.component.kind(),
                action
            );
            return;
        }

        let Some(runtime) = self.runtime.clone().or_else(|| Handle::try_current().ok()) else {
            warn!("No runtime available to {:?} component {}", action, self.component.id());
            return;
        };

        let component = self.component.clone();
        runtime.spawn(async move {
            let Some(controls) = component.controls() else {
                return;
            };
            let future: ControlFuture<'_> = match action {
                Control::Start => controls.start(),
                Control::Stop => controls.stop(),
            };
            if let Err(e) = future.await {
                warn!("Script-requested {:?} of {} failed: {}", action, component.id(), e);
            }
        });
    }
}

impl fmt::Debug for ComponentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentHandle")
            .field("id", &self.component.id())
            .field("kind", &self.component.kind())
            .finish()
    }
}

/// A compiled script bound to one component.
pub struct LoadedScript {
    url: String,
    ast: AST,
    scope: Mutex<Scope<'static>>,
    hooks: HookSet,
    this: ComponentHandle,
}

impl LoadedScript {
    /// The URL the script was loaded from.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Hooks this script defines.
    pub fn hooks(&self) -> HookSet {
        self.hooks
    }
}

impl fmt::Debug for LoadedScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedScript")
            .field("url", &self.url)
            .field("hooks", &self.hooks)
            .finish()
    }
}

/// Compiles scripts and invokes their hooks.
pub struct ScriptEngine {
    engine: Engine,
}

impl ScriptEngine {
    /// Create an engine with the given limits.
    pub fn new(limits: ScriptLimits) -> Self {
        let mut engine = Engine::new();
        engine.set_max_operations(limits.max_operations);
        engine.set_max_call_levels(limits.max_call_levels);

        engine.on_print(|text| info!(target: "tapwire::script", "{}", text));
        engine.on_debug(|text, source, pos| {
            debug!(target: "tapwire::script", "{} @ {:?} {}", text, source, pos)
        });

        engine
            .register_type_with_name::<ComponentHandle>("Component")
            .register_get("id", |handle: &mut ComponentHandle| handle.id())
            .register_get("kind", |handle: &mut ComponentHandle| handle.kind())
            .register_fn("start", |handle: &mut ComponentHandle| handle.start())
            .register_fn("stop", |handle: &mut ComponentHandle| handle.stop());

        Self { engine }
    }

    /// Compile and evaluate script source for `handle`.
    pub fn load_source(
        &self,
        url: &str,
        source: &str,
        handle: ComponentHandle,
    ) -> Result<LoadedScript, ScriptError> {
        let ast = self
            .engine
            .compile(source)
            .map_err(|e| ScriptError::Compile {
                script: url.to_string(),
                message: e.to_string(),
            })?;

        let mut scope = Scope::new();
        scope.push_constant("component", handle.clone());
        self.engine
            .run_ast_with_scope(&mut scope, &ast)
            .map_err(|e| ScriptError::Runtime {
                script: url.to_string(),
                hook: "top level".to_string(),
                message: e.to_string(),
            })?;

        let mut hooks = HookSet::default();
        for f in ast.iter_functions() {
            match (f.name, f.params.len()) {
                ("on_add", 0) => hooks.on_add = true,
                ("on_message", 1) => hooks.on_message = true,
                ("on_remove", 0) => hooks.on_remove = true,
                _ => {}
            }
        }

        debug!("Loaded script {} with hooks {:?}", url, hooks);

        Ok(LoadedScript {
            url: url.to_string(),
            ast,
            scope: Mutex::new(scope),
            hooks,
            this: handle,
        })
    }

    /// Run `on_add` if the script defines it.
    pub fn on_add(&self, script: &LoadedScript) -> Result<bool, ScriptError> {
        if !script.hooks.on_add {
            return Ok(false);
        }
        self.call(script, "on_add", ())?;
        Ok(true)
    }

    /// Run `on_remove` if the script defines it.
    pub fn on_remove(&self, script: &LoadedScript) -> Result<bool, ScriptError> {
        if !script.hooks.on_remove {
            return Ok(false);
        }
        self.call(script, "on_remove", ())?;
        Ok(true)
    }

    /// Run `on_message` with an event projection.
    pub fn on_message(&self, script: &LoadedScript, event: Dynamic) -> Result<bool, ScriptError> {
        if !script.hooks.on_message {
            return Ok(false);
        }
        self.call(script, "on_message", (event,))?;
        Ok(true)
    }

    fn call(
        &self,
        script: &LoadedScript,
        hook: &str,
        args: impl rhai::FuncArgs,
    ) -> Result<(), ScriptError> {
        let mut this = Dynamic::from(script.this.clone());
        let options = CallFnOptions::new()
            .eval_ast(false)
            .rewind_scope(true)
            .bind_this_ptr(&mut this);

        let mut scope = script.scope.lock().unwrap_or_else(PoisonError::into_inner);
        self.engine
            .call_fn_with_options::<Dynamic>(options, &mut scope, &script.ast, hook, args)
            .map(|_| ())
            .map_err(|e| ScriptError::Runtime {
                script: script.url.clone(),
                hook: hook.to_string(),
                message: e.to_string(),
            })
    }
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new(ScriptLimits::default())
    }
}

/// Convert an event to the structured value scripts receive.
pub fn project_event(event: &Event) -> Result<Dynamic, ScriptError> {
    rhai::serde::to_dynamic(event).map_err(|e| ScriptError::Projection(e.to_string()))
}
