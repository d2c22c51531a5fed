use std::fmt;

use rhai::Dynamic;

use crate::error::InvokeError;
use crate::executor::{RunSetup, ScriptExecutor};
use crate::marshal::{FromScript, Value};
use crate::module::FunctionRef;
use crate::types::{TypeRegistry, WeakObject};

/// A script function, optionally bound to the object it is a method of.
#[derive(Debug, Clone)]
pub struct ScriptCallback {
    function: FunctionRef,
    object: Option<Dynamic>,
}

impl ScriptCallback {
    pub fn function(function: FunctionRef) -> Self {
        Self { function, object: None }
    }

    pub fn method(function: FunctionRef, object: Dynamic) -> Self {
        Self { function, object: Some(object) }
    }
}

enum BoundObject {
    Weak(Box<dyn WeakObject>),
    Strong(Dynamic),
}

/// Callback that does not keep its bound object alive.
#[derive(Default)]
pub struct NonOwningCallback {
    function: Option<FunctionRef>,
    object: Option<BoundObject>,
}

impl NonOwningCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_callback(&mut self, callback: Option<ScriptCallback>, types: &TypeRegistry) {
        self.reset();
        let Some(callback) = callback else {
            return;
        };
        self.object = callback.object.map(|object| match types.downgrade(&object) {
            Some(weak) => BoundObject::Weak(weak),
            None => {
                tracing::warn!(
                    target: "scripting",
                    function = callback.function.name(),
                    object = object.type_name(),
                    "bound object has no weak reference support, holding it strongly"
                );
                BoundObject::Strong(object)
            }
        });
        self.function = Some(callback.function);
    }

    pub fn has_callback(&self) -> bool {
        self.function.is_some()
    }

    pub fn is_method(&self) -> bool {
        self.object.is_some()
    }

    /// False once a weakly bound object has been destroyed.
    pub fn is_target_alive(&self) -> bool {
        match &self.object {
            Some(BoundObject::Weak(weak)) => weak.is_alive(),
            _ => true,
        }
    }

    pub fn reset(&mut self) {
        self.function = None;
        self.object = None;
    }

    /// The bound object is kept alive only for the duration of the call.
    pub fn invoke<R: FromScript>(
        &mut self,
        executor: &ScriptExecutor,
        setup: &RunSetup,
        args: &[Value],
    ) -> Result<Option<R>, InvokeError> {
        let Some(function) = self.function.clone() else {
            return Err(InvokeError::EmptyCallback);
        };
        let mut target = match &self.object {
            None => return executor.invoke(&function, args, setup),
            Some(BoundObject::Strong(object)) => object.clone(),
            Some(BoundObject::Weak(weak)) => match weak.upgrade() {
                Some(object) => object,
                None => {
                    tracing::debug!(target: "scripting", function = function.name(), "callback target destroyed");
                    self.reset();
                    return Err(InvokeError::TargetGone);
                }
            },
        };
        executor.invoke_method(&function, &mut target, args, setup)
    }
}

impl fmt::Debug for NonOwningCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let object = match &self.object {
            None => "none",
            Some(BoundObject::Weak(_)) => "weak",
            Some(BoundObject::Strong(_)) => "strong",
        };
        f.debug_struct("NonOwningCallback").field("function", &self.function).field("object", &object).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refcount::Handle;

    struct Widget {
        label: String,
    }

    /// Registered without weak reference support.
    struct Gadget {
        label: String,
    }

    fn executor() -> ScriptExecutor {
        ScriptExecutor::builder()
            .register_object::<Widget>("Widget", true)
            .register_object::<Gadget>("Gadget", false)
            .with_engine(|engine| {
                engine.register_get("label", |widget: &mut Handle<Widget>| widget.label.clone());
                engine.register_get("label", |gadget: &mut Handle<Gadget>| gadget.label.clone());
            })
            .build()
            .unwrap()
    }

    #[test]
    fn empty_callback_reports_empty() {
        let executor = executor();
        let mut callback = NonOwningCallback::new();
        assert!(!callback.has_callback());
        let err = callback.invoke::<i64>(&executor, &RunSetup::new("none"), &[]).unwrap_err();
        assert_eq!(err, InvokeError::EmptyCallback);
    }

    #[test]
    fn bound_method_sees_this() {
        let executor = executor();
        let module = executor.create_module("Callbacks", "test");
        module.add_source_segment("callbacks.rhai", 1, "fn describe(suffix) { this.label + suffix }");
        let function = module.function("describe", 1).unwrap();

        let widget = Handle::new(Widget { label: "ok".into() });
        let mut callback = NonOwningCallback::new();
        callback.set_callback(Some(ScriptCallback::method(function, Dynamic::from(widget.clone()))), executor.types());
        assert!(callback.is_method());
        assert_eq!(Handle::ref_count(&widget), 1);

        let result = callback.invoke::<String>(&executor, &RunSetup::new("describe"), &["!".into()]).unwrap();
        assert_eq!(result.as_deref(), Some("ok!"));
        assert_eq!(Handle::ref_count(&widget), 1);
    }

    #[test]
    fn destroyed_target_is_reported_then_empty() {
        let executor = executor();
        let module = executor.create_module("Callbacks", "test");
        module.add_source_segment("callbacks.rhai", 1, "fn describe() { this.label }");
        let function = module.function("describe", 0).unwrap();

        let widget = Handle::new(Widget { label: "gone".into() });
        let mut callback = NonOwningCallback::new();
        callback.set_callback(Some(ScriptCallback::method(function, Dynamic::from(widget.clone()))), executor.types());
        drop(widget);
        assert!(!callback.is_target_alive());

        let setup = RunSetup::new("describe");
        assert_eq!(callback.invoke::<String>(&executor, &setup, &[]).unwrap_err(), InvokeError::TargetGone);
        assert!(!callback.has_callback());
        assert_eq!(callback.invoke::<String>(&executor, &setup, &[]).unwrap_err(), InvokeError::EmptyCallback);
    }

    #[test]
    fn objects_without_weak_support_are_held_strongly() {
        let executor = executor();
        let module = executor.create_module("Callbacks", "test");
        module.add_source_segment("callbacks.rhai", 1, "fn describe() { this.label }");
        let function = module.function("describe", 0).unwrap();

        let gadget = Handle::new(Gadget { label: "kept".into() });
        let mut callback = NonOwningCallback::new();
        callback.set_callback(Some(ScriptCallback::method(function, Dynamic::from(gadget.clone()))), executor.types());
        assert_eq!(Handle::ref_count(&gadget), 2);

        let weak = Handle::downgrade(&gadget);
        drop(gadget);
        assert!(weak.is_alive());
        assert!(callback.is_target_alive());
        let result = callback.invoke::<String>(&executor, &RunSetup::new("describe"), &[]).unwrap();
        assert_eq!(result.as_deref(), Some("kept"));

        callback.reset();
        assert!(!weak.is_alive());
    }

    #[test]
    fn replacing_the_callback_releases_the_previous_target() {
        let executor = executor();
        let module = executor.create_module("Callbacks", "test");
        module.add_source_segment("callbacks.rhai", 1, "fn describe() { this.label }");
        let function = module.function("describe", 0).unwrap();

        let first = Handle::new(Gadget { label: "first".into() });
        let second = Handle::new(Gadget { label: "second".into() });
        let mut callback = NonOwningCallback::new();
        callback.set_callback(
            Some(ScriptCallback::method(function.clone(), Dynamic::from(first.clone()))),
            executor.types(),
        );
        assert_eq!(Handle::ref_count(&first), 2);

        callback.set_callback(Some(ScriptCallback::method(function, Dynamic::from(second.clone()))), executor.types());
        assert_eq!(Handle::ref_count(&first), 1);
        assert_eq!(Handle::ref_count(&second), 2);
        let result = callback.invoke::<String>(&executor, &RunSetup::new("describe"), &[]).unwrap();
        assert_eq!(result.as_deref(), Some("second"));

        callback.set_callback(None, executor.types());
        assert_eq!(Handle::ref_count(&second), 1);
        assert!(!callback.has_callback());
    }
}
