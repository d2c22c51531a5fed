use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;

use rhai::Dynamic;

use crate::refcount::{Handle, WeakHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScriptTypeId(u32);

impl fmt::Display for ScriptTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptPrimitive {
    Void,
    Int,
    Float,
    Bool,
    Char,
    String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptTypeKind {
    Primitive(ScriptPrimitive),
    Object { supports_weak: bool },
}

/// Weak reference to a script-visible object, stored without knowing its concrete type.
pub trait WeakObject: Send + Sync {
    fn upgrade(&self) -> Option<Dynamic>;
    fn is_alive(&self) -> bool;
}

impl<T: Send + Sync + 'static> WeakObject for WeakHandle<T> {
    fn upgrade(&self) -> Option<Dynamic> {
        WeakHandle::upgrade(self).map(Dynamic::from)
    }

    fn is_alive(&self) -> bool {
        WeakHandle::is_alive(self)
    }
}

type DowngradeFn = fn(&Dynamic) -> Option<Box<dyn WeakObject>>;

fn downgrade_handle<T: Send + Sync + 'static>(value: &Dynamic) -> Option<Box<dyn WeakObject>> {
    let handle = value.clone().try_cast::<Handle<T>>()?;
    Some(Box::new(Handle::downgrade(&handle)))
}

#[derive(Clone)]
pub struct ScriptTypeInfo {
    pub id: ScriptTypeId,
    pub name: String,
    pub kind: ScriptTypeKind,
    downgrade: Option<DowngradeFn>,
}

impl ScriptTypeInfo {
    pub fn supports_weak(&self) -> bool {
        self.downgrade.is_some()
    }
}

impl fmt::Debug for ScriptTypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptTypeInfo")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Maps native type ids to script types. Filled in once while the executor is being built.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    entries: Vec<ScriptTypeInfo>,
    by_native: HashMap<TypeId, ScriptTypeId>,
    by_name: HashMap<String, ScriptTypeId>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    pub fn new() -> Self {
        let mut registry = Self { entries: Vec::new(), by_native: HashMap::new(), by_name: HashMap::new() };
        let void = registry.push("void", ScriptTypeKind::Primitive(ScriptPrimitive::Void), None);
        registry.by_native.insert(TypeId::of::<()>(), void);
        let int = registry.push("int", ScriptTypeKind::Primitive(ScriptPrimitive::Int), None);
        for native in [
            TypeId::of::<i8>(),
            TypeId::of::<i16>(),
            TypeId::of::<i32>(),
            TypeId::of::<i64>(),
            TypeId::of::<u8>(),
            TypeId::of::<u16>(),
            TypeId::of::<u32>(),
            TypeId::of::<u64>(),
            TypeId::of::<usize>(),
        ] {
            registry.by_native.insert(native, int);
        }
        let float = registry.push("float", ScriptTypeKind::Primitive(ScriptPrimitive::Float), None);
        registry.by_native.insert(TypeId::of::<f32>(), float);
        registry.by_native.insert(TypeId::of::<f64>(), float);
        let boolean = registry.push("bool", ScriptTypeKind::Primitive(ScriptPrimitive::Bool), None);
        registry.by_native.insert(TypeId::of::<bool>(), boolean);
        let character = registry.push("char", ScriptTypeKind::Primitive(ScriptPrimitive::Char), None);
        registry.by_native.insert(TypeId::of::<char>(), character);
        let string = registry.push("string", ScriptTypeKind::Primitive(ScriptPrimitive::String), None);
        registry.by_native.insert(TypeId::of::<String>(), string);
        registry.by_native.insert(TypeId::of::<rhai::ImmutableString>(), string);
        registry
    }

    fn push(&mut self, name: &str, kind: ScriptTypeKind, downgrade: Option<DowngradeFn>) -> ScriptTypeId {
        let id = ScriptTypeId(self.entries.len() as u32);
        self.entries.push(ScriptTypeInfo { id, name: name.to_string(), kind, downgrade });
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Registers `Handle<T>` as the script type `name`. Re-registering the same type returns its id.
    pub fn register_object<T: Send + Sync + 'static>(&mut self, name: &str, supports_weak: bool) -> ScriptTypeId {
        let native = TypeId::of::<Handle<T>>();
        if let Some(existing) = self.by_native.get(&native) {
            return *existing;
        }
        let downgrade: Option<DowngradeFn> = if supports_weak { Some(downgrade_handle::<T>) } else { None };
        let id = self.push(name, ScriptTypeKind::Object { supports_weak }, downgrade);
        self.by_native.insert(native, id);
        id
    }

    pub fn lookup<T: 'static>(&self) -> Option<&ScriptTypeInfo> {
        self.lookup_native(TypeId::of::<T>())
    }

    pub fn lookup_native(&self, native: TypeId) -> Option<&ScriptTypeInfo> {
        self.by_native.get(&native).and_then(|id| self.info(*id))
    }

    pub fn resolve_name(&self, name: &str) -> Option<&ScriptTypeInfo> {
        self.by_name.get(name).and_then(|id| self.info(*id))
    }

    pub fn info(&self, id: ScriptTypeId) -> Option<&ScriptTypeInfo> {
        self.entries.get(id.0 as usize)
    }

    /// Weak reference to a script object, if its registered type supports one.
    pub fn downgrade(&self, value: &Dynamic) -> Option<Box<dyn WeakObject>> {
        let info = self.lookup_native(value.type_id())?;
        info.downgrade.and_then(|downgrade| downgrade(value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
