use std::any::TypeId;
use std::fmt;

use rhai::{Dynamic, ImmutableString, Map, FLOAT, INT};
use thiserror::Error;

use crate::refcount::Handle;
use crate::types::TypeRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarshalError {
    #[error("expected {expected}, found {found}")]
    Mismatch { expected: &'static str, found: String },
    #[error("value {value} does not fit in {target}")]
    OutOfRange { value: String, target: &'static str },
    #[error("type '{0}' is not registered with the script executor")]
    Unregistered(&'static str),
}

impl MarshalError {
    fn mismatch(expected: &'static str, found: impl Into<String>) -> Self {
        MarshalError::Mismatch { expected, found: found.into() }
    }
}

trait ErasedHandle: Send + Sync {
    fn to_dynamic(&self) -> Dynamic;
    fn ref_count(&self) -> isize;
    fn clone_box(&self) -> Box<dyn ErasedHandle>;
}

impl<T: Send + Sync + 'static> ErasedHandle for Handle<T> {
    fn to_dynamic(&self) -> Dynamic {
        Dynamic::from(self.clone())
    }

    fn ref_count(&self) -> isize {
        Handle::ref_count(self)
    }

    fn clone_box(&self) -> Box<dyn ErasedHandle> {
        Box::new(self.clone())
    }
}

/// A native object handle passed as a script argument.
pub struct ObjectValue {
    native: TypeId,
    type_name: &'static str,
    handle: Box<dyn ErasedHandle>,
}

impl ObjectValue {
    pub fn new<T: Send + Sync + 'static>(handle: Handle<T>) -> Self {
        Self { native: TypeId::of::<Handle<T>>(), type_name: std::any::type_name::<T>(), handle: Box::new(handle) }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn ref_count(&self) -> isize {
        self.handle.ref_count()
    }
}

impl Clone for ObjectValue {
    fn clone(&self) -> Self {
        Self { native: self.native, type_name: self.type_name, handle: self.handle.clone_box() }
    }
}

impl fmt::Debug for ObjectValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectValue({}, refs: {})", self.type_name, self.ref_count())
    }
}

/// Native argument or return value crossing into script.
#[derive(Debug, Clone)]
pub enum Value {
    Void,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    Double(f64),
    Char(char),
    String(String),
    Object(ObjectValue),
    /// Already in script form; passed through untouched.
    Script(Dynamic),
}

impl Value {
    pub fn object<T: Send + Sync + 'static>(handle: Handle<T>) -> Self {
        Value::Object(ObjectValue::new(handle))
    }

    pub fn type_label(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::Bool(_) => "bool",
            Value::Int8(_) => "i8",
            Value::Int16(_) => "i16",
            Value::Int32(_) => "i32",
            Value::Int64(_) => "i64",
            Value::UInt8(_) => "u8",
            Value::UInt16(_) => "u16",
            Value::UInt32(_) => "u32",
            Value::UInt64(_) => "u64",
            Value::Float(_) => "f32",
            Value::Double(_) => "f64",
            Value::Char(_) => "char",
            Value::String(_) => "string",
            Value::Object(object) => object.type_name(),
            Value::Script(_) => "dynamic",
        }
    }

    /// Converts into the script representation. Object handles gain one reference owned by the result.
    pub fn to_script(&self, types: &TypeRegistry) -> Result<Dynamic, MarshalError> {
        let dynamic = match self {
            Value::Void => Dynamic::UNIT,
            Value::Bool(value) => Dynamic::from_bool(*value),
            Value::Int8(value) => Dynamic::from_int(INT::from(*value)),
            Value::Int16(value) => Dynamic::from_int(INT::from(*value)),
            Value::Int32(value) => Dynamic::from_int(INT::from(*value)),
            Value::Int64(value) => Dynamic::from_int(*value),
            Value::UInt8(value) => Dynamic::from_int(INT::from(*value)),
            Value::UInt16(value) => Dynamic::from_int(INT::from(*value)),
            Value::UInt32(value) => Dynamic::from_int(INT::from(*value)),
            Value::UInt64(value) => {
                let narrowed = INT::try_from(*value)
                    .map_err(|_| MarshalError::OutOfRange { value: value.to_string(), target: "int" })?;
                Dynamic::from_int(narrowed)
            }
            Value::Float(value) => Dynamic::from_float(FLOAT::from(*value)),
            Value::Double(value) => Dynamic::from_float(*value),
            Value::Char(value) => Dynamic::from_char(*value),
            Value::String(value) => Dynamic::from(value.clone()),
            Value::Object(object) => {
                if types.lookup_native(object.native).is_none() {
                    return Err(MarshalError::Unregistered(object.type_name));
                }
                object.handle.to_dynamic()
            }
            Value::Script(value) => value.clone(),
        };
        Ok(dynamic)
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::$variant(value)
                }
            }
        )*
    };
}

value_from!(
    bool => Bool,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    f32 => Float,
    f64 => Double,
    char => Char,
    String => String,
    Dynamic => Script,
);

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Void
    }
}

impl<T: Send + Sync + 'static> From<Handle<T>> for Value {
    fn from(handle: Handle<T>) -> Self {
        Value::object(handle)
    }
}

/// Marshals every argument or none. A single failure aborts before anything runs.
pub fn marshal_args(args: &[Value], types: &TypeRegistry) -> Result<Vec<Dynamic>, (usize, MarshalError)> {
    args.iter().enumerate().map(|(index, arg)| arg.to_script(types).map_err(|err| (index, err))).collect()
}

/// Conversion from a script return value into a native type.
pub trait FromScript: Sized + 'static {
    fn from_script(value: Dynamic) -> Result<Self, MarshalError>;

    fn is_unit() -> bool {
        TypeId::of::<Self>() == TypeId::of::<()>()
    }
}

macro_rules! int_from_script {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FromScript for $ty {
                fn from_script(value: Dynamic) -> Result<Self, MarshalError> {
                    let raw = value.as_int().map_err(|found| MarshalError::mismatch(stringify!($ty), found))?;
                    <$ty>::try_from(raw)
                        .map_err(|_| MarshalError::OutOfRange { value: raw.to_string(), target: stringify!($ty) })
                }
            }
        )*
    };
}

int_from_script!(i8, i16, i32, u8, u16, u32, u64, usize);

impl FromScript for i64 {
    fn from_script(value: Dynamic) -> Result<Self, MarshalError> {
        value.as_int().map_err(|found| MarshalError::mismatch("i64", found))
    }
}

impl FromScript for f64 {
    fn from_script(value: Dynamic) -> Result<Self, MarshalError> {
        if let Ok(float) = value.as_float() {
            return Ok(float);
        }
        value.as_int().map(|int| int as f64).map_err(|found| MarshalError::mismatch("f64", found))
    }
}

impl FromScript for f32 {
    fn from_script(value: Dynamic) -> Result<Self, MarshalError> {
        f64::from_script(value).map(|float| float as f32)
    }
}

impl FromScript for bool {
    fn from_script(value: Dynamic) -> Result<Self, MarshalError> {
        value.as_bool().map_err(|found| MarshalError::mismatch("bool", found))
    }
}

impl FromScript for char {
    fn from_script(value: Dynamic) -> Result<Self, MarshalError> {
        value.as_char().map_err(|found| MarshalError::mismatch("char", found))
    }
}

impl FromScript for String {
    fn from_script(value: Dynamic) -> Result<Self, MarshalError> {
        value.into_string().map_err(|found| MarshalError::mismatch("string", found))
    }
}

impl FromScript for ImmutableString {
    fn from_script(value: Dynamic) -> Result<Self, MarshalError> {
        value.into_immutable_string().map_err(|found| MarshalError::mismatch("string", found))
    }
}

impl FromScript for Map {
    fn from_script(value: Dynamic) -> Result<Self, MarshalError> {
        let found = value.type_name();
        value.try_cast::<Map>().ok_or_else(|| MarshalError::mismatch("map", found))
    }
}

impl FromScript for Dynamic {
    fn from_script(value: Dynamic) -> Result<Self, MarshalError> {
        Ok(value)
    }
}

impl FromScript for () {
    fn from_script(_: Dynamic) -> Result<Self, MarshalError> {
        Ok(())
    }
}

impl FromScript for Value {
    fn from_script(value: Dynamic) -> Result<Self, MarshalError> {
        let converted = if value.is_unit() {
            Value::Void
        } else if let Ok(int) = value.as_int() {
            Value::Int64(int)
        } else if let Ok(float) = value.as_float() {
            Value::Double(float)
        } else if let Ok(flag) = value.as_bool() {
            Value::Bool(flag)
        } else if let Ok(ch) = value.as_char() {
            Value::Char(ch)
        } else if value.is_string() {
            Value::String(value.into_string().map_err(|found| MarshalError::mismatch("string", found))?)
        } else {
            Value::Script(value)
        };
        Ok(converted)
    }
}

/// Returned handles are cloned out of the script value, so the caller owns its own reference.
impl<T: Send + Sync + 'static> FromScript for Handle<T> {
    fn from_script(value: Dynamic) -> Result<Self, MarshalError> {
        let found = value.type_name();
        value.try_cast::<Handle<T>>().ok_or_else(|| MarshalError::mismatch(std::any::type_name::<T>(), found))
    }
}
