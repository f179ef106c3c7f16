//! Value conversion layer
//!
//! Host values reach the stack through [`Push`] and come back through
//! [`FromStack`]. Both directions are open: any host type can implement
//! either trait. [`Value`] is the closed, owned representation for callers
//! that do not know the shape of what a script hands back, and
//! [`LuaValue`] is the lazy, borrowed one for callers that want to inspect
//! a slot before deciding how much of it to convert.

mod decode;
mod push;

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::ffi::c_int;

pub use decode::FromStack;
pub use push::Push;

use crate::encoding::StringEncoding;
use crate::ffi::LightPointer;
use crate::iter::{IPairs, Pairs};
use crate::runtime::{LuaState, LuaType};
use crate::userdata::HostObject;

/// An owned script value.
///
/// Equality compares integers and floats numerically, maps without regard
/// to entry order, and objects by identity.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    /// Raw bytes; Lua strings are not required to be valid in any encoding.
    String(Vec<u8>),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Object(HostObject),
}

impl Value {
    pub fn string(text: impl Into<String>) -> Value {
        Value::String(text.into().into_bytes())
    }

    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Value {
        Value::String(bytes.into())
    }

    pub fn object<T: Any>(value: T) -> Value {
        Value::Object(HostObject::new(value))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Name of the script type this value becomes when pushed.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) | Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) | Value::Map(_) => "table",
            Value::Object(_) => "userdata",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Integer(i) => Some(i),
            Value::Number(n) => float_to_integer(n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Integer(i) => Some(i as f64),
            Value::Number(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::String(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// The string contents, when they are valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&HostObject> {
        match self {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }

    /// Look up a string key in a map.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map()?
            .iter()
            .find(|(k, _)| k.as_bytes() == Some(key.as_bytes()))
            .map(|(_, v)| v)
    }
}

/// `n` as an integer, if it has an exact integer representation.
pub(crate) fn float_to_integer(n: f64) -> Option<i64> {
    // 2^63 itself is out of range; -2^63 is not
    if n.fract() == 0.0 && n >= -9_223_372_036_854_775_808.0 && n < 9_223_372_036_854_775_808.0 {
        Some(n as i64)
    } else {
        None
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Integer(i), Value::Number(n)) | (Value::Number(n), Value::Integer(i)) => {
                float_to_integer(*n) == Some(*i)
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.iter().any(|(k2, v2)| k == k2 && v == v2))
            }
            // a table keyed 1..=n decodes as an array, whichever way it was built
            (Value::Array(a), Value::Map(m)) | (Value::Map(m), Value::Array(a)) => {
                map_is_sequence_of(m, a)
            }
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

/// Whether `map` has exactly the keys `1..=items.len()`, each holding the
/// matching item.
fn map_is_sequence_of(map: &[(Value, Value)], items: &[Value]) -> bool {
    if map.len() != items.len() {
        return false;
    }
    let mut seen = vec![false; items.len()];
    map.iter().all(|(key, value)| {
        let Some(position) = key
            .as_i64()
            .and_then(|k| usize::try_from(k).ok())
            .and_then(|k| k.checked_sub(1))
        else {
            return false;
        };
        match (items.get(position), seen.get_mut(position)) {
            (Some(item), Some(taken)) if !*taken => {
                *taken = true;
                item == value
            }
            _ => false,
        }
    })
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Boolean(b)
    }
}

macro_rules! value_from_integer {
    ($($t:ty),*) => {$(
        impl From<$t> for Value {
            fn from(i: $t) -> Value {
                Value::Integer(i64::from(i))
            }
        }
    )*};
}

value_from_integer!(i8, i16, i32, i64, u8, u16, u32);

impl From<u64> for Value {
    fn from(i: u64) -> Value {
        match i64::try_from(i) {
            Ok(i) => Value::Integer(i),
            Err(_) => Value::Number(i as f64),
        }
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Value {
        Value::from(i as u64)
    }
}

impl From<isize> for Value {
    fn from(i: isize) -> Value {
        Value::Integer(i as i64)
    }
}

impl From<f32> for Value {
    fn from(n: f32) -> Value {
        Value::Number(f64::from(n))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Value {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::String(s.into_bytes())
    }
}

impl From<HostObject> for Value {
    fn from(object: HostObject) -> Value {
        Value::Object(object)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Value {
        value.map_or(Value::Nil, Into::into)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Value {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<K: Into<Value>, V: Into<Value>, S> From<HashMap<K, V, S>> for Value {
    fn from(map: HashMap<K, V, S>) -> Value {
        Value::Map(map.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<K: Into<Value>, V: Into<Value>> From<BTreeMap<K, V>> for Value {
    fn from(map: BTreeMap<K, V>) -> Value {
        Value::Map(map.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<V: Into<Value>> FromIterator<V> for Value {
    fn from_iter<I: IntoIterator<Item = V>>(iter: I) -> Value {
        Value::Array(iter.into_iter().map(Into::into).collect())
    }
}

/// Pushes and decodes as userdata holding a `T`.
///
/// Pushing boxes a clone of the inner value; decoding clones it back out
/// after a checked downcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Userdata<T>(pub T);

impl<T> Userdata<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

/// A borrowed, undecoded view of one stack slot.
///
/// Scalars are decoded eagerly since they are cheap. Strings, tables,
/// functions and userdata stay on the stack and are converted only on
/// request, so a view is valid only while its slot is.
#[derive(Debug, Clone, Copy)]
pub enum LuaValue<'a> {
    Nil,
    Boolean(bool),
    LightUserdata(LightPointer),
    Integer(i64),
    Number(f64),
    String(StringRef<'a>),
    Table(TableRef<'a>),
    Function(FunctionRef<'a>),
    Userdata(UserdataRef<'a>),
    Thread,
}

impl LuaValue<'_> {
    pub fn type_of(&self) -> LuaType {
        match self {
            LuaValue::Nil => LuaType::Nil,
            LuaValue::Boolean(_) => LuaType::Boolean,
            LuaValue::LightUserdata(_) => LuaType::LightUserdata,
            LuaValue::Integer(_) | LuaValue::Number(_) => LuaType::Number,
            LuaValue::String(_) => LuaType::String,
            LuaValue::Table(_) => LuaType::Table,
            LuaValue::Function(_) => LuaType::Function,
            LuaValue::Userdata(_) => LuaType::Userdata,
            LuaValue::Thread => LuaType::Thread,
        }
    }
}

/// A string slot.
#[derive(Debug, Clone, Copy)]
pub struct StringRef<'a> {
    state: &'a LuaState,
    index: c_int,
}

impl<'a> StringRef<'a> {
    pub fn index(&self) -> c_int {
        self.index
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.state.to_bytes(self.index).unwrap_or_default()
    }

    /// Decoded with the VM's default encoding.
    pub fn to_string(&self) -> Option<String> {
        self.state.to_string(self.index)
    }

    pub fn to_string_with(&self, encoding: StringEncoding) -> Option<String> {
        self.state.to_string_with(self.index, encoding, false)
    }
}

/// A table slot.
#[derive(Debug, Clone, Copy)]
pub struct TableRef<'a> {
    state: &'a LuaState,
    index: c_int,
}

impl<'a> TableRef<'a> {
    pub fn index(&self) -> c_int {
        self.index
    }

    /// Raw length of the sequence part.
    pub fn len(&self) -> usize {
        unsafe { crate::ffi::sys::lua_rawlen(self.state.as_ptr(), self.index) as usize }
    }

    pub fn is_empty(&self) -> bool {
        self.pairs().next().is_none()
    }

    /// Every element of the table, converted. Absent when the keys are not
    /// exactly `1..=n` or any element fails to convert.
    pub fn to_array(&self) -> Option<Vec<Value>> {
        match self.state.materialize(self.index)? {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Every entry of the table, converted. Absent when any key or value
    /// fails to convert.
    pub fn to_map(&self) -> Option<Vec<(Value, Value)>> {
        match self.state.materialize(self.index)? {
            Value::Map(entries) => Some(entries),
            Value::Array(items) => Some(
                items
                    .into_iter()
                    .zip(1_i64..)
                    .map(|(v, k)| (Value::Integer(k), v))
                    .collect(),
            ),
            _ => None,
        }
    }

    pub fn ipairs(&self, required: Option<LuaType>) -> IPairs<'a> {
        self.state.ipairs(self.index, required)
    }

    pub fn pairs(&self) -> Pairs<'a> {
        self.state.pairs(self.index)
    }
}

/// A function slot.
#[derive(Debug, Clone, Copy)]
pub struct FunctionRef<'a> {
    state: &'a LuaState,
    index: c_int,
}

impl<'a> FunctionRef<'a> {
    pub fn index(&self) -> c_int {
        self.index
    }

    /// Push a copy of the function, ready for a protected call.
    pub fn push(&self) {
        self.state.push_value(self.index);
    }
}

/// A full userdata slot, which may or may not have been created here.
#[derive(Debug, Clone, Copy)]
pub struct UserdataRef<'a> {
    state: &'a LuaState,
    index: c_int,
}

impl<'a> UserdataRef<'a> {
    pub fn index(&self) -> c_int {
        self.index
    }

    pub fn is_host_object(&self) -> bool {
        self.state.is_host_object(self.index)
    }

    pub fn object(&self) -> Option<HostObject> {
        self.state.to_object(self.index)
    }

    pub fn downcast<T: Any + Clone>(&self) -> Option<T> {
        self.state.to_userdata(self.index)
    }
}
