use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::ffi::c_int;

use crate::encoding::StringEncoding;
use crate::ffi::{sys, LightPointer};
use crate::runtime::{LuaState, LuaType};
use crate::userdata::HostObject;
use crate::value::{Userdata, Value};

/// A host value that can be pushed onto the stack as exactly one slot.
pub trait Push {
    fn push_to(&self, state: &LuaState);
}

impl<T: Push + ?Sized> Push for &T {
    fn push_to(&self, state: &LuaState) {
        (**self).push_to(state)
    }
}

impl LuaState {
    /// Push `value` as one new slot.
    pub fn push<T: Push>(&self, value: T) {
        self.ensure_stack(1);
        value.push_to(self);
    }

    /// Push raw bytes as a string, without any encoding.
    pub fn push_bytes(&self, bytes: &[u8]) {
        self.ensure_stack(1);
        unsafe {
            sys::lua_pushlstring(self.as_ptr(), bytes.as_ptr().cast(), bytes.len());
        }
    }

    /// Push `text` encoded with `encoding`. Text the encoding cannot
    /// represent pushes nil.
    pub fn push_str_with(&self, text: &str, encoding: StringEncoding) {
        match encoding.encode(text) {
            Some(bytes) => self.push_bytes(&bytes),
            None => {
                tracing::warn!(?encoding, "string not representable; pushing nil");
                self.push_nil();
            }
        }
    }

    /// Push a dynamically typed value. Arrays and maps become new tables,
    /// objects become userdata.
    pub fn push_any(&self, value: &Value) {
        let raw = self.as_ptr();
        self.ensure_stack(1);
        match value {
            Value::Nil => self.push_nil(),
            Value::Boolean(b) => b.push_to(self),
            Value::Integer(i) => i.push_to(self),
            Value::Number(n) => n.push_to(self),
            Value::String(bytes) => self.push_bytes(bytes),
            Value::Array(items) => self.push_sequence(items.iter()),
            Value::Map(entries) => {
                unsafe { sys::lua_createtable(raw, 0, table_hint(entries.len())) };
                for (key, value) in entries {
                    self.push_entry(key, value);
                }
            }
            Value::Object(object) => self.push_object(object),
        }
    }

    fn push_sequence<'v, T, I>(&self, items: I)
    where
        T: Push + 'v,
        I: ExactSizeIterator<Item = &'v T>,
    {
        let raw = self.as_ptr();
        unsafe { sys::lua_createtable(raw, table_hint(items.len()), 0) };
        self.ensure_stack(2);
        for (item, n) in items.zip(1..) {
            item.push_to(self);
            unsafe { sys::lua_rawseti(raw, -2, n) };
        }
    }

    /// Set `key = value` in the table at the top. Keys that cannot index a
    /// table (nil, NaN) are skipped.
    fn push_entry<K: Push + ?Sized, V: Push + ?Sized>(&self, key: &K, value: &V) {
        let raw = self.as_ptr();
        self.ensure_stack(3);
        key.push_to(self);
        if !self.is_valid_key(-1) {
            tracing::warn!("skipping table entry with a nil or NaN key");
            self.pop(1);
            return;
        }
        value.push_to(self);
        unsafe { sys::lua_rawset(raw, -3) };
    }

    fn is_valid_key(&self, index: c_int) -> bool {
        match self.type_of(index) {
            None | Some(LuaType::Nil) => false,
            Some(LuaType::Number) => {
                let n = unsafe { sys::lua_tonumberx(self.as_ptr(), index, std::ptr::null_mut()) };
                !n.is_nan()
            }
            Some(_) => true,
        }
    }
}

fn table_hint(len: usize) -> c_int {
    c_int::try_from(len).unwrap_or(c_int::MAX)
}

impl Push for bool {
    fn push_to(&self, state: &LuaState) {
        unsafe { sys::lua_pushboolean(state.as_ptr(), c_int::from(*self)) }
    }
}

macro_rules! push_integer {
    ($($t:ty),*) => {$(
        impl Push for $t {
            fn push_to(&self, state: &LuaState) {
                unsafe { sys::lua_pushinteger(state.as_ptr(), *self as sys::lua_Integer) }
            }
        }
    )*};
}

push_integer!(i8, i16, i32, i64, isize, u8, u16, u32);

macro_rules! push_wide_unsigned {
    ($($t:ty),*) => {$(
        impl Push for $t {
            fn push_to(&self, state: &LuaState) {
                match sys::lua_Integer::try_from(*self) {
                    Ok(i) => unsafe { sys::lua_pushinteger(state.as_ptr(), i) },
                    Err(_) => unsafe { sys::lua_pushnumber(state.as_ptr(), *self as sys::lua_Number) },
                }
            }
        }
    )*};
}

push_wide_unsigned!(u64, usize);

impl Push for f32 {
    fn push_to(&self, state: &LuaState) {
        unsafe { sys::lua_pushnumber(state.as_ptr(), sys::lua_Number::from(*self)) }
    }
}

impl Push for f64 {
    fn push_to(&self, state: &LuaState) {
        unsafe { sys::lua_pushnumber(state.as_ptr(), *self) }
    }
}

impl Push for str {
    fn push_to(&self, state: &LuaState) {
        state.push_str_with(self, state.default_string_encoding());
    }
}

impl Push for String {
    fn push_to(&self, state: &LuaState) {
        self.as_str().push_to(state)
    }
}

impl Push for LightPointer {
    fn push_to(&self, state: &LuaState) {
        unsafe { sys::lua_pushlightuserdata(state.as_ptr(), self.as_ptr()) }
    }
}

impl<T: Push> Push for Option<T> {
    fn push_to(&self, state: &LuaState) {
        match self {
            Some(value) => value.push_to(state),
            None => state.push_nil(),
        }
    }
}

impl<T: Push> Push for [T] {
    fn push_to(&self, state: &LuaState) {
        state.push_sequence(self.iter())
    }
}

impl<T: Push, const N: usize> Push for [T; N] {
    fn push_to(&self, state: &LuaState) {
        state.push_sequence(self.iter())
    }
}

impl<T: Push> Push for Vec<T> {
    fn push_to(&self, state: &LuaState) {
        state.push_sequence(self.iter())
    }
}

impl<K: Push, V: Push, S> Push for HashMap<K, V, S> {
    fn push_to(&self, state: &LuaState) {
        unsafe { sys::lua_createtable(state.as_ptr(), 0, table_hint(self.len())) };
        for (key, value) in self {
            state.push_entry(key, value);
        }
    }
}

impl<K: Push, V: Push> Push for BTreeMap<K, V> {
    fn push_to(&self, state: &LuaState) {
        unsafe { sys::lua_createtable(state.as_ptr(), 0, table_hint(self.len())) };
        for (key, value) in self {
            state.push_entry(key, value);
        }
    }
}

impl Push for Value {
    fn push_to(&self, state: &LuaState) {
        state.push_any(self)
    }
}

impl Push for HostObject {
    fn push_to(&self, state: &LuaState) {
        state.push_object(self)
    }
}

impl<T: Any + Clone> Push for Userdata<T> {
    fn push_to(&self, state: &LuaState) {
        state.push_userdata(self.0.clone())
    }
}
