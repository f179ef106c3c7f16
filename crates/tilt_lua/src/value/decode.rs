use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::ffi::c_int;
use std::hash::{BuildHasher, Hash};

use crate::encoding::StringEncoding;
use crate::ffi::{c_name, sys, LightPointer};
use crate::frame::StackFrame;
use crate::runtime::{LuaState, LuaType};
use crate::userdata::HostObject;
use crate::value::{
    FunctionRef, LuaValue, Push, StringRef, TableRef, Userdata, UserdataRef, Value,
};

/// Nesting depth at which table materialization gives up. Also stops
/// self-referencing tables.
const MAX_DEPTH: usize = 64;

/// A host value that can be read back from one stack slot.
///
/// Decoding is strict on type and never raises: a slot of the wrong shape
/// yields `None`.
pub trait FromStack: Sized {
    fn from_stack(state: &LuaState, index: c_int) -> Option<Self>;
}

impl LuaState {
    /// Decode the slot at `index` as a `T`.
    pub fn to_value<T: FromStack>(&self, index: c_int) -> Option<T> {
        T::from_stack(self, index)
    }

    /// A lazy view of the slot at `index`. `None` only for an empty
    /// position.
    pub fn to_any(&self, index: c_int) -> Option<LuaValue<'_>> {
        let raw = self.as_ptr();
        let ty = self.type_of(index)?;
        let index = self.abs_index(index);
        Some(match ty {
            LuaType::Nil => LuaValue::Nil,
            LuaType::Boolean => LuaValue::Boolean(self.to_boolean(index)),
            LuaType::LightUserdata => {
                LuaValue::LightUserdata(LightPointer(unsafe { sys::lua_touserdata(raw, index) }))
            }
            LuaType::Number => match self.number_value(index) {
                Value::Integer(i) => LuaValue::Integer(i),
                Value::Number(n) => LuaValue::Number(n),
                _ => unreachable!("number_value only yields numbers"),
            },
            LuaType::String => LuaValue::String(StringRef { state: self, index }),
            LuaType::Table => LuaValue::Table(TableRef { state: self, index }),
            LuaType::Function => LuaValue::Function(FunctionRef { state: self, index }),
            LuaType::Userdata => LuaValue::Userdata(UserdataRef { state: self, index }),
            LuaType::Thread => LuaValue::Thread,
        })
    }

    /// Integer when the number has an exact integer value, float otherwise.
    fn number_value(&self, index: c_int) -> Value {
        let raw = self.as_ptr();
        let mut isnum: c_int = 0;
        let i = unsafe { sys::lua_tointegerx(raw, index, &mut isnum) };
        if isnum != 0 {
            Value::Integer(i)
        } else {
            Value::Number(unsafe { sys::lua_tonumberx(raw, index, std::ptr::null_mut()) })
        }
    }

    /// The value as an integer, with the VM's own coercions (numeric
    /// strings, floats with an exact integer value).
    pub fn to_int(&self, index: c_int) -> Option<i64> {
        let mut isnum: c_int = 0;
        let i = unsafe { sys::lua_tointegerx(self.as_ptr(), index, &mut isnum) };
        (isnum != 0).then_some(i)
    }

    /// The value as a float, with the VM's own coercions.
    pub fn to_number(&self, index: c_int) -> Option<f64> {
        let mut isnum: c_int = 0;
        let n = unsafe { sys::lua_tonumberx(self.as_ptr(), index, &mut isnum) };
        (isnum != 0).then_some(n)
    }

    /// Truthiness: everything except nil and false is true.
    pub fn to_boolean(&self, index: c_int) -> bool {
        unsafe { sys::lua_toboolean(self.as_ptr(), index) != 0 }
    }

    /// The bytes of a string slot. Numbers are not converted.
    pub fn to_bytes(&self, index: c_int) -> Option<Vec<u8>> {
        if self.type_of(index) != Some(LuaType::String) {
            return None;
        }
        let mut len = 0;
        unsafe {
            let ptr = sys::lua_tolstring(self.as_ptr(), index, &mut len);
            if ptr.is_null() {
                return None;
            }
            Some(std::slice::from_raw_parts(ptr.cast::<u8>(), len).to_vec())
        }
    }

    /// A string slot decoded with the VM's default encoding.
    pub fn to_string(&self, index: c_int) -> Option<String> {
        self.to_string_with(index, self.default_string_encoding(), false)
    }

    /// Decode a string slot with `encoding`. With `convert`, any other value
    /// is first converted the way `tostring` would, honoring `__tostring`;
    /// a conversion that raises yields `None`.
    pub fn to_string_with(
        &self,
        index: c_int,
        encoding: StringEncoding,
        convert: bool,
    ) -> Option<String> {
        if self.type_of(index) == Some(LuaType::String) {
            return encoding.decode(&self.to_bytes(index)?);
        }
        if !convert || self.is_none(index) {
            return None;
        }
        let frame = StackFrame::enter(self);
        if !self.protected_tostring(index) {
            return None;
        }
        let text = encoding.decode(&self.to_bytes(-1)?);
        drop(frame);
        text
    }

    /// Push `tostring(value at index)` under protection. Pushes nothing and
    /// returns `false` if the conversion raised.
    pub(crate) fn protected_tostring(&self, index: c_int) -> bool {
        let raw = self.as_ptr();
        let index = self.abs_index(index);
        self.ensure_stack(2);
        unsafe {
            sys::lua_pushcfunction(raw, tostring_value);
            sys::lua_pushvalue(raw, index);
            if sys::lua_pcall(raw, 1, 1, 0) != sys::LUA_OK {
                sys::lua_pop(raw, 1);
                return false;
            }
        }
        true
    }

    /// The string elements of a sequence, in order, up to the first element
    /// that is not a string. `None` if the slot is not a table.
    pub fn to_string_array(&self, index: c_int) -> Option<Vec<String>> {
        if self.type_of(index) != Some(LuaType::Table) {
            return None;
        }
        let mut strings = Vec::new();
        let mut elements = self.ipairs(index, Some(LuaType::String));
        while elements.next().is_some() {
            match self.to_string(-1) {
                Some(text) => strings.push(text),
                None => break,
            }
        }
        Some(strings)
    }

    /// Read the string-keyed field `key` of the table or userdata at
    /// `index` and decode it with `accessor`, which sees the field at the
    /// top of the stack. Metamethods run under protection, and a raise or a
    /// non-indexable value yields `None`.
    pub fn get_field<R>(
        &self,
        index: c_int,
        key: &str,
        accessor: impl FnOnce(&LuaState, c_int) -> Option<R>,
    ) -> Option<R> {
        if !matches!(
            self.type_of(index),
            Some(LuaType::Table) | Some(LuaType::Userdata)
        ) {
            return None;
        }
        let raw = self.as_ptr();
        let index = self.abs_index(index);
        let frame = StackFrame::enter(self);
        self.ensure_stack(3);
        let key = c_name(key);
        let status = unsafe {
            sys::lua_pushcfunction(raw, index_value);
            sys::lua_pushvalue(raw, index);
            sys::lua_pushstring(raw, key.as_ptr());
            sys::lua_pcall(raw, 2, 1, 0)
        };
        if status != sys::LUA_OK {
            return None;
        }
        let result = accessor(self, -1);
        drop(frame);
        result
    }

    pub fn to_int_field(&self, index: c_int, key: &str) -> Option<i64> {
        self.get_field(index, key, LuaState::to_int)
    }

    pub fn to_number_field(&self, index: c_int, key: &str) -> Option<f64> {
        self.get_field(index, key, LuaState::to_number)
    }

    /// `None` when the field is absent, otherwise its truthiness.
    pub fn to_boolean_field(&self, index: c_int, key: &str) -> Option<bool> {
        self.get_field(index, key, |state, i| {
            (!state.is_none_or_nil(i)).then(|| state.to_boolean(i))
        })
    }

    pub fn to_bytes_field(&self, index: c_int, key: &str) -> Option<Vec<u8>> {
        self.get_field(index, key, LuaState::to_bytes)
    }

    pub fn to_string_field(&self, index: c_int, key: &str) -> Option<String> {
        self.get_field(index, key, LuaState::to_string)
    }

    pub fn to_string_array_field(&self, index: c_int, key: &str) -> Option<Vec<String>> {
        self.get_field(index, key, LuaState::to_string_array)
    }

    /// Pop `value` into `key` of the table at the top. The assignment is
    /// raw and bypasses `__newindex`.
    pub fn set_field<T: Push>(&self, key: &str, value: T) {
        let raw = self.as_ptr();
        self.ensure_stack(2);
        self.push(key);
        self.push(value);
        unsafe { sys::lua_rawset(raw, -3) };
    }

    /// Convert the slot at `index` into an owned [`Value`], descending into
    /// tables. All or nothing: any element that cannot be represented
    /// makes the whole result `None`.
    pub(crate) fn materialize(&self, index: c_int) -> Option<Value> {
        let index = self.abs_index(index);
        let value = self.materialize_at(index, 0);
        if value.is_none() {
            tracing::warn!(
                type_name = self.type_of(index).map_or("none", LuaType::name),
                "value cannot be converted to a host value"
            );
        }
        value
    }

    fn materialize_at(&self, index: c_int, depth: usize) -> Option<Value> {
        match self.type_of(index)? {
            LuaType::Nil => Some(Value::Nil),
            LuaType::Boolean => Some(Value::Boolean(self.to_boolean(index))),
            LuaType::Number => Some(self.number_value(index)),
            LuaType::String => self.to_bytes(index).map(Value::String),
            LuaType::Table => self.materialize_table(index, depth),
            LuaType::Userdata => self.to_object(index).map(Value::Object),
            LuaType::LightUserdata | LuaType::Function | LuaType::Thread => None,
        }
    }

    fn materialize_table(&self, index: c_int, depth: usize) -> Option<Value> {
        if depth >= MAX_DEPTH {
            return None;
        }
        let mut entries = Vec::new();
        for (key, value) in self.pairs(index) {
            let key = self.materialize_at(key, depth + 1)?;
            let value = self.materialize_at(value, depth + 1)?;
            entries.push((key, value));
        }
        Some(sequence_or_map(entries))
    }
}

/// An array when the keys are exactly `1..=n`, a map otherwise.
fn sequence_or_map(mut entries: Vec<(Value, Value)>) -> Value {
    let n = entries.len();
    let is_sequence = entries.iter().all(|(key, _)| match key {
        Value::Integer(i) => *i >= 1 && (*i as u64) <= n as u64,
        _ => false,
    });
    if !is_sequence {
        return Value::Map(entries);
    }
    // keys are distinct, so n keys within 1..=n cover it exactly
    entries.sort_by_key(|(key, _)| key.as_i64());
    Value::Array(entries.into_iter().map(|(_, value)| value).collect())
}

/// `tostring(arg 1)`, as a plain C function so a raising `__tostring`
/// unwinds through no Rust frames.
unsafe extern "C-unwind" fn tostring_value(raw: *mut sys::lua_State) -> c_int {
    sys::luaL_tolstring(raw, 1, std::ptr::null_mut());
    1
}

/// `arg1[arg2]`, honoring `__index`.
unsafe extern "C-unwind" fn index_value(raw: *mut sys::lua_State) -> c_int {
    sys::lua_gettable(raw, 1);
    1
}

impl FromStack for bool {
    fn from_stack(state: &LuaState, index: c_int) -> Option<bool> {
        (state.type_of(index) == Some(LuaType::Boolean)).then(|| state.to_boolean(index))
    }
}

macro_rules! from_stack_integer {
    ($($t:ty),*) => {$(
        impl FromStack for $t {
            fn from_stack(state: &LuaState, index: c_int) -> Option<$t> {
                if state.type_of(index) != Some(LuaType::Number) {
                    return None;
                }
                <$t>::try_from(state.to_int(index)?).ok()
            }
        }
    )*};
}

from_stack_integer!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

impl FromStack for f64 {
    fn from_stack(state: &LuaState, index: c_int) -> Option<f64> {
        if state.type_of(index) != Some(LuaType::Number) {
            return None;
        }
        state.to_number(index)
    }
}

impl FromStack for f32 {
    fn from_stack(state: &LuaState, index: c_int) -> Option<f32> {
        f64::from_stack(state, index).map(|n| n as f32)
    }
}

impl FromStack for String {
    fn from_stack(state: &LuaState, index: c_int) -> Option<String> {
        state.to_string(index)
    }
}

impl FromStack for LightPointer {
    fn from_stack(state: &LuaState, index: c_int) -> Option<LightPointer> {
        if state.type_of(index) != Some(LuaType::LightUserdata) {
            return None;
        }
        Some(LightPointer(unsafe { sys::lua_touserdata(state.as_ptr(), index) }))
    }
}

impl FromStack for Value {
    fn from_stack(state: &LuaState, index: c_int) -> Option<Value> {
        state.materialize(index)
    }
}

impl FromStack for HostObject {
    fn from_stack(state: &LuaState, index: c_int) -> Option<HostObject> {
        state.to_object(index)
    }
}

impl<T: Any + Clone> FromStack for Userdata<T> {
    fn from_stack(state: &LuaState, index: c_int) -> Option<Userdata<T>> {
        state.to_userdata(index).map(Userdata)
    }
}

/// Nil and empty positions decode as `Some(None)`.
impl<T: FromStack> FromStack for Option<T> {
    fn from_stack(state: &LuaState, index: c_int) -> Option<Option<T>> {
        if state.is_none_or_nil(index) {
            Some(None)
        } else {
            T::from_stack(state, index).map(Some)
        }
    }
}

/// The sequence part `1..=#t`, every element converted.
impl<T: FromStack> FromStack for Vec<T> {
    fn from_stack(state: &LuaState, index: c_int) -> Option<Vec<T>> {
        if state.type_of(index) != Some(LuaType::Table) {
            return None;
        }
        let raw = state.as_ptr();
        let index = state.abs_index(index);
        let len = unsafe { sys::lua_rawlen(raw, index) };
        let frame = StackFrame::enter(state);
        state.ensure_stack(1);
        let mut items = Vec::with_capacity(len as usize);
        for n in 1..=len as sys::lua_Integer {
            unsafe { sys::lua_rawgeti(raw, index, n) };
            items.push(T::from_stack(state, -1)?);
            state.pop(1);
        }
        drop(frame);
        Some(items)
    }
}

impl<K, V, S> FromStack for HashMap<K, V, S>
where
    K: FromStack + Eq + Hash,
    V: FromStack,
    S: BuildHasher + Default,
{
    fn from_stack(state: &LuaState, index: c_int) -> Option<HashMap<K, V, S>> {
        if state.type_of(index) != Some(LuaType::Table) {
            return None;
        }
        state
            .pairs(index)
            .map(|(key, value)| Some((K::from_stack(state, key)?, V::from_stack(state, value)?)))
            .collect()
    }
}

impl<K: FromStack + Ord, V: FromStack> FromStack for BTreeMap<K, V> {
    fn from_stack(state: &LuaState, index: c_int) -> Option<BTreeMap<K, V>> {
        if state.type_of(index) != Some(LuaType::Table) {
            return None;
        }
        state
            .pairs(index)
            .map(|(key, value)| Some((K::from_stack(state, key)?, V::from_stack(state, value)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::runtime::{Libraries, LuaRuntime, LuaType};
    use crate::value::{LuaValue, Userdata, Value};
    use crate::StringEncoding;

    fn eval(lua: &LuaRuntime, expression: &str) {
        lua.do_string(&format!("result = {expression}"), "=test").unwrap();
        lua.get_global("result");
    }

    #[test]
    fn integers_decode_only_when_exact() {
        let lua = LuaRuntime::new(Libraries::NONE);
        lua.push(3.0);
        lua.push(3.5);
        lua.push("12");
        assert_eq!(lua.to_value::<i64>(1), Some(3));
        assert_eq!(lua.to_value::<i64>(2), None);
        assert_eq!(lua.to_value::<i64>(3), None);
        assert_eq!(lua.to_int(3), Some(12));
        assert_eq!(lua.to_value::<u8>(1), Some(3));
        lua.push(300);
        assert_eq!(lua.to_value::<u8>(-1), None);
        lua.set_top(0);
    }

    #[test]
    fn strings_are_not_coerced() {
        let lua = LuaRuntime::new(Libraries::NONE);
        lua.push(12);
        assert_eq!(lua.to_string(-1), None);
        assert_eq!(lua.type_of(-1), Some(LuaType::Number));
        assert_eq!(
            lua.to_string_with(-1, StringEncoding::Utf8, true).as_deref(),
            Some("12")
        );
        assert_eq!(lua.top(), 1);
        lua.pop(1);
    }

    #[test]
    fn conversion_honors_tostring_metamethods() {
        let lua = LuaRuntime::new(Libraries::NONE);
        eval(
            &lua,
            "setmetatable({}, { __tostring = function() return 'custom' end })",
        );
        assert_eq!(
            lua.to_string_with(-1, StringEncoding::Utf8, true).as_deref(),
            Some("custom")
        );
        lua.pop(1);

        eval(
            &lua,
            "setmetatable({}, { __tostring = function() error('nope') end })",
        );
        assert_eq!(lua.to_string_with(-1, StringEncoding::Utf8, true), None);
        assert_eq!(lua.top(), 1);
        lua.pop(1);
    }

    #[test]
    fn tables_materialize_as_arrays_or_maps() {
        let lua = LuaRuntime::new(Libraries::NONE);
        eval(&lua, "{ 10, 20, { name = 'x', tags = { 'a' } } }");
        let value = lua.to_value::<Value>(-1).unwrap();
        let expected = Value::Array(vec![
            Value::from(10),
            Value::from(20),
            Value::Map(vec![
                (Value::from("tags"), Value::from(vec!["a"])),
                (Value::from("name"), Value::from("x")),
            ]),
        ]);
        assert_eq!(value, expected);
        lua.pop(1);

        eval(&lua, "{ [1] = 'a', [3] = 'c' }");
        assert!(matches!(lua.to_value::<Value>(-1), Some(Value::Map(_))));
        lua.pop(1);

        eval(&lua, "{}");
        assert_eq!(lua.to_value::<Value>(-1), Some(Value::Array(Vec::new())));
        lua.pop(1);
        assert_eq!(lua.top(), 0);
    }

    #[test]
    fn materialization_is_all_or_nothing() {
        let lua = LuaRuntime::new(Libraries::NONE);
        eval(&lua, "{ 1, 2, print }");
        assert_eq!(lua.to_value::<Value>(-1), None);
        assert_eq!(lua.top(), 1);
        lua.pop(1);

        eval(&lua, "(function() local t = {} t.self = t return t end)()");
        assert_eq!(lua.to_value::<Value>(-1), None);
        assert_eq!(lua.top(), 1);
        lua.pop(1);
    }

    #[test]
    fn round_trip_through_the_stack() {
        let lua = LuaRuntime::new(Libraries::NONE);
        let value = Value::Map(vec![
            (Value::from("list"), Value::from(vec![1.5, 2.5])),
            (Value::from("flag"), Value::from(true)),
            (Value::from(7), Value::from("seven")),
        ]);
        lua.push(&value);
        assert_eq!(lua.to_value::<Value>(-1), Some(value));
        lua.pop(1);
    }

    #[test]
    fn sequence_keyed_maps_round_trip_as_arrays() {
        let lua = LuaRuntime::new(Libraries::NONE);
        let value = Value::Map(vec![
            (Value::from(2), Value::from("b")),
            (Value::from(1), Value::from("a")),
        ]);
        lua.push(&value);
        let back = lua.to_value::<Value>(-1).unwrap();
        assert_eq!(back, Value::from(vec!["a", "b"]));
        assert_eq!(back, value);
        assert_eq!(value, back);
        lua.pop(1);

        let gapped = Value::Map(vec![
            (Value::from(1), Value::from("a")),
            (Value::from(3), Value::from("b")),
        ]);
        assert_ne!(gapped, Value::from(vec!["a", "b"]));
        let repeated = Value::Map(vec![
            (Value::from(1), Value::from("a")),
            (Value::Number(1.0), Value::from("a")),
        ]);
        assert_ne!(repeated, Value::from(vec!["a", "a"]));
        assert_eq!(lua.top(), 0);
    }

    #[test]
    fn typed_containers() {
        let lua = LuaRuntime::new(Libraries::NONE);
        eval(&lua, "{ b = 2, a = 1 }");
        let map = lua.to_value::<BTreeMap<String, i64>>(-1).unwrap();
        assert_eq!(
            map.into_iter().collect::<Vec<_>>(),
            vec![("a".to_string(), 1), ("b".to_string(), 2)]
        );
        assert_eq!(lua.to_value::<BTreeMap<String, String>>(-1), None);
        lua.pop(1);

        eval(&lua, "{ 'x', 'y', 3 }");
        assert_eq!(lua.to_value::<Vec<String>>(-1), None);
        assert_eq!(
            lua.to_value::<Vec<Option<String>>>(-1),
            None,
            "numbers are not strings"
        );
        assert_eq!(lua.to_string_array(-1), Some(vec!["x".into(), "y".into()]));
        lua.pop(1);
        assert_eq!(lua.top(), 0);
    }

    #[test]
    fn lazy_views_defer_conversion() {
        let lua = LuaRuntime::new(Libraries::NONE);
        eval(&lua, "{ 'a', 'b' }");
        lua.push("text");
        lua.push(5);
        lua.push(0.25);
        match lua.to_any(1) {
            Some(LuaValue::Table(table)) => {
                assert_eq!(table.len(), 2);
                assert_eq!(table.to_array(), Some(vec![Value::from("a"), Value::from("b")]));
            }
            other => panic!("expected a table, got {other:?}"),
        }
        match lua.to_any(2) {
            Some(LuaValue::String(text)) => assert_eq!(text.to_bytes(), b"text"),
            other => panic!("expected a string, got {other:?}"),
        }
        assert!(matches!(lua.to_any(3), Some(LuaValue::Integer(5))));
        assert!(matches!(lua.to_any(4), Some(LuaValue::Number(n)) if n == 0.25));
        assert!(lua.to_any(5).is_none());
        lua.set_top(0);
    }

    #[test]
    fn userdata_through_the_wrapper() {
        let lua = LuaRuntime::new(Libraries::NONE);
        lua.push(Userdata(vec![1_u8, 2, 3]));
        assert_eq!(
            lua.to_value::<Userdata<Vec<u8>>>(-1),
            Some(Userdata(vec![1, 2, 3]))
        );
        assert_eq!(lua.to_value::<Userdata<String>>(-1), None);
        match lua.to_any(-1) {
            Some(LuaValue::Userdata(ud)) => assert_eq!(ud.downcast::<Vec<u8>>(), Some(vec![1, 2, 3])),
            other => panic!("expected userdata, got {other:?}"),
        }
        lua.pop(1);
    }

    #[test]
    fn fields_are_read_without_raising() {
        let lua = LuaRuntime::new(Libraries::NONE);
        eval(
            &lua,
            "setmetatable({ n = 4, s = 'four', on = false, list = { 'p', 'q' } }, \
             { __index = function(_, k) if k == 'boom' then error('no') end end })",
        );
        assert_eq!(lua.to_int_field(-1, "n"), Some(4));
        assert_eq!(lua.to_number_field(-1, "n"), Some(4.0));
        assert_eq!(lua.to_string_field(-1, "s").as_deref(), Some("four"));
        assert_eq!(lua.to_bytes_field(-1, "s").as_deref(), Some(&b"four"[..]));
        assert_eq!(lua.to_boolean_field(-1, "on"), Some(false));
        assert_eq!(lua.to_boolean_field(-1, "missing"), None);
        assert_eq!(
            lua.to_string_array_field(-1, "list"),
            Some(vec!["p".into(), "q".into()])
        );
        assert_eq!(lua.to_int_field(-1, "boom"), None);
        assert_eq!(lua.top(), 1);

        lua.push(5);
        assert_eq!(lua.to_int_field(-1, "n"), None);
        lua.set_top(0);
    }

    #[test]
    fn set_field_assigns_into_the_top_table() {
        let lua = LuaRuntime::new(Libraries::NONE);
        lua.push(Value::Map(Vec::new()));
        lua.set_field("answer", 42);
        lua.set_field("name", "deep thought");
        assert_eq!(lua.to_int_field(-1, "answer"), Some(42));
        assert_eq!(lua.to_string_field(-1, "name").as_deref(), Some("deep thought"));
        assert_eq!(lua.top(), 1);
        lua.pop(1);
    }
}
