//! Stack iteration protocols
//!
//! Both iterators leave their current element on the stack while the
//! caller looks at it and take it off again on the next step. Dropping an
//! iterator part-way through restores the depth it started from.

use std::ffi::c_int;

use crate::ffi::sys;
use crate::runtime::{LuaState, LuaType};

/// Sequential iteration over `t[1], t[2], ...`.
///
/// Yields each 1-based position with the element at the top of the stack
/// (index -1). Stops at the first nil, or the first element whose type
/// differs from the one required.
pub struct IPairs<'a> {
    state: &'a LuaState,
    table: c_int,
    required: Option<LuaType>,
    next: sys::lua_Integer,
    base: c_int,
    done: bool,
}

impl Iterator for IPairs<'_> {
    type Item = sys::lua_Integer;

    fn next(&mut self) -> Option<sys::lua_Integer> {
        self.state.set_top(self.base);
        if self.done {
            return None;
        }
        let position = self.next;
        let raw = unsafe { sys::lua_rawgeti(self.state.as_ptr(), self.table, position) };
        let ty = LuaType::from_raw(raw).unwrap_or(LuaType::Nil);
        if ty == LuaType::Nil || self.required.is_some_and(|required| required != ty) {
            self.state.set_top(self.base);
            self.done = true;
            return None;
        }
        self.next += 1;
        Some(position)
    }
}

impl Drop for IPairs<'_> {
    fn drop(&mut self) {
        self.state.set_top(self.base);
    }
}

/// Iteration over every key/value pair of a table, in unspecified order.
///
/// Yields the stack indexes of the key and the value. Do not modify the
/// table while iterating: assigning to a key that is not already present
/// makes the traversal undefined.
pub struct Pairs<'a> {
    state: &'a LuaState,
    table: c_int,
    base: c_int,
    started: bool,
    done: bool,
}

impl Iterator for Pairs<'_> {
    /// `(key_index, value_index)`
    type Item = (c_int, c_int);

    fn next(&mut self) -> Option<(c_int, c_int)> {
        if self.done {
            return None;
        }
        let raw = self.state.as_ptr();
        if self.started {
            // drop the value, keep the key for lua_next
            self.state.set_top(self.base + 1);
        } else {
            self.state.ensure_stack(2);
            self.state.push_nil();
            self.started = true;
        }
        if unsafe { sys::lua_next(raw, self.table) } == 0 {
            self.done = true;
            return None;
        }
        Some((self.base + 1, self.base + 2))
    }
}

impl Drop for Pairs<'_> {
    fn drop(&mut self) {
        self.state.set_top(self.base);
    }
}

impl LuaState {
    /// Iterate the sequence part of the table at `index`.
    ///
    /// Panics if the value is not a table, or if `required` is
    /// `Some(LuaType::Nil)`, which could never match.
    pub fn ipairs(&self, index: c_int, required: Option<LuaType>) -> IPairs<'_> {
        assert_eq!(
            self.type_of(index),
            Some(LuaType::Table),
            "ipairs target at index {index} is not a table"
        );
        assert_ne!(
            required,
            Some(LuaType::Nil),
            "ipairs cannot require nil elements"
        );
        self.ensure_stack(1);
        IPairs {
            state: self,
            table: self.abs_index(index),
            required,
            next: 1,
            base: self.top(),
            done: false,
        }
    }

    /// Iterate every entry of the table at `index`. Panics if the value is
    /// not a table.
    pub fn pairs(&self, index: c_int) -> Pairs<'_> {
        assert_eq!(
            self.type_of(index),
            Some(LuaType::Table),
            "pairs target at index {index} is not a table"
        );
        Pairs {
            state: self,
            table: self.abs_index(index),
            base: self.top(),
            started: false,
            done: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::runtime::{Libraries, LuaRuntime};

    fn table(lua: &LuaRuntime, constructor: &str) {
        lua.do_string(&format!("t = {constructor}"), "=test").unwrap();
        lua.get_global("t");
    }

    #[test]
    fn bounded_iteration_stops_at_first_mismatch() {
        let lua = LuaRuntime::new(Libraries::NONE);
        table(&lua, r#"{ 11, 22, "oops", 44 }"#);
        let mut seen = Vec::new();
        for position in lua.ipairs(-1, Some(LuaType::Number)) {
            seen.push((position, lua.to_int(-1).unwrap()));
            assert_eq!(lua.top(), 2);
        }
        assert_eq!(seen, [(1, 11), (2, 22)]);
        assert_eq!(lua.top(), 1);
    }

    #[test]
    fn unconstrained_iteration_stops_at_nil() {
        let lua = LuaRuntime::new(Libraries::NONE);
        table(&lua, r#"{ 1, "two", true, nil, 5 }"#);
        assert_eq!(lua.ipairs(1, None).count(), 3);
        assert_eq!(lua.top(), 1);
    }

    #[test]
    fn early_break_restores_depth() {
        let lua = LuaRuntime::new(Libraries::NONE);
        table(&lua, "{ 'a', 'b', 'c' }");
        for position in lua.ipairs(1, None) {
            lua.push_nil();
            lua.push_nil();
            if position == 2 {
                break;
            }
        }
        assert_eq!(lua.top(), 1);

        let mut entries = lua.pairs(1);
        assert!(entries.next().is_some());
        drop(entries);
        assert_eq!(lua.top(), 1);
    }

    #[test]
    #[should_panic(expected = "not a table")]
    fn ipairs_over_a_non_table_is_fatal() {
        let lua = LuaRuntime::new(Libraries::NONE);
        lua.push(3);
        let _ = lua.ipairs(-1, None);
    }

    #[test]
    #[should_panic(expected = "cannot require nil")]
    fn requiring_nil_is_fatal() {
        let lua = LuaRuntime::new(Libraries::NONE);
        table(&lua, "{}");
        let _ = lua.ipairs(-1, Some(LuaType::Nil));
    }

    #[test]
    fn pairs_visits_every_entry() {
        let lua = LuaRuntime::new(Libraries::NONE);
        table(&lua, "{ x = 1, y = 2, 30 }");
        let mut seen = HashMap::new();
        for (key, value) in lua.pairs(-1) {
            let key = lua
                .to_string(key)
                .unwrap_or_else(|| lua.to_int(key).unwrap().to_string());
            seen.insert(key, lua.to_int(value).unwrap());
            assert_eq!(lua.top(), 3);
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(seen["x"], 1);
        assert_eq!(seen["y"], 2);
        assert_eq!(seen["1"], 30);
        assert_eq!(lua.top(), 1);
    }

    #[test]
    fn pairs_over_an_empty_table() {
        let lua = LuaRuntime::new(Libraries::NONE);
        table(&lua, "{}");
        assert_eq!(lua.pairs(1).count(), 0);
        assert_eq!(lua.top(), 1);
    }
}
