//! String encodings
//!
//! Lua strings are byte strings. Host strings are encoded on the way in and
//! decoded on the way out using either an explicit encoding or the VM's
//! default, which lives in the VM registry so every view of one VM agrees.

use std::borrow::Cow;
use std::ffi::c_int;

use serde::{Deserialize, Serialize};

use crate::ffi::sys;
use crate::runtime::LuaState;

const ENCODING_KEY: &std::ffi::CStr = c"tilt_lua.string_encoding";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StringEncoding {
    #[default]
    Utf8,
    /// ISO 8859-1: one byte per code point, U+0000 to U+00FF.
    Latin1,
}

impl StringEncoding {
    /// `None` when `text` has characters the encoding cannot represent.
    pub fn encode<'a>(self, text: &'a str) -> Option<Cow<'a, [u8]>> {
        match self {
            StringEncoding::Utf8 => Some(Cow::Borrowed(text.as_bytes())),
            StringEncoding::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).ok())
                .collect::<Option<Vec<u8>>>()
                .map(Cow::Owned),
        }
    }

    /// `None` when `bytes` are not valid in this encoding.
    pub fn decode(self, bytes: &[u8]) -> Option<String> {
        match self {
            StringEncoding::Utf8 => std::str::from_utf8(bytes).ok().map(str::to_string),
            StringEncoding::Latin1 => Some(bytes.iter().map(|&b| char::from(b)).collect()),
        }
    }

    fn to_raw(self) -> sys::lua_Integer {
        match self {
            StringEncoding::Utf8 => 0,
            StringEncoding::Latin1 => 1,
        }
    }

    fn from_raw(raw: sys::lua_Integer) -> StringEncoding {
        match raw {
            1 => StringEncoding::Latin1,
            _ => StringEncoding::Utf8,
        }
    }
}

impl LuaState {
    /// Encoding used by `push(&str)`, `to_string` and friends when none is
    /// given explicitly. UTF-8 unless changed.
    pub fn default_string_encoding(&self) -> StringEncoding {
        let raw = self.as_ptr();
        unsafe {
            sys::lua_getfield(raw, sys::LUA_REGISTRYINDEX, ENCODING_KEY.as_ptr());
            let mut isnum: c_int = 0;
            let value = sys::lua_tointegerx(raw, -1, &mut isnum);
            sys::lua_pop(raw, 1);
            if isnum == 0 {
                StringEncoding::Utf8
            } else {
                StringEncoding::from_raw(value)
            }
        }
    }

    pub fn set_default_string_encoding(&self, encoding: StringEncoding) {
        let raw = self.as_ptr();
        unsafe {
            sys::lua_pushinteger(raw, encoding.to_raw());
            sys::lua_setfield(raw, sys::LUA_REGISTRYINDEX, ENCODING_KEY.as_ptr());
        }
    }
}
