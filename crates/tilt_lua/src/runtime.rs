//! VM runtime management
//!
//! [`LuaRuntime`] owns a Lua 5.4 state. [`LuaState`] is the non-owning view
//! every stack operation is defined on; host functions called back from the
//! VM receive one for the calling state.

use std::ffi::{c_int, CStr};
use std::fmt;
use std::ops::{BitOr, BitOrAssign, Deref};
use std::ptr::NonNull;

use serde::{Deserialize, Serialize};

use crate::ffi::{c_name, sys};

/// Standard libraries that can be opened in a new VM.
///
/// The base library is always opened. [`Libraries::SAFE`] leaves out
/// everything that reaches the host system (`io`, `os`, `package`,
/// `debug`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "LibrariesRepr", into = "Vec<String>")]
pub struct Libraries(u16);

impl Libraries {
    pub const NONE: Libraries = Libraries(0);
    pub const PACKAGE: Libraries = Libraries(1);
    pub const COROUTINE: Libraries = Libraries(1 << 1);
    pub const TABLE: Libraries = Libraries(1 << 2);
    pub const IO: Libraries = Libraries(1 << 3);
    pub const OS: Libraries = Libraries(1 << 4);
    pub const STRING: Libraries = Libraries(1 << 5);
    pub const MATH: Libraries = Libraries(1 << 6);
    pub const UTF8: Libraries = Libraries(1 << 7);
    pub const DEBUG: Libraries = Libraries(1 << 8);

    pub const ALL: Libraries = Libraries(0x1ff);
    pub const SAFE: Libraries = Libraries(
        Self::COROUTINE.0 | Self::TABLE.0 | Self::STRING.0 | Self::MATH.0 | Self::UTF8.0,
    );

    pub const fn union(self, other: Libraries) -> Libraries {
        Libraries(self.0 | other.0)
    }

    pub const fn contains(self, other: Libraries) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Look up a single library by its global name (`"string"`, `"os"`, ...).
    pub fn from_name(name: &str) -> Option<Libraries> {
        LIBRARY_OPENERS
            .iter()
            .find(|lib| lib.name.to_bytes() == name.as_bytes())
            .map(|lib| lib.flag)
    }

    /// Global names of the libraries in this set, in opening order.
    pub fn names(self) -> impl Iterator<Item = &'static str> {
        LIBRARY_OPENERS
            .iter()
            .filter(move |lib| self.contains(lib.flag))
            .filter_map(|lib| lib.name.to_str().ok())
    }
}

impl BitOr for Libraries {
    type Output = Libraries;

    fn bitor(self, rhs: Libraries) -> Libraries {
        self.union(rhs)
    }
}

impl BitOrAssign for Libraries {
    fn bitor_assign(&mut self, rhs: Libraries) {
        *self = self.union(rhs);
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LibrariesRepr {
    Preset(String),
    List(Vec<String>),
}

impl TryFrom<LibrariesRepr> for Libraries {
    type Error = String;

    fn try_from(repr: LibrariesRepr) -> Result<Self, Self::Error> {
        match repr {
            LibrariesRepr::Preset(name) => match name.as_str() {
                "all" => Ok(Libraries::ALL),
                "safe" => Ok(Libraries::SAFE),
                "none" => Ok(Libraries::NONE),
                other => Libraries::from_name(other)
                    .ok_or_else(|| format!("unknown library or preset '{other}'")),
            },
            LibrariesRepr::List(names) => names.iter().try_fold(Libraries::NONE, |set, name| {
                Libraries::from_name(name)
                    .map(|lib| set | lib)
                    .ok_or_else(|| format!("unknown library '{name}'"))
            }),
        }
    }
}

impl From<Libraries> for Vec<String> {
    fn from(libraries: Libraries) -> Self {
        libraries.names().map(str::to_string).collect()
    }
}

struct LibraryOpener {
    flag: Libraries,
    name: &'static CStr,
    open: sys::lua_CFunction,
}

static LIBRARY_OPENERS: [LibraryOpener; 9] = [
    LibraryOpener { flag: Libraries::PACKAGE, name: c"package", open: sys::luaopen_package },
    LibraryOpener { flag: Libraries::COROUTINE, name: c"coroutine", open: sys::luaopen_coroutine },
    LibraryOpener { flag: Libraries::TABLE, name: c"table", open: sys::luaopen_table },
    LibraryOpener { flag: Libraries::IO, name: c"io", open: sys::luaopen_io },
    LibraryOpener { flag: Libraries::OS, name: c"os", open: sys::luaopen_os },
    LibraryOpener { flag: Libraries::STRING, name: c"string", open: sys::luaopen_string },
    LibraryOpener { flag: Libraries::MATH, name: c"math", open: sys::luaopen_math },
    LibraryOpener { flag: Libraries::UTF8, name: c"utf8", open: sys::luaopen_utf8 },
    LibraryOpener { flag: Libraries::DEBUG, name: c"debug", open: sys::luaopen_debug },
];

/// Type tag of a stack slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum LuaType {
    Nil = 0,
    Boolean = 1,
    LightUserdata = 2,
    Number = 3,
    String = 4,
    Table = 5,
    Function = 6,
    Userdata = 7,
    Thread = 8,
}

impl LuaType {
    /// `None` for `LUA_TNONE`, i.e. a valid but empty stack position.
    pub fn from_raw(raw: c_int) -> Option<LuaType> {
        match raw {
            sys::LUA_TNIL => Some(LuaType::Nil),
            sys::LUA_TBOOLEAN => Some(LuaType::Boolean),
            sys::LUA_TLIGHTUSERDATA => Some(LuaType::LightUserdata),
            sys::LUA_TNUMBER => Some(LuaType::Number),
            sys::LUA_TSTRING => Some(LuaType::String),
            sys::LUA_TTABLE => Some(LuaType::Table),
            sys::LUA_TFUNCTION => Some(LuaType::Function),
            sys::LUA_TUSERDATA => Some(LuaType::Userdata),
            sys::LUA_TTHREAD => Some(LuaType::Thread),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            LuaType::Nil => "nil",
            LuaType::Boolean => "boolean",
            LuaType::LightUserdata => "lightuserdata",
            LuaType::Number => "number",
            LuaType::String => "string",
            LuaType::Table => "table",
            LuaType::Function => "function",
            LuaType::Userdata => "userdata",
            LuaType::Thread => "thread",
        }
    }
}

impl fmt::Display for LuaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Collector actions accepted by [`LuaState::collect_garbage`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GcAction {
    Stop,
    Restart,
    Collect,
}

impl GcAction {
    fn raw(self) -> c_int {
        match self {
            GcAction::Stop => sys::LUA_GCSTOP,
            GcAction::Restart => sys::LUA_GCRESTART,
            GcAction::Collect => sys::LUA_GCCOLLECT,
        }
    }
}

/// Non-owning view of a Lua state.
///
/// Not `Send` or `Sync`: one VM is one thread of control, and nothing here
/// synchronizes access to it.
#[repr(transparent)]
pub struct LuaState {
    raw: NonNull<sys::lua_State>,
}

impl LuaState {
    /// # Safety
    /// `raw` must point to a live Lua state for as long as the view is used.
    pub(crate) unsafe fn from_raw(raw: *mut sys::lua_State) -> LuaState {
        LuaState {
            raw: NonNull::new(raw).expect("null lua_State"),
        }
    }

    /// Raw state pointer, for C API calls the bridge does not wrap.
    pub fn as_ptr(&self) -> *mut sys::lua_State {
        self.raw.as_ptr()
    }

    pub fn top(&self) -> c_int {
        unsafe { sys::lua_gettop(self.as_ptr()) }
    }

    pub fn set_top(&self, top: c_int) {
        unsafe { sys::lua_settop(self.as_ptr(), top) }
    }

    pub fn pop(&self, count: c_int) {
        unsafe { sys::lua_pop(self.as_ptr(), count) }
    }

    /// Push a copy of the value at `index`.
    pub fn push_value(&self, index: c_int) {
        unsafe { sys::lua_pushvalue(self.as_ptr(), index) }
    }

    pub fn abs_index(&self, index: c_int) -> c_int {
        unsafe { sys::lua_absindex(self.as_ptr(), index) }
    }

    /// Make room for `extra` more slots. Failing to grow the stack is fatal.
    pub fn ensure_stack(&self, extra: c_int) {
        let grown = unsafe { sys::lua_checkstack(self.as_ptr(), extra) };
        assert!(grown != 0, "Lua stack cannot grow by {extra} slots");
    }

    /// Type of the value at `index`, or `None` for an empty position.
    pub fn type_of(&self, index: c_int) -> Option<LuaType> {
        LuaType::from_raw(unsafe { sys::lua_type(self.as_ptr(), index) })
    }

    pub fn is_none(&self, index: c_int) -> bool {
        self.type_of(index).is_none()
    }

    pub fn is_none_or_nil(&self, index: c_int) -> bool {
        matches!(self.type_of(index), None | Some(LuaType::Nil))
    }

    pub fn push_nil(&self) {
        unsafe { sys::lua_pushnil(self.as_ptr()) }
    }

    /// Push the globals table (`_G`).
    pub fn push_globals(&self) {
        unsafe {
            sys::lua_rawgeti(
                self.as_ptr(),
                sys::LUA_REGISTRYINDEX,
                sys::LUA_RIDX_GLOBALS as sys::lua_Integer,
            );
        }
    }

    /// Push the global `name` and return its type.
    pub fn get_global(&self, name: &str) -> LuaType {
        let name = c_name(name);
        let raw = unsafe { sys::lua_getglobal(self.as_ptr(), name.as_ptr()) };
        LuaType::from_raw(raw).unwrap_or(LuaType::Nil)
    }

    /// Pop the top value into the global `name`.
    pub fn set_global(&self, name: &str) {
        let name = c_name(name);
        unsafe { sys::lua_setglobal(self.as_ptr(), name.as_ptr()) }
    }

    /// Open a library with `opener` as `package.loaded[name]`, optionally
    /// also setting the global `name`. Leaves the stack unchanged.
    pub fn require_f(&self, name: &CStr, opener: sys::lua_CFunction, global: bool) {
        unsafe {
            sys::luaL_requiref(self.as_ptr(), name.as_ptr(), opener, c_int::from(global));
        }
        self.pop(1);
    }

    pub fn open_libraries(&self, libraries: Libraries) {
        for lib in LIBRARY_OPENERS.iter().filter(|lib| libraries.contains(lib.flag)) {
            self.require_f(lib.name, lib.open, true);
        }
    }

    pub fn collect_garbage(&self, action: GcAction) {
        unsafe {
            sys::lua_gc(self.as_ptr(), action.raw(), 0);
        }
    }

    pub fn collector_running(&self) -> bool {
        unsafe { sys::lua_gc(self.as_ptr(), sys::LUA_GCISRUNNING, 0) != 0 }
    }

    /// Total memory in use by the VM, in bytes.
    pub fn collector_count(&self) -> usize {
        let (kib, rem) = unsafe {
            (
                sys::lua_gc(self.as_ptr(), sys::LUA_GCCOUNT, 0),
                sys::lua_gc(self.as_ptr(), sys::LUA_GCCOUNTB, 0),
            )
        };
        kib.max(0) as usize * 1024 + rem.max(0) as usize
    }
}

impl fmt::Debug for LuaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LuaState")
            .field("raw", &self.as_ptr())
            .field("top", &self.top())
            .finish()
    }
}

/// Owning handle to a Lua VM.
///
/// Dropping the runtime closes the state, which runs every pending userdata
/// finalizer.
pub struct LuaRuntime {
    state: LuaState,
}

impl LuaRuntime {
    /// Create a VM with the base library plus `libraries`.
    pub fn new(libraries: Libraries) -> Self {
        let raw = unsafe { sys::luaL_newstate() };
        // luaL_newstate only fails when the allocator does
        let state = unsafe { LuaState::from_raw(raw) };
        state.require_f(c"_G", sys::luaopen_base, true);
        state.open_libraries(libraries);
        tracing::debug!(
            libraries = ?libraries.names().collect::<Vec<_>>(),
            "created Lua state"
        );
        Self { state }
    }
}

impl Default for LuaRuntime {
    fn default() -> Self {
        Self::new(Libraries::ALL)
    }
}

impl Deref for LuaRuntime {
    type Target = LuaState;

    fn deref(&self) -> &LuaState {
        &self.state
    }
}

impl Drop for LuaRuntime {
    fn drop(&mut self) {
        unsafe { sys::lua_close(self.state.as_ptr()) };
        tracing::debug!("closed Lua state");
    }
}
