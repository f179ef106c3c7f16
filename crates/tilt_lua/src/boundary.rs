//! Callback reentrancy boundary
//!
//! Host functions the VM calls (metatable callbacks, globals, the module
//! searcher) are plain Rust functions behind one C trampoline. A host
//! failure, whether an `Err` or a panic, must never unwind through Lua's C
//! frames: the trampoline turns it into a Lua error raised with
//! `lua_error`, which transfers control to the nearest protected call.
//!
//! `lua_error` does not return and skips Rust destructors, so the raise
//! happens only after every Rust value of the callback has been dropped.
//! The message string is the only thing left behind, in the VM's error slot.

use std::any::Any;
use std::error::Error;
use std::ffi::{c_int, c_void};
use std::panic::{self, AssertUnwindSafe};

use crate::error::LuaCallError;
use crate::ffi::{c_name, sys};
use crate::runtime::LuaState;

/// Result of a host function: the number of values it left on the stack.
pub type CallbackResult = Result<c_int, Box<dyn Error + 'static>>;

/// A host function callable from Lua.
///
/// Arguments are at stack indexes `1..=n`. Return the number of results
/// pushed. Upvalues given to [`LuaState::push_closure`] are read with
/// [`LuaState::upvalue`].
pub type HostFunction = fn(&LuaState) -> CallbackResult;

impl LuaState {
    /// Push `f` as a Lua function.
    pub fn push_function(&self, f: HostFunction) {
        self.push_closure(f, 0);
    }

    /// Push `f` as a Lua closure capturing the top `upvalues` values, which
    /// are popped.
    pub fn push_closure(&self, f: HostFunction, upvalues: c_int) {
        assert!(
            upvalues >= 0 && upvalues < 255,
            "a closure holds at most 254 host upvalues"
        );
        self.ensure_stack(1);
        let raw = self.as_ptr();
        unsafe {
            sys::lua_pushlightuserdata(raw, f as *const () as *mut c_void);
            // the function pointer becomes upvalue 1, ahead of the caller's
            sys::lua_rotate(raw, -(upvalues + 1), 1);
            sys::lua_pushcclosure(raw, trampoline, upvalues + 1);
        }
    }

    /// Set the global `name` to the host function `f`.
    pub fn register_global_fn(&self, name: &str, f: HostFunction) {
        self.push_function(f);
        self.set_global(name);
    }

    /// Set each named host function as a field of the table at the top.
    pub fn set_funcs(&self, functions: &[(&str, HostFunction)]) {
        let raw = self.as_ptr();
        for (name, f) in functions {
            self.push_function(*f);
            let name = c_name(name);
            unsafe { sys::lua_setfield(raw, -2, name.as_ptr()) };
        }
    }

    /// Pseudo-index of upvalue `n` (1-based) of the running host closure.
    pub fn upvalue(&self, n: c_int) -> c_int {
        // slot 1 holds the trampoline's function pointer
        sys::LUA_REGISTRYINDEX - (n + 1)
    }
}

unsafe extern "C-unwind" fn trampoline(raw: *mut sys::lua_State) -> c_int {
    let ptr = sys::lua_touserdata(raw, sys::LUA_REGISTRYINDEX - 1);
    let f = std::mem::transmute::<*mut c_void, HostFunction>(ptr);
    protect(raw, f)
}

/// Run `f` against `raw`, converting any host failure into a Lua error.
///
/// # Safety
/// Must only be called from a C function invoked by the VM on `raw`.
pub(crate) unsafe fn protect<F>(raw: *mut sys::lua_State, f: F) -> c_int
where
    F: FnOnce(&LuaState) -> CallbackResult,
{
    let message = match panic::catch_unwind(AssertUnwindSafe(|| {
        let state = LuaState::from_raw(raw);
        f(&state)
    })) {
        Ok(Ok(results)) => return results,
        Ok(Err(err)) => describe_error(err),
        Err(payload) => format!("host panic: {}", panic_message(payload.as_ref())),
    };
    push_message(raw, message);
    sys::lua_error(raw)
}

fn describe_error(err: Box<dyn Error + 'static>) -> String {
    match err.downcast::<LuaCallError>() {
        Ok(call_error) => call_error.into_message(),
        Err(other) => format!("host error: {other}"),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text
    } else {
        "non-string panic payload"
    }
}

unsafe fn push_message(raw: *mut sys::lua_State, message: String) {
    sys::lua_pushlstring(raw, message.as_ptr().cast(), message.len());
}
