//! Protected calls and script loading
//!
//! Every way into script code goes through [`LuaState::pcall`], which turns
//! any failure inside the VM into a [`LuaCallError`]. Whether the failure
//! came from script code or from a host function the script called makes no
//! difference here.

use std::ffi::c_int;
use std::path::Path;

use crate::error::LuaCallError;
use crate::ffi::{c_name, sys};
use crate::frame::StackFrame;
use crate::runtime::LuaState;
use crate::value::{FromStack, Value};

/// How many results a protected call leaves on the stack.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CallResults {
    /// Exactly this many, padded with nil or truncated.
    Fixed(c_int),
    /// Everything the function returned.
    All,
}

impl CallResults {
    fn raw(self) -> c_int {
        match self {
            CallResults::Fixed(n) => n,
            CallResults::All => sys::LUA_MULTRET,
        }
    }
}

impl LuaState {
    /// Call the function below the top `nargs` values under protection.
    ///
    /// The function and its arguments are consumed. On success the results
    /// are left in their place; on failure nothing is, and the error value
    /// is formatted into the returned error. With `traceback` the message
    /// carries a stack traceback from the point of failure.
    pub fn pcall(
        &self,
        nargs: c_int,
        results: CallResults,
        traceback: bool,
    ) -> Result<(), LuaCallError> {
        let raw = self.as_ptr();
        let function = self.top() - nargs;
        assert!(
            nargs >= 0 && function >= 1,
            "pcall needs a function below its {nargs} arguments"
        );
        let handler = if traceback {
            self.ensure_stack(1);
            unsafe {
                sys::lua_pushcfunction(raw, traceback_handler);
                sys::lua_rotate(raw, function, 1);
            }
            function
        } else {
            0
        };

        tracing::trace!(nargs, ?results, traceback, "protected call");
        let status = unsafe { sys::lua_pcall(raw, nargs, results.raw(), handler) };
        if traceback {
            unsafe { sys::lua_remove(raw, handler) };
        }
        if status == sys::LUA_OK {
            return Ok(());
        }

        let message = self.error_message(-1);
        self.pop(1);
        tracing::debug!(status, %message, "script error");
        Err(LuaCallError::new(message))
    }

    /// Call the function at the top with `args`, discarding its results.
    pub fn pcall_args(&self, args: &[Value], traceback: bool) -> Result<(), LuaCallError> {
        let frame = StackFrame::consuming(self, 1);
        self.push_args(args);
        self.pcall(args_len(args), CallResults::Fixed(0), traceback)?;
        frame.leave(0);
        Ok(())
    }

    /// Call the function at the top with `args` and decode its first
    /// result. The stack is left as it was before the function was pushed.
    /// `Ok(None)` means the call succeeded but its result is not a `T`.
    pub fn pcall_value<T: FromStack>(
        &self,
        args: &[Value],
        traceback: bool,
    ) -> Result<Option<T>, LuaCallError> {
        let frame = StackFrame::consuming(self, 1);
        self.push_args(args);
        self.pcall(args_len(args), CallResults::Fixed(1), traceback)?;
        let value = self.to_value::<T>(-1);
        drop(frame);
        Ok(value)
    }

    /// Call the global function `name` with `args` and decode its first
    /// result.
    pub fn call_global<T: FromStack>(
        &self,
        name: &str,
        args: &[Value],
    ) -> Result<Option<T>, LuaCallError> {
        self.get_global(name);
        self.pcall_value(args, false)
    }

    fn push_args(&self, args: &[Value]) {
        self.ensure_stack(args_len(args));
        for arg in args {
            self.push_any(arg);
        }
    }

    /// Describe the error value at `index` without raising.
    pub(crate) fn error_message(&self, index: c_int) -> String {
        if let Some(bytes) = self.to_bytes(index) {
            return String::from_utf8_lossy(&bytes).into_owned();
        }
        let frame = StackFrame::enter(self);
        let message = if self.protected_tostring(index) {
            self.to_bytes(-1)
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        } else {
            None
        };
        drop(frame);
        message.unwrap_or_else(|| {
            let type_name = self.type_of(index).map_or("no", |ty| ty.name());
            format!("(error object is a {type_name} value)")
        })
    }

    /// Compile `chunk` and push it as a function. `mode` is `"t"` (text
    /// only), `"b"` (binary only) or `"bt"`. A compile error is returned
    /// with nothing pushed.
    pub fn load_buffer(&self, chunk: &[u8], chunk_name: &str, mode: &str) -> Result<(), LuaCallError> {
        let raw = self.as_ptr();
        let name = c_name(chunk_name);
        let mode = c_name(mode);
        self.ensure_stack(1);
        let status = unsafe {
            sys::luaL_loadbufferx(
                raw,
                chunk.as_ptr().cast(),
                chunk.len(),
                name.as_ptr(),
                mode.as_ptr(),
            )
        };
        if status == sys::LUA_OK {
            return Ok(());
        }
        let message = self.error_message(-1);
        self.pop(1);
        Err(LuaCallError::new(message))
    }

    /// Compile Lua source text and push it as a function.
    pub fn load_string(&self, source: &str, chunk_name: &str) -> Result<(), LuaCallError> {
        self.load_buffer(source.as_bytes(), chunk_name, "t")
    }

    /// Compile the file at `path` and push it as a function. A leading `#`
    /// line is skipped.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<(), LuaCallError> {
        let path = path.as_ref();
        let mut contents = std::fs::read(path)
            .map_err(|e| LuaCallError::new(format!("cannot read {}: {e}", path.display())))?;
        skip_shebang(&mut contents);
        self.load_buffer(&contents, &format!("@{}", path.display()), "bt")
    }

    /// Compile and run `source`, with a traceback on failure.
    pub fn do_string(&self, source: &str, chunk_name: &str) -> Result<(), LuaCallError> {
        let frame = StackFrame::enter(self);
        self.load_string(source, chunk_name)?;
        self.pcall(0, CallResults::Fixed(0), true)?;
        frame.leave(0);
        Ok(())
    }

    /// Compile and run the file at `path`, with a traceback on failure.
    pub fn do_file(&self, path: impl AsRef<Path>) -> Result<(), LuaCallError> {
        let frame = StackFrame::enter(self);
        self.load_file(path)?;
        self.pcall(0, CallResults::Fixed(0), true)?;
        frame.leave(0);
        Ok(())
    }
}

fn args_len(args: &[Value]) -> c_int {
    c_int::try_from(args.len()).unwrap_or(c_int::MAX)
}

/// Blank out a first line starting with `#`, keeping its newline so line
/// numbers stay right.
fn skip_shebang(contents: &mut Vec<u8>) {
    if contents.first() == Some(&b'#') {
        let end = contents
            .iter()
            .position(|&b| b == b'\n')
            .unwrap_or(contents.len());
        contents.drain(..end);
    }
}

/// Message handler: append a traceback to string messages, starting at
/// the function that raised rather than at the handler itself.
unsafe extern "C-unwind" fn traceback_handler(raw: *mut sys::lua_State) -> c_int {
    let message = sys::lua_tostring(raw, 1);
    if message.is_null() {
        // leave non-string error objects alone
        return 1;
    }
    sys::luaL_traceback(raw, raw, message, 1);
    1
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::runtime::{Libraries, LuaRuntime, LuaType};

    #[test]
    fn script_errors_surface_their_message() {
        let lua = LuaRuntime::new(Libraries::NONE);
        lua.push(1);
        assert_eq!(lua.get_global("error"), LuaType::Function);
        let err = lua
            .pcall_args(&[Value::from("Deliberate error"), Value::from(0)], false)
            .unwrap_err();
        assert_eq!(err.message(), "Deliberate error");
        assert_eq!(lua.top(), 1);
        lua.pop(1);
    }

    #[test]
    fn stack_balance_holds_on_both_paths() {
        let lua = LuaRuntime::new(Libraries::NONE);
        lua.do_string("function twice(x) return x, x end", "=test").unwrap();
        for traceback in [false, true] {
            lua.get_global("twice");
            lua.push(5);
            lua.pcall(1, CallResults::Fixed(2), traceback).unwrap();
            assert_eq!(lua.top(), 2);
            assert_eq!(lua.to_int(1), Some(5));
            assert_eq!(lua.to_int(2), Some(5));
            lua.set_top(0);

            lua.get_global("error");
            lua.push("bad");
            assert!(lua.pcall(1, CallResults::Fixed(2), traceback).is_err());
            assert_eq!(lua.top(), 0);
        }
    }

    #[test]
    fn all_results_are_kept() {
        let lua = LuaRuntime::new(Libraries::NONE);
        lua.load_string("return 1, 2, 3", "=test").unwrap();
        lua.pcall(0, CallResults::All, false).unwrap();
        assert_eq!(lua.top(), 3);
    }

    #[test]
    fn traceback_is_appended_on_request() {
        let lua = LuaRuntime::new(Libraries::NONE);
        lua.load_string("error('deep')", "=chunk").unwrap();
        let err = lua.pcall(0, CallResults::Fixed(0), true).unwrap_err();
        assert!(err.message().starts_with("chunk:1: deep"));
        assert!(err.message().contains("stack traceback:"));

        lua.load_string("error('shallow')", "=chunk").unwrap();
        let err = lua.pcall(0, CallResults::Fixed(0), false).unwrap_err();
        assert_eq!(err.message(), "chunk:1: shallow");
        assert_eq!(lua.top(), 0);
    }

    #[test]
    fn traceback_starts_at_the_failing_function() {
        let lua = LuaRuntime::new(Libraries::NONE);
        lua.load_string("local t = nil\nreturn t.field", "=chunk").unwrap();
        let err = lua.pcall(0, CallResults::Fixed(0), true).unwrap_err();
        assert!(
            err.message().contains("stack traceback:\n\tchunk:2:"),
            "{}",
            err.message()
        );
        assert_eq!(lua.top(), 0);
    }

    #[test]
    fn non_string_errors_are_described() {
        let lua = LuaRuntime::new(Libraries::NONE);
        lua.load_string("error({})", "=test").unwrap();
        let err = lua.pcall(0, CallResults::Fixed(0), false).unwrap_err();
        assert!(err.message().starts_with("table: "));

        lua.load_string(
            "error(setmetatable({}, { __tostring = function() return 'pretty' end }))",
            "=test",
        )
        .unwrap();
        let err = lua.pcall(0, CallResults::Fixed(0), true).unwrap_err();
        assert_eq!(err.message(), "pretty");
        assert_eq!(lua.top(), 0);
    }

    #[test]
    fn compile_errors_use_the_same_kind() {
        let lua = LuaRuntime::new(Libraries::NONE);
        let err = lua.load_string("return +", "=broken").unwrap_err();
        assert!(err.message().starts_with("broken:1:"));
        assert_eq!(lua.top(), 0);
        assert!(lua.do_string("x = = 1", "=broken").is_err());
        assert_eq!(lua.top(), 0);
    }

    #[test]
    fn call_global_decodes_the_first_result() {
        let lua = LuaRuntime::new(Libraries::NONE);
        lua.do_string("function greet(name) return 'hi ' .. name end", "=test")
            .unwrap();
        let greeting: Option<String> = lua.call_global("greet", &[Value::from("bob")]).unwrap();
        assert_eq!(greeting.as_deref(), Some("hi bob"));
        let wrong: Option<i64> = lua.call_global("greet", &[Value::from("bob")]).unwrap();
        assert_eq!(wrong, None);
        assert!(lua.call_global::<i64>("missing", &[]).is_err());
        assert_eq!(lua.top(), 0);
    }

    #[test]
    fn files_load_with_their_path_as_chunk_name() {
        let lua = LuaRuntime::new(Libraries::NONE);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "#!/usr/bin/env lua").unwrap();
        writeln!(file, "answer = 6 * 7").unwrap();
        writeln!(file, "error('line three')").unwrap();
        let err = lua.do_file(file.path()).unwrap_err();
        assert!(err.message().contains(":3: line three"), "{}", err.message());
        lua.get_global("answer");
        assert_eq!(lua.to_int(-1), Some(42));
        lua.pop(1);

        let missing = lua.load_file("/nonexistent/script.lua").unwrap_err();
        assert!(missing.message().starts_with("cannot read"));
        assert_eq!(lua.top(), 0);
    }
}
