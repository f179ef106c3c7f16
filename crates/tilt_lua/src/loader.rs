//! Module loader
//!
//! Replaces the package library's file searchers with one that resolves
//! `require` names against a single directory. The C-library searchers are
//! removed outright: an embedded VM has no business loading native code.

use std::ffi::{c_int, OsStr};
use std::io::ErrorKind;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::boundary::CallbackResult;
use crate::error::LuaCallError;
use crate::ffi::sys;
use crate::frame::StackFrame;
use crate::runtime::{LuaState, LuaType};

fn default_extension() -> String {
    "lua".to_string()
}

/// Where `require` looks for modules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequireRoot {
    /// Directory module paths are resolved against.
    pub root: PathBuf,
    /// Prepended to the module's relative path in chunk names, and so in
    /// error messages and tracebacks.
    #[serde(default)]
    pub display_prefix: String,
    #[serde(default = "default_extension")]
    pub extension: String,
}

impl RequireRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            display_prefix: String::new(),
            extension: default_extension(),
        }
    }

    pub fn with_display_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.display_prefix = prefix.into();
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Path of module `name` relative to the root: dots become directory
    /// separators.
    pub fn relative_path(&self, name: &str) -> String {
        format!("{}.{}", name.replace('.', "/"), self.extension)
    }

    pub fn resolve(&self, name: &str) -> PathBuf {
        self.root.join(self.relative_path(name))
    }
}

impl LuaState {
    /// Route `require` through `root`.
    ///
    /// Panics if the package library is not open.
    pub fn set_require_root(&self, root: &RequireRoot) {
        let raw = self.as_ptr();
        let frame = StackFrame::enter(self);
        assert_eq!(
            self.get_global("package"),
            LuaType::Table,
            "the module loader needs the package library"
        );
        let searchers = unsafe { sys::lua_getfield(raw, -1, c"searchers".as_ptr()) };
        assert_eq!(
            searchers,
            sys::LUA_TTABLE,
            "package.searchers is missing or not a table"
        );

        // raw bytes, so no string encoding can lose part of the path
        self.ensure_stack(4);
        self.push_bytes(root.root.as_os_str().as_encoded_bytes());
        self.push_bytes(root.display_prefix.as_bytes());
        self.push_bytes(root.extension.as_bytes());
        self.push_closure(search_module, 3);
        unsafe {
            sys::lua_rawseti(raw, -2, 2);
            sys::lua_pushnil(raw);
            sys::lua_rawseti(raw, -2, 4);
            sys::lua_pushnil(raw);
            sys::lua_rawseti(raw, -2, 3);
        }
        drop(frame);
        tracing::debug!(
            root = %root.root.display(),
            prefix = %root.display_prefix,
            "installed module searcher"
        );
    }
}

/// `package.searchers[2]`: returns the compiled chunk and its path, or a
/// message for `require`'s not-found report.
fn search_module(state: &LuaState) -> CallbackResult {
    let Some(name) = state.to_string(1) else {
        state.push_nil();
        return Ok(1);
    };
    let root = searcher_root(state)?;
    let relative = root.relative_path(&name);
    let path = root.root.join(&relative);

    let contents = match std::fs::read(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::trace!(module = %name, path = %path.display(), "module not found");
            state.push(format!("no resource '{name}'"));
            return Ok(1);
        }
        Err(e) => {
            return Err(LuaCallError::new(format!(
                "cannot read module '{name}' from {}: {e}",
                path.display()
            ))
            .into())
        }
    };

    let chunk_name = format!("@{}{}", root.display_prefix, relative);
    state.load_buffer(&contents, &chunk_name, "t")?;
    state.push(&*path.to_string_lossy());
    tracing::debug!(module = %name, path = %path.display(), "loaded module");
    Ok(2)
}

/// Rebuild the [`RequireRoot`] captured in the searcher's upvalues.
fn searcher_root(state: &LuaState) -> Result<RequireRoot, LuaCallError> {
    let upvalue = |n: c_int, what: &str| {
        state
            .to_bytes(state.upvalue(n))
            .ok_or_else(|| LuaCallError::new(format!("module searcher has no {what}")))
    };
    let root = upvalue(1, "root directory")?;
    let display_prefix = upvalue(2, "display prefix")?;
    let extension = upvalue(3, "module extension")?;
    Ok(RequireRoot {
        // SAFETY: pushed from `OsStr::as_encoded_bytes` by `set_require_root`
        root: PathBuf::from(unsafe { OsStr::from_encoded_bytes_unchecked(&root) }),
        display_prefix: String::from_utf8_lossy(&display_prefix).into_owned(),
        extension: String::from_utf8_lossy(&extension).into_owned(),
    })
}
