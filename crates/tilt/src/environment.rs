//! Template environment
//!
//! A [`TiltEnvironment`] is a Lua VM with the templating scripts loaded.
//! The scripts do the rendering; this side only moves values in and out.
//! After construction the VM can be customised through
//! [`TiltEnvironment::runtime`]:
//!
//! - a global `readFile(path)` controls where template includes come from
//! - a global `printWarning(text)` receives the output of `warning(...)`;
//!   by default it goes to the log

use std::ffi::c_int;

use tilt_lua::{
    CallResults, CallbackResult, HostFunction, LuaRuntime, LuaState, LuaType, StackFrame, Value,
};

use crate::config::EnvironmentConfig;
use crate::error::{Result, TiltError};

/// Output of [`TiltEnvironment::render`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderResult {
    pub text: String,
    /// Every template the render read, including the rendered file itself
    /// and the global includes. Unordered.
    pub includes: Vec<String>,
}

pub struct TiltEnvironment {
    lua: LuaRuntime,
    config: EnvironmentConfig,
}

impl TiltEnvironment {
    /// Start a VM, install the script loader and run the entry module.
    pub fn new(config: EnvironmentConfig) -> Result<Self> {
        if !config.script_root.is_dir() {
            return Err(TiltError::MissingScriptRoot(config.script_root.clone()));
        }

        let lua = LuaRuntime::from_config(&config.runtime_config());
        lua.register_global_fn("printWarning", print_warning);

        lua.get_global("require");
        lua.pcall_args(&[Value::from(config.entry_module.as_str())], true)?;

        tracing::info!(
            root = %config.script_root.display(),
            entry = %config.entry_module,
            "template environment ready"
        );
        Ok(Self { lua, config })
    }

    /// The underlying VM.
    pub fn runtime(&self) -> &LuaRuntime {
        &self.lua
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    /// Render `contents` as the template `filename`.
    ///
    /// `context` is made available to the template in addition to anything
    /// set with [`set_context`](Self::set_context). `global_includes` are
    /// included ahead of the template, as if it started with an
    /// `include` of each.
    pub fn render(
        &self,
        filename: &str,
        contents: &str,
        context: Option<Value>,
        global_includes: &[&str],
    ) -> Result<RenderResult> {
        let lua = &self.lua;
        let frame = StackFrame::enter(lua);
        lua.get_global("render");
        lua.push(filename);
        lua.push(contents);
        lua.push(context);
        lua.push(global_includes);
        // render() runs the template under its own xpcall, so no second
        // traceback here
        lua.pcall(4, CallResults::Fixed(2), false)?;

        let text_index = frame.base() + 1;
        let includes_index = frame.base() + 2;
        let text = lua
            .to_string(text_index)
            .ok_or_else(|| unexpected(lua, "render", "a string", text_index))?;
        let includes = match lua.type_of(includes_index) {
            Some(LuaType::Table) => lua
                .pairs(includes_index)
                .filter_map(|(key, _)| lua.to_string(key))
                .collect(),
            Some(LuaType::Nil) => Vec::new(),
            _ => return Err(unexpected(lua, "render", "a table of includes", includes_index)),
        };
        drop(frame);

        tracing::debug!(filename, includes = includes.len(), "rendered template");
        Ok(RenderResult { text, includes })
    }

    /// Parse `contents` without rendering and return the script's parse
    /// tree.
    pub fn parse(&self, filename: &str, contents: &str) -> Result<Value> {
        let lua = &self.lua;
        let frame = StackFrame::enter(lua);
        lua.get_global("parse");
        lua.push(filename);
        lua.push(contents);
        lua.pcall(2, CallResults::Fixed(1), true)?;
        let tree = lua
            .to_value::<Value>(-1)
            .ok_or_else(|| unexpected(lua, "parse", "plain data", -1))?;
        drop(frame);
        Ok(tree)
    }

    /// Add the entries of `context` to the environment every template sees.
    pub fn set_context(&self, context: Value) -> Result<()> {
        self.lua.get_global("setContext");
        self.lua.pcall_args(&[context], true)?;
        Ok(())
    }

    /// Replace the script-side `readFile(path)` used to load includes.
    pub fn set_read_file(&self, read_file: HostFunction) {
        self.lua.register_global_fn("readFile", read_file);
    }
}

fn unexpected(lua: &LuaState, function: &'static str, expected: &'static str, index: c_int) -> TiltError {
    TiltError::UnexpectedResult {
        function,
        expected,
        found: lua.type_of(index).map_or("nothing", LuaType::name).to_string(),
    }
}

/// Default `printWarning(text)`.
fn print_warning(state: &LuaState) -> CallbackResult {
    let text = state
        .to_string_with(1, state.default_string_encoding(), true)
        .unwrap_or_default();
    tracing::warn!(target: "tilt::template", "{text}");
    Ok(0)
}
