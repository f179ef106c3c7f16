//! Tilt Lua Bridge
//!
//! Stack-level bridge between Rust host values and an embedded Lua 5.4 VM.
//!
//! ## Architecture
//!
//! - **Runtime:** owns the `lua_State`, selects standard libraries, exposes collector controls
//! - **Values:** `Push` / `FromStack` convert between host values and stack slots
//! - **Userdata:** per-VM metatable registry for boxed host objects, finalized by the VM collector
//! - **Calls:** protected calls surface every VM failure as a single [`LuaCallError`]
//! - **Boundary:** host functions called by the VM never unwind through VM frames
//!
//! Every operation leaves the stack at its entry depth plus its documented
//! result count, on success and failure alike. [`StackFrame`] enforces this.
//!
//! ```
//! use tilt_lua::{Libraries, LuaRuntime, Value};
//!
//! let lua = LuaRuntime::new(Libraries::SAFE);
//! lua.push(1234);
//! assert_eq!(lua.to_int(-1), Some(1234));
//! lua.pop(1);
//!
//! lua.do_string("function double(x) return x * 2 end", "=example").unwrap();
//! let doubled: Option<i64> = lua.call_global("double", &[Value::from(21)]).unwrap();
//! assert_eq!(doubled, Some(42));
//! ```

pub mod boundary;
pub mod call;
pub mod config;
pub mod encoding;
pub mod error;
pub mod ffi;
pub mod frame;
pub mod iter;
pub mod loader;
pub mod runtime;
pub mod userdata;
pub mod value;

pub use boundary::{CallbackResult, HostFunction};
pub use call::CallResults;
pub use config::RuntimeConfig;
pub use encoding::StringEncoding;
pub use error::LuaCallError;
pub use ffi::LightPointer;
pub use frame::StackFrame;
pub use iter::{IPairs, Pairs};
pub use loader::RequireRoot;
pub use runtime::{GcAction, Libraries, LuaRuntime, LuaState, LuaType};
pub use userdata::HostObject;
pub use value::{
    FromStack, FunctionRef, LuaValue, Push, StringRef, TableRef, Userdata, UserdataRef, Value,
};

/// Bridge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
