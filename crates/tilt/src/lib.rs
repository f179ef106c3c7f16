//! Tilt
//!
//! Template rendering backed by an embedded Lua VM. The templating language
//! itself is implemented by Lua scripts loaded from a script directory;
//! this crate starts the VM, loads the scripts and exchanges values with
//! them through [`tilt_lua`].
//!
//! ```
//! use tilt::{EnvironmentConfig, TiltEnvironment, Value};
//!
//! # fn main() -> tilt::Result<()> {
//! let scripts = concat!(env!("CARGO_MANIFEST_DIR"), "/scripts");
//! let env = TiltEnvironment::new(EnvironmentConfig::with_script_root(scripts))?;
//! let context = Value::Map(vec![(Value::from("name"), Value::from("world"))]);
//! let result = env.render("hello.tilt", "Hello {{name}}!", Some(context), &[])?;
//! assert_eq!(result.text, "Hello world!");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod environment;
pub mod error;

pub use config::EnvironmentConfig;
pub use environment::{RenderResult, TiltEnvironment};
pub use error::{Result, TiltError};
pub use tilt_lua::{self, Value};

/// Tilt version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
