//! Raw C API access
//!
//! The bridge talks to Lua through the `mlua-sys` bindings only. This module
//! re-exports them under one name and holds the small conversions every
//! other module needs when crossing into C.

use std::ffi::{c_void, CString};

pub use mlua_sys as sys;

/// Opaque light pointer as stored in a Lua light userdata slot.
///
/// The VM never owns or frees what it points to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LightPointer(pub *mut c_void);

impl LightPointer {
    pub fn as_ptr(&self) -> *mut c_void {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }
}

/// Convert a Rust string into a NUL-terminated C string.
///
/// Lua field and global names are C strings, so an interior NUL truncates
/// the name at that point.
pub(crate) fn c_name(name: &str) -> CString {
    match CString::new(name) {
        Ok(owned) => owned,
        Err(err) => {
            let end = err.nul_position();
            CString::new(&name.as_bytes()[..end]).unwrap_or_default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c_name_truncates_at_interior_nul() {
        assert_eq!(c_name("render").to_bytes(), b"render");
        assert_eq!(c_name("ren\0der").to_bytes(), b"ren");
    }

    #[test]
    fn light_pointer_null() {
        assert!(LightPointer(std::ptr::null_mut()).is_null());
    }
}
