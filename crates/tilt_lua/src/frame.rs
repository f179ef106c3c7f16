//! Scoped stack frames
//!
//! The Lua stack is the one shared resource every bridge operation touches.
//! A [`StackFrame`] records the depth an operation starts from. Leaving the
//! frame asserts the operation produced exactly its documented number of
//! results; dropping it without leaving (early return, `?`, panic) restores
//! the recorded depth so nothing leaks onto the caller's stack.

use std::ffi::c_int;

use crate::runtime::LuaState;

pub struct StackFrame<'a> {
    state: &'a LuaState,
    base: c_int,
    armed: bool,
}

impl<'a> StackFrame<'a> {
    /// Open a frame at the current top.
    pub fn enter(state: &'a LuaState) -> Self {
        Self::with_base(state, state.top())
    }

    /// Open a frame whose base lies below the current top, for operations
    /// that consume values their caller already pushed (a function and its
    /// arguments, for example).
    pub fn consuming(state: &'a LuaState, consumed: c_int) -> Self {
        let top = state.top();
        assert!(
            consumed >= 0 && consumed <= top,
            "cannot consume {consumed} values from a stack of depth {top}"
        );
        Self::with_base(state, top - consumed)
    }

    fn with_base(state: &'a LuaState, base: c_int) -> Self {
        Self {
            state,
            base,
            armed: true,
        }
    }

    #[inline]
    pub fn base(&self) -> c_int {
        self.base
    }

    /// Values currently above the frame base.
    #[inline]
    pub fn depth(&self) -> c_int {
        self.state.top() - self.base
    }

    /// Close the frame, asserting exactly `results` values were left above
    /// the base. A mismatch is a defect in the calling code and is fatal.
    pub fn leave(mut self, results: c_int) {
        self.armed = false;
        let depth = self.depth();
        assert_eq!(
            depth, results,
            "stack imbalance: expected {results} results above base {}, found {depth}",
            self.base
        );
    }

    /// Close the frame keeping whatever is above the base.
    pub fn keep(mut self) -> c_int {
        self.armed = false;
        self.depth()
    }
}

impl Drop for StackFrame<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.set_top(self.base);
        }
    }
}
