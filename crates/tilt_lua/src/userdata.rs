//! Userdata and the metatable registry
//!
//! A host value pushed as userdata is moved into a reference-counted box
//! whose only strong handles live inside Lua userdata allocations. From then
//! on the VM owns it: the value is released by the `__gc` finalizer when the
//! collector proves the last such userdata unreachable, or when the state
//! closes. Host-side handles obtained with [`LuaState::to_object`] are weak
//! views and never trigger finalization.
//!
//! Metatables are registered per VM, in the VM's own registry, under a name
//! derived from the Rust `TypeId`. Two VMs in one process never share
//! entries, and two Rust types with the same name never collide.

use std::any::{Any, TypeId};
use std::cell::Cell;
use std::collections::hash_map::DefaultHasher;
use std::ffi::{c_int, CStr, CString};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::mem::size_of;
use std::rc::{Rc, Weak};

use crate::boundary::{CallbackResult, HostFunction};
use crate::ffi::{c_name, sys};
use crate::frame::StackFrame;
use crate::runtime::{LuaState, LuaType};

/// Shared default metatable used for types without a registration.
const DEFAULT_METATABLE: &CStr = c"tilt_lua.default";

/// Field set on every metatable this bridge creates. A userdata whose
/// metatable lacks it was not created here and is never reinterpreted.
const HOST_MARKER: &CStr = c"__tilt_host";

/// The VM's share of a host value.
struct Owned {
    value: Rc<dyn Any>,
    type_id: TypeId,
    type_name: &'static str,
}

/// What a userdata allocation holds. `None` once finalized.
type HostSlot = Option<Owned>;

/// A handle to a boxed host value of any `'static` type, tagged with its
/// type.
///
/// A handle made with [`HostObject::new`] holds the value until it is first
/// pushed; the push moves the value into the VM, and from then on this
/// handle and all its clones only observe it. Handles read back from the
/// VM are observers from the start. Dropping a handle never drops a value
/// the VM owns.
#[derive(Clone)]
pub struct HostObject {
    value: Weak<dyn Any>,
    pending: Rc<Cell<Option<Rc<dyn Any>>>>,
    type_id: TypeId,
    type_name: &'static str,
}

impl HostObject {
    pub fn new<T: Any>(value: T) -> Self {
        let value: Rc<dyn Any> = Rc::new(value);
        Self {
            value: Rc::downgrade(&value),
            pending: Rc::new(Cell::new(Some(value))),
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }

    fn observe(owned: &Owned) -> Self {
        Self {
            value: Rc::downgrade(&owned.value),
            pending: Rc::new(Cell::new(None)),
            type_id: owned.type_id,
            type_name: owned.type_name,
        }
    }

    /// Take the value for a new userdata: the pending value on first push,
    /// another share of the VM's value after that. `None` once the VM has
    /// released it.
    fn share(&self) -> Option<Owned> {
        let value = self.pending.take().or_else(|| self.value.upgrade())?;
        Some(Owned {
            value,
            type_id: self.type_id,
            type_name: self.type_name,
        })
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// `TypeId` of the boxed value (not of the box).
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn is<T: Any>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    /// Whether the value still exists. False once every userdata holding it
    /// has been finalized.
    pub fn is_live(&self) -> bool {
        self.value.strong_count() > 0
    }

    /// Run `f` against the value if it is a live `T`.
    ///
    /// The value is kept alive while `f` runs; if the VM finalizes its last
    /// userdata meanwhile, the value is released when `f` returns.
    pub fn with_ref<T: Any, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let value = self.value.upgrade()?;
        value.downcast_ref::<T>().map(f)
    }

    /// Whether both handles refer to one boxed value.
    pub fn ptr_eq(&self, other: &HostObject) -> bool {
        Weak::ptr_eq(&self.value, &other.value)
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostObject")
            .field("type_name", &self.type_name)
            .field("live", &self.is_live())
            .finish_non_exhaustive()
    }
}

/// Registry name for a Rust type: readable prefix, unique suffix.
fn metatable_name(type_id: TypeId, type_name: &str) -> CString {
    let mut hasher = DefaultHasher::new();
    type_id.hash(&mut hasher);
    c_name(&format!("{type_name}#{:016x}", hasher.finish()))
}

impl LuaState {
    /// Register the metatable for userdata holding a `T`.
    ///
    /// `functions` become metatable fields, each called through the
    /// reentrancy boundary. `__index` defaults to the metatable itself, and
    /// `__gc` is always installed by the bridge. Registering the same `T`
    /// twice on one VM, or passing `__gc`, is a configuration defect and
    /// panics.
    pub fn register_metatable<T: Any>(&self, functions: &[(&str, HostFunction)]) {
        let name = metatable_name(TypeId::of::<T>(), std::any::type_name::<T>());
        let frame = StackFrame::enter(self);
        self.create_metatable(&name, functions);
        drop(frame);
        tracing::debug!(type_name = std::any::type_name::<T>(), "registered metatable");
    }

    /// Register the shared metatable used for userdata of any type that has
    /// no registration of its own. Panics if the default already exists,
    /// including when an earlier push created it implicitly.
    pub fn register_default_metatable(&self, functions: &[(&str, HostFunction)]) {
        let frame = StackFrame::enter(self);
        self.create_metatable(DEFAULT_METATABLE, functions);
        drop(frame);
    }

    /// Leaves the new metatable on the stack.
    fn create_metatable(&self, name: &CStr, functions: &[(&str, HostFunction)]) {
        let raw = self.as_ptr();
        self.ensure_stack(3);
        let created = unsafe { sys::luaL_newmetatable(raw, name.as_ptr()) };
        assert!(
            created != 0,
            "metatable {} is already registered",
            name.to_string_lossy()
        );
        assert!(
            functions.iter().all(|(field, _)| *field != "__gc"),
            "__gc is installed automatically for host userdata"
        );

        self.set_funcs(functions);

        if functions.iter().all(|(field, _)| *field != "__index") {
            unsafe {
                sys::lua_pushvalue(raw, -1);
                sys::lua_setfield(raw, -2, c"__index".as_ptr());
            }
        }

        self.push_function(release_host_value);
        unsafe {
            sys::lua_setfield(raw, -2, c"__gc".as_ptr());
            sys::lua_pushboolean(raw, 1);
            sys::lua_setfield(raw, -2, HOST_MARKER.as_ptr());
        }
    }

    /// Push `value` as a userdata owned by the VM.
    pub fn push_userdata<T: Any>(&self, value: T) {
        self.push_object(&HostObject::new(value));
    }

    /// Push the value behind `object` as a new userdata.
    ///
    /// The first push of a fresh handle hands its value to the VM. Pushing
    /// a handle to a value the VM already owns adds another userdata for the
    /// same value; pushing one whose value was released pushes nil.
    ///
    /// The userdata gets the metatable registered for the object's type,
    /// or the shared default. If no default exists yet it is created empty,
    /// with a warning: pushing an unregistered type is usually a setup
    /// mistake.
    pub fn push_object(&self, object: &HostObject) {
        let raw = self.as_ptr();
        self.ensure_stack(3);
        let type_name = object.type_name;
        let Some(owned) = object.share() else {
            tracing::warn!(type_name, "host value already released; pushing nil");
            self.push_nil();
            return;
        };
        let name = metatable_name(owned.type_id, type_name);
        unsafe {
            let slot = sys::lua_newuserdatauv(raw, size_of::<HostSlot>(), 0) as *mut HostSlot;
            slot.write(Some(owned));

            if sys::lua_getfield(raw, sys::LUA_REGISTRYINDEX, name.as_ptr()) != sys::LUA_TTABLE {
                sys::lua_pop(raw, 1);
                if sys::lua_getfield(raw, sys::LUA_REGISTRYINDEX, DEFAULT_METATABLE.as_ptr())
                    == sys::LUA_TTABLE
                {
                    tracing::debug!(type_name, "using default metatable");
                } else {
                    sys::lua_pop(raw, 1);
                    tracing::warn!(
                        type_name,
                        "no metatable registered; creating the implicit default"
                    );
                    self.create_metatable(DEFAULT_METATABLE, &[]);
                }
            }
            sys::lua_setmetatable(raw, -2);
        }
    }

    /// Whether the value at `index` is a userdata created by this bridge.
    pub fn is_host_object(&self, index: c_int) -> bool {
        self.host_slot(index).is_some()
    }

    /// An observing handle to the host value at `index`, or `None` when the
    /// value is not a live host userdata.
    pub fn to_object(&self, index: c_int) -> Option<HostObject> {
        let slot = self.host_slot(index)?;
        unsafe { (*slot).as_ref() }.map(HostObject::observe)
    }

    /// Checked downcast of the userdata at `index` to `T`, cloned out.
    /// `None` for anything else; never raises.
    pub fn to_userdata<T: Any + Clone>(&self, index: c_int) -> Option<T> {
        self.with_userdata(index, T::clone)
    }

    /// Run `f` against the `T` boxed at `index`.
    pub fn with_userdata<T: Any, R>(&self, index: c_int, f: impl FnOnce(&T) -> R) -> Option<R> {
        let slot = self.host_slot(index)?;
        let frame = StackFrame::enter(self);
        // a second reference keeps the userdata reachable even if `f` pops it
        self.ensure_stack(1);
        self.push_value(index);
        let result = unsafe { (*slot).as_ref() }
            .and_then(|owned| owned.value.downcast_ref::<T>())
            .map(f);
        drop(frame);
        result
    }

    fn host_slot(&self, index: c_int) -> Option<*mut HostSlot> {
        if self.type_of(index) != Some(LuaType::Userdata) {
            return None;
        }
        let raw = self.as_ptr();
        let index = self.abs_index(index);
        let frame = StackFrame::enter(self);
        self.ensure_stack(2);
        let marked = unsafe {
            sys::lua_getmetatable(raw, index) != 0
                && sys::lua_getfield(raw, -1, HOST_MARKER.as_ptr()) == sys::LUA_TBOOLEAN
                && sys::lua_toboolean(raw, -1) != 0
        };
        drop(frame);
        if !marked || unsafe { sys::lua_rawlen(raw, index) } as usize != size_of::<HostSlot>() {
            return None;
        }
        Some(unsafe { sys::lua_touserdata(raw, index) } as *mut HostSlot)
    }
}

/// `__gc` for every host metatable: drop this userdata's share of the value.
fn release_host_value(state: &LuaState) -> CallbackResult {
    let raw = state.as_ptr();
    unsafe {
        let slot = sys::lua_touserdata(raw, 1) as *mut HostSlot;
        if !slot.is_null() && sys::lua_rawlen(raw, 1) as usize == size_of::<HostSlot>() {
            drop((*slot).take());
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::runtime::{GcAction, Libraries, LuaRuntime};

    #[derive(Clone, Debug, PartialEq)]
    struct Point {
        x: i64,
        y: i64,
    }

    struct Tracked(Rc<Cell<u32>>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[derive(Clone)]
    struct Badge(&'static str);

    fn point_sum(state: &LuaState) -> CallbackResult {
        let sum = state
            .with_userdata(1, |p: &Point| p.x + p.y)
            .ok_or("expected a point")?;
        state.push(sum);
        Ok(1)
    }

    fn badge_name(state: &LuaState) -> CallbackResult {
        let name = state.with_userdata(1, |b: &Badge| b.0).ok_or("not a badge")?;
        state.push(name);
        Ok(1)
    }

    #[test]
    fn registered_methods_are_reachable_through_index() {
        let lua = LuaRuntime::new(Libraries::NONE);
        lua.register_metatable::<Point>(&[("sum", point_sum)]);
        lua.push_userdata(Point { x: 3, y: 4 });
        lua.set_global("p");
        lua.do_string("total = p:sum()", "=test").unwrap();
        lua.get_global("total");
        assert_eq!(lua.to_int(-1), Some(7));
        lua.pop(1);
        assert_eq!(lua.top(), 0);
    }

    #[test]
    fn methods_reject_values_of_another_type() {
        let lua = LuaRuntime::new(Libraries::NONE);
        lua.register_metatable::<Point>(&[("sum", point_sum)]);
        lua.register_metatable::<Badge>(&[("name", badge_name)]);
        lua.push_userdata(Point { x: 1, y: 1 });
        lua.set_global("point");
        lua.push_userdata(Badge("gold"));
        lua.set_global("badge");

        lua.do_string("named = badge.name(badge)", "=test").unwrap();
        lua.get_global("named");
        assert_eq!(lua.to_string(-1).as_deref(), Some("gold"));
        lua.pop(1);

        let err = lua.do_string("badge.name(point)", "=test").unwrap_err();
        assert!(err.message().contains("host error: not a badge"), "{}", err.message());
        let err = lua.do_string("point.sum(badge)", "=test").unwrap_err();
        assert!(err.message().contains("expected a point"), "{}", err.message());
        assert_eq!(lua.top(), 0);
    }

    #[test]
    fn downcast_is_checked() {
        let lua = LuaRuntime::new(Libraries::NONE);
        lua.register_metatable::<Point>(&[]);
        lua.push_userdata(Point { x: 1, y: 2 });
        assert_eq!(lua.to_userdata::<Point>(-1), Some(Point { x: 1, y: 2 }));
        assert_eq!(lua.to_userdata::<String>(-1), None);
        lua.push(1.5);
        assert_eq!(lua.to_userdata::<Point>(-1), None);
        assert!(!lua.is_host_object(-1));
        lua.pop(2);
    }

    #[test]
    fn foreign_userdata_is_not_reinterpreted() {
        let lua = LuaRuntime::new(Libraries::NONE);
        unsafe {
            sys::lua_newuserdatauv(lua.as_ptr(), size_of::<HostSlot>(), 0);
        }
        assert!(!lua.is_host_object(-1));
        assert!(lua.to_object(-1).is_none());
        lua.pop(1);
    }

    #[test]
    fn host_handles_never_finalize() {
        let drops = Rc::new(Cell::new(0));
        let lua = LuaRuntime::new(Libraries::NONE);
        lua.push_userdata(Tracked(drops.clone()));
        let held = lua.to_object(-1).unwrap();
        assert!(held.is::<Tracked>());
        assert!(held.is_live());

        let copy = held.clone();
        drop(copy);
        assert_eq!(drops.get(), 0);

        lua.pop(1);
        lua.collect_garbage(GcAction::Collect);
        assert_eq!(drops.get(), 1);
        assert!(!held.is_live());
        assert_eq!(held.with_ref(|_: &Tracked| ()), None);
        drop(held);
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn pushing_hands_the_value_to_the_vm() {
        let drops = Rc::new(Cell::new(0));
        let lua = LuaRuntime::new(Libraries::NONE);
        let object = HostObject::new(Tracked(drops.clone()));
        lua.push_object(&object);
        lua.push_object(&object);
        assert!(lua.to_object(-1).unwrap().ptr_eq(&object));
        lua.pop(1);
        lua.collect_garbage(GcAction::Collect);
        assert_eq!(drops.get(), 0);

        lua.pop(1);
        lua.collect_garbage(GcAction::Collect);
        assert_eq!(drops.get(), 1);
        assert!(!object.is_live());

        lua.push_object(&object);
        assert_eq!(lua.type_of(-1), Some(LuaType::Nil));
        lua.pop(1);
    }

    #[test]
    fn unpushed_objects_drop_with_their_handle() {
        let drops = Rc::new(Cell::new(0));
        let object = HostObject::new(Tracked(drops.clone()));
        assert_eq!(object.with_ref(|t: &Tracked| t.0.get()), Some(0));
        drop(object);
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn finalization_waits_for_the_last_script_reference() {
        let drops = Rc::new(Cell::new(0));
        let lua = LuaRuntime::new(Libraries::NONE);
        lua.push_userdata(Tracked(drops.clone()));
        lua.set_global("first");
        lua.do_string("second = { first }", "=test").unwrap();

        lua.collect_garbage(GcAction::Collect);
        assert_eq!(drops.get(), 0);

        lua.do_string("first = nil", "=test").unwrap();
        lua.collect_garbage(GcAction::Collect);
        assert_eq!(drops.get(), 0);

        lua.do_string("second = nil", "=test").unwrap();
        lua.collect_garbage(GcAction::Collect);
        lua.collect_garbage(GcAction::Collect);
        assert_eq!(drops.get(), 1);
        assert_eq!(lua.top(), 0);
    }

    #[test]
    fn unreachable_userdata_is_finalized() {
        let drops = Rc::new(Cell::new(0));
        let lua = LuaRuntime::new(Libraries::NONE);
        lua.push_userdata(Tracked(drops.clone()));
        lua.pop(1);
        lua.collect_garbage(GcAction::Collect);
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn closing_the_state_releases_values() {
        let drops = Rc::new(Cell::new(0));
        let lua = LuaRuntime::new(Libraries::NONE);
        lua.push_userdata(Tracked(drops.clone()));
        lua.set_global("kept");
        drop(lua);
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn registrations_are_per_state() {
        let first = LuaRuntime::new(Libraries::NONE);
        let second = LuaRuntime::new(Libraries::NONE);
        first.register_metatable::<Point>(&[]);
        second.register_metatable::<Point>(&[]);
        assert_eq!(first.top(), 0);
        assert_eq!(second.top(), 0);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn double_registration_is_fatal() {
        let lua = LuaRuntime::new(Libraries::NONE);
        lua.register_metatable::<Point>(&[]);
        lua.register_metatable::<Point>(&[]);
    }

    #[test]
    fn unregistered_types_share_the_default() {
        let lua = LuaRuntime::new(Libraries::NONE);
        lua.push_userdata(17_u32);
        lua.push_userdata(String::from("text"));
        unsafe {
            sys::lua_getmetatable(lua.as_ptr(), 1);
            sys::lua_getmetatable(lua.as_ptr(), 2);
            assert_eq!(sys::lua_rawequal(lua.as_ptr(), -1, -2), 1);
        }
        lua.set_top(2);
        assert_eq!(lua.to_userdata::<u32>(1), Some(17));
        assert_eq!(lua.to_userdata::<String>(2).as_deref(), Some("text"));
        lua.pop(2);
    }
}
