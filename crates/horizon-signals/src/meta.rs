//! Runtime type information for signals and slots.
//!
//! A [`MetaObject`] is a static description of a class: its name, its parent
//! class, the signals it declares and the slots it exposes. Signal and slot
//! indices are global across the inheritance chain, so a subclass's first
//! signal comes after all of its ancestors' signals. Every class ultimately
//! derives from [`OBJECT_META`], which declares `destroyed()` as signal 0 and
//! `objectNameChanged(String)` as signal 1.
//!
//! The [`TypeRegistry`] maps parameter type names (as written in signal
//! declarations) to descriptors that know how to copy a value of that type.
//! Queued connections need it: arguments are copied before they cross to the
//! receiver's thread, and a type that is not registered cannot be copied.
//!
//! ```
//! use horizon_signals::meta::{MetaObject, MethodMeta, SignalMeta, OBJECT_META};
//!
//! static COUNTER_META: MetaObject = MetaObject {
//!     type_name: "Counter",
//!     parent: Some(&OBJECT_META),
//!     signals: &[SignalMeta::new("valueChanged", &["i32"])],
//!     methods: &[],
//! };
//!
//! assert_eq!(COUNTER_META.index_of_signal("valueChanged(i32)"), Some(2));
//! assert_eq!(COUNTER_META.signal(0).map(|s| s.name), Some("destroyed"));
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use parking_lot::RwLock;
use slotmap::{SlotMap, new_key_type};

use crate::logging::targets;
use crate::object::Object;

/// A type-erased signal argument.
pub type Arg = dyn Any + Send + Sync;

/// Invoker for a slot declared in a [`MetaObject`].
///
/// The receiver is passed type-erased; implementations downcast it with
/// [`object_cast`](crate::object::object_cast).
pub type InvokeFn = fn(&dyn Object, &[&Arg]);

/// Index of the `destroyed()` signal every object inherits.
pub const DESTROYED_SIGNAL: i32 = 0;

/// Index of the `objectNameChanged(String)` signal every object inherits.
pub const OBJECT_NAME_CHANGED_SIGNAL: i32 = 1;

/// Meta-object of the root class.
pub static OBJECT_META: MetaObject = MetaObject {
    type_name: "Object",
    parent: None,
    signals: &[
        SignalMeta::new("destroyed", &[]),
        SignalMeta::new("objectNameChanged", &["String"]),
    ],
    methods: &[],
};

/// Metadata about a declared signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalMeta {
    /// Signal name without parameters.
    pub name: &'static str,
    /// Parameter type names, in order.
    pub param_types: &'static [&'static str],
}

impl SignalMeta {
    pub const fn new(name: &'static str, param_types: &'static [&'static str]) -> Self {
        Self { name, param_types }
    }

    /// The normalized signature, e.g. `valueChanged(i32)`.
    pub fn signature(&self) -> String {
        format_signature(self.name, self.param_types)
    }
}

/// Metadata about an invokable slot.
#[derive(Clone, Copy)]
pub struct MethodMeta {
    /// Slot name without parameters.
    pub name: &'static str,
    /// Parameter type names, in order.
    pub param_types: &'static [&'static str],
    /// Calls the slot on a receiver.
    pub invoke: InvokeFn,
}

impl MethodMeta {
    pub const fn new(
        name: &'static str,
        param_types: &'static [&'static str],
        invoke: InvokeFn,
    ) -> Self {
        Self {
            name,
            param_types,
            invoke,
        }
    }

    /// The normalized signature, e.g. `setValue(i32)`.
    pub fn signature(&self) -> String {
        format_signature(self.name, self.param_types)
    }
}

impl fmt::Debug for MethodMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodMeta")
            .field("name", &self.name)
            .field("param_types", &self.param_types)
            .finish_non_exhaustive()
    }
}

/// Static description of a class.
#[derive(Debug)]
pub struct MetaObject {
    /// Class name used in diagnostics.
    pub type_name: &'static str,
    /// Parent class, `None` only for [`OBJECT_META`].
    pub parent: Option<&'static MetaObject>,
    /// Signals declared by this class (not including inherited ones).
    pub signals: &'static [SignalMeta],
    /// Slots declared by this class (not including inherited ones).
    pub methods: &'static [MethodMeta],
}

impl MetaObject {
    /// Index of this class's first own signal.
    pub fn signal_offset(&self) -> usize {
        self.parent.map_or(0, |p| p.signal_count())
    }

    /// Total number of signals including inherited ones.
    pub fn signal_count(&self) -> usize {
        self.signal_offset() + self.signals.len()
    }

    /// Index of this class's first own slot.
    pub fn method_offset(&self) -> usize {
        self.parent.map_or(0, |p| p.method_count())
    }

    /// Total number of slots including inherited ones.
    pub fn method_count(&self) -> usize {
        self.method_offset() + self.methods.len()
    }

    /// Looks up a signal by global index.
    pub fn signal(&'static self, index: i32) -> Option<&'static SignalMeta> {
        let index = usize::try_from(index).ok()?;
        let offset = self.signal_offset();
        if index >= offset {
            self.signals.get(index - offset)
        } else {
            self.parent?.signal(index as i32)
        }
    }

    /// Looks up a slot by global index.
    pub fn method(&'static self, index: usize) -> Option<&'static MethodMeta> {
        let offset = self.method_offset();
        if index >= offset {
            self.methods.get(index - offset)
        } else {
            self.parent?.method(index)
        }
    }

    /// Finds a signal by signature (`changed()`) or bare name (`changed`).
    ///
    /// The most derived class is searched first.
    pub fn index_of_signal(&self, signature: &str) -> Option<i32> {
        let wanted = normalize_signature(signature);
        let own = self
            .signals
            .iter()
            .position(|s| signature_matches(s.name, s.param_types, &wanted));
        match own {
            Some(pos) => Some((self.signal_offset() + pos) as i32),
            None => self.parent?.index_of_signal(signature),
        }
    }

    /// Finds a slot by signature or bare name.
    pub fn index_of_method(&self, signature: &str) -> Option<usize> {
        let wanted = normalize_signature(signature);
        let own = self
            .methods
            .iter()
            .position(|m| signature_matches(m.name, m.param_types, &wanted));
        match own {
            Some(pos) => Some(self.method_offset() + pos),
            None => self.parent?.index_of_method(signature),
        }
    }

    /// Whether this class is `other` or derives from it.
    pub fn inherits(&self, other: &MetaObject) -> bool {
        let mut current = Some(self);
        while let Some(meta) = current {
            if std::ptr::eq(meta, other) {
                return true;
            }
            current = meta.parent;
        }
        false
    }
}

fn format_signature(name: &str, params: &[&str]) -> String {
    format!("{name}({})", params.join(","))
}

fn signature_matches(name: &str, params: &[&str], wanted: &str) -> bool {
    match wanted.split_once('(') {
        Some((wanted_name, _)) => wanted_name == name && format_signature(name, params) == wanted,
        None => wanted == name,
    }
}

/// Removes all whitespace from a signature: `"valueChanged( i32 )"` becomes
/// `"valueChanged(i32)"`.
pub fn normalize_signature(signature: &str) -> String {
    signature.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Whether a slot taking `slot` parameters can be driven by a signal carrying
/// `signal` parameters.
///
/// The slot may ignore trailing signal arguments but every parameter it does
/// take must match the signal's parameter at the same position.
pub fn check_connect_args(signal: &[&str], slot: &[&str]) -> bool {
    slot.len() <= signal.len() && signal.iter().zip(slot).all(|(a, b)| a == b)
}

// ============================================================================
// Argument type registry
// ============================================================================

new_key_type! {
    /// Key of a registered argument type.
    pub struct MetaTypeId;
}

/// Describes how to copy values of one argument type.
#[derive(Clone, Copy)]
pub struct TypeDescriptor {
    name: &'static str,
    type_id: TypeId,
    copy: fn(&Arg) -> Option<Box<Arg>>,
}

impl TypeDescriptor {
    /// Describes `T` under `name`.
    pub fn of<T: Any + Clone + Send + Sync>(name: &'static str) -> Self {
        Self {
            name,
            type_id: TypeId::of::<T>(),
            copy: |value| {
                value
                    .downcast_ref::<T>()
                    .map(|v| Box::new(v.clone()) as Box<Arg>)
            },
        }
    }

    /// The registered type name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The Rust type this descriptor copies.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Deep-copies `value`, or returns `None` if it is not of this type.
    pub fn copy(&self, value: &Arg) -> Option<Box<Arg>> {
        (self.copy)(value)
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct RegistryInner {
    types: SlotMap<MetaTypeId, TypeDescriptor>,
    by_name: HashMap<&'static str, MetaTypeId>,
}

/// Process-wide registry of argument types that can cross threads.
///
/// Common primitive types and `String` are registered on first use.
pub struct TypeRegistry {
    inner: RwLock<RegistryInner>,
}

static TYPE_REGISTRY: OnceLock<TypeRegistry> = OnceLock::new();

/// Initializes the global type registry with the built-in types.
///
/// Called implicitly by every registry access; calling it early only moves
/// the cost of setting it up.
pub fn init_type_registry() -> &'static TypeRegistry {
    TYPE_REGISTRY.get_or_init(|| {
        let registry = TypeRegistry {
            inner: RwLock::new(RegistryInner::default()),
        };
        registry.insert(TypeDescriptor::of::<bool>("bool"));
        registry.insert(TypeDescriptor::of::<char>("char"));
        registry.insert(TypeDescriptor::of::<i8>("i8"));
        registry.insert(TypeDescriptor::of::<i16>("i16"));
        registry.insert(TypeDescriptor::of::<i32>("i32"));
        registry.insert(TypeDescriptor::of::<i64>("i64"));
        registry.insert(TypeDescriptor::of::<isize>("isize"));
        registry.insert(TypeDescriptor::of::<u8>("u8"));
        registry.insert(TypeDescriptor::of::<u16>("u16"));
        registry.insert(TypeDescriptor::of::<u32>("u32"));
        registry.insert(TypeDescriptor::of::<u64>("u64"));
        registry.insert(TypeDescriptor::of::<usize>("usize"));
        registry.insert(TypeDescriptor::of::<f32>("f32"));
        registry.insert(TypeDescriptor::of::<f64>("f64"));
        registry.insert(TypeDescriptor::of::<String>("String"));
        registry.insert(TypeDescriptor::of::<Vec<u8>>("Vec<u8>"));
        registry
    })
}

impl TypeRegistry {
    fn global() -> &'static Self {
        init_type_registry()
    }

    fn insert(&self, descriptor: TypeDescriptor) -> MetaTypeId {
        let mut inner = self.inner.write();
        if let Some(&id) = inner.by_name.get(descriptor.name) {
            if inner.types[id].type_id != descriptor.type_id {
                tracing::warn!(
                    target: targets::META,
                    type_name = descriptor.name,
                    "type name already registered for another type; first registration kept"
                );
            }
            return id;
        }
        let id = inner.types.insert(descriptor);
        inner.by_name.insert(descriptor.name, id);
        id
    }

    /// Registers `T` under `name` so signals declaring `name` parameters can
    /// be queued. Registering the same name twice returns the existing id.
    pub fn register<T: Any + Clone + Send + Sync>(name: &'static str) -> MetaTypeId {
        Self::global().insert(TypeDescriptor::of::<T>(name))
    }

    /// Looks up a type by its declared name.
    pub fn get_by_name(name: &str) -> Option<TypeDescriptor> {
        let name = normalize_signature(name);
        let inner = Self::global().inner.read();
        inner.by_name.get(name.as_str()).map(|&id| inner.types[id])
    }

    /// Looks up a type by id.
    pub fn get(id: MetaTypeId) -> Option<TypeDescriptor> {
        Self::global().inner.read().types.get(id).copied()
    }

    /// Whether `name` is registered.
    pub fn contains(name: &str) -> bool {
        Self::get_by_name(name).is_some()
    }

    /// Number of registered types.
    pub fn type_count() -> usize {
        Self::global().inner.read().types.len()
    }

    /// Resolves every name in `names`, or reports the first unknown one.
    pub fn resolve_all(names: &[&'static str]) -> Result<Vec<TypeDescriptor>, &'static str> {
        names
            .iter()
            .map(|&name| Self::get_by_name(name).ok_or(name))
            .collect()
    }
}

/// Shorthand for [`TypeRegistry::register`].
pub fn register_type<T: Any + Clone + Send + Sync>(name: &'static str) -> MetaTypeId {
    TypeRegistry::register::<T>(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &dyn Object, _: &[&Arg]) {}

    static BASE_META: MetaObject = MetaObject {
        type_name: "Base",
        parent: Some(&OBJECT_META),
        signals: &[SignalMeta::new("changed", &[]), SignalMeta::new("moved", &["i32", "i32"])],
        methods: &[MethodMeta::new("refresh", &[], noop)],
    };

    static DERIVED_META: MetaObject = MetaObject {
        type_name: "Derived",
        parent: Some(&BASE_META),
        signals: &[SignalMeta::new("changed", &["String"])],
        methods: &[MethodMeta::new("setText", &["String"], noop)],
    };

    #[test]
    fn test_signal_indices_span_inheritance() {
        assert_eq!(OBJECT_META.signal_count(), 2);
        assert_eq!(BASE_META.signal_offset(), 2);
        assert_eq!(DERIVED_META.signal_offset(), 4);
        assert_eq!(DERIVED_META.signal_count(), 5);

        assert_eq!(DERIVED_META.signal(0).map(|s| s.name), Some("destroyed"));
        assert_eq!(
            DERIVED_META.signal(OBJECT_NAME_CHANGED_SIGNAL).map(|s| s.signature()),
            Some("objectNameChanged(String)".into())
        );
        assert_eq!(DERIVED_META.signal(3).map(|s| s.name), Some("moved"));
        assert_eq!(DERIVED_META.signal(4).map(|s| s.signature()), Some("changed(String)".into()));
        assert!(DERIVED_META.signal(5).is_none());
        assert!(DERIVED_META.signal(-1).is_none());
    }

    #[test]
    fn test_index_of_signal() {
        assert_eq!(DERIVED_META.index_of_signal("changed(String)"), Some(4));
        assert_eq!(DERIVED_META.index_of_signal("changed()"), Some(2));
        // Bare names resolve to the most derived declaration.
        assert_eq!(DERIVED_META.index_of_signal("changed"), Some(4));
        assert_eq!(DERIVED_META.index_of_signal(" moved( i32 , i32 ) "), Some(3));
        assert_eq!(DERIVED_META.index_of_signal("destroyed()"), Some(0));
        assert_eq!(DERIVED_META.index_of_signal("clicked()"), None);
    }

    #[test]
    fn test_method_lookup() {
        assert_eq!(DERIVED_META.method_offset(), 1);
        assert_eq!(DERIVED_META.index_of_method("refresh()"), Some(0));
        assert_eq!(DERIVED_META.index_of_method("setText(String)"), Some(1));
        assert_eq!(DERIVED_META.method(1).map(|m| m.name), Some("setText"));
        assert!(DERIVED_META.method(2).is_none());
    }

    #[test]
    fn test_inherits() {
        assert!(DERIVED_META.inherits(&BASE_META));
        assert!(DERIVED_META.inherits(&OBJECT_META));
        assert!(!BASE_META.inherits(&DERIVED_META));
    }

    #[test]
    fn test_check_connect_args() {
        assert!(check_connect_args(&["i32", "String"], &["i32"]));
        assert!(check_connect_args(&["i32"], &[]));
        assert!(!check_connect_args(&["i32"], &["i32", "i32"]));
        assert!(!check_connect_args(&["i32"], &["String"]));
    }

    // ------------------------------------------------------------------
    // TypeRegistry
    // ------------------------------------------------------------------

    #[derive(Clone, Debug, PartialEq)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn test_builtin_types_registered() {
        assert!(TypeRegistry::contains("i32"));
        assert!(TypeRegistry::contains("String"));
        assert!(!TypeRegistry::contains("NeverRegistered"));
    }

    #[test]
    fn test_register_and_copy() {
        let id = register_type::<Point>("meta_tests::Point");
        assert_eq!(register_type::<Point>("meta_tests::Point"), id);

        let descriptor = TypeRegistry::get(id).expect("registered");
        assert_eq!(descriptor.name(), "meta_tests::Point");

        let original = Point { x: 1, y: 2 };
        let copy = descriptor.copy(&original).expect("same type");
        assert_eq!(copy.downcast_ref::<Point>(), Some(&original));
        assert!(descriptor.copy(&5i32).is_none());
    }

    #[test]
    fn test_resolve_all_reports_missing() {
        let resolved = TypeRegistry::resolve_all(&["i32", "String"]).expect("builtins");
        assert_eq!(resolved.len(), 2);
        assert_eq!(
            TypeRegistry::resolve_all(&["i32", "Unknown"]).unwrap_err(),
            "Unknown"
        );
    }
}
