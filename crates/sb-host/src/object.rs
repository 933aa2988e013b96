use std::any::Any;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Arc, OnceLock};

use indexmap::{IndexMap, IndexSet};
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use parking_lot::RwLock;

use crate::error::{HostError, HostResult};
use crate::key::HostKey;

thread_local! {
    static LIVE_OBJECTS: Arc<AtomicIsize> = Arc::new(AtomicIsize::new(0));
}

/// Number of non-singleton host objects allocated by the current thread and
/// not yet released. An object counts against the thread that allocated it,
/// whichever thread drops the last reference. Used as an instrumented
/// reference-count harness.
pub fn live_objects() -> isize {
    LIVE_OBJECTS.with(|live| live.load(Ordering::SeqCst))
}

static NONE: OnceLock<HostRef> = OnceLock::new();
static TRUE: OnceLock<HostRef> = OnceLock::new();
static FALSE: OnceLock<HostRef> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostInt {
    Small(i64),
    Big(BigInt),
}

impl HostInt {
    pub fn from_bigint(value: BigInt) -> Self {
        match value.to_i64() {
            Some(small) => Self::Small(small),
            None => Self::Big(value),
        }
    }

    pub fn to_i64(&self) -> Option<i64> {
        match self {
            Self::Small(value) => Some(*value),
            Self::Big(value) => value.to_i64(),
        }
    }

    pub fn to_bigint(&self) -> BigInt {
        match self {
            Self::Small(value) => BigInt::from(*value),
            Self::Big(value) => value.clone(),
        }
    }
}

impl fmt::Display for HostInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Small(value) => write!(f, "{}", value),
            Self::Big(value) => write!(f, "{}", value),
        }
    }
}

pub type HostCallable = dyn Fn(&HostRef) -> HostResult<HostRef> + Send + Sync;

pub struct HostFunction {
    name: String,
    func: Box<HostCallable>,
}

impl HostFunction {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Extension object embedded in the host runtime (the equivalent of a native
/// extension type). Identified with `HostRef::downcast_native`.
pub trait NativeObject: Any + Send + Sync {
    fn type_name(&self) -> &'static str;
    fn as_any(&self) -> &dyn Any;
}

pub enum HostObject {
    None,
    Bool(bool),
    Int(HostInt),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(RwLock<Vec<HostRef>>),
    List(RwLock<Vec<HostRef>>),
    Set(RwLock<IndexSet<HostKey>>),
    Dict(RwLock<IndexMap<HostKey, HostRef>>),
    Namespace(IndexMap<String, HostRef>),
    Function(HostFunction),
    Native(Box<dyn NativeObject>),
}

impl HostObject {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::Tuple(_) => "tuple",
            Self::List(_) => "list",
            Self::Set(_) => "set",
            Self::Dict(_) => "dict",
            Self::Namespace(_) => "SimpleNamespace",
            Self::Function(_) => "function",
            Self::Native(native) => native.type_name(),
        }
    }
}

struct Tracked {
    object: HostObject,
    // allocating thread's counter; singletons are not counted
    owner: Option<Arc<AtomicIsize>>,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        if let Some(owner) = &self.owner {
            owner.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// An owned, counted reference to a host object.
///
/// `HostRef` is move-only. Another count is acquired explicitly with
/// [`HostRef::new_ref`] and released by dropping. Container primitives that
/// take a `HostRef` by value steal it; the ones that take `&HostRef` do not,
/// and acquire their own count.
pub struct HostRef(Arc<Tracked>);

impl HostRef {
    fn alloc(object: HostObject) -> Self {
        let owner = LIVE_OBJECTS.with(|live| {
            live.fetch_add(1, Ordering::SeqCst);
            Arc::clone(live)
        });
        Self(Arc::new(Tracked {
            object,
            owner: Some(owner),
        }))
    }

    fn singleton(cell: &'static OnceLock<HostRef>, object: fn() -> HostObject) -> Self {
        cell.get_or_init(|| {
            Self(Arc::new(Tracked {
                object: object(),
                owner: None,
            }))
        })
        .new_ref()
    }

    pub fn none() -> Self {
        Self::singleton(&NONE, || HostObject::None)
    }

    pub fn bool(value: bool) -> Self {
        if value {
            Self::singleton(&TRUE, || HostObject::Bool(true))
        } else {
            Self::singleton(&FALSE, || HostObject::Bool(false))
        }
    }

    pub fn int(value: i64) -> Self {
        Self::alloc(HostObject::Int(HostInt::Small(value)))
    }

    pub fn int_from_bigint(value: BigInt) -> Self {
        Self::alloc(HostObject::Int(HostInt::from_bigint(value)))
    }

    /// Parses base-10 text, accepting an optional sign.
    pub fn int_from_decimal(text: &str) -> HostResult<Self> {
        let parsed = BigInt::from_str(text.trim()).map_err(|_| {
            HostError::value_error(format!(
                "invalid literal for int() with base 10: '{}'",
                text
            ))
        })?;
        Ok(Self::int_from_bigint(parsed))
    }

    pub fn float(value: f64) -> Self {
        Self::alloc(HostObject::Float(value))
    }

    pub fn str(value: &str) -> Self {
        Self::alloc(HostObject::Str(value.to_string()))
    }

    /// Copies exactly `value.len()` bytes; embedded NUL bytes are preserved.
    pub fn bytes_from_slice(value: &[u8]) -> Self {
        Self::alloc(HostObject::Bytes(value.to_vec()))
    }

    /// A tuple of `len` slots, each initially `None`. Fill it with
    /// [`HostRef::tuple_set_item`] before sharing it.
    pub fn new_tuple(len: usize) -> Self {
        let slots = (0..len).map(|_| Self::none()).collect();
        Self::alloc(HostObject::Tuple(RwLock::new(slots)))
    }

    /// Steals every item.
    pub fn tuple_from(items: Vec<HostRef>) -> Self {
        Self::alloc(HostObject::Tuple(RwLock::new(items)))
    }

    pub fn new_list() -> Self {
        Self::alloc(HostObject::List(RwLock::new(Vec::new())))
    }

    pub fn new_set() -> Self {
        Self::alloc(HostObject::Set(RwLock::new(IndexSet::new())))
    }

    pub fn new_dict() -> Self {
        Self::alloc(HostObject::Dict(RwLock::new(IndexMap::new())))
    }

    /// Builds an attribute bag from a complete dict of fields. Does not steal
    /// `fields`; every key must be a str.
    pub fn new_namespace(fields: &HostRef) -> HostResult<Self> {
        let HostObject::Dict(entries) = fields.object() else {
            return Err(HostError::type_error(format!(
                "SimpleNamespace() argument must be dict, not {}",
                fields.type_name()
            )));
        };
        let entries = entries.read();
        let mut attributes = IndexMap::with_capacity(entries.len());
        for (key, value) in entries.iter() {
            let Some(name) = key.as_ref().as_str() else {
                return Err(HostError::type_error("keywords must be strings"));
            };
            attributes.insert(name.to_string(), value.new_ref());
        }
        Ok(Self::alloc(HostObject::Namespace(attributes)))
    }

    pub fn function(
        name: impl Into<String>,
        func: impl Fn(&HostRef) -> HostResult<HostRef> + Send + Sync + 'static,
    ) -> Self {
        Self::alloc(HostObject::Function(HostFunction {
            name: name.into(),
            func: Box::new(func),
        }))
    }

    pub fn native(object: impl NativeObject) -> Self {
        Self::alloc(HostObject::Native(Box::new(object)))
    }

    pub fn object(&self) -> &HostObject {
        &self.0.object
    }

    pub fn new_ref(&self) -> HostRef {
        HostRef(Arc::clone(&self.0))
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn ptr_eq(&self, other: &HostRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn type_name(&self) -> &'static str {
        self.object().type_name()
    }

    pub fn is_none(&self) -> bool {
        matches!(self.object(), HostObject::None)
    }

    pub fn is_callable(&self) -> bool {
        matches!(self.object(), HostObject::Function(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.object() {
            HostObject::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<&HostInt> {
        match self.object() {
            HostObject::Int(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self.object() {
            HostObject::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.object() {
            HostObject::Str(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self.object() {
            HostObject::Bytes(value) => Some(value.as_slice()),
            _ => None,
        }
    }

    pub fn downcast_native<T: NativeObject>(&self) -> Option<&T> {
        match self.object() {
            HostObject::Native(native) => native.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    pub fn call(&self, args: &HostRef) -> HostResult<HostRef> {
        let HostObject::Function(function) = self.object() else {
            return Err(HostError::type_error(format!(
                "'{}' object is not callable",
                self.type_name()
            )));
        };
        if !matches!(args.object(), HostObject::Tuple(_)) {
            return Err(HostError::type_error(format!(
                "argument list must be a tuple, not {}",
                args.type_name()
            )));
        }
        (function.func)(args)
    }

    /// Steals `item`. Only legal while this reference is the tuple's sole owner.
    pub fn tuple_set_item(&self, index: usize, item: HostRef) -> HostResult<()> {
        let HostObject::Tuple(slots) = self.object() else {
            return Err(HostError::system_error("bad argument to tuple_set_item"));
        };
        if self.ref_count() != 1 {
            return Err(HostError::system_error("tuple_set_item on a shared tuple"));
        }
        let mut slots = slots.write();
        let Some(slot) = slots.get_mut(index) else {
            return Err(HostError::system_error("tuple assignment index out of range"));
        };
        *slot = item;
        Ok(())
    }

    /// Steals `item`.
    pub fn list_append(&self, item: HostRef) -> HostResult<()> {
        let HostObject::List(items) = self.object() else {
            return Err(HostError::system_error("bad argument to list_append"));
        };
        items.write().push(item);
        Ok(())
    }

    /// Does not steal `item`.
    pub fn set_add(&self, item: &HostRef) -> HostResult<()> {
        let HostObject::Set(items) = self.object() else {
            return Err(HostError::system_error("bad argument to set_add"));
        };
        let key = HostKey::new(item.new_ref())?;
        items.write().insert(key);
        Ok(())
    }

    /// Does not steal `key` or `value`. An existing entry keeps its position.
    pub fn dict_set_item(&self, key: &HostRef, value: &HostRef) -> HostResult<()> {
        let HostObject::Dict(entries) = self.object() else {
            return Err(HostError::system_error("bad argument to dict_set_item"));
        };
        let key = HostKey::new(key.new_ref())?;
        entries.write().insert(key, value.new_ref());
        Ok(())
    }

    pub fn dict_get_item(&self, key: &HostRef) -> HostResult<Option<HostRef>> {
        let HostObject::Dict(entries) = self.object() else {
            return Err(HostError::system_error("bad argument to dict_get_item"));
        };
        let key = HostKey::new(key.new_ref())?;
        Ok(entries.read().get(&key).map(HostRef::new_ref))
    }

    pub fn dict_get_str(&self, key: &str) -> HostResult<Option<HostRef>> {
        self.dict_get_item(&HostRef::str(key))
    }

    /// New references to every key/value pair, in insertion order.
    pub fn dict_items(&self) -> HostResult<Vec<(HostRef, HostRef)>> {
        let HostObject::Dict(entries) = self.object() else {
            return Err(HostError::type_error(format!(
                "'{}' object is not a mapping",
                self.type_name()
            )));
        };
        Ok(entries
            .read()
            .iter()
            .map(|(key, value)| (key.as_ref().new_ref(), value.new_ref()))
            .collect())
    }

    /// New references to the elements of a tuple, list or set.
    pub fn items(&self) -> HostResult<Vec<HostRef>> {
        match self.object() {
            HostObject::Tuple(items) | HostObject::List(items) => {
                Ok(items.read().iter().map(HostRef::new_ref).collect())
            }
            HostObject::Set(items) => Ok(items
                .read()
                .iter()
                .map(|key| key.as_ref().new_ref())
                .collect()),
            _ => Err(HostError::type_error(format!(
                "'{}' object is not iterable",
                self.type_name()
            ))),
        }
    }

    pub fn namespace_fields(&self) -> HostResult<Vec<(String, HostRef)>> {
        let HostObject::Namespace(fields) = self.object() else {
            return Err(HostError::type_error(format!(
                "'{}' object has no attribute '__dict__'",
                self.type_name()
            )));
        };
        Ok(fields
            .iter()
            .map(|(name, value)| (name.clone(), value.new_ref()))
            .collect())
    }

    pub fn get_attr(&self, name: &str) -> HostResult<HostRef> {
        let found = match self.object() {
            HostObject::Namespace(fields) => fields.get(name).map(HostRef::new_ref),
            _ => None,
        };
        found.ok_or_else(|| {
            HostError::type_error(format!(
                "'{}' object has no attribute '{}'",
                self.type_name(),
                name
            ))
        })
    }

    pub fn len(&self) -> HostResult<usize> {
        match self.object() {
            HostObject::Str(value) => Ok(value.chars().count()),
            HostObject::Bytes(value) => Ok(value.len()),
            HostObject::Tuple(items) | HostObject::List(items) => Ok(items.read().len()),
            HostObject::Set(items) => Ok(items.read().len()),
            HostObject::Dict(entries) => Ok(entries.read().len()),
            _ => Err(HostError::type_error(format!(
                "object of type '{}' has no len()",
                self.type_name()
            ))),
        }
    }

    pub fn is_empty(&self) -> HostResult<bool> {
        self.len().map(|len| len == 0)
    }

    pub fn repr(&self) -> String {
        match self.object() {
            HostObject::None => "None".to_string(),
            HostObject::Bool(true) => "True".to_string(),
            HostObject::Bool(false) => "False".to_string(),
            HostObject::Int(value) => value.to_string(),
            HostObject::Float(value) => float_repr(*value),
            HostObject::Str(value) => {
                format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
            }
            HostObject::Bytes(value) => bytes_repr(value),
            HostObject::Tuple(items) => {
                let items = items.read();
                let body = join_reprs(items.iter());
                if items.len() == 1 {
                    format!("({},)", body)
                } else {
                    format!("({})", body)
                }
            }
            HostObject::List(items) => format!("[{}]", join_reprs(items.read().iter())),
            HostObject::Set(items) => {
                let items = items.read();
                if items.is_empty() {
                    "set()".to_string()
                } else {
                    format!("{{{}}}", join_reprs(items.iter().map(HostKey::as_ref)))
                }
            }
            HostObject::Dict(entries) => format!(
                "{{{}}}",
                entries
                    .read()
                    .iter()
                    .map(|(key, value)| format!("{}: {}", key.as_ref().repr(), value.repr()))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            HostObject::Namespace(fields) => format!(
                "namespace({})",
                fields
                    .iter()
                    .map(|(name, value)| format!("{}={}", name, value.repr()))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            HostObject::Function(function) => format!("<function {}>", function.name()),
            HostObject::Native(native) => format!("<{} object>", native.type_name()),
        }
    }
}

impl fmt::Debug for HostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostRef({})", self.repr())
    }
}

fn join_reprs<'a>(items: impl Iterator<Item = &'a HostRef>) -> String {
    items.map(HostRef::repr).collect::<Vec<_>>().join(", ")
}

fn float_repr(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value.is_infinite() {
        let text = if value > 0.0 { "inf" } else { "-inf" };
        text.to_string()
    } else if value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{:.1}", value)
    } else {
        value.to_string()
    }
}

fn bytes_repr(value: &[u8]) -> String {
    let mut out = String::from("b'");
    for byte in value {
        match byte {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(*byte as char),
            _ => out.push_str(&format!("\\x{:02x}", byte)),
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod object_tests {
    use super::*;
    use crate::HostErrorKind;

    #[test]
    fn singletons_are_shared_and_untracked() {
        let before = live_objects();
        let first = HostRef::none();
        let second = HostRef::none();
        assert!(first.ptr_eq(&second));
        assert!(HostRef::bool(true).ptr_eq(&HostRef::bool(true)));
        assert!(!HostRef::bool(true).ptr_eq(&HostRef::bool(false)));
        assert_eq!(live_objects(), before);
    }

    #[test]
    fn new_ref_and_drop_adjust_the_count() {
        let value = HostRef::str("hook");
        assert_eq!(value.ref_count(), 1);
        let extra = value.new_ref();
        assert_eq!(value.ref_count(), 2);
        drop(extra);
        assert_eq!(value.ref_count(), 1);
    }

    #[test]
    fn live_objects_tracks_allocation_and_release() {
        let before = live_objects();
        let list = HostRef::new_list();
        list.list_append(HostRef::int(1)).expect("append");
        list.list_append(HostRef::str("a")).expect("append");
        assert_eq!(live_objects(), before + 3);
        drop(list);
        assert_eq!(live_objects(), before);
    }

    #[test]
    fn release_on_another_thread_settles_the_allocating_count() {
        let before = live_objects();
        let value = HostRef::str("moved");
        assert_eq!(live_objects(), before + 1);
        std::thread::spawn(move || {
            let elsewhere = live_objects();
            drop(value);
            assert_eq!(live_objects(), elsewhere);
        })
        .join()
        .expect("release thread");
        assert_eq!(live_objects(), before);
    }

    #[test]
    fn tuple_set_item_requires_sole_ownership() {
        let tuple = HostRef::new_tuple(2);
        tuple.tuple_set_item(0, HostRef::int(7)).expect("set item");
        let shared = tuple.new_ref();
        let error = tuple
            .tuple_set_item(1, HostRef::int(8))
            .expect_err("shared tuple must reject writes");
        assert_eq!(error.kind, HostErrorKind::SystemError);
        drop(shared);
        assert_eq!(tuple.repr(), "(7, None)");
    }

    #[test]
    fn dict_insert_does_not_steal() {
        let dict = HostRef::new_dict();
        let key = HostRef::str("k");
        let value = HostRef::int(1);
        dict.dict_set_item(&key, &value).expect("insert");
        assert_eq!(key.ref_count(), 2);
        assert_eq!(value.ref_count(), 2);
        drop(dict);
        assert_eq!(key.ref_count(), 1);
        assert_eq!(value.ref_count(), 1);
    }

    #[test]
    fn unhashable_keys_are_rejected() {
        let dict = HostRef::new_dict();
        let error = dict
            .dict_set_item(&HostRef::new_list(), &HostRef::none())
            .expect_err("list keys are unhashable");
        assert_eq!(error.to_string(), "TypeError: unhashable type: 'list'");

        let set = HostRef::new_set();
        let tuple = HostRef::tuple_from(vec![HostRef::int(1), HostRef::new_dict()]);
        assert!(set.set_add(&tuple).is_err());
        assert_eq!(set.len().expect("len"), 0);
    }

    #[test]
    fn namespace_requires_str_keys_and_keeps_order() {
        let fields = HostRef::new_dict();
        for (name, value) in [("b", 1), ("a", 2), ("c", 3)] {
            fields
                .dict_set_item(&HostRef::str(name), &HostRef::int(value))
                .expect("insert");
        }
        let namespace = HostRef::new_namespace(&fields).expect("namespace");
        assert_eq!(namespace.repr(), "namespace(b=1, a=2, c=3)");
        assert_eq!(namespace.get_attr("a").expect("attr").repr(), "2");

        let bad = HostRef::new_dict();
        bad.dict_set_item(&HostRef::int(1), &HostRef::none())
            .expect("insert");
        let error = HostRef::new_namespace(&bad).expect_err("non-str key");
        assert_eq!(error.message, "keywords must be strings");
    }

    #[test]
    fn calling_checks_callability() {
        let echo = HostRef::function("echo", |args| {
            let items = args.items()?;
            Ok(HostRef::int(items.len() as i64))
        });
        assert!(echo.is_callable());
        let result = echo
            .call(&HostRef::tuple_from(vec![HostRef::none(), HostRef::none()]))
            .expect("call");
        assert_eq!(result.repr(), "2");

        let error = HostRef::int(3)
            .call(&HostRef::new_tuple(0))
            .expect_err("int is not callable");
        assert_eq!(error.message, "'int' object is not callable");
    }

    #[test]
    fn decimal_ints_normalize_to_machine_width() {
        let small = HostRef::int_from_decimal("-42").expect("parse");
        assert_eq!(small.as_int(), Some(&HostInt::Small(-42)));
        let big = HostRef::int_from_decimal("123456789012345678901234567890").expect("parse");
        assert!(matches!(big.as_int(), Some(HostInt::Big(_))));
        assert_eq!(big.repr(), "123456789012345678901234567890");
        assert!(HostRef::int_from_decimal("12x").is_err());
    }

    #[test]
    fn reprs_follow_host_conventions() {
        assert_eq!(HostRef::float(2.0).repr(), "2.0");
        assert_eq!(HostRef::float(0.5).repr(), "0.5");
        assert_eq!(HostRef::bytes_from_slice(b"a\0b").repr(), "b'a\\x00b'");
        assert_eq!(HostRef::tuple_from(vec![HostRef::int(1)]).repr(), "(1,)");
        assert_eq!(HostRef::new_set().repr(), "set()");
        assert_eq!(HostRef::str("it's").repr(), "'it\\'s'");
    }
}
