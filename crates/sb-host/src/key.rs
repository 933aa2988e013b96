use std::hash::{Hash, Hasher};

use num_bigint::BigInt;
use num_traits::FromPrimitive;

use crate::error::{HostError, HostResult};
use crate::object::{HostObject, HostRef};

/// A hashable host object used as a set element or dict key.
pub struct HostKey(HostRef);

impl HostKey {
    /// Steals `value`, failing when it (or any tuple element) is unhashable.
    pub fn new(value: HostRef) -> HostResult<Self> {
        check_hashable(&value)?;
        Ok(Self(value))
    }

    pub fn into_inner(self) -> HostRef {
        self.0
    }
}

impl AsRef<HostRef> for HostKey {
    fn as_ref(&self) -> &HostRef {
        &self.0
    }
}

fn check_hashable(value: &HostRef) -> HostResult<()> {
    match value.object() {
        HostObject::None
        | HostObject::Bool(_)
        | HostObject::Int(_)
        | HostObject::Float(_)
        | HostObject::Str(_)
        | HostObject::Bytes(_) => Ok(()),
        HostObject::Tuple(items) => items.read().iter().try_for_each(check_hashable),
        _ => Err(HostError::type_error(format!(
            "unhashable type: '{}'",
            value.type_name()
        ))),
    }
}

/// Numeric keys compare by value across bool, int and float, so `1`,
/// `1.0` and `True` are the same key and `-0.0` folds into `0`.
#[derive(PartialEq)]
enum Numeric {
    Int(BigInt),
    // non-integral or non-finite; bits compare equal only for the same value
    Float(u64),
    NaN,
}

fn numeric(object: &HostObject) -> Option<Numeric> {
    match object {
        HostObject::Bool(value) => Some(Numeric::Int(BigInt::from(u8::from(*value)))),
        HostObject::Int(value) => Some(Numeric::Int(value.to_bigint())),
        HostObject::Float(value) if value.is_nan() => Some(Numeric::NaN),
        HostObject::Float(value) if value.is_finite() && value.fract() == 0.0 => {
            BigInt::from_f64(*value).map(Numeric::Int)
        }
        HostObject::Float(value) => Some(Numeric::Float(value.to_bits())),
        _ => None,
    }
}

fn hash_object<H: Hasher>(value: &HostRef, state: &mut H) {
    let object = value.object();
    if let Some(number) = numeric(object) {
        0_u8.hash(state);
        match number {
            Numeric::Int(value) => value.hash(state),
            Numeric::Float(bits) => bits.hash(state),
            Numeric::NaN => {}
        }
        return;
    }
    1_u8.hash(state);
    std::mem::discriminant(object).hash(state);
    match object {
        HostObject::Str(value) => value.hash(state),
        HostObject::Bytes(value) => value.hash(state),
        HostObject::Tuple(items) => {
            let items = items.read();
            items.len().hash(state);
            for item in items.iter() {
                hash_object(item, state);
            }
        }
        _ => {}
    }
}

fn objects_equal(left: &HostRef, right: &HostRef) -> bool {
    if left.ptr_eq(right) {
        return true;
    }
    if let (Some(a), Some(b)) = (numeric(left.object()), numeric(right.object())) {
        // NaN only matches itself, which the identity check above covers
        return a != Numeric::NaN && a == b;
    }
    match (left.object(), right.object()) {
        (HostObject::None, HostObject::None) => true,
        (HostObject::Str(a), HostObject::Str(b)) => a == b,
        (HostObject::Bytes(a), HostObject::Bytes(b)) => a == b,
        (HostObject::Tuple(a), HostObject::Tuple(b)) => {
            let (a, b) = (a.read(), b.read());
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| objects_equal(x, y))
        }
        _ => false,
    }
}

impl Hash for HostKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        hash_object(&self.0, state);
    }
}

impl PartialEq for HostKey {
    fn eq(&self, other: &Self) -> bool {
        objects_equal(&self.0, &other.0)
    }
}

impl Eq for HostKey {}

#[cfg(test)]
mod key_tests {
    use super::*;

    #[test]
    fn equal_content_collides() {
        let dict = HostRef::new_dict();
        dict.dict_set_item(&HostRef::str("a"), &HostRef::int(1))
            .expect("insert");
        dict.dict_set_item(&HostRef::str("a"), &HostRef::int(2))
            .expect("insert");
        assert_eq!(dict.len().expect("len"), 1);
        assert_eq!(dict.repr(), "{'a': 2}");

        let tuple_key = || HostRef::tuple_from(vec![HostRef::int(1), HostRef::str("x")]);
        dict.dict_set_item(&tuple_key(), &HostRef::none())
            .expect("insert");
        let found = dict.dict_get_item(&tuple_key()).expect("lookup");
        assert!(found.map(|value| value.is_none()).unwrap_or(false));
    }

    #[test]
    fn numerically_equal_keys_collide() {
        let dict = HostRef::new_dict();
        dict.dict_set_item(&HostRef::int(1), &HostRef::str("int"))
            .expect("insert");
        dict.dict_set_item(&HostRef::float(1.0), &HostRef::str("float"))
            .expect("insert");
        dict.dict_set_item(&HostRef::bool(true), &HostRef::str("bool"))
            .expect("insert");
        assert_eq!(dict.repr(), "{1: 'bool'}");

        dict.dict_set_item(&HostRef::float(-0.0), &HostRef::str("zero"))
            .expect("insert");
        let zero = dict.dict_get_item(&HostRef::int(0)).expect("lookup");
        assert_eq!(zero.map(|value| value.repr()), Some("'zero'".to_string()));
        assert!(dict
            .dict_get_item(&HostRef::float(1.5))
            .expect("lookup")
            .is_none());
    }

    #[test]
    fn nan_keys_only_match_themselves() {
        let set = HostRef::new_set();
        let nan = HostRef::float(f64::NAN);
        set.set_add(&nan).expect("add");
        set.set_add(&nan).expect("add");
        assert_eq!(set.len().expect("len"), 1);
        set.set_add(&HostRef::float(f64::NAN)).expect("add");
        assert_eq!(set.len().expect("len"), 2);
    }
}
