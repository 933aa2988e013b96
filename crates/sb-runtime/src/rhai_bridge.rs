use num_bigint::BigInt;
use rhai::{
    Array, Blob, Dynamic, Engine, EvalAltResult, FnPtr, ImmutableString, Map, Position, FLOAT, INT,
};
use sb_core::{BridgeError, ResolverConfig, ScriptInt, ScriptStruct, ScriptValue};

use crate::interpreter::PendingError;

#[derive(Debug, Clone)]
pub(crate) struct TupleValue(Vec<ScriptValue>);

#[derive(Debug, Clone)]
pub(crate) struct SetValue(Vec<ScriptValue>);

#[derive(Debug, Clone)]
pub(crate) struct StructValue(ScriptStruct);

/// A mapping coming from the host. rhai's own map sorts its keys and only
/// takes strings, so this keeps insertion order and any key kind.
#[derive(Debug, Clone)]
pub(crate) struct MappingValue(Vec<(ScriptValue, ScriptValue)>);

impl MappingValue {
    fn get(&self, key: &ScriptValue) -> Result<Dynamic, Box<EvalAltResult>> {
        self.0
            .iter()
            .find(|(candidate, _)| candidate == key)
            .map(|(_, item)| script_to_dynamic(item))
            .ok_or_else(|| runtime_error(format!("key {} not found", key)))
    }

    /// Rebinds an existing key in place; new keys go last.
    fn set(&mut self, key: ScriptValue, item: Dynamic) {
        let item = dynamic_to_script(item);
        match self.0.iter_mut().find(|(candidate, _)| *candidate == key) {
            Some(entry) => entry.1 = item,
            None => self.0.push((key, item)),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct BigIntValue(BigInt);

fn runtime_error(message: impl Into<String>) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        Dynamic::from(message.into()),
        Position::NONE,
    ))
}

pub(crate) fn dynamic_to_script(value: Dynamic) -> ScriptValue {
    let value = value.flatten();
    if value.is_unit() {
        return ScriptValue::None;
    }
    if value.is::<bool>() {
        return ScriptValue::Bool(value.cast::<bool>());
    }
    if value.is::<INT>() {
        return ScriptValue::int(value.cast::<INT>());
    }
    if value.is::<FLOAT>() {
        return ScriptValue::Float(value.cast::<FLOAT>());
    }
    if value.is::<ImmutableString>() {
        return ScriptValue::String(value.cast::<ImmutableString>().to_string());
    }
    if value.is::<char>() {
        return ScriptValue::String(value.cast::<char>().to_string());
    }
    if value.is::<Blob>() {
        return ScriptValue::Bytes(value.cast::<Blob>());
    }
    if value.is::<Array>() {
        return ScriptValue::List(
            value
                .cast::<Array>()
                .into_iter()
                .map(dynamic_to_script)
                .collect(),
        );
    }
    if value.is::<Map>() {
        return ScriptValue::Mapping(
            value
                .cast::<Map>()
                .into_iter()
                .map(|(key, item)| (ScriptValue::String(key.to_string()), dynamic_to_script(item)))
                .collect(),
        );
    }
    if value.is::<TupleValue>() {
        return ScriptValue::Tuple(value.cast::<TupleValue>().0);
    }
    if value.is::<SetValue>() {
        return ScriptValue::Set(value.cast::<SetValue>().0);
    }
    if value.is::<StructValue>() {
        return ScriptValue::Struct(value.cast::<StructValue>().0);
    }
    if value.is::<MappingValue>() {
        return ScriptValue::Mapping(value.cast::<MappingValue>().0);
    }
    if value.is::<BigIntValue>() {
        return ScriptValue::Int(ScriptInt::from_bigint(value.cast::<BigIntValue>().0));
    }
    if value.is::<FnPtr>() {
        return ScriptValue::Function(value.cast::<FnPtr>().fn_name().to_string());
    }
    ScriptValue::Opaque(value.type_name().to_string())
}

/// Opaque values have no interpreter form left and come back as `()`.
pub(crate) fn script_to_dynamic(value: &ScriptValue) -> Dynamic {
    match value {
        ScriptValue::None | ScriptValue::Opaque(_) => Dynamic::UNIT,
        ScriptValue::Bool(value) => Dynamic::from_bool(*value),
        ScriptValue::Int(ScriptInt::Small(value)) => Dynamic::from_int(*value),
        ScriptValue::Int(ScriptInt::Big(value)) => Dynamic::from(BigIntValue(value.clone())),
        ScriptValue::Float(value) => Dynamic::from_float(*value),
        ScriptValue::String(value) => Dynamic::from(value.clone()),
        ScriptValue::Bytes(value) => Dynamic::from_blob(value.clone()),
        ScriptValue::Tuple(items) => Dynamic::from(TupleValue(items.clone())),
        ScriptValue::List(items) => {
            Dynamic::from_array(items.iter().map(script_to_dynamic).collect())
        }
        ScriptValue::Set(items) => Dynamic::from(SetValue(items.clone())),
        ScriptValue::Mapping(entries) => Dynamic::from(MappingValue(entries.clone())),
        ScriptValue::Struct(fields) => Dynamic::from(StructValue(fields.clone())),
        ScriptValue::Function(name) => FnPtr::new(name.as_str())
            .map(Dynamic::from)
            .unwrap_or(Dynamic::UNIT),
    }
}

fn array_to_script(items: Array) -> Vec<ScriptValue> {
    items.into_iter().map(dynamic_to_script).collect()
}

fn struct_from_pairs(pairs: Array) -> Result<StructValue, Box<EvalAltResult>> {
    let mut fields = ScriptStruct::new();
    for pair in pairs {
        let pair = pair.flatten();
        let mut entry = pair
            .try_cast::<Array>()
            .filter(|entry| entry.len() == 2)
            .ok_or_else(|| runtime_error("make_struct expects [name, value] pairs"))?;
        let value = entry.pop().unwrap_or(Dynamic::UNIT);
        let name = entry
            .pop()
            .and_then(|name| name.try_cast::<ImmutableString>())
            .ok_or_else(|| runtime_error("make_struct field names must be strings"))?;
        fields.insert(name.to_string(), dynamic_to_script(value));
    }
    Ok(StructValue(fields))
}

/// Registers the interpreter-side helpers: `make_struct`, `tuple`, `set`,
/// `bigint` and `bytes`, plus indexers and display for the custom kinds.
pub(crate) fn register_value_types(
    engine: &mut Engine,
    config: &ResolverConfig,
    pending: &PendingError,
) {
    engine
        .register_type_with_name::<TupleValue>("tuple")
        .register_fn("tuple", |items: Array| TupleValue(array_to_script(items)))
        .register_fn("len", |value: &mut TupleValue| value.0.len() as INT)
        .register_indexer_get(
            |value: &mut TupleValue, index: INT| -> Result<Dynamic, Box<EvalAltResult>> {
                usize::try_from(index)
                    .ok()
                    .and_then(|index| value.0.get(index))
                    .map(script_to_dynamic)
                    .ok_or_else(|| runtime_error(format!("tuple index {} out of range", index)))
            },
        )
        .register_fn("to_string", |value: &mut TupleValue| {
            ScriptValue::Tuple(value.0.clone()).to_string()
        })
        .register_fn("to_debug", |value: &mut TupleValue| {
            ScriptValue::Tuple(value.0.clone()).to_string()
        });

    engine
        .register_type_with_name::<StructValue>("struct")
        .register_fn("make_struct", || StructValue(ScriptStruct::new()))
        .register_fn("make_struct", struct_from_pairs)
        .register_fn("len", |value: &mut StructValue| value.0.len() as INT)
        .register_indexer_get(
            |value: &mut StructValue, name: ImmutableString| -> Result<Dynamic, Box<EvalAltResult>> {
                value
                    .0
                    .get(name.as_str())
                    .map(script_to_dynamic)
                    .ok_or_else(|| runtime_error(format!("struct has no field '{}'", name)))
            },
        )
        .register_indexer_set(
            |value: &mut StructValue, name: ImmutableString, item: Dynamic| {
                value.0.insert(name.to_string(), dynamic_to_script(item));
            },
        )
        .register_fn("to_string", |value: &mut StructValue| {
            ScriptValue::Struct(value.0.clone()).to_string()
        })
        .register_fn("to_debug", |value: &mut StructValue| {
            ScriptValue::Struct(value.0.clone()).to_string()
        });

    let allow_set = config.allow_set;
    let set_pending = pending.clone();
    let empty_set_pending = pending.clone();
    engine
        .register_type_with_name::<SetValue>("set")
        .register_fn(
            "set",
            move |items: Array| -> Result<SetValue, Box<EvalAltResult>> {
                if !allow_set {
                    return Err(set_pending.raise(set_disallowed()));
                }
                Ok(unique_set(items))
            },
        )
        .register_fn("set", move || -> Result<SetValue, Box<EvalAltResult>> {
            if !allow_set {
                return Err(empty_set_pending.raise(set_disallowed()));
            }
            Ok(SetValue(Vec::new()))
        })
        .register_fn("len", |value: &mut SetValue| value.0.len() as INT)
        .register_fn("contains", |value: &mut SetValue, item: Dynamic| {
            value.0.contains(&dynamic_to_script(item))
        })
        .register_fn("to_string", |value: &mut SetValue| {
            ScriptValue::Set(value.0.clone()).to_string()
        })
        .register_fn("to_debug", |value: &mut SetValue| {
            ScriptValue::Set(value.0.clone()).to_string()
        });

    engine
        .register_type_with_name::<MappingValue>("dict")
        .register_indexer_get(|value: &mut MappingValue, key: ImmutableString| {
            value.get(&ScriptValue::String(key.to_string()))
        })
        .register_indexer_get(|value: &mut MappingValue, key: INT| {
            value.get(&ScriptValue::int(key))
        })
        .register_indexer_set(
            |value: &mut MappingValue, key: ImmutableString, item: Dynamic| {
                value.set(ScriptValue::String(key.to_string()), item);
            },
        )
        .register_indexer_set(|value: &mut MappingValue, key: INT, item: Dynamic| {
            value.set(ScriptValue::int(key), item);
        })
        .register_fn("len", |value: &mut MappingValue| value.0.len() as INT)
        .register_fn("contains", |value: &mut MappingValue, key: Dynamic| {
            let key = dynamic_to_script(key);
            value.0.iter().any(|(candidate, _)| *candidate == key)
        })
        .register_fn("keys", |value: &mut MappingValue| -> Array {
            value.0.iter().map(|(key, _)| script_to_dynamic(key)).collect()
        })
        .register_fn("values", |value: &mut MappingValue| -> Array {
            value.0.iter().map(|(_, item)| script_to_dynamic(item)).collect()
        })
        .register_fn("to_string", |value: &mut MappingValue| {
            ScriptValue::Mapping(value.0.clone()).to_string()
        })
        .register_fn("to_debug", |value: &mut MappingValue| {
            ScriptValue::Mapping(value.0.clone()).to_string()
        });

    engine
        .register_type_with_name::<BigIntValue>("bigint")
        .register_fn(
            "bigint",
            |text: ImmutableString| -> Result<BigIntValue, Box<EvalAltResult>> {
                text.trim()
                    .parse::<BigInt>()
                    .map(BigIntValue)
                    .map_err(|_| runtime_error(format!("invalid integer literal '{}'", text)))
            },
        )
        .register_fn("bigint", |value: INT| BigIntValue(BigInt::from(value)))
        .register_fn("+", |a: BigIntValue, b: BigIntValue| BigIntValue(a.0 + b.0))
        .register_fn("+", |a: BigIntValue, b: INT| BigIntValue(a.0 + b))
        .register_fn("*", |a: BigIntValue, b: BigIntValue| BigIntValue(a.0 * b.0))
        .register_fn("*", |a: BigIntValue, b: INT| BigIntValue(a.0 * b))
        .register_fn("to_string", |value: &mut BigIntValue| value.0.to_string())
        .register_fn("to_debug", |value: &mut BigIntValue| value.0.to_string());

    engine.register_fn("bytes", |text: ImmutableString| -> Blob {
        text.as_bytes().to_vec()
    });
}

fn set_disallowed() -> BridgeError {
    BridgeError::resolve("set is not allowed: enable ResolverConfig::allow_set")
}

fn unique_set(items: Array) -> SetValue {
    match ScriptValue::set(array_to_script(items)) {
        ScriptValue::Set(items) => SetValue(items),
        _ => SetValue(Vec::new()),
    }
}

#[cfg(test)]
mod rhai_bridge_tests {
    use super::*;

    fn build_engine(config: ResolverConfig) -> (Engine, PendingError) {
        let pending = PendingError::default();
        let mut engine = Engine::new();
        register_value_types(&mut engine, &config, &pending);
        (engine, pending)
    }

    #[test]
    fn dynamic_primitives_convert() {
        assert_eq!(dynamic_to_script(Dynamic::UNIT), ScriptValue::None);
        assert_eq!(dynamic_to_script(Dynamic::from_int(7)), ScriptValue::int(7));
        assert_eq!(
            dynamic_to_script(Dynamic::from('x')),
            ScriptValue::string("x")
        );
        assert_eq!(
            dynamic_to_script(Dynamic::from_blob(vec![0, 1])),
            ScriptValue::Bytes(vec![0, 1])
        );
    }

    #[test]
    fn script_values_survive_the_engine_boundary() {
        let values = [
            ScriptValue::Tuple(vec![ScriptValue::int(1), ScriptValue::None]),
            ScriptValue::set(vec![ScriptValue::int(1), ScriptValue::int(2)]),
            ScriptValue::Mapping(vec![(ScriptValue::string("k"), ScriptValue::Bool(true))]),
            ScriptValue::Mapping(vec![(ScriptValue::int(1), ScriptValue::Bool(true))]),
            ScriptValue::Struct(ScriptStruct::from_fields([("b", ScriptValue::int(1))])),
            ScriptValue::Int(ScriptInt::from_bigint(BigInt::from(i64::MAX) + 1)),
            ScriptValue::Bytes(b"\0a".to_vec()),
        ];
        for value in values {
            assert_eq!(dynamic_to_script(script_to_dynamic(&value)), value);
        }
    }

    #[test]
    fn make_struct_keeps_pair_order() {
        let (engine, _) = build_engine(ResolverConfig::default());
        let result = engine
            .eval::<Dynamic>(r#"make_struct([["b", 1], ["a", 2], ["c", 3]])"#)
            .expect("eval");
        let ScriptValue::Struct(fields) = dynamic_to_script(result) else {
            panic!("expected struct");
        };
        assert_eq!(fields.names().collect::<Vec<_>>(), vec!["b", "a", "c"]);
    }

    #[test]
    fn struct_fields_are_indexable() {
        let (engine, _) = build_engine(ResolverConfig::default());
        let result = engine
            .eval::<INT>(r#"let s = make_struct(); s["x"] = 40; s["x"] + 2"#)
            .expect("eval");
        assert_eq!(result, 42);
    }

    #[test]
    fn tuple_indexing_and_bigint_arithmetic() {
        let (engine, _) = build_engine(ResolverConfig::default());
        let second = engine
            .eval::<INT>("let t = tuple([10, 20, 30]); t[1] + len(t)")
            .expect("eval");
        assert_eq!(second, 23);

        let big = engine
            .eval::<Dynamic>(r#"bigint("9223372036854775807") + 1"#)
            .expect("eval");
        assert_eq!(
            dynamic_to_script(big),
            ScriptValue::Int(ScriptInt::from_bigint(BigInt::from(i64::MAX) + 1))
        );
    }

    #[test]
    fn set_requires_permission() {
        let (engine, pending) = build_engine(ResolverConfig::default());
        assert!(engine.eval::<Dynamic>("set([1, 2])").is_err());
        assert!(matches!(
            pending.take(),
            Some(BridgeError::Resolve { .. })
        ));

        let (engine, pending) = build_engine(ResolverConfig {
            allow_set: true,
            ..ResolverConfig::default()
        });
        let value = engine
            .eval::<Dynamic>("set([1, 2, 1])")
            .expect("eval");
        assert_eq!(
            dynamic_to_script(value),
            ScriptValue::set(vec![ScriptValue::int(1), ScriptValue::int(2)])
        );
        assert!(pending.take().is_none());
    }

    #[test]
    fn host_mappings_keep_insertion_order_in_scripts() {
        let (engine, _) = build_engine(ResolverConfig::default());
        let mut scope = rhai::Scope::new();
        let seeded = ScriptValue::Mapping(vec![
            (ScriptValue::string("z"), ScriptValue::int(1)),
            (ScriptValue::string("a"), ScriptValue::int(2)),
        ]);
        scope.push_dynamic("d", script_to_dynamic(&seeded));

        let total = engine
            .eval_with_scope::<INT>(&mut scope, r#"d["z"] + d.a + len(d)"#)
            .expect("eval");
        assert_eq!(total, 5);

        let updated = engine
            .eval_with_scope::<Dynamic>(&mut scope, r#"d["m"] = 3; d["z"] = 0; d"#)
            .expect("eval");
        assert_eq!(dynamic_to_script(updated).to_string(), r#"{"z": 0, "a": 2, "m": 3}"#);
        assert!(engine
            .eval_with_scope::<bool>(&mut scope, r#""a" in d"#)
            .expect("eval"));
    }
}
