use sb_core::{
    BridgeError, ConversionError, Direction, Namespace, PathSegment, ScriptInt, ScriptStruct,
    ScriptValue,
};
use sb_host::{HostError, HostInt, HostObject, HostRef};

fn host_failure(error: HostError) -> ConversionError {
    ConversionError::host(Direction::ToScript, error)
}

/// Converts a host object into an interpreter value. The structural converse
/// of `script_to_host`; dicts become mappings and attribute bags become
/// structs.
pub fn host_to_script(value: &HostRef) -> Result<ScriptValue, ConversionError> {
    match value.object() {
        HostObject::None => Ok(ScriptValue::None),
        HostObject::Bool(value) => Ok(ScriptValue::Bool(*value)),
        HostObject::Int(HostInt::Small(value)) => Ok(ScriptValue::int(*value)),
        HostObject::Int(HostInt::Big(value)) => {
            Ok(ScriptValue::Int(ScriptInt::from_bigint(value.clone())))
        }
        HostObject::Float(value) => Ok(ScriptValue::Float(*value)),
        HostObject::Str(value) => Ok(ScriptValue::String(value.clone())),
        HostObject::Bytes(value) => Ok(ScriptValue::Bytes(value.clone())),
        HostObject::Tuple(_) => Ok(ScriptValue::Tuple(sequence_to_script(value)?)),
        HostObject::List(_) => Ok(ScriptValue::List(sequence_to_script(value)?)),
        HostObject::Set(_) => Ok(ScriptValue::set(sequence_to_script(value)?)),
        HostObject::Dict(_) => dict_to_script(value),
        HostObject::Namespace(_) => namespace_fields_to_script(value),
        HostObject::Function(_) | HostObject::Native(_) => Err(ConversionError::unsupported(
            Direction::ToScript,
            value.type_name(),
        )),
    }
}

fn sequence_to_script(value: &HostRef) -> Result<Vec<ScriptValue>, ConversionError> {
    let items = value.items().map_err(host_failure)?;
    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            host_to_script(item).map_err(|error| error.within(PathSegment::Index(index)))
        })
        .collect()
}

fn dict_to_script(value: &HostRef) -> Result<ScriptValue, ConversionError> {
    let items = value.dict_items().map_err(host_failure)?;
    let mut entries = Vec::with_capacity(items.len());
    for (index, (key, item)) in items.iter().enumerate() {
        let key = host_to_script(key).map_err(|error| error.within(PathSegment::MapKey(index)))?;
        let item = host_to_script(item)
            .map_err(|error| error.within(PathSegment::MapValue(key.to_string())))?;
        entries.push((key, item));
    }
    Ok(ScriptValue::Mapping(entries))
}

fn namespace_fields_to_script(value: &HostRef) -> Result<ScriptValue, ConversionError> {
    let mut fields = ScriptStruct::new();
    for (name, item) in value.namespace_fields().map_err(host_failure)? {
        let item = host_to_script(&item)
            .map_err(|error| error.within(PathSegment::Field(name.clone())))?;
        fields.insert(name, item);
    }
    Ok(ScriptValue::Struct(fields))
}

/// Reads a host dict of `str` keys into a globals namespace.
pub fn host_to_namespace(value: &HostRef) -> Result<Namespace, BridgeError> {
    if !matches!(value.object(), HostObject::Dict(_)) {
        return Err(BridgeError::type_contract(format!(
            "globals must be a dict, not {}",
            value.type_name()
        )));
    }
    let mut namespace = Namespace::new();
    for (key, item) in value.dict_items()? {
        let Some(name) = key.as_str() else {
            return Err(BridgeError::type_contract(format!(
                "global names must be str, not {}",
                key.type_name()
            )));
        };
        let item = host_to_script(&item)
            .map_err(|error| error.within(PathSegment::MapValue(format!("{:?}", name))))?;
        namespace.insert(name.to_string(), item);
    }
    Ok(namespace)
}
