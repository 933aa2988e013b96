use sb_core::{
    ConversionError, Direction, Namespace, PathSegment, ScriptInt, ScriptStruct, ScriptValue,
};
use sb_host::{HostError, HostRef};

fn host_failure(error: HostError) -> ConversionError {
    ConversionError::host(Direction::ToHost, error)
}

/// Converts an interpreter value into a new host object.
///
/// Every partially built container is released before an error is returned.
/// A failure inside a container carries the index, field name or mapping
/// role that leads to it.
pub fn script_to_host(value: &ScriptValue) -> Result<HostRef, ConversionError> {
    match value {
        ScriptValue::None => Ok(HostRef::none()),
        ScriptValue::Bool(value) => Ok(HostRef::bool(*value)),
        ScriptValue::Int(value) => int_to_host(value),
        ScriptValue::Float(value) => Ok(HostRef::float(*value)),
        ScriptValue::String(value) => Ok(HostRef::str(value)),
        ScriptValue::Bytes(value) => Ok(HostRef::bytes_from_slice(value)),
        ScriptValue::Tuple(items) => tuple_to_host(items),
        ScriptValue::List(items) => list_to_host(items),
        ScriptValue::Set(items) => set_to_host(items),
        ScriptValue::Mapping(entries) => mapping_to_host(entries),
        ScriptValue::Struct(fields) => struct_to_host(fields),
        ScriptValue::Function(_) | ScriptValue::Opaque(_) => Err(ConversionError::unsupported(
            Direction::ToHost,
            value.type_name(),
        )),
    }
}

pub fn int_to_host(value: &ScriptInt) -> Result<HostRef, ConversionError> {
    if let Some(small) = value.to_i64() {
        return Ok(HostRef::int(small));
    }
    HostRef::int_from_decimal(&value.to_string()).map_err(host_failure)
}

pub fn tuple_to_host(items: &[ScriptValue]) -> Result<HostRef, ConversionError> {
    let tuple = HostRef::new_tuple(items.len());
    for (index, item) in items.iter().enumerate() {
        let converted =
            script_to_host(item).map_err(|error| error.within(PathSegment::Index(index)))?;
        // steals `converted`
        tuple
            .tuple_set_item(index, converted)
            .map_err(|error| host_failure(error).within(PathSegment::Index(index)))?;
    }
    Ok(tuple)
}

pub fn list_to_host(items: &[ScriptValue]) -> Result<HostRef, ConversionError> {
    let list = HostRef::new_list();
    for (index, item) in items.iter().enumerate() {
        let converted =
            script_to_host(item).map_err(|error| error.within(PathSegment::Index(index)))?;
        // steals `converted`
        list.list_append(converted)
            .map_err(|error| host_failure(error).within(PathSegment::Index(index)))?;
    }
    Ok(list)
}

pub fn set_to_host(items: &[ScriptValue]) -> Result<HostRef, ConversionError> {
    let set = HostRef::new_set();
    for (index, item) in items.iter().enumerate() {
        let converted =
            script_to_host(item).map_err(|error| error.within(PathSegment::Index(index)))?;
        // does not steal; `converted` is released at the end of the iteration
        set.set_add(&converted)
            .map_err(|error| host_failure(error).within(PathSegment::Index(index)))?;
    }
    Ok(set)
}

pub fn mapping_to_host(entries: &[(ScriptValue, ScriptValue)]) -> Result<HostRef, ConversionError> {
    let dict = HostRef::new_dict();
    for (index, (key, value)) in entries.iter().enumerate() {
        let host_key =
            script_to_host(key).map_err(|error| error.within(PathSegment::MapKey(index)))?;
        let host_value = script_to_host(value)
            .map_err(|error| error.within(PathSegment::MapValue(key.to_string())))?;
        // does not steal either side
        dict.dict_set_item(&host_key, &host_value)
            .map_err(|error| host_failure(error).within(PathSegment::MapKey(index)))?;
    }
    Ok(dict)
}

/// Fields are staged in an ordered dict first; the attribute bag can only be
/// built from a complete set of fields.
pub fn struct_to_host(fields: &ScriptStruct) -> Result<HostRef, ConversionError> {
    let staged = HostRef::new_dict();
    for (name, value) in fields.fields() {
        let host_value = script_to_host(value)
            .map_err(|error| error.within(PathSegment::Field(name.to_string())))?;
        staged
            .dict_set_item(&HostRef::str(name), &host_value)
            .map_err(|error| host_failure(error).within(PathSegment::Field(name.to_string())))?;
    }
    HostRef::new_namespace(&staged).map_err(ConversionError::struct_construction)
}

/// Exports a globals namespace as a host dict. Function values stay behind:
/// they only have meaning inside the interpreter.
pub fn namespace_to_host(globals: &Namespace) -> Result<HostRef, ConversionError> {
    let dict = HostRef::new_dict();
    for (name, value) in globals {
        if matches!(value, ScriptValue::Function(_)) {
            continue;
        }
        let host_value = script_to_host(value)
            .map_err(|error| error.within(PathSegment::MapValue(format!("{:?}", name))))?;
        dict.dict_set_item(&HostRef::str(name), &host_value)
            .map_err(host_failure)?;
    }
    Ok(dict)
}
