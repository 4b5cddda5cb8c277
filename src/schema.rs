//! JSON Schema handling for retriever parameters and response shapes.
//!
//! Setup-time checks enforce the shape this crate relies on; value checks
//! are delegated to `jsonschema`.

use jsonschema::Validator;
use serde_json::{Map, Value};

use crate::error::SchemaError;

/// Checks a retriever parameter schema. The root must describe an object.
pub fn validate_parameter_schema(schema: &Value) -> Result<(), SchemaError> {
    let schema_obj = schema.as_object().ok_or(SchemaError::SchemaNotObject)?;

    let root_type = schema_obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or(SchemaError::RootTypeMustBeObject)?;

    if root_type != "object" {
        return Err(SchemaError::RootTypeMustBeObject);
    }

    validate_node(schema_obj)?;
    compile(schema).map(drop)
}

/// Checks a response-shape schema. Any root type is accepted.
pub fn validate_output_schema(schema: &Value) -> Result<(), SchemaError> {
    let schema_obj = schema.as_object().ok_or(SchemaError::SchemaNotObject)?;
    validate_node(schema_obj)?;
    compile(schema).map(drop)
}

fn compile(schema: &Value) -> Result<Validator, SchemaError> {
    Validator::new(schema).map_err(|err| SchemaError::Uncompilable(err.to_string()))
}

fn validate_node(schema_obj: &Map<String, Value>) -> Result<(), SchemaError> {
    if let Some(type_name) = schema_obj.get("type") {
        if !type_name.is_string() {
            return Err(SchemaError::InvalidType);
        }
    }

    if let Some(required) = schema_obj.get("required") {
        let required_arr = required.as_array().ok_or(SchemaError::InvalidRequired)?;
        if required_arr.iter().any(|item| !item.is_string()) {
            return Err(SchemaError::InvalidRequired);
        }
    }

    if let Some(allowed) = schema_obj.get("enum") {
        if !allowed.is_array() {
            return Err(SchemaError::InvalidEnum);
        }
    }

    if let Some(properties) = schema_obj.get("properties") {
        let properties = properties
            .as_object()
            .ok_or(SchemaError::InvalidProperties)?;
        for field_schema in properties.values() {
            let field_obj = field_schema
                .as_object()
                .ok_or(SchemaError::SchemaNotObject)?;
            validate_node(field_obj)?;
        }
    }

    if let Some(items) = schema_obj.get("items") {
        let items_obj = items.as_object().ok_or(SchemaError::SchemaNotObject)?;
        validate_node(items_obj)?;
    }

    Ok(())
}

/// Checks `value` against `schema`. Every violation is reported with the
/// location of the offending field so the message can be handed back to
/// the model verbatim.
pub fn validate_value(schema: &Value, value: &Value) -> Result<(), String> {
    let validator = compile(schema).map_err(|err| err.to_string())?;
    if validator.is_valid(value) {
        return Ok(());
    }

    let violations = validator
        .iter_errors(value)
        .map(|err| {
            let location = err.instance_path.to_string();
            if location.is_empty() {
                err.to_string()
            } else {
                format!("{location}: {err}")
            }
        })
        .collect::<Vec<_>>();
    Err(violations.join("; "))
}
