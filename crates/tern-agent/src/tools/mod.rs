mod dispatcher;
mod registry;

use crate::ToolError;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashSet;
use tern_llm::ToolDefinition;

pub(crate) use dispatcher::panic_message;
pub use dispatcher::{ToolDispatcher, error_signature};
pub use registry::{ApprovalDescriber, RegisteredTool, ToolExecutor, ToolFuture, ToolRegistry};

/// Deserializes parsed call arguments into a tool's own parameter type.
pub fn parse_arguments<T: DeserializeOwned>(arguments: Value) -> Result<T, ToolError> {
    serde_json::from_value(arguments)
        .map_err(|error| ToolError::Validation(format!("invalid arguments: {}", error)))
}

/// Checks parsed call arguments against the tool's parameter schema.
///
/// All problems are collected into one rejection that also lists the
/// parameters the tool accepts, so the model can fix the whole call in a
/// single retry instead of discovering mistakes one at a time.
fn check_arguments(definition: &ToolDefinition, arguments: &Value) -> Result<(), ToolError> {
    let schema = &definition.parameters;
    let object_schema = schema.is_object()
        && schema
            .get("type")
            .and_then(Value::as_str)
            .is_none_or(|root_type| root_type == "object");
    if !object_schema {
        return Err(ToolError::Validation(format!(
            "tool '{}' declares a parameter schema whose root is not an object",
            definition.name
        )));
    }

    let Some(object) = arguments.as_object() else {
        return Err(rejection(
            definition,
            vec![format!(
                "arguments must be a JSON object, got {}",
                json_type_name(arguments)
            )],
        ));
    };

    let properties = schema.get("properties").and_then(Value::as_object);
    let closed = schema.get("additionalProperties").and_then(Value::as_bool) == Some(false);
    let mut problems: Vec<String> = required_keys(schema)
        .filter(|key| !object.contains_key(*key))
        .map(|key| format!("missing required argument '{}'", key))
        .collect();

    for (key, value) in object {
        match properties.and_then(|properties| properties.get(key)) {
            None if closed => problems.push(format!("unknown argument '{}'", key)),
            None => {}
            Some(property) => {
                if let Some(expected) = property.get("type").and_then(Value::as_str) {
                    if !has_type(value, expected) {
                        problems.push(format!(
                            "argument '{}' must be {}, got {}",
                            key,
                            expected,
                            json_type_name(value)
                        ));
                    }
                }
            }
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(rejection(definition, problems))
    }
}

fn required_keys(schema: &Value) -> impl Iterator<Item = &str> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
}

fn has_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn rejection(definition: &ToolDefinition, problems: Vec<String>) -> ToolError {
    let mut message = format!(
        "arguments for '{}' rejected: {}",
        definition.name,
        problems.join("; ")
    );
    let accepted = accepted_parameters(&definition.parameters);
    if !accepted.is_empty() {
        message.push_str(". Accepted parameters: ");
        message.push_str(&accepted);
    }
    ToolError::Validation(message)
}

/// `name (type, required), other (type)` in schema order.
fn accepted_parameters(schema: &Value) -> String {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return String::new();
    };
    let required: HashSet<&str> = required_keys(schema).collect();
    properties
        .iter()
        .map(|(name, property)| {
            let kind = property.get("type").and_then(Value::as_str).unwrap_or("any");
            if required.contains(name.as_str()) {
                format!("{} ({}, required)", name, kind)
            } else {
                format!("{} ({})", name, kind)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn forecast() -> ToolDefinition {
        ToolDefinition {
            name: "forecast".to_string(),
            description: "Weather forecast".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "city": {"type": "string"},
                    "days": {"type": "integer"}
                },
                "required": ["city"],
                "additionalProperties": false
            }),
        }
    }

    fn rejection_text(arguments: Value) -> String {
        match check_arguments(&forecast(), &arguments) {
            Err(ToolError::Validation(message)) => message,
            other => panic!("expected a validation error, got {:?}", other),
        }
    }

    #[test]
    fn accepts_arguments_matching_schema() {
        assert!(check_arguments(&forecast(), &json!({"city": "Paris", "days": 2})).is_ok());
        assert!(check_arguments(&forecast(), &json!({"city": "Paris"})).is_ok());
    }

    #[test]
    fn reports_every_problem_with_accepted_parameters() {
        let message = rejection_text(json!({"days": "two", "units": "metric"}));

        assert_eq!(
            message,
            "arguments for 'forecast' rejected: missing required argument 'city'; \
             argument 'days' must be integer, got string; unknown argument 'units'. \
             Accepted parameters: city (string, required), days (integer)"
        );
    }

    #[test]
    fn rejects_non_object_arguments() {
        assert!(rejection_text(json!(["Paris"])).contains("arguments must be a JSON object, got array"));
    }

    #[test]
    fn open_schema_tolerates_extra_keys() {
        let mut definition = forecast();
        definition.parameters["additionalProperties"] = json!(true);

        assert!(check_arguments(&definition, &json!({"city": "Paris", "units": "metric"})).is_ok());
    }

    #[test]
    fn non_object_schema_root_is_a_tool_defect() {
        let mut definition = forecast();
        definition.parameters = json!({"type": "array"});

        let error = check_arguments(&definition, &json!({})).expect_err("array root");
        assert_eq!(
            error,
            ToolError::Validation(
                "tool 'forecast' declares a parameter schema whose root is not an object"
                    .to_string()
            )
        );
    }

    #[test]
    fn parse_arguments_deserializes_typed_params() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Params {
            city: String,
        }

        let params: Params = parse_arguments(json!({"city": "Oslo"})).expect("params");
        assert_eq!(params.city, "Oslo");
        assert!(parse_arguments::<Params>(json!({"town": "Oslo"})).is_err());
    }
}
