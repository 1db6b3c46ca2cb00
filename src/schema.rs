//! JSON Schema generation for capability inputs.
//!
//! Discovery consumers fetch `GET <endpoint>/schema` from registered
//! components and validate request payloads against the returned draft-07
//! document. The document is derived deterministically from the
//! capability's `InputSummary`.

use serde_json::{json, Map, Value};

use crate::service::{Capability, FieldHint};

/// JSON Schema dialect emitted for capability inputs.
pub const SCHEMA_DIALECT: &str = "http://json-schema.org/draft-07/schema#";

/// Generate the JSON Schema document for a capability.
///
/// Returns `None` when the capability declares no `input_summary`; the
/// hosting server then serves 404 (or does not register the schema
/// endpoint at all).
pub fn capability_schema(capability: &Capability) -> Option<Value> {
    let summary = capability.input_summary.as_ref()?;

    let mut properties = Map::new();
    for hint in summary.required.iter().chain(summary.optional.iter()) {
        properties.insert(hint.name.clone(), field_schema(hint));
    }

    let mut schema = Map::new();
    schema.insert("$schema".to_string(), json!(SCHEMA_DIALECT));
    schema.insert("type".to_string(), json!("object"));
    schema.insert("title".to_string(), json!(capability.name));
    schema.insert("description".to_string(), json!(capability.description));
    schema.insert("properties".to_string(), Value::Object(properties));

    let required: Vec<&str> = summary.required.iter().map(|h| h.name.as_str()).collect();
    if !required.is_empty() {
        schema.insert("required".to_string(), json!(required));
    }

    if !summary.is_empty() {
        schema.insert("additionalProperties".to_string(), json!(false));
    }

    Some(Value::Object(schema))
}

fn field_schema(hint: &FieldHint) -> Value {
    let mut field = Map::new();
    field.insert("type".to_string(), json!(hint.field_type));
    if let Some(description) = &hint.description {
        field.insert("description".to_string(), json!(description));
    }
    if let Some(example) = &hint.example {
        field.insert("examples".to_string(), json!([example]));
    }
    Value::Object(field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::InputSummary;

    fn add_capability() -> Capability {
        Capability::new("add")
            .with_description("Adds two numbers")
            .with_input_summary(InputSummary {
                required: vec![
                    FieldHint {
                        name: "a".to_string(),
                        field_type: "number".to_string(),
                        description: Some("First operand".to_string()),
                        example: Some(json!(1)),
                    },
                    FieldHint::new("b", "number"),
                ],
                optional: vec![FieldHint::new("precision", "integer")],
            })
    }

    #[test]
    fn test_no_summary_no_schema() {
        let cap = Capability::new("echo");
        assert!(capability_schema(&cap).is_none());
    }

    #[test]
    fn test_schema_shape() {
        let schema = capability_schema(&add_capability()).unwrap();

        assert_eq!(schema["$schema"], json!(SCHEMA_DIALECT));
        assert_eq!(schema["type"], json!("object"));
        assert_eq!(schema["title"], json!("add"));
        assert_eq!(schema["description"], json!("Adds two numbers"));
        assert_eq!(schema["required"], json!(["a", "b"]));
        assert_eq!(schema["additionalProperties"], json!(false));

        let props = schema["properties"].as_object().unwrap();
        assert_eq!(props.len(), 3);
        assert_eq!(props["a"]["type"], json!("number"));
        assert_eq!(props["a"]["description"], json!("First operand"));
        assert_eq!(props["a"]["examples"], json!([1]));
        assert_eq!(props["precision"]["type"], json!("integer"));
        assert!(props["b"].get("description").is_none());
    }

    #[test]
    fn test_required_omitted_when_empty() {
        let cap = Capability::new("status").with_input_summary(InputSummary {
            required: vec![],
            optional: vec![FieldHint::new("verbose", "boolean")],
        });
        let schema = capability_schema(&cap).unwrap();
        assert!(schema.get("required").is_none());
        assert_eq!(schema["additionalProperties"], json!(false));
    }

    #[test]
    fn test_additional_properties_absent_for_empty_summary() {
        let cap = Capability::new("ping").with_input_summary(InputSummary::default());
        let schema = capability_schema(&cap).unwrap();
        assert!(schema.get("additionalProperties").is_none());
        assert_eq!(schema["properties"], json!({}));
    }

    #[test]
    fn test_generation_is_deterministic() {
        let cap = add_capability();
        let a = capability_schema(&cap).unwrap();
        let b = capability_schema(&cap).unwrap();
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }
}
