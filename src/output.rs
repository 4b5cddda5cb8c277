//! Response shapes: turn the model's final answer into a typed value or a
//! failure detail the model can act on.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::error::SchemaError;
use crate::schema::{validate_output_schema, validate_value};

/// Why a final answer was rejected. `detail` is re-injected into the
/// conversation as corrective feedback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{detail}")]
pub struct ValidationFailure {
    pub detail: String,
}

impl ValidationFailure {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

/// Validates and coerces raw model output into `O`. Implementations must be
/// pure.
pub trait OutputSchema<O>: Send + Sync {
    fn validate(&self, raw: &str) -> Result<O, ValidationFailure>;

    /// JSON schema forwarded to the model, if the shape has one.
    fn json_schema(&self) -> Option<&Value> {
        None
    }

    /// Layers an application check on top of this shape.
    fn with_validator<F>(self, check: F) -> Validated<Self, F>
    where
        Self: Sized,
        F: Fn(&O) -> Result<(), String> + Send + Sync,
    {
        Validated { inner: self, check }
    }
}

/// Unstructured text. Always accepts the raw answer unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextOutput;

impl OutputSchema<String> for TextOutput {
    fn validate(&self, raw: &str) -> Result<String, ValidationFailure> {
        Ok(raw.to_string())
    }
}

/// A JSON answer deserialized into `T`, optionally checked against a schema
/// first.
pub struct JsonOutput<T> {
    schema: Option<Value>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for JsonOutput<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonOutput")
            .field("schema", &self.schema)
            .finish()
    }
}

impl<T> Default for JsonOutput<T> {
    fn default() -> Self {
        Self {
            schema: None,
            _marker: PhantomData,
        }
    }
}

impl<T> JsonOutput<T>
where
    T: DeserializeOwned,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(schema: Value) -> Result<Self, SchemaError> {
        validate_output_schema(&schema)?;
        Ok(Self {
            schema: Some(schema),
            _marker: PhantomData,
        })
    }
}

impl<T> OutputSchema<T> for JsonOutput<T>
where
    T: DeserializeOwned,
{
    fn validate(&self, raw: &str) -> Result<T, ValidationFailure> {
        let body = strip_code_fence(raw);
        let value: Value = serde_json::from_str(body)
            .map_err(|err| ValidationFailure::new(format!("response is not valid JSON: {err}")))?;

        if let Some(schema) = &self.schema {
            validate_value(schema, &value).map_err(ValidationFailure::new)?;
        }

        serde_json::from_value(value).map_err(|err| ValidationFailure::new(err.to_string()))
    }

    fn json_schema(&self) -> Option<&Value> {
        self.schema.as_ref()
    }
}

/// See [`OutputSchema::with_validator`].
pub struct Validated<S, F> {
    inner: S,
    check: F,
}

impl<O, S, F> OutputSchema<O> for Validated<S, F>
where
    S: OutputSchema<O>,
    F: Fn(&O) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, raw: &str) -> Result<O, ValidationFailure> {
        let output = self.inner.validate(raw)?;
        (self.check)(&output).map_err(ValidationFailure::new)?;
        Ok(output)
    }

    fn json_schema(&self) -> Option<&Value> {
        self.inner.json_schema()
    }
}

// Models like to wrap JSON in ```json fences.
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(rest) = rest.strip_suffix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(newline) if !rest[..newline].trim_start().starts_with(['{', '[']) => {
            &rest[newline + 1..]
        }
        _ => rest,
    };
    body.trim()
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Forecast {
        city: String,
        celsius: i64,
    }

    fn forecast_output() -> JsonOutput<Forecast> {
        JsonOutput::with_schema(json!({
            "type": "object",
            "properties": {
                "city": {"type": "string"},
                "celsius": {"type": "integer"}
            },
            "required": ["city", "celsius"]
        }))
        .expect("valid schema")
    }

    #[test]
    fn text_output_returns_raw_text_unchanged() {
        let raw = "  4\n";
        assert_eq!(TextOutput.validate(raw), Ok(raw.to_string()));
    }

    #[test]
    fn json_output_parses_fenced_answer() {
        let raw = "```json\n{\"city\": \"Oslo\", \"celsius\": -3}\n```";
        let forecast = forecast_output().validate(raw).expect("valid");
        assert_eq!(
            forecast,
            Forecast {
                city: "Oslo".to_string(),
                celsius: -3
            }
        );
    }

    #[test]
    fn json_output_names_missing_field() {
        let failure = forecast_output()
            .validate(r#"{"city": "Oslo"}"#)
            .expect_err("must fail");
        assert_eq!(failure.detail, "\"celsius\" is a required property");
    }

    #[test]
    fn json_output_rejects_non_json() {
        let failure = forecast_output().validate("sunny").expect_err("must fail");
        assert!(failure.detail.starts_with("response is not valid JSON"));
    }

    #[test]
    fn json_output_without_schema_reports_serde_detail() {
        let failure = JsonOutput::<Forecast>::new()
            .validate(r#"{"city": 3, "celsius": 1}"#)
            .expect_err("must fail");
        assert!(failure.detail.contains("invalid type"));
    }

    #[test]
    fn validator_runs_after_shape_check() {
        let output = TextOutput.with_validator(|text: &String| {
            if text.trim().is_empty() {
                Err("answer must not be empty".to_string())
            } else {
                Ok(())
            }
        });

        assert_eq!(output.validate("ok"), Ok("ok".to_string()));
        assert_eq!(
            output.validate("  ").expect_err("must fail").detail,
            "answer must not be empty"
        );
    }

    #[test]
    fn schema_must_be_an_object() {
        assert!(JsonOutput::<Forecast>::with_schema(json!("object")).is_err());
    }
}
