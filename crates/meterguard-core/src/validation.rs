//! Structural checks on successful response payloads.

use std::fmt::Debug;

use serde_json::{Map, Value};

/// Checks a decoded payload before it is handed to the caller.
pub trait ResponseValidator: Debug + Send + Sync {
    /// Returns a human-readable reason when the payload is rejected.
    fn validate(&self, payload: &Value) -> Result<(), String>;
}

#[derive(Debug, Clone, PartialEq)]
enum FieldRule {
    /// Required string with a minimum length.
    Text { min_len: usize },
    /// Required non-negative integer.
    Counter,
    /// Optional integer; must not be negative when present.
    OptionalCounter,
    /// Optional number of any sign.
    OptionalNumber,
}

/// Validator for `{"data": [ {...}, ... ], "summaryStatistics": {...}}` payloads.
///
/// `data` may be absent or empty. Every element must be an object satisfying the
/// configured field rules. `summaryStatistics`, when present, must be an object.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSeriesValidator {
    name: String,
    fields: Vec<(String, FieldRule)>,
}

impl DataSeriesValidator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Traffic series: timestamp plus edge and origin counters.
    pub fn traffic() -> Self {
        Self::new("traffic")
            .require_text("time", 10)
            .require_counter("edgeBytesTotal")
            .optional_counter("edgeHitsTotal")
            .optional_counter("originHitsTotal")
            .optional_counter("originBytesTotal")
    }

    /// Emissions series: timestamp, country code, bytes and carbon figures.
    pub fn emissions() -> Self {
        Self::new("emissions")
            .require_text("time", 10)
            .require_text("country", 2)
            .require_counter("edgeBytesTotal")
            .optional_number("carbonIntensity")
            .optional_number("carbonEmission")
    }

    pub fn require_text(mut self, field: impl Into<String>, min_len: usize) -> Self {
        self.fields.push((field.into(), FieldRule::Text { min_len }));
        self
    }

    pub fn require_counter(mut self, field: impl Into<String>) -> Self {
        self.fields.push((field.into(), FieldRule::Counter));
        self
    }

    pub fn optional_counter(mut self, field: impl Into<String>) -> Self {
        self.fields.push((field.into(), FieldRule::OptionalCounter));
        self
    }

    pub fn optional_number(mut self, field: impl Into<String>) -> Self {
        self.fields.push((field.into(), FieldRule::OptionalNumber));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn check_point(&self, index: usize, point: &Map<String, Value>) -> Result<(), String> {
        for (field, rule) in &self.fields {
            let value = point.get(field).filter(|value| !value.is_null());
            let problem = match (rule, value) {
                (FieldRule::Text { .. }, None) | (FieldRule::Counter, None) => {
                    Some(String::from("is required"))
                }
                (FieldRule::Text { min_len }, Some(value)) => match value.as_str() {
                    Some(text) if text.chars().count() >= *min_len => None,
                    Some(_) => Some(format!("must be at least {min_len} characters")),
                    None => Some(String::from("must be a string")),
                },
                (FieldRule::Counter | FieldRule::OptionalCounter, Some(value)) => {
                    check_counter(value)
                }
                (FieldRule::OptionalNumber, Some(value)) if !value.is_number() => {
                    Some(String::from("must be a number"))
                }
                _ => None,
            };
            if let Some(problem) = problem {
                return Err(format!(
                    "{} schema: data[{index}].{field} {problem}",
                    self.name
                ));
            }
        }
        Ok(())
    }
}

fn check_counter(value: &Value) -> Option<String> {
    if value.as_u64().is_some() {
        None
    } else if value.as_i64().is_some() {
        Some(String::from("must be non-negative"))
    } else {
        Some(String::from("must be an integer"))
    }
}

impl ResponseValidator for DataSeriesValidator {
    fn validate(&self, payload: &Value) -> Result<(), String> {
        let Some(object) = payload.as_object() else {
            return Err(format!("{} schema: payload must be a JSON object", self.name));
        };

        match object.get("summaryStatistics") {
            None | Some(Value::Null) | Some(Value::Object(_)) => {}
            Some(_) => {
                return Err(format!(
                    "{} schema: summaryStatistics must be an object",
                    self.name
                ))
            }
        }

        let points = match object.get("data") {
            None | Some(Value::Null) => return Ok(()),
            Some(Value::Array(points)) => points,
            Some(_) => return Err(format!("{} schema: data must be an array", self.name)),
        };
        for (index, point) in points.iter().enumerate() {
            let Some(point) = point.as_object() else {
                return Err(format!(
                    "{} schema: data[{index}] must be an object",
                    self.name
                ));
            };
            self.check_point(index, point)?;
        }
        Ok(())
    }
}

/// Number of elements in the payload's `data` array, zero when absent.
pub fn data_point_count(payload: &Value) -> usize {
    payload
        .get("data")
        .and_then(Value::as_array)
        .map_or(0, Vec::len)
}
