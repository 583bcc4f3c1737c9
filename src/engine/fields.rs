use std::collections::HashMap;

use serde_json::Value;

use crate::request::WafRequest;

/// Scalar value a projected field can take. Absent fields are simply missing
/// from the map; the evaluator treats absence distinctly from every scalar.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Str(String),
    Num(f64),
    Bool(bool),
}

impl FieldValue {
    /// Loose string representation used for equality and membership tests.
    /// Whole numbers render without a fractional part so that the JSON value
    /// `30` and the header text `"30"` compare equal.
    pub fn as_text(&self) -> String {
        match self {
            FieldValue::Str(text) => text.clone(),
            FieldValue::Num(number) => format_number(*number),
            FieldValue::Bool(flag) => flag.to_string(),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Num(number) => Some(*number),
            FieldValue::Str(text) => text.trim().parse::<f64>().ok(),
            FieldValue::Bool(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(text) => Some(text.as_str()),
            _ => None,
        }
    }

    fn from_json(value: &Value) -> Option<FieldValue> {
        match value {
            Value::String(text) => Some(FieldValue::Str(text.clone())),
            Value::Number(number) => number.as_f64().map(FieldValue::Num),
            Value::Bool(flag) => Some(FieldValue::Bool(*flag)),
            _ => None,
        }
    }
}

pub(crate) fn format_number(number: f64) -> String {
    if number.fract() == 0.0 && number.is_finite() && number.abs() < 1e15 {
        format!("{}", number as i64)
    } else {
        number.to_string()
    }
}

/// Flat, read-only view of a request over the fixed field vocabulary.
#[derive(Debug, Default)]
pub struct FieldMap {
    values: HashMap<String, FieldValue>,
}

impl FieldMap {
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.values.get(field)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn insert(&mut self, key: impl Into<String>, value: FieldValue) {
        self.values.insert(key.into(), value);
    }
}

const META_PREFIX: &str = "request.cf.";
const THREAT_SCORE_FIELD: &str = "request.cf.threatScore";

const DERIVED_FIELDS: &[&str] = &[
    "derived.uri.path",
    "derived.uri.query.string",
    "derived.uri.query.param_count",
    "derived.body.has_body",
];

/// Whether a dotted name belongs to the closed field vocabulary. Predicates
/// over unknown names are rejected at rule-creation time; anything already
/// stored simply evaluates as absent.
pub fn is_known_field(name: &str) -> bool {
    matches!(name, "request.method" | "request.url")
        || DERIVED_FIELDS.contains(&name)
        || name
            .strip_prefix("request.headers.")
            .is_some_and(|rest| !rest.is_empty())
        || name
            .strip_prefix(META_PREFIX)
            .is_some_and(|rest| !rest.is_empty())
}

/// Flattens a request into the dotted field map the predicate evaluator
/// consumes. Pure; performs no I/O.
pub fn project(request: &WafRequest) -> FieldMap {
    let mut fields = FieldMap::default();

    fields.insert("request.method", FieldValue::Str(request.method.to_string()));
    fields.insert(
        "request.url",
        FieldValue::Str(format!("http://{}{}", request.host, request.target)),
    );

    for (name, value) in &request.headers {
        fields.insert(
            format!("request.headers.{name}"),
            FieldValue::Str(value.clone()),
        );
    }

    fields.insert(
        "derived.uri.path",
        FieldValue::Str(request.path().to_string()),
    );
    let query = request.query().unwrap_or("");
    fields.insert(
        "derived.uri.query.string",
        FieldValue::Str(query.to_string()),
    );
    let param_count = query.split('&').filter(|pair| !pair.is_empty()).count();
    fields.insert(
        "derived.uri.query.param_count",
        FieldValue::Num(param_count as f64),
    );

    let has_body = request.content_length.map(|len| len > 0).unwrap_or(false) || request.chunked;
    fields.insert("derived.body.has_body", FieldValue::Bool(has_body));

    for (key, value) in &request.meta {
        flatten_meta(&mut fields, key, value);
    }

    // An edge that omits the threat score still gets a comparable zero.
    if fields.get(THREAT_SCORE_FIELD).is_none() {
        fields.insert(THREAT_SCORE_FIELD, FieldValue::Num(0.0));
    }

    fields
}

fn flatten_meta(fields: &mut FieldMap, path: &str, value: &Value) {
    match value {
        Value::Object(members) => {
            for (key, nested) in members {
                flatten_meta(fields, &format!("{path}.{key}"), nested);
            }
        }
        other => {
            if let Some(scalar) = FieldValue::from_json(other) {
                fields.insert(format!("{META_PREFIX}{path}"), scalar);
            }
        }
    }
}
