use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

/// Label extracted from one model completion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stimulus {
    pub source: String,
    pub proportion: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// Result of decoding a model completion. `None` is the sentinel
/// `{"source": "none", "proportion": "none", "location": "none"}`.
#[derive(Debug, Clone, PartialEq)]
pub enum Annotation {
    Stimulus(Stimulus),
    None,
}

impl Annotation {
    pub fn is_none(&self) -> bool { matches!(self, Annotation::None) }

    pub fn stimulus(&self) -> Option<&Stimulus> {
        match self {
            Annotation::Stimulus(s) => Some(s),
            Annotation::None => None,
        }
    }

    /// Reads `source` and `proportion` out of a decoded object. Anything that
    /// does not carry a usable source string and a finite numeric proportion
    /// collapses to the sentinel.
    pub fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else { return Annotation::None; };
        let source = match obj.get("source").and_then(Value::as_str) {
            Some(s) if !s.trim().is_empty() && s != "none" => s.trim().to_string(),
            _ => return Annotation::None,
        };
        let proportion = match obj.get("proportion") {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        let Some(proportion) = proportion.filter(|p| p.is_finite()) else { return Annotation::None; };
        let location = obj
            .get("location")
            .and_then(Value::as_str)
            .filter(|l| *l != "none")
            .map(str::to_string);
        Annotation::Stimulus(Stimulus { source, proportion, location })
    }
}

impl Serialize for Annotation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Annotation::Stimulus(s) => s.serialize(serializer),
            Annotation::None => json!({"source": "none", "proportion": "none", "location": "none"}).serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Annotation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Annotation::from_value(&value))
    }
}

/// Locates the first `{ ... }` span in `text`: the first opening brace up to
/// the first closing brace after it. Nested objects are not balanced.
pub fn object_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text[start..].find('}')? + start;
    Some(&text[start..=end])
}

/// Decodes the embedded object literal in the first completion string.
/// Never fails: missing text, no braces and undecodable spans all yield
/// [`Annotation::None`].
pub fn parse(raw_output: &[String]) -> Annotation {
    let Some(first) = raw_output.first() else { return Annotation::None; };
    let Some(span) = object_span(first) else { return Annotation::None; };
    match serde_json::from_str::<Value>(span) {
        Ok(value) => Annotation::from_value(&value),
        Err(e) => {
            tracing::debug!(error = %e, text = span, "embedded object did not decode");
            Annotation::None
        }
    }
}
