use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Error from decoding a durable payload.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// The wire document behind a durable payload.
///
/// Captures every property entry plus the declared type descriptor in one
/// self-describing unit, so a payload can be interpreted without consulting
/// anything outside the record that carries it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Qualified name of the declared schema type at encode time.
    pub type_name: String,
    /// Property entries, in the order they were encoded.
    pub entries: IndexMap<String, Value>,
}

/// Serializer-side view of a document. Borrows so that encoding a snapshot
/// does not clone every value a second time.
#[derive(Serialize)]
struct DocumentRef<'a> {
    type_name: &'a str,
    entries: &'a IndexMap<String, Value>,
}

/// Encodes property entries plus their declared type into a textual payload.
///
/// Encoding cannot fail: every `Value` has a JSON representation.
pub fn encode(entries: &IndexMap<String, Value>, type_name: &str) -> String {
    serde_json::to_string(&DocumentRef { type_name, entries })
        .expect("Value serialization should not fail")
}

/// Decodes a payload back into its document form.
pub fn decode(payload: &str) -> Result<Document, CodecError> {
    Ok(serde_json::from_str(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entries() -> IndexMap<String, Value> {
        let mut entries = IndexMap::new();
        entries.insert("length".to_string(), Value::Float(4.2));
        entries.insert("material".to_string(), Value::from("steel"));
        entries.insert(
            "tags".to_string(),
            Value::list([Value::from("inspected"), Value::from("approved")]),
        );
        entries.insert(
            "origin".to_string(),
            Value::record([("system", Value::from("scanner")), ("pass", Value::Int(2))]),
        );
        entries
    }

    #[test]
    fn roundtrip_preserves_entries_and_type() {
        let entries = sample_entries();
        let payload = encode(&entries, "Annotation.MeasuredPart");

        let doc = decode(&payload).unwrap();
        assert_eq!(doc.type_name, "Annotation.MeasuredPart");
        assert_eq!(doc.entries, entries);
    }

    #[test]
    fn roundtrip_empty_map() {
        let entries = IndexMap::new();
        let payload = encode(&entries, "Annotation");

        let doc = decode(&payload).unwrap();
        assert_eq!(doc.type_name, "Annotation");
        assert!(doc.entries.is_empty());
    }

    #[test]
    fn decode_malformed_payload() {
        assert!(matches!(
            decode("{not json"),
            Err(CodecError::Malformed(_))
        ));
        // valid JSON, wrong shape
        assert!(matches!(decode("[1, 2, 3]"), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn payload_is_textual() {
        let entries = sample_entries();
        let payload = encode(&entries, "Annotation");
        assert!(payload.contains("\"length\""));
        assert!(payload.contains("steel"));
    }

    #[test]
    fn deep_nesting_roundtrip() {
        let mut entries = IndexMap::new();
        let mut nested = Value::Int(0);
        for _ in 0..32 {
            nested = Value::record([("inner", nested)]);
        }
        entries.insert("deep".to_string(), nested);

        let payload = encode(&entries, "Annotation");
        let doc = decode(&payload).unwrap();
        assert_eq!(doc.entries, entries);
    }
}
