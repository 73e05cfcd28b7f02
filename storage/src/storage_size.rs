//! Canonical storage size of a row document.
//!
//! The size mirrors the byte layout the document driver uses on disk: a
//! document costs a 4-byte length prefix plus one terminator, each element
//! costs a type byte, its NUL-terminated key and its payload. Integers that
//! fit 32 bits are stored narrow.

use serde_json::Value;

const DOCUMENT_OVERHEAD: u64 = 4 + 1;
const ELEMENT_OVERHEAD: u64 = 1 + 1;
const STRING_OVERHEAD: u64 = 4 + 1;

/// The canonical storage size of a value, in bytes.
///
/// `size = canonical_storage_size(value)` is stamped into the service
/// header at the moment of every write and drives storage billing.
pub fn canonical_storage_size(value: &Value) -> u64 {
    match value {
        Value::Object(map) => {
            let elements: u64 = map
                .iter()
                .map(|(key, element)| {
                    ELEMENT_OVERHEAD + key.len() as u64 + canonical_storage_size(element)
                })
                .sum();
            DOCUMENT_OVERHEAD + elements
        }
        Value::Array(items) => {
            let elements: u64 = items
                .iter()
                .enumerate()
                .map(|(position, element)| {
                    let key_len = decimal_digits(position as u64);
                    ELEMENT_OVERHEAD + key_len + canonical_storage_size(element)
                })
                .sum();
            DOCUMENT_OVERHEAD + elements
        }
        Value::String(text) => STRING_OVERHEAD + text.len() as u64,
        Value::Number(number) => {
            let narrow = number
                .as_i64()
                .map(|raw| i32::try_from(raw).is_ok())
                .unwrap_or(false);
            if narrow {
                4
            } else {
                8
            }
        }
        Value::Bool(_) => 1,
        Value::Null => 0,
    }
}

fn decimal_digits(mut position: u64) -> u64 {
    let mut digits = 1;
    while position >= 10 {
        digits += 1;
        position /= 10;
    }
    digits
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::canonical_storage_size;

    #[test]
    fn small_document() {
        // 4 (length) + 1 (type) + 2 ("x\0") + 4 (int32) + 1 (terminator)
        assert_eq!(canonical_storage_size(&json!({"x": 1})), 12);
    }

    #[test]
    fn wide_integers_cost_eight_bytes() {
        assert_eq!(canonical_storage_size(&json!({"x": 1_i64 << 40})), 16);
        assert_eq!(canonical_storage_size(&json!({"x": 1.5})), 16);
    }

    #[test]
    fn strings_carry_length_prefix_and_terminator() {
        // 4 + 1 + 2 + (4 + 3 + 1) + 1
        assert_eq!(canonical_storage_size(&json!({"s": "abc"})), 16);
    }

    #[test]
    fn arrays_are_documents_with_decimal_keys() {
        // 4 + 1 + 2 + [4 + (2+1+4)*2 + 1] + 1
        assert_eq!(canonical_storage_size(&json!({"a": [1, 2]})), 27);
    }

    #[test]
    fn null_and_bool_payloads() {
        assert_eq!(canonical_storage_size(&json!({"n": null})), 8);
        assert_eq!(canonical_storage_size(&json!({"b": true})), 9);
    }
}
