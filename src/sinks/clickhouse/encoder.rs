//! JSONEachRow encoding for batch bodies.

use bytes::{BufMut, Bytes, BytesMut};

use crate::event::ParsedRow;

/// Encode rows as newline-delimited JSON objects, preserving schema column
/// order.
pub(crate) fn encode_rows(rows: &[ParsedRow]) -> Bytes {
    let mut body = BytesMut::new();
    for row in rows {
        let object: serde_json::Map<String, serde_json::Value> = row
            .fields
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect();
        // Maps of JSON values serialize infallibly.
        let line = serde_json::to_vec(&object).expect("JSON object serialization cannot fail");
        body.put_slice(&line);
        body.put_u8(b'\n');
    }
    body.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Value;
    use crate::test_util::row_for;

    #[test]
    fn rows_become_newline_delimited_objects() {
        let mut first = row_for("s", 0, 10);
        first
            .fields
            .insert("user_id".to_string(), Value::Int64(7));
        first
            .fields
            .insert("note".to_string(), Value::Null);
        let second = row_for("s", 10, 20);

        let body = encode_rows(&[first, second]);
        let text = std::str::from_utf8(&body).unwrap();
        similar_asserts::assert_eq!(
            text,
            concat!(
                r#"{"message":"s:0","user_id":7,"note":null}"#,
                "\n",
                r#"{"message":"s:10"}"#,
                "\n",
            )
        );
    }

    #[test]
    fn field_order_follows_schema_order() {
        let mut row = row_for("s", 0, 10);
        row.fields.insert("z_last".to_string(), Value::Int64(1));
        row.fields.insert("a_first".to_string(), Value::Int64(2));
        let body = encode_rows(&[row]);
        let text = std::str::from_utf8(&body).unwrap();
        assert!(text.find("z_last").unwrap() < text.find("a_first").unwrap());
    }
}
