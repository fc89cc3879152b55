use super::parser::Value;

impl Value<'_> {
    /// Encodes this value as bencode. Dictionary keys are written in sorted
    /// order so equal values always produce identical bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Bytes(bytes) => encode_bytes(bytes, buf),
            Value::Integer(i) => {
                buf.push(b'i');
                buf.extend_from_slice(i.to_string().as_bytes());
                buf.push(b'e');
            }
            Value::List(items) => {
                buf.push(b'l');
                for item in items {
                    item.encode_into(buf);
                }
                buf.push(b'e');
            }
            Value::Dictionary(entries) => {
                let mut keys: Vec<&&[u8]> = entries.keys().collect();
                keys.sort();
                buf.push(b'd');
                for key in keys {
                    encode_bytes(key, buf);
                    entries[*key].encode_into(buf);
                }
                buf.push(b'e');
            }
        }
    }
}

fn encode_bytes(bytes: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(bytes.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(bytes);
}

/// Builds a dictionary value from `(key, value)` pairs.
pub fn dict<'a>(entries: impl IntoIterator<Item = (&'a str, Value<'a>)>) -> Value<'a> {
    Value::Dictionary(
        entries
            .into_iter()
            .map(|(key, value)| (key.as_bytes(), value))
            .collect(),
    )
}
