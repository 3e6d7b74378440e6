use serde_json::Value;
use sha2::{Digest, Sha256};

/// Incremental SHA-256 over the prompt prefix. The digest state is cheap to
/// clone, so a breakpoint can read the hash "so far" without consuming the
/// hasher.
#[derive(Debug, Clone, Default)]
pub struct CumulativeHasher {
    digest: Sha256,
}

impl CumulativeHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, text: &str) {
        self.digest.update(text.as_bytes());
    }

    /// Hex hash of everything fed so far; the hasher keeps accumulating.
    pub fn snapshot_hex(&self) -> String {
        let clone = self.digest.clone();
        hex_lower(&clone.finalize())
    }
}

pub fn sha256_hex(text: &str) -> String {
    let mut digest = Sha256::new();
    digest.update(text.as_bytes());
    hex_lower(&digest.finalize())
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Deterministic JSON rendering: object keys recursively sorted, array order
/// preserved, scalars rendered by serde. Independent of any map-ordering
/// feature flags.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (position, key) in keys.iter().enumerate() {
                if position > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (position, item) in items.iter().enumerate() {
                if position > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_does_not_consume_state() {
        let mut hasher = CumulativeHasher::new();
        hasher.update("abc");
        let first = hasher.snapshot_hex();
        assert_eq!(first, hasher.snapshot_hex());

        hasher.update("def");
        let second = hasher.snapshot_hex();
        assert_ne!(first, second);
        assert_eq!(second, sha256_hex("abcdef"));
    }

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let value = serde_json::json!({
            "zeta": {"b": 1, "a": [ {"y": 2, "x": 1} ]},
            "alpha": true
        });
        assert_eq!(
            canonical_json(&value),
            r#"{"alpha":true,"zeta":{"a":[{"x":1,"y":2}],"b":1}}"#
        );
    }
}
