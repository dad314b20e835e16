//! YAML fragment merging (§6, `include_path`) and the small
//! `serde_yaml` -> `serde_json` bridge the source/output descriptors
//! use to carry plug-in-specific fields (§3a).

use serde_yaml::Value;

/// Merges `incoming` into `base` in place: per-key union for mappings,
/// concatenation for sequences, override for scalars.
pub fn merge_yaml(base: &mut Value, incoming: Value) {
    match (base, incoming) {
        (Value::Mapping(base_map), Value::Mapping(incoming_map)) => {
            for (k, v) in incoming_map {
                match base_map.get_mut(&k) {
                    Some(existing) => merge_yaml(existing, v),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (Value::Sequence(base_seq), Value::Sequence(mut incoming_seq)) => {
            base_seq.append(&mut incoming_seq);
        }
        (base_slot, incoming_value) => {
            *base_slot = incoming_value;
        }
    }
}

/// Converts a `serde_yaml::Value` to the equivalent `serde_json::Value`.
/// Used to carry plug-in-specific config fields (which arrive as
/// arbitrary YAML) through to source/output factories as JSON, the
/// format `agent-core`'s `SourceDescriptor::params` and the output
/// registry's `build_output` expect.
pub fn yaml_to_json(value: Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                serde_json::Value::Number(i.into())
            } else if let Some(u) = n.as_u64() {
                serde_json::Value::Number(u.into())
            } else {
                serde_json::Number::from_f64(n.as_f64().unwrap_or(0.0))
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null)
            }
        }
        Value::String(s) => serde_json::Value::String(s),
        Value::Sequence(seq) => serde_json::Value::Array(seq.into_iter().map(yaml_to_json).collect()),
        Value::Mapping(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                let key = match k {
                    Value::String(s) => s,
                    other => yaml_to_json(other).to_string(),
                };
                out.insert(key, yaml_to_json(v));
            }
            serde_json::Value::Object(out)
        }
        Value::Tagged(tagged) => yaml_to_json(tagged.value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn scalar_keys_union_without_colliding() {
        let mut base = yaml("a: 1\nb: 2\n");
        let incoming = yaml("c: 3\n");
        merge_yaml(&mut base, incoming);
        assert_eq!(base, yaml("a: 1\nb: 2\nc: 3\n"));
    }

    #[test]
    fn nested_mappings_union_per_key() {
        let mut base = yaml("outer:\n  a: 1\n  b: 2\n");
        let incoming = yaml("outer:\n  b: 20\n  c: 3\n");
        merge_yaml(&mut base, incoming);
        assert_eq!(base, yaml("outer:\n  a: 1\n  b: 20\n  c: 3\n"));
    }

    #[test]
    fn sequences_concatenate() {
        let mut base = yaml("sources:\n  - a\n  - b\n");
        let incoming = yaml("sources:\n  - c\n");
        merge_yaml(&mut base, incoming);
        assert_eq!(base, yaml("sources:\n  - a\n  - b\n  - c\n"));
    }

    #[test]
    fn scalars_override() {
        let mut base = yaml("ttl: 60\n");
        let incoming = yaml("ttl: 120\n");
        merge_yaml(&mut base, incoming);
        assert_eq!(base, yaml("ttl: 120\n"));
    }

    #[test]
    fn yaml_to_json_roundtrips_basic_shapes() {
        let v = yaml("a: 1\nb: [1, 2, \"x\"]\nc:\n  d: true\n");
        let json = yaml_to_json(v);
        assert_eq!(json["a"], serde_json::json!(1));
        assert_eq!(json["b"], serde_json::json!([1, 2, "x"]));
        assert_eq!(json["c"]["d"], serde_json::json!(true));
    }
}
