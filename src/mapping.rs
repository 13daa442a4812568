//! Bidirectional model-identifier mapping.
//!
//! Clients speak in external ids (`gpt-3.5-turbo`), backends in internal ids
//! (`llama-3.1-instruct-13b`). The table is built once from configuration and
//! shared read-only by every request.

use std::collections::HashMap;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Default)]
pub struct ModelMapping {
    entries: Vec<(String, String)>,
    forward: HashMap<String, usize>,
    reverse: HashMap<String, usize>,
}

impl ModelMapping {
    /// Build a mapping from `(external, internal)` pairs, keeping their order.
    ///
    /// Repeating an external id with the same target is tolerated; repeating
    /// it with a different target is rejected. When several external ids map
    /// to one internal id, the first one listed is used for reverse lookups.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut mapping = Self::default();
        for (external, internal) in pairs {
            let (external, internal) = (external.into(), internal.into());
            if external.trim().is_empty() || internal.trim().is_empty() {
                return Err(GatewayError::config(format!(
                    "model mapping '{external}' = '{internal}' has an empty model id"
                )));
            }
            if let Some(&idx) = mapping.forward.get(&external) {
                if mapping.entries[idx].1 != internal {
                    return Err(GatewayError::config(format!(
                        "model '{}' is mapped to both '{}' and '{}'",
                        external, mapping.entries[idx].1, internal
                    )));
                }
                continue;
            }
            let idx = mapping.entries.len();
            mapping.forward.insert(external.clone(), idx);
            mapping.reverse.entry(internal.clone()).or_insert(idx);
            mapping.entries.push((external, internal));
        }
        Ok(mapping)
    }

    /// External id → internal id. Unknown ids pass through unchanged.
    pub fn map_forward<'a>(&'a self, external: &'a str) -> &'a str {
        self.forward
            .get(external)
            .map_or(external, |&idx| self.entries[idx].1.as_str())
    }

    /// Internal id → external id. Unknown ids pass through unchanged.
    pub fn map_reverse<'a>(&'a self, internal: &'a str) -> &'a str {
        self.reverse
            .get(internal)
            .map_or(internal, |&idx| self.entries[idx].0.as_str())
    }

    pub fn external_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(external, _)| external.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for ModelMapping {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (external, internal) in &self.entries {
            map.serialize_entry(external, internal)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ModelMapping {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct OrderedPairs;

        impl<'de> Visitor<'de> for OrderedPairs {
            type Value = Vec<(String, String)>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a table of external model id to internal model id")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut pairs = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((k, v)) = access.next_entry::<String, String>()? {
                    pairs.push((k, v));
                }
                Ok(pairs)
            }
        }

        let pairs = deserializer.deserialize_map(OrderedPairs)?;
        Self::from_pairs(pairs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ModelMapping {
        ModelMapping::from_pairs([
            ("gpt-3.5-turbo", "llama-3.1-instruct-13b"),
            ("gpt-4", "llama-3.1-instruct-13b"),
            ("gpt-4-turbo", "qwen2.5-32b-instruct"),
            ("text-embedding-ada-002", "nomic-embed-text"),
        ])
        .unwrap()
    }

    #[test]
    fn test_forward_mapping() {
        let m = sample();
        assert_eq!(m.map_forward("gpt-3.5-turbo"), "llama-3.1-instruct-13b");
        assert_eq!(m.map_forward("gpt-4"), "llama-3.1-instruct-13b");
        assert_eq!(m.map_forward("gpt-4-turbo"), "qwen2.5-32b-instruct");
    }

    #[test]
    fn test_reverse_mapping_first_external_wins() {
        let m = sample();
        assert_eq!(m.map_reverse("llama-3.1-instruct-13b"), "gpt-3.5-turbo");
        assert_eq!(m.map_reverse("qwen2.5-32b-instruct"), "gpt-4-turbo");
    }

    #[test]
    fn test_unmapped_models_pass_through() {
        let m = sample();
        assert_eq!(m.map_forward("some-random-model"), "some-random-model");
        assert_eq!(m.map_reverse("some-random-model"), "some-random-model");
    }

    #[test]
    fn test_round_trip_for_every_reverse_representative() {
        // Every external id that is the first for its internal id survives the
        // forward-then-reverse trip; later aliases collapse onto that first id.
        let m = ModelMapping::from_pairs([
            ("gpt-3.5-turbo", "llama-a"),
            ("gpt-4", "llama-b"),
            ("text-embedding-3-small", "nomic"),
        ])
        .unwrap();
        for external in m.external_ids() {
            assert_eq!(m.map_reverse(m.map_forward(external)), external);
        }
    }

    #[test]
    fn test_conflicting_duplicate_is_rejected() {
        let err = ModelMapping::from_pairs([("gpt-4", "a"), ("gpt-4", "b")]).unwrap_err();
        assert!(err.to_string().contains("gpt-4"));

        let ok = ModelMapping::from_pairs([("gpt-4", "a"), ("gpt-4", "a")]).unwrap();
        assert_eq!(ok.len(), 1);
    }

    #[test]
    fn test_empty_ids_are_rejected() {
        for pairs in [[("gpt-4", "")], [("", "llama")], [("gpt-4", "  ")]] {
            let err = ModelMapping::from_pairs(pairs).unwrap_err();
            assert!(err.to_string().contains("empty model id"));
        }

        let err = toml::from_str::<crate::config::GatewayConfig>(
            "[model_mapping]\n\"gpt-4\" = \"\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("empty model id"));
    }

    #[test]
    fn test_deserialize_preserves_document_order() {
        #[derive(Deserialize)]
        struct Wrapper {
            model_mapping: ModelMapping,
        }
        let w: Wrapper = toml::from_str(
            r#"
[model_mapping]
"zeta" = "shared"
"alpha" = "shared"
"mid" = "other"
"#,
        )
        .unwrap();
        let ids: Vec<&str> = w.model_mapping.external_ids().collect();
        assert_eq!(ids, vec!["zeta", "alpha", "mid"]);
        assert_eq!(w.model_mapping.map_reverse("shared"), "zeta");
    }
}
