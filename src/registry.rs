//! Asset Registry (C1): immutable process-wide name ⇄ id mapping, and the
//! polymorphic subscription-payload resolver downstream clients rely on.

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::config::AssetRow;
use crate::error::SessionError;

/// Resolved asset, returned by [`AssetRegistry::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAsset {
    pub id: u32,
    pub name: String,
}

/// Immutable name → id table built at process start. Never mutated after
/// construction, so `&AssetRegistry` is safely shared across every session
/// without synchronization.
#[derive(Debug)]
pub struct AssetRegistry {
    by_name: FxHashMap<String, u32>,
    by_id: FxHashMap<u32, String>,
}

impl AssetRegistry {
    pub fn new(rows: &[AssetRow]) -> Self {
        let mut by_name = FxHashMap::default();
        let mut by_id = FxHashMap::default();
        for row in rows {
            by_name.insert(row.name.clone(), row.id);
            by_id.insert(row.id, row.name.clone());
        }
        Self { by_name, by_id }
    }

    pub fn id_for_name(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    pub fn name_for_id(&self, id: u32) -> Option<&str> {
        self.by_id.get(&id).map(|s| s.as_str())
    }

    /// Resolve a polymorphic downstream subscription payload to an id +
    /// textual name pair. Accepts a bare string, a bare integer, or a
    /// structured value carrying one of the recognized keys, since downstream
    /// clients from multiple app versions emit different shapes for the
    /// same intent.
    pub fn resolve(&self, payload: &Value) -> Result<ResolvedAsset, SessionError> {
        match payload {
            Value::String(name) => self.resolve_name(name),
            Value::Number(n) => {
                let id = n
                    .as_u64()
                    .ok_or_else(|| SessionError::UnknownAsset(payload.to_string()))?
                    as u32;
                self.resolve_id(id)
            }
            Value::Object(_) => {
                for key in ["active", "name", "id"] {
                    if let Some(v) = payload.get(key) {
                        return self.resolve(v);
                    }
                }
                if let Some(nested) = payload.pointer("/msg/name") {
                    return self.resolve(nested);
                }
                if let Some(nested) = payload.get("payload") {
                    return self.resolve(nested);
                }
                Err(SessionError::UnknownAsset(payload.to_string()))
            }
            _ => Err(SessionError::UnknownAsset(payload.to_string())),
        }
    }

    fn resolve_name(&self, name: &str) -> Result<ResolvedAsset, SessionError> {
        self.id_for_name(name)
            .map(|id| ResolvedAsset {
                id,
                name: name.to_string(),
            })
            .ok_or_else(|| SessionError::UnknownAsset(name.to_string()))
    }

    fn resolve_id(&self, id: u32) -> Result<ResolvedAsset, SessionError> {
        // Integers are treated as ids directly; the
        // textual name is filled in when known, else left as the numeric
        // string so callers always have something to echo back.
        let name = self
            .name_for_id(id)
            .map(|s| s.to_string())
            .unwrap_or_else(|| id.to_string());
        Ok(ResolvedAsset { id, name })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> AssetRegistry {
        AssetRegistry::new(&[
            AssetRow {
                name: "EURUSD-OTC".to_string(),
                id: 76,
            },
            AssetRow {
                name: "GBPUSD-OTC".to_string(),
                id: 77,
            },
        ])
    }

    #[test]
    fn resolves_bare_string() {
        let r = registry();
        let resolved = r.resolve(&json!("EURUSD-OTC")).unwrap();
        assert_eq!(resolved.id, 76);
    }

    #[test]
    fn resolves_bare_integer_as_id() {
        let r = registry();
        let resolved = r.resolve(&json!(77)).unwrap();
        assert_eq!(resolved.name, "GBPUSD-OTC");
    }

    #[test]
    fn resolves_structured_active_key() {
        let r = registry();
        let resolved = r.resolve(&json!({"active": "EURUSD-OTC"})).unwrap();
        assert_eq!(resolved.id, 76);
    }

    #[test]
    fn resolves_nested_msg_name() {
        let r = registry();
        let resolved = r
            .resolve(&json!({"msg": {"name": "GBPUSD-OTC"}}))
            .unwrap();
        assert_eq!(resolved.id, 77);
    }

    #[test]
    fn unknown_name_is_an_error() {
        let r = registry();
        let err = r.resolve(&json!("ZZZ-OTC")).unwrap_err();
        assert_eq!(err.to_string(), "Ativo desconhecido: ZZZ-OTC");
    }

    #[test]
    fn resolution_is_pure_and_repeatable() {
        let r = registry();
        let a = r.resolve(&json!("EURUSD-OTC")).unwrap();
        let b = r.resolve(&json!("EURUSD-OTC")).unwrap();
        assert_eq!(a, b);
    }
}
