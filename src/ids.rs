//! Deterministic identifier derivation.
//!
//! Identifiers are version-5 name-based UUIDs under [`FABRIC_NAMESPACE`], so
//! the same natural key yields the same identifier on every delivery.

use uuid::Uuid;

/// Namespace for every name-based identifier this crate derives.
pub const FABRIC_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_93d7_4b58_a0e1_5c2d_8f47_b3a9);

/// Derive a name-based UUID from an arbitrary key string.
pub fn name_uuid(key: &str) -> Uuid {
    Uuid::new_v5(&FABRIC_NAMESPACE, key.as_bytes())
}

/// Derive the identifier of a tenant-owned entity.
///
/// `kind` is the natural-key prefix (`dept`, `office`, `group`, `role`), or
/// empty for users, whose key is `tenant:id`.
///
/// # Example
///
/// ```
/// use entity_fabric::ids::derive_id;
/// use uuid::Uuid;
///
/// let tenant = Uuid::nil();
/// assert_eq!(derive_id(tenant, "group", "G1"), derive_id(tenant, "group", "G1"));
/// assert_ne!(derive_id(tenant, "group", "G1"), derive_id(tenant, "role", "G1"));
/// ```
pub fn derive_id(tenant_id: Uuid, kind: &str, natural_key: &str) -> Uuid {
    if kind.is_empty() {
        name_uuid(&format!("{}:{}", tenant_id, natural_key))
    } else {
        name_uuid(&format!("{}:{}:{}", tenant_id, kind, natural_key))
    }
}

/// Type an opaque identifier received on the wire.
///
/// RFC 4122 strings are used as-is; anything else is derived from
/// `<scope>:<raw>`. A missing value yields a random identifier.
pub fn resolve_opaque_id(scope: &str, raw: Option<&str>) -> Uuid {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(value) => Uuid::parse_str(value).unwrap_or_else(|_| {
            tracing::debug!("{} id '{}' is not a UUID; deriving one", scope, value);
            name_uuid(&format!("{}:{}", scope, value))
        }),
        None => {
            tracing::warn!("No {} id on message; generating a random one", scope);
            Uuid::new_v4()
        }
    }
}
