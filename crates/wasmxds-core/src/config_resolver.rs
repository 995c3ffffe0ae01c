use crate::kvstore::{KeyValueStore, StoreKind};
use crate::CoreError;
use wasmxds_schema::{ConfigValue, KeyRef};

/// Resolve a configuration value to its string form.
///
/// Absent values resolve to the empty string. An inline value is returned
/// verbatim and wins over a reference. References are looked up in the
/// config-map store first when both sub-kinds are set; a reference without
/// a namespace resolves in `namespace`, the resource's own.
pub fn resolve_config(
    store: &dyn KeyValueStore,
    namespace: &str,
    value: Option<&ConfigValue>,
) -> Result<String, CoreError> {
    let Some(value) = value else {
        return Ok(String::new());
    };
    if let Some(inline) = &value.value {
        return Ok(inline.clone());
    }
    let Some(reference) = &value.value_from else {
        return Err(CoreError::MissingConfiguration(
            "neither value nor valueFrom is set".to_owned(),
        ));
    };

    let (kind, key_ref) = match (&reference.config_map_key_ref, &reference.secret_key_ref) {
        (Some(key_ref), _) => (StoreKind::ConfigMap, key_ref),
        (None, Some(key_ref)) => (StoreKind::Secret, key_ref),
        (None, None) => {
            return Err(CoreError::MissingConfiguration(
                "valueFrom sets neither configMapKeyRef nor secretKeyRef".to_owned(),
            ))
        }
    };
    lookup(store, kind, namespace, key_ref)
}

fn lookup(
    store: &dyn KeyValueStore,
    kind: StoreKind,
    default_namespace: &str,
    key_ref: &KeyRef,
) -> Result<String, CoreError> {
    let namespace = if key_ref.namespace.is_empty() {
        default_namespace
    } else {
        &key_ref.namespace
    };
    let object = store.get(kind, namespace, &key_ref.name)?;
    let bytes = object
        .data
        .get(&key_ref.key)
        .ok_or_else(|| CoreError::KeyNotFound {
            kind,
            namespace: namespace.to_owned(),
            name: key_ref.name.clone(),
            key: key_ref.key.clone(),
        })?;
    String::from_utf8(bytes.clone()).map_err(|e| CoreError::LookupFailed {
        kind,
        namespace: namespace.to_owned(),
        name: key_ref.name.clone(),
        reason: format!("value of '{}' is not UTF-8: {e}", key_ref.key),
    })
}
