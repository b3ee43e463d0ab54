use k8s_openapi::api::core::v1::Secret;
use sha2::{Digest, Sha256};

/// Annotation carrying the content hash of the mounted TLS material. A change
/// in the referenced secret changes the hash, which rolls the pods so they
/// remount the new certificates.
pub const TLS_HASH_ANNOTATION: &str = "vertica.com/tls-secret-hash";

/// Annotation carrying the previous hash during a CA rollover, so both the
/// old and the new trust anchors stay mounted until the rotation completes.
pub const TLS_PREVIOUS_HASH_ANNOTATION: &str = "vertica.com/tls-secret-hash-previous";

/// Stable content hash over the secret's data, independent of key order.
pub fn secret_data_hash(secret: &Secret) -> String {
    let mut hasher = Sha256::new();
    if let Some(data) = &secret.data {
        // BTreeMap iteration is ordered, so the digest is deterministic
        for (key, value) in data {
            hasher.update(key.as_bytes());
            hasher.update(&value.0);
        }
    }
    format!("{:x}", hasher.finalize())
}

/// Whether the pods have to be rolled to pick up new TLS material: the
/// observed hash differs from the one stamped on the pod template.
pub fn needs_remount(current_annotation: Option<&String>, observed_hash: &str) -> bool {
    current_annotation.map(String::as_str) != Some(observed_hash)
}

#[cfg(test)]
mod test {
    use super::{needs_remount, secret_data_hash};
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn secret_with(data: &[(&str, &str)]) -> Secret {
        Secret {
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn test_hash_stable_for_same_content() {
        let a = secret_with(&[("tls.crt", "cert"), ("tls.key", "key")]);
        let b = secret_with(&[("tls.key", "key"), ("tls.crt", "cert")]);
        assert_eq!(secret_data_hash(&a), secret_data_hash(&b));
    }

    #[test]
    fn test_hash_changes_on_rotation() {
        let a = secret_with(&[("tls.crt", "cert"), ("tls.key", "key")]);
        let b = secret_with(&[("tls.crt", "cert2"), ("tls.key", "key2")]);
        assert_ne!(secret_data_hash(&a), secret_data_hash(&b));
    }

    #[test]
    fn test_needs_remount() {
        let hash = secret_data_hash(&secret_with(&[("tls.crt", "cert")]));
        assert!(needs_remount(None, &hash));
        assert!(needs_remount(Some(&"stale".to_string()), &hash));
        assert!(!needs_remount(Some(&hash), &hash));
    }
}
