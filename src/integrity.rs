//! Cryptographic integrity for audit events
//!
//! Canonicalizes the signed fields of an event into a deterministic byte
//! sequence and computes a SHA-256 digest over it. Verification recomputes
//! the digest, so any mutation of a signed field — reordering, added or
//! removed optional fields, changed values — is detectable.
//!
//! Stateless: called by the processor's persistence step to attach a hash
//! before write, and by external verification surfaces to re-derive it.

use crate::error::Result;
use crate::types::AuditEvent;
use sha2::{Digest, Sha256};

/// Default integrity algorithm recorded on sealed events
pub const DEFAULT_HASH_ALGORITHM: &str = "SHA-256";

/// Fields excluded from canonicalization: integrity fields themselves plus
/// volatile operational fields that may change between writes.
const EXCLUDED_FIELDS: &[&str] = &["hash", "hashAlgorithm", "processingLatency"];

/// Compute the integrity hash of an event's signed fields
///
/// Returns a lowercase hex SHA-256 digest over the canonical form.
pub fn generate_event_hash(event: &AuditEvent) -> Result<String> {
    let canonical = canonicalize(event)?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(hex::encode(digest))
}

/// Verify an event against an expected hash
///
/// Returns `true` iff the recomputed digest equals `expected_hash`
/// byte-for-byte. Verification failure is a boolean, not an error, so
/// callers can alert, quarantine, or escalate without crashing a read path.
pub fn verify_event_hash(event: &AuditEvent, expected_hash: &str) -> Result<bool> {
    let actual = generate_event_hash(event)?;
    Ok(actual == expected_hash)
}

/// Attach the integrity hash to an event
///
/// No-op when a hash is already present: redelivered events may pass
/// through the persistence step more than once, and a set hash is
/// immutable.
pub fn seal_event(mut event: AuditEvent) -> Result<AuditEvent> {
    if event.is_sealed() {
        return Ok(event);
    }
    let hash = generate_event_hash(&event)?;
    event.hash = Some(hash);
    event.hash_algorithm = Some(DEFAULT_HASH_ALGORITHM.to_string());
    Ok(event)
}

/// Canonical JSON form of the signed fields: recursively sorted keys,
/// no insignificant whitespace, excluded fields stripped at the top level.
fn canonicalize(event: &AuditEvent) -> Result<String> {
    let value = serde_json::to_value(event)?;
    let mut out = String::with_capacity(256);
    write_canonical(&value, true, &mut out);
    Ok(out)
}

fn write_canonical(value: &serde_json::Value, top_level: bool, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map
                .keys()
                .filter(|k| !(top_level && EXCLUDED_FIELDS.contains(&k.as_str())))
                .collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], false, out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, false, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataClassification, EventStatus};

    fn sample_event() -> AuditEvent {
        AuditEvent::new("2026-03-01T10:15:00Z", "fhir.patient.read", EventStatus::Success)
            .with_principal("user-42")
            .with_organization("org-1")
            .with_target("Patient", "pat-9")
            .with_classification(DataClassification::Phi)
            .with_detail("fields", serde_json::json!(["name", "dob"]))
    }

    #[test]
    fn test_hash_roundtrip() {
        let event = sample_event();
        let hash = generate_event_hash(&event).unwrap();
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert!(verify_event_hash(&event, &hash).unwrap());
    }

    #[test]
    fn test_hash_deterministic() {
        let event = sample_event();
        let h1 = generate_event_hash(&event).unwrap();
        let h2 = generate_event_hash(&event).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_detail_insertion_order_irrelevant() {
        let a = sample_event()
            .with_detail("alpha", serde_json::json!(1))
            .with_detail("beta", serde_json::json!(2));
        let mut b = sample_event()
            .with_detail("beta", serde_json::json!(2))
            .with_detail("alpha", serde_json::json!(1));
        b.id = a.id.clone();

        assert_eq!(
            generate_event_hash(&a).unwrap(),
            generate_event_hash(&b).unwrap()
        );
    }

    #[test]
    fn test_mutation_detected() {
        let event = sample_event();
        let hash = generate_event_hash(&event).unwrap();

        let mut tampered = event.clone();
        tampered.action = "fhir.patient.delete".to_string();
        assert!(!verify_event_hash(&tampered, &hash).unwrap());

        let mut tampered = event.clone();
        tampered.principal_id = Some("user-99".to_string());
        assert!(!verify_event_hash(&tampered, &hash).unwrap());

        let mut tampered = event.clone();
        tampered.details.insert("extra".to_string(), serde_json::json!(true));
        assert!(!verify_event_hash(&tampered, &hash).unwrap());

        let mut tampered = event;
        tampered.organization_id = None;
        assert!(!verify_event_hash(&tampered, &hash).unwrap());
    }

    #[test]
    fn test_seal_attaches_hash_and_algorithm() {
        let sealed = seal_event(sample_event()).unwrap();
        assert!(sealed.is_sealed());
        assert_eq!(sealed.hash_algorithm.as_deref(), Some(DEFAULT_HASH_ALGORITHM));
        assert!(verify_event_hash(&sealed, sealed.hash.as_ref().unwrap()).unwrap());
    }

    #[test]
    fn test_seal_is_idempotent() {
        let sealed = seal_event(sample_event()).unwrap();
        let original_hash = sealed.hash.clone();
        let resealed = seal_event(sealed).unwrap();
        assert_eq!(resealed.hash, original_hash);
    }

    #[test]
    fn test_integrity_fields_excluded_from_hash() {
        // The hash of a sealed event (over signed fields) must match the
        // hash computed before sealing.
        let event = sample_event();
        let before = generate_event_hash(&event).unwrap();
        let sealed = seal_event(event).unwrap();
        let after = generate_event_hash(&sealed).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_volatile_detail_key_still_signed() {
        // Exclusion applies to top-level fields only; a details entry named
        // like a volatile field remains part of the signed content.
        let event = sample_event().with_detail("processingLatency", serde_json::json!(12));
        let hash = generate_event_hash(&event).unwrap();

        let mut tampered = event;
        tampered
            .details
            .insert("processingLatency".to_string(), serde_json::json!(99));
        assert!(!verify_event_hash(&tampered, &hash).unwrap());
    }

    #[test]
    fn test_canonical_form_sorted_and_compact() {
        let event = AuditEvent::new("2026-03-01T10:15:00Z", "auth.login.attempt", EventStatus::Attempt);
        let canonical = canonicalize(&event).unwrap();
        assert!(!canonical.contains(' '));
        let action_pos = canonical.find("\"action\"").unwrap();
        let id_pos = canonical.find("\"id\"").unwrap();
        let ts_pos = canonical.find("\"timestamp\"").unwrap();
        assert!(action_pos < id_pos && id_pos < ts_pos);
    }
}
