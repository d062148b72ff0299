//! The `Secret` entity: identity, lifecycle timestamps, opaque payload and
//! the password verifier.
//!
//! The payload is client-side ciphertext and is never interpreted here. The
//! verifier is a bcrypt hash of the key material (server secret followed by
//! the client password), so the server can gate access without ever storing
//! something that decrypts the payload.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::errors::SecretError;

/// `expire_date` value marking a one-time secret.
pub const ONE_TIME: i64 = -1;

/// Hard retention ceiling applied to every secret, one-time or not.
pub const MAX_RETENTION_SECS: i64 = 30 * 86_400;

/// Length of a rendered identifier (20 random bytes as hex).
pub const ID_LEN: usize = 40;

/// bcrypt work factor used when the configuration does not override it.
pub const DEFAULT_COST: u32 = 12;

/// Closed set of lifetimes a client may pick from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    OneHour,
    OneDay,
    OneWeek,
    OneTime,
}

impl Expiration {
    /// Map a client label to a lifetime. Unknown labels, including the empty
    /// string, fall back to one-time use.
    pub fn from_label(label: &str) -> Self {
        match label {
            "1 hour" => Expiration::OneHour,
            "1 day" => Expiration::OneDay,
            "1 week" => Expiration::OneWeek,
            _ => Expiration::OneTime,
        }
    }

    /// Seconds added to the creation instant, or `None` for one-time use.
    pub fn seconds(self) -> Option<i64> {
        match self {
            Expiration::OneHour => Some(3_600),
            Expiration::OneDay => Some(86_400),
            Expiration::OneWeek => Some(604_800),
            Expiration::OneTime => None,
        }
    }
}

/// Persisted record. Serializes to exactly the five fields below; any other
/// shape is rejected on load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Secret {
    pub id: String,
    pub create_date: i64,
    pub expire_date: i64,
    pub data: String,
    pub hash: String,
}

impl Secret {
    /// Assign a fresh random identifier. Returns `false` without touching the
    /// secret when an identifier is already present.
    pub fn new_id(&mut self) -> bool {
        if !self.id.is_empty() {
            return false;
        }
        let mut bytes = [0u8; ID_LEN / 2];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        self.id = hex::encode(bytes);
        true
    }

    /// Build a complete secret in one step. See [`Secret::create`].
    pub fn new(
        label: &str,
        key_material: &[u8],
        payload: impl Into<String>,
        cost: u32,
    ) -> Result<Self, SecretError> {
        let mut secret = Secret::default();
        secret.create(label, key_material, payload, cost)?;
        Ok(secret)
    }

    /// Populate a blank secret: id, creation time, expiry, verifier and payload.
    ///
    /// Only valid on a fresh instance; a secret that already carries an id is
    /// left untouched.
    pub fn create(
        &mut self,
        label: &str,
        key_material: &[u8],
        payload: impl Into<String>,
        cost: u32,
    ) -> Result<(), SecretError> {
        if !self.id.is_empty() {
            return Err(SecretError::AlreadyCreated);
        }
        // Hash first so a bad cost leaves the instance blank.
        let hash = bcrypt::hash(key_material, cost)?;
        let created = now();
        self.new_id();
        self.create_date = created;
        self.expire_date = expire_date_for(label, created);
        self.hash = hash;
        self.data = payload.into();
        Ok(())
    }

    /// Set `expire_date` relative to the current time from a client label.
    pub fn set_expiration(&mut self, label: &str) {
        self.expire_date = expire_date_for(label, now());
    }

    pub fn is_valid_id(&self) -> bool {
        is_valid_id(&self.id)
    }

    pub fn is_one_time(&self) -> bool {
        self.expire_date == ONE_TIME
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now())
    }

    /// Expiry predicate evaluated against an explicit instant.
    pub fn is_expired_at(&self, now: i64) -> bool {
        is_expired(self.create_date, self.expire_date, now)
    }

    /// Replace the verifier with a freshly salted hash of `key_material`.
    pub fn set_password(
        &mut self,
        key_material: &[u8],
        cost: u32,
    ) -> Result<(), SecretError> {
        self.hash = bcrypt::hash(key_material, cost)?;
        Ok(())
    }

    /// Verify `key_material` against the stored hash. Fails closed: a missing
    /// or unparseable verifier yields `false`.
    pub fn check_password(&self, key_material: &[u8]) -> bool {
        if self.hash.is_empty() {
            return false;
        }
        bcrypt::verify(key_material, &self.hash).unwrap_or(false)
    }

    /// Load a persisted record from a JSON value.
    pub fn load_from_mapping(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Load a persisted record from raw JSON bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Absolute expiry for `label` counted from `base`.
pub fn expire_date_for(label: &str, base: i64) -> i64 {
    match Expiration::from_label(label).seconds() {
        Some(secs) => base + secs,
        None => ONE_TIME,
    }
}

/// Shape check for identifiers coming from outside: 40 hex characters.
pub fn is_valid_id(id: &str) -> bool {
    id.len() == ID_LEN && id.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Expiry rule shared by full records and metadata-only lookups.
pub fn is_expired(create_date: i64, expire_date: i64, now: i64) -> bool {
    // Saturates on hostile dates: a record created at i64::MIN is past the ceiling.
    if now.saturating_sub(create_date) >= MAX_RETENTION_SECS {
        return true;
    }
    expire_date != ONE_TIME && now >= expire_date
}

/// Combine the server-wide secret and the client password, in that order.
/// The result is hashing input only and is wiped on drop.
pub fn derive_key_material(password: &str, server_secret: &str) -> Zeroizing<Vec<u8>> {
    let mut material = Vec::with_capacity(server_secret.len() + password.len());
    material.extend_from_slice(server_secret.as_bytes());
    material.extend_from_slice(password.as_bytes());
    Zeroizing::new(material)
}

/// Current Unix time in seconds.
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const COST: u32 = 4;

    fn sample() -> Secret {
        let key = derive_key_material("p1", "server-key");
        Secret::new("1 hour", &key, "CIPHERTEXT", COST).unwrap()
    }

    #[test]
    fn test_expiration_labels() {
        for (label, secs) in [("1 hour", 3_600), ("1 day", 86_400), ("1 week", 604_800)] {
            assert_eq!(expire_date_for(label, 1_000), 1_000 + secs, "{label}");
            let key = derive_key_material("pw", "k");
            let s = Secret::new(label, &key, "x", COST).unwrap();
            assert_eq!(s.expire_date, s.create_date + secs);
        }
        for label in ["", "2 hours", "1 HOUR", "forever"] {
            let mut s = Secret::default();
            s.set_expiration(label);
            assert_eq!(s.expire_date, ONE_TIME, "label {label:?}");
            assert!(s.is_one_time());
        }
    }

    #[test]
    fn test_create_populates_every_field() {
        let before = now();
        let s = sample();
        assert!(s.is_valid_id());
        assert!(s.id.bytes().all(|b| !b.is_ascii_uppercase()));
        assert!(s.create_date >= before && s.create_date <= now());
        assert_eq!(s.expire_date, s.create_date + 3_600);
        assert_eq!(s.data, "CIPHERTEXT");
        assert!(s.hash.starts_with("$2"));
        assert!(!s.is_one_time());
    }

    #[test]
    fn test_create_twice_is_rejected() {
        let mut s = sample();
        let id = s.id.clone();
        let key = derive_key_material("p2", "server-key");
        assert!(matches!(
            s.create("1 day", &key, "OTHER", COST),
            Err(SecretError::AlreadyCreated)
        ));
        assert_eq!(s.id, id);
        assert_eq!(s.data, "CIPHERTEXT");
    }

    #[test]
    fn test_new_id_is_immutable() {
        let mut s = Secret::default();
        assert!(s.new_id());
        let first = s.id.clone();
        assert!(!s.new_id());
        assert_eq!(s.id, first);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = sample();
        let b = sample();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_id_validation() {
        assert!(is_valid_id(&"a".repeat(40)));
        assert!(is_valid_id("0123456789abcdef0123456789abcdef01234567"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id(&"a".repeat(39)));
        assert!(!is_valid_id(&"a".repeat(41)));
        assert!(!is_valid_id(&"g".repeat(40)));
        assert!(!is_valid_id("../../../../../../../../../../etc/passwd"));
        assert!(!Secret::default().is_valid_id());
    }

    #[test]
    fn test_expiry_of_timed_secret() {
        let s = Secret {
            create_date: 1_000,
            expire_date: 4_600,
            ..Default::default()
        };
        assert!(!s.is_expired_at(1_000));
        assert!(!s.is_expired_at(4_599));
        assert!(s.is_expired_at(4_600));
    }

    #[test]
    fn test_expiry_of_one_time_secret() {
        let s = Secret {
            create_date: 1_000,
            expire_date: ONE_TIME,
            ..Default::default()
        };
        assert!(!s.is_expired_at(1_000));
        assert!(!s.is_expired_at(1_000 + MAX_RETENTION_SECS - 1));
        assert!(s.is_expired_at(1_000 + MAX_RETENTION_SECS));
    }

    #[test]
    fn test_retention_ceiling_applies_to_timed_secrets() {
        let s = Secret {
            create_date: 0,
            expire_date: 10 * MAX_RETENTION_SECS,
            ..Default::default()
        };
        assert!(!s.is_expired_at(MAX_RETENTION_SECS - 1));
        assert!(s.is_expired_at(MAX_RETENTION_SECS));
    }

    #[test]
    fn test_password_check() {
        let s = sample();
        assert!(s.check_password(&derive_key_material("p1", "server-key")));
        assert!(!s.check_password(&derive_key_material("wrong", "server-key")));
        assert!(!s.check_password(&derive_key_material("p1", "other-key")));
    }

    #[test]
    fn test_password_check_fails_closed() {
        let key = derive_key_material("p1", "server-key");
        let mut s = sample();
        s.hash.clear();
        assert!(!s.check_password(&key));
        s.hash = "not-a-bcrypt-hash".to_string();
        assert!(!s.check_password(&key));
    }

    #[test]
    fn test_set_password_replaces_verifier() {
        let mut s = sample();
        s.set_password(&derive_key_material("p2", "server-key"), COST)
            .unwrap();
        assert!(!s.check_password(&derive_key_material("p1", "server-key")));
        assert!(s.check_password(&derive_key_material("p2", "server-key")));
    }

    #[test]
    fn test_key_material_order() {
        assert_eq!(&derive_key_material("pw", "key")[..], b"keypw");
    }

    #[test]
    fn test_load_from_mapping() {
        let s = sample();
        let value = serde_json::to_value(&s).unwrap();
        assert_eq!(value.as_object().unwrap().len(), 5);
        let loaded = Secret::load_from_mapping(value).unwrap();
        assert_eq!(loaded, s);
        assert!(loaded.check_password(&derive_key_material("p1", "server-key")));
    }

    #[test]
    fn test_load_rejects_missing_field() {
        let full = serde_json::to_value(sample()).unwrap();
        for field in ["id", "create_date", "expire_date", "data", "hash"] {
            let mut partial = full.clone();
            partial.as_object_mut().unwrap().remove(field);
            assert!(
                Secret::load_from_mapping(partial).is_err(),
                "missing {field} should be rejected"
            );
        }
    }

    #[test]
    fn test_load_rejects_extra_field() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["owner"] = json!("mallory");
        assert!(Secret::load_from_mapping(value).is_err());
    }

    #[test]
    fn test_extreme_dates_do_not_overflow() {
        let now = now();
        assert!(is_expired(i64::MIN, ONE_TIME, now));
        assert!(is_expired(i64::MIN, i64::MAX, now));
        assert!(!is_expired(i64::MAX, ONE_TIME, now));
        assert!(is_expired(i64::MAX, i64::MIN, now));
    }
}
