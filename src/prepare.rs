//! # Write Preparation
//!
//! Turns a requested mutation into a self-contained, content-addressed
//! [`PreparedWrite`]. Preparation is pure: no I/O and no access to the
//! repository head. Whether an update or delete actually matches a live
//! record is decided later, inside the repository's critical section.
//!
//! ## Steps
//!
//! ```text
//! WriteOp ──► validate ids ──► normalize record ($type) ──► shape checks
//!                                                               │
//!          PreparedWrite ◄── cid ◄── canonical bytes ◄── schema check
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec::canonical_json;
use crate::error::{Error, Result};
use crate::types::{AtUri, Cid, Did, Nsid, RecordKey, TidClock};

/// Deepest nesting accepted inside a record.
pub const MAX_RECORD_DEPTH: usize = 32;

/// Field naming the record's collection.
const TYPE_FIELD: &str = "$type";

// =============================================================================
// Requests
// =============================================================================

/// A swap-record precondition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSwap {
    /// The record must not exist.
    MustBeAbsent,
    /// The record must currently have exactly this cid.
    MustMatch(Cid),
}

impl RecordSwap {
    /// Maps the wire shape (`null` vs a cid) to a precondition.
    pub fn from_expected(expected: Option<Cid>) -> Self {
        match expected {
            Some(cid) => RecordSwap::MustMatch(cid),
            None => RecordSwap::MustBeAbsent,
        }
    }

    /// Checks the precondition against the record's current cid.
    pub fn check(&self, uri: &AtUri, current: Option<Cid>) -> Result<()> {
        let expected = match self {
            RecordSwap::MustBeAbsent => None,
            RecordSwap::MustMatch(cid) => Some(*cid),
        };
        if expected == current {
            Ok(())
        } else {
            Err(Error::BadRecordSwap {
                uri: uri.to_string(),
                expected: expected.map(|c| c.to_string()),
                actual: current.map(|c| c.to_string()),
            })
        }
    }
}

/// One requested mutation, as received from a caller.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Create {
        collection: String,
        rkey: Option<String>,
        record: Value,
    },
    Update {
        collection: String,
        rkey: String,
        record: Value,
        swap_record: Option<RecordSwap>,
    },
    Delete {
        collection: String,
        rkey: String,
        swap_record: Option<RecordSwap>,
    },
}

// =============================================================================
// Prepared Writes
// =============================================================================

/// The kind of a write, also used in commit event ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteAction {
    Create,
    Update,
    Delete,
}

impl WriteAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteAction::Create => "create",
            WriteAction::Update => "update",
            WriteAction::Delete => "delete",
        }
    }
}

/// Outcome of schema validation reported back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    /// A schema for the collection accepted the record.
    Valid,
    /// No schema was consulted (unknown collection or validation skipped).
    Unknown,
}

/// A create or update with its payload already encoded and hashed.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRecord {
    pub uri: AtUri,
    pub cid: Cid,
    pub record: Value,
    /// Canonical encoding of `record`; `cid` is its hash.
    pub bytes: Vec<u8>,
    pub swap: Option<RecordSwap>,
    pub validation: ValidationStatus,
}

/// A delete.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedDelete {
    pub uri: AtUri,
    pub swap: Option<RecordSwap>,
}

/// One validated mutation.
///
/// # Rust Pattern: Closed Tagged Variant
///
/// Every write shape (single create, put, delete, batch entry) is lowered to
/// this enum, and the coordinator has exactly one `apply` path for all of
/// them.
#[derive(Debug, Clone, PartialEq)]
pub enum PreparedWrite {
    Create(PreparedRecord),
    Update(PreparedRecord),
    Delete(PreparedDelete),
}

impl PreparedWrite {
    pub fn action(&self) -> WriteAction {
        match self {
            PreparedWrite::Create(_) => WriteAction::Create,
            PreparedWrite::Update(_) => WriteAction::Update,
            PreparedWrite::Delete(_) => WriteAction::Delete,
        }
    }

    pub fn uri(&self) -> &AtUri {
        match self {
            PreparedWrite::Create(r) | PreparedWrite::Update(r) => &r.uri,
            PreparedWrite::Delete(d) => &d.uri,
        }
    }

    pub fn swap(&self) -> Option<RecordSwap> {
        match self {
            PreparedWrite::Create(r) | PreparedWrite::Update(r) => r.swap,
            PreparedWrite::Delete(d) => d.swap,
        }
    }

    /// The cid the write stores, `None` for deletes.
    pub fn cid(&self) -> Option<Cid> {
        match self {
            PreparedWrite::Create(r) | PreparedWrite::Update(r) => Some(r.cid),
            PreparedWrite::Delete(_) => None,
        }
    }
}

// =============================================================================
// Schema Validation Hook
// =============================================================================

/// Result of consulting a record schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaCheck {
    Valid,
    Invalid(String),
    /// No schema is known for the collection.
    Unknown,
}

/// Pluggable per-collection schema validation.
pub trait RecordValidator: Send + Sync + 'static {
    fn check(&self, collection: &Nsid, record: &Map<String, Value>) -> SchemaCheck;
}

/// A validator that knows no schemas.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSchemas;

impl RecordValidator for NoSchemas {
    fn check(&self, _collection: &Nsid, _record: &Map<String, Value>) -> SchemaCheck {
        SchemaCheck::Unknown
    }
}

// =============================================================================
// Preparer
// =============================================================================

/// Validates and normalizes requested mutations.
#[derive(Clone)]
pub struct WritePreparer {
    clock: Arc<TidClock>,
    validator: Arc<dyn RecordValidator>,
    max_record_bytes: usize,
}

impl WritePreparer {
    pub fn new(
        clock: Arc<TidClock>,
        validator: Arc<dyn RecordValidator>,
        max_record_bytes: usize,
    ) -> Self {
        Self {
            clock,
            validator,
            max_record_bytes,
        }
    }

    /// Prepares one requested mutation.
    ///
    /// `validate` follows the request flag: `Some(false)` skips schema
    /// validation, `Some(true)` requires a known schema, `None` validates when
    /// a schema is known.
    pub fn prepare(&self, did: &Did, op: WriteOp, validate: Option<bool>) -> Result<PreparedWrite> {
        match op {
            WriteOp::Create {
                collection,
                rkey,
                record,
            } => self.prepare_create(did, &collection, rkey.as_deref(), record, validate),
            WriteOp::Update {
                collection,
                rkey,
                record,
                swap_record,
            } => self.prepare_update(did, &collection, &rkey, record, swap_record, validate),
            WriteOp::Delete {
                collection,
                rkey,
                swap_record,
            } => self.prepare_delete(did, &collection, &rkey, swap_record),
        }
    }

    /// Prepares a batch; the first failure fails the whole batch.
    pub fn prepare_batch(
        &self,
        did: &Did,
        ops: Vec<WriteOp>,
        validate: Option<bool>,
    ) -> Result<Vec<PreparedWrite>> {
        ops.into_iter()
            .map(|op| self.prepare(did, op, validate))
            .collect()
    }

    /// Prepares a create. Without an explicit key, a fresh TID is used.
    ///
    /// Creates carry an implicit "must not exist" precondition.
    pub fn prepare_create(
        &self,
        did: &Did,
        collection: &str,
        rkey: Option<&str>,
        record: Value,
        validate: Option<bool>,
    ) -> Result<PreparedWrite> {
        let collection = Nsid::parse(collection)?;
        let rkey = match rkey {
            Some(k) => RecordKey::parse(k)?,
            None => RecordKey::from(self.clock.next()),
        };
        let uri = AtUri::new(did.clone(), collection, rkey);
        let prepared = self.prepare_record(uri, record, Some(RecordSwap::MustBeAbsent), validate)?;
        Ok(PreparedWrite::Create(prepared))
    }

    pub fn prepare_update(
        &self,
        did: &Did,
        collection: &str,
        rkey: &str,
        record: Value,
        swap: Option<RecordSwap>,
        validate: Option<bool>,
    ) -> Result<PreparedWrite> {
        let uri = AtUri::new(did.clone(), Nsid::parse(collection)?, RecordKey::parse(rkey)?);
        let prepared = self.prepare_record(uri, record, swap, validate)?;
        Ok(PreparedWrite::Update(prepared))
    }

    pub fn prepare_delete(
        &self,
        did: &Did,
        collection: &str,
        rkey: &str,
        swap: Option<RecordSwap>,
    ) -> Result<PreparedWrite> {
        let uri = AtUri::new(did.clone(), Nsid::parse(collection)?, RecordKey::parse(rkey)?);
        Ok(PreparedWrite::Delete(PreparedDelete { uri, swap }))
    }

    fn prepare_record(
        &self,
        uri: AtUri,
        record: Value,
        swap: Option<RecordSwap>,
        validate: Option<bool>,
    ) -> Result<PreparedRecord> {
        let Value::Object(mut map) = record else {
            return Err(Error::InvalidRecord("record must be a JSON object".to_string()));
        };

        match map.get(TYPE_FIELD) {
            None => {
                map.insert(
                    TYPE_FIELD.to_string(),
                    Value::String(uri.collection.to_string()),
                );
            }
            Some(Value::String(t)) if t == uri.collection.as_str() => {}
            Some(Value::String(t)) => {
                return Err(Error::InvalidRecord(format!(
                    "invalid $type: expected {}, got {t}",
                    uri.collection
                )));
            }
            Some(_) => {
                return Err(Error::InvalidRecord("$type must be a string".to_string()));
            }
        }

        let depth = nesting_depth(&map);
        if depth > MAX_RECORD_DEPTH {
            return Err(Error::InvalidRecord(format!(
                "record nesting depth {depth} exceeds {MAX_RECORD_DEPTH}"
            )));
        }

        let validation = self.check_schema(&uri.collection, &map, validate)?;

        let record = Value::Object(map);
        let bytes = canonical_json(&record)?;
        if bytes.len() > self.max_record_bytes {
            return Err(Error::InvalidRecord(format!(
                "record is {} bytes, limit is {}",
                bytes.len(),
                self.max_record_bytes
            )));
        }
        let cid = Cid::for_bytes(&bytes);

        Ok(PreparedRecord {
            uri,
            cid,
            record,
            bytes,
            swap,
            validation,
        })
    }

    fn check_schema(
        &self,
        collection: &Nsid,
        record: &Map<String, Value>,
        validate: Option<bool>,
    ) -> Result<ValidationStatus> {
        if validate == Some(false) {
            return Ok(ValidationStatus::Unknown);
        }
        match self.validator.check(collection, record) {
            SchemaCheck::Valid => Ok(ValidationStatus::Valid),
            SchemaCheck::Invalid(msg) => Err(Error::InvalidRecord(msg)),
            SchemaCheck::Unknown if validate == Some(true) => Err(Error::InvalidRecord(format!(
                "lexicon not found for collection {collection}"
            ))),
            SchemaCheck::Unknown => Ok(ValidationStatus::Unknown),
        }
    }
}

fn nesting_depth(map: &Map<String, Value>) -> usize {
    1 + map.values().map(value_depth).max().unwrap_or(0)
}

fn value_depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => nesting_depth(map),
        Value::Array(items) => 1 + items.iter().map(value_depth).max().unwrap_or(0),
        _ => 0,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn preparer() -> WritePreparer {
        WritePreparer::new(Arc::new(TidClock::with_clock_id(3)), Arc::new(NoSchemas), 1024)
    }

    fn alice() -> Did {
        Did::parse("did:example:alice").unwrap()
    }

    /// Accepts records with a `text` field, rejects the rest.
    struct RequireText;

    impl RecordValidator for RequireText {
        fn check(&self, collection: &Nsid, record: &Map<String, Value>) -> SchemaCheck {
            if collection.as_str() != "app.example.post" {
                return SchemaCheck::Unknown;
            }
            if record.get("text").map(Value::is_string).unwrap_or(false) {
                SchemaCheck::Valid
            } else {
                SchemaCheck::Invalid("missing text".to_string())
            }
        }
    }

    #[test]
    fn test_create_with_explicit_key() {
        let w = preparer()
            .prepare_create(&alice(), "app.example.post", Some("3abc"), json!({"text": "hi"}), None)
            .unwrap();

        assert_eq!(w.action(), WriteAction::Create);
        assert_eq!(w.uri().to_string(), "at://did:example:alice/app.example.post/3abc");
        assert_eq!(w.swap(), Some(RecordSwap::MustBeAbsent));

        let PreparedWrite::Create(rec) = w else { panic!("expected create") };
        assert_eq!(rec.record["$type"], "app.example.post");
        assert_eq!(rec.cid, Cid::for_bytes(&rec.bytes));
        assert_eq!(rec.validation, ValidationStatus::Unknown);
    }

    #[test]
    fn test_generated_keys_are_ordered() {
        let p = preparer();
        let first = p
            .prepare_create(&alice(), "app.example.post", None, json!({"text": "a"}), None)
            .unwrap();
        let second = p
            .prepare_create(&alice(), "app.example.post", None, json!({"text": "b"}), None)
            .unwrap();
        assert!(first.uri().rkey < second.uri().rkey);
        assert_eq!(first.uri().rkey.as_str().len(), 13);
    }

    #[test]
    fn test_cid_ignores_key_order() {
        let p = preparer();
        let a = p
            .prepare_update(&alice(), "app.example.post", "k", json!({"a": 1, "b": 2}), None, None)
            .unwrap();
        let b = p
            .prepare_update(
                &alice(),
                "app.example.post",
                "k",
                json!({"b": 2, "$type": "app.example.post", "a": 1}),
                None,
                None,
            )
            .unwrap();
        assert_eq!(a.cid(), b.cid());
    }

    #[test]
    fn test_invalid_records_rejected() {
        let p = preparer();
        let did = alice();

        let err = p
            .prepare_create(&did, "app.example.post", None, json!("text"), None)
            .unwrap_err();
        assert_eq!(err.code(), "InvalidRecord");

        let err = p
            .prepare_create(&did, "app.example.post", None, json!({"$type": "app.other.thing"}), None)
            .unwrap_err();
        assert_eq!(err.code(), "InvalidRecord");

        let err = p
            .prepare_create(&did, "app.example.post", None, json!({"$type": 5}), None)
            .unwrap_err();
        assert_eq!(err.code(), "InvalidRecord");

        let big = "x".repeat(2048);
        let err = p
            .prepare_create(&did, "app.example.post", None, json!({"text": big}), None)
            .unwrap_err();
        assert_eq!(err.code(), "InvalidRecord");

        let mut deep = json!(1);
        for _ in 0..40 {
            deep = json!({ "n": deep });
        }
        let err = p
            .prepare_create(&did, "app.example.post", None, deep, None)
            .unwrap_err();
        assert_eq!(err.code(), "InvalidRecord");
    }

    #[test]
    fn test_invalid_identifiers_rejected() {
        let p = preparer();
        let err = p
            .prepare_create(&alice(), "post", None, json!({}), None)
            .unwrap_err();
        assert_eq!(err.code(), "InvalidRequest");

        let err = p
            .prepare_delete(&alice(), "app.example.post", "a/b", None)
            .unwrap_err();
        assert_eq!(err.code(), "InvalidRequest");
    }

    #[test]
    fn test_schema_validation_modes() {
        let p = WritePreparer::new(Arc::new(TidClock::new()), Arc::new(RequireText), 1024);
        let did = alice();

        let ok = p
            .prepare_create(&did, "app.example.post", None, json!({"text": "hi"}), None)
            .unwrap();
        let PreparedWrite::Create(rec) = ok else { panic!("expected create") };
        assert_eq!(rec.validation, ValidationStatus::Valid);

        let err = p
            .prepare_create(&did, "app.example.post", None, json!({"body": "hi"}), None)
            .unwrap_err();
        assert_eq!(err.code(), "InvalidRecord");

        // Skipping validation accepts the same record.
        let skipped = p
            .prepare_create(&did, "app.example.post", None, json!({"body": "hi"}), Some(false))
            .unwrap();
        let PreparedWrite::Create(rec) = skipped else { panic!("expected create") };
        assert_eq!(rec.validation, ValidationStatus::Unknown);

        // Unknown collection: fine unless validation was explicitly requested.
        assert!(p
            .prepare_create(&did, "app.example.like", None, json!({}), None)
            .is_ok());
        let err = p
            .prepare_create(&did, "app.example.like", None, json!({}), Some(true))
            .unwrap_err();
        assert_eq!(err.code(), "InvalidRecord");
    }

    #[test]
    fn test_prepare_batch_fails_as_a_whole() {
        let ops = vec![
            WriteOp::Create {
                collection: "app.example.post".into(),
                rkey: None,
                record: json!({"text": "ok"}),
            },
            WriteOp::Update {
                collection: "app.example.post".into(),
                rkey: "k".into(),
                record: json!([]),
                swap_record: None,
            },
        ];
        assert!(preparer().prepare_batch(&alice(), ops, None).is_err());
    }

    #[test]
    fn test_record_swap_check() {
        let uri = AtUri::new(
            alice(),
            Nsid::parse("app.example.post").unwrap(),
            RecordKey::parse("k").unwrap(),
        );
        let cid = Cid::for_bytes(b"x");

        assert!(RecordSwap::MustBeAbsent.check(&uri, None).is_ok());
        assert!(RecordSwap::MustBeAbsent.check(&uri, Some(cid)).is_err());
        assert!(RecordSwap::MustMatch(cid).check(&uri, Some(cid)).is_ok());

        let err = RecordSwap::MustMatch(cid).check(&uri, None).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(RecordSwap::from_expected(None), RecordSwap::MustBeAbsent);
    }
}
