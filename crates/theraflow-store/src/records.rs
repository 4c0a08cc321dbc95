//! Record types mirrored by the collection caches.
//!
//! The cache only interprets the identifier, `ownerId` and `createdAt`
//! fields. Everything else a record carries is kept verbatim in `fields`.
//!
//! Decoding never rejects a record over the shape of a descriptive field:
//! timestamps and names that cannot be read decode as `None`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::bus::Topic;
use crate::types::{Collection, Document, OwnerId, StoredDocument};

/// A record type held in a collection cache.
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Remote collection the record lives in.
    const COLLECTION: Collection;

    /// Name of the identifier field in the document body.
    const ID_FIELD: &'static str;

    /// Topic published when the cache of this type changes.
    const TOPIC: Topic;

    fn id(&self) -> &str;

    fn set_owner_id(&mut self, owner: OwnerId);

    fn created_at(&self) -> Option<DateTime<Utc>>;
    fn set_created_at(&mut self, at: DateTime<Utc>);

    /// Decode a stored document, taking the identifier from the document key.
    fn from_document(doc: StoredDocument) -> Result<Self, serde_json::Error> {
        let StoredDocument { id, mut data } = doc;
        data.insert(Self::ID_FIELD.to_string(), Value::String(id));
        serde_json::from_value(Value::Object(data))
    }

    /// Encode the record as a document body.
    fn to_document(&self) -> Result<Document, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(serde::de::Error::custom(format!(
                "record did not serialize to an object: {}",
                other
            ))),
        }
    }
}

/// A patient record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    #[serde(default)]
    pub patient_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<OwnerId>,
    #[serde(default, deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, deserialize_with = "lenient::timestamp", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Remaining fields, kept as-is.
    #[serde(flatten)]
    pub fields: Document,
}

impl Patient {
    pub fn new(patient_id: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
            owner_id: None,
            first_name: None,
            last_name: None,
            created_at: None,
            fields: Document::new(),
        }
    }

    pub fn with_name(mut self, first: impl Into<String>, last: impl Into<String>) -> Self {
        self.first_name = Some(first.into());
        self.last_name = Some(last.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

impl Entity for Patient {
    const COLLECTION: Collection = Collection::Patients;
    const ID_FIELD: &'static str = "patientId";
    const TOPIC: Topic = Topic::PatientsChanged;

    fn id(&self) -> &str {
        &self.patient_id
    }

    fn set_owner_id(&mut self, owner: OwnerId) {
        self.owner_id = Some(owner);
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    fn set_created_at(&mut self, at: DateTime<Utc>) {
        self.created_at = Some(at);
    }
}

/// A therapy session record, belonging to one patient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(default)]
    pub id: String,
    #[serde(default, deserialize_with = "lenient::key")]
    pub patient_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<OwnerId>,
    #[serde(default, deserialize_with = "lenient::timestamp", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub fields: Document,
}

impl Session {
    pub fn new(id: impl Into<String>, patient_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            patient_id: patient_id.into(),
            owner_id: None,
            created_at: None,
            fields: Document::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }
}

impl Entity for Session {
    const COLLECTION: Collection = Collection::Sessions;
    const ID_FIELD: &'static str = "id";
    const TOPIC: Topic = Topic::SessionsChanged;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_owner_id(&mut self, owner: OwnerId) {
        self.owner_id = Some(owner);
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    fn set_created_at(&mut self, at: DateTime<Utc>) {
        self.created_at = Some(at);
    }
}

/// Profile of a signed-in user, stored under `users/{uid}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub uid: String,
    #[serde(default, deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, deserialize_with = "lenient::timestamp", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub fields: Document,
}

impl UserProfile {
    pub fn new() -> Self {
        Self {
            uid: String::new(),
            email: None,
            display_name: None,
            created_at: None,
            fields: Document::new(),
        }
    }
}

impl Default for UserProfile {
    fn default() -> Self {
        Self::new()
    }
}

/// Field decoders that fall back instead of failing the whole record.
mod lenient {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    /// RFC 3339 strings, epoch milliseconds, or a `{"seconds", "nanoseconds"}`
    /// server timestamp. Anything else is `None`.
    pub fn timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(match &value {
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|at| at.with_timezone(&Utc)),
            Value::Number(_) => integer(&value).and_then(DateTime::<Utc>::from_timestamp_millis),
            Value::Object(map) => {
                let field = |names: [&str; 2]| {
                    names
                        .iter()
                        .find_map(|name| map.get(*name))
                        .and_then(integer)
                };
                let seconds = field(["seconds", "_seconds"]);
                let nanos = field(["nanoseconds", "_nanoseconds"]).unwrap_or(0);
                seconds.and_then(|secs| DateTime::<Utc>::from_timestamp(secs, u32::try_from(nanos).ok()?))
            }
            _ => None,
        })
    }

    /// Strings as-is, numbers and booleans in their JSON spelling.
    pub fn text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(scalar(Value::deserialize(deserializer)?))
    }

    /// Like [`text`], but an unreadable link decodes as an empty identifier.
    pub fn key<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(scalar(Value::deserialize(deserializer)?).unwrap_or_default())
    }

    fn scalar(value: Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    fn integer(value: &Value) -> Option<i64> {
        value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_patient_from_document_uses_key_as_id() {
        let data = json!({"ownerId": "u1", "firstName": "Ann", "dob": "1990-01-01"});
        let Value::Object(data) = data else { unreachable!() };

        let patient = Patient::from_document(StoredDocument::new("p1", data)).unwrap();

        assert_eq!(patient.patient_id, "p1");
        assert_eq!(patient.owner_id, Some(OwnerId::from("u1")));
        assert_eq!(patient.first_name.as_deref(), Some("Ann"));
        assert_eq!(patient.fields.get("dob"), Some(&json!("1990-01-01")));
    }

    #[test]
    fn test_session_document_keeps_unknown_fields() {
        let session = Session::new("s1", "p1").with_field("transcript", "hello");
        let doc = session.to_document().unwrap();

        assert_eq!(doc.get("id"), Some(&json!("s1")));
        assert_eq!(doc.get("patientId"), Some(&json!("p1")));
        assert_eq!(doc.get("transcript"), Some(&json!("hello")));
        assert!(!doc.contains_key("ownerId"));

        let back = Session::from_document(StoredDocument::new("s1", doc)).unwrap();
        assert_eq!(back, session);
    }

    #[test]
    fn test_created_at_wire_format() {
        let at = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let session = Session::new("s1", "p1").with_created_at(at);
        let doc = session.to_document().unwrap();
        assert_eq!(doc.get("createdAt"), Some(&json!("2024-05-01T10:00:00Z")));
    }

    fn decode<E: Entity>(id: &str, data: Value) -> E {
        let Value::Object(data) = data else { unreachable!() };
        E::from_document(StoredDocument::new(id, data)).unwrap()
    }

    #[test]
    fn test_server_timestamp_shapes_decode() {
        let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();

        let object: Patient = decode("p1", json!({"createdAt": {"seconds": 1_700_000_000, "nanoseconds": 0}}));
        let underscored: Patient = decode("p2", json!({"createdAt": {"_seconds": 1_700_000_000}}));
        let millis: Patient = decode("p3", json!({"createdAt": 1_700_000_000_000i64}));

        assert_eq!(object.created_at, Some(at));
        assert_eq!(underscored.created_at, Some(at));
        assert_eq!(millis.created_at, Some(at));
    }

    #[test]
    fn test_unreadable_fields_do_not_reject_record() {
        let patient: Patient = decode(
            "p4",
            json!({"ownerId": "u1", "firstName": 7, "lastName": ["x"], "createdAt": "not a date"}),
        );
        assert_eq!(patient.patient_id, "p4");
        assert_eq!(patient.owner_id, Some(OwnerId::from("u1")));
        assert_eq!(patient.first_name.as_deref(), Some("7"));
        assert_eq!(patient.last_name, None);
        assert_eq!(patient.created_at, None);

        let session: Session = decode("s1", json!({"ownerId": "u1", "patientId": 12, "createdAt": null}));
        assert_eq!(session.patient_id, "12");
        assert_eq!(session.created_at, None);

        let orphan: Session = decode("s2", json!({"ownerId": "u1", "patientId": {"ref": "p1"}}));
        assert_eq!(orphan.patient_id, "");
    }

    #[test]
    fn test_document_id_overrides_body_id() {
        let Value::Object(data) = json!({"id": "stale", "patientId": "p1"}) else {
            unreachable!()
        };
        let session = Session::from_document(StoredDocument::new("s9", data)).unwrap();
        assert_eq!(session.id, "s9");
    }
}
