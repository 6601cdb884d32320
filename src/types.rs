use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Resource kinds carried by administrative events.
///
/// The identity provider emits upper-case tokens; parsing is case-insensitive
/// and anything outside the synchronized set lands in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResourceType {
    User,
    RealmRoleMapping,
    Other(String),
}

impl From<&str> for ResourceType {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "USER" => ResourceType::User,
            "REALM_ROLE_MAPPING" => ResourceType::RealmRoleMapping,
            _ => ResourceType::Other(value.to_string()),
        }
    }
}

impl From<String> for ResourceType {
    fn from(value: String) -> Self {
        ResourceType::from(value.as_str())
    }
}

impl From<ResourceType> for String {
    fn from(value: ResourceType) -> Self {
        value.as_str().to_string()
    }
}

impl ResourceType {
    pub fn as_str(&self) -> &str {
        match self {
            ResourceType::User => "USER",
            ResourceType::RealmRoleMapping => "REALM_ROLE_MAPPING",
            ResourceType::Other(raw) => raw,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation kinds carried by administrative events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OperationType {
    Create,
    Update,
    Delete,
    Action,
    Other(String),
}

impl From<&str> for OperationType {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "CREATE" => OperationType::Create,
            "UPDATE" => OperationType::Update,
            "DELETE" => OperationType::Delete,
            "ACTION" => OperationType::Action,
            _ => OperationType::Other(value.to_string()),
        }
    }
}

impl From<String> for OperationType {
    fn from(value: String) -> Self {
        OperationType::from(value.as_str())
    }
}

impl From<OperationType> for String {
    fn from(value: OperationType) -> Self {
        value.as_str().to_string()
    }
}

impl OperationType {
    pub fn as_str(&self) -> &str {
        match self {
            OperationType::Create => "CREATE",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
            OperationType::Action => "ACTION",
            OperationType::Other(raw) => raw,
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who triggered an administrative event. Provenance only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthDetails {
    #[serde(deserialize_with = "null_as_default")]
    pub realm_id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub realm_name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub client_id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub user_id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub ip_address: String,
}

/// Administrative change notification as published on the broker.
///
/// The wire keys `id`, `time` and `authDetails` are the identity provider's
/// spelling; `eventId`, `timestamp` and `actor` are accepted as well.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminEventEnvelope {
    #[serde(rename = "id", alias = "eventId", default, deserialize_with = "null_as_default")]
    pub event_id: String,
    /// Epoch milliseconds.
    #[serde(rename = "time", alias = "timestamp", default, deserialize_with = "null_as_default")]
    pub timestamp: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub realm_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub realm_name: String,
    #[serde(rename = "authDetails", alias = "actor", default)]
    pub actor: Option<AuthDetails>,
    pub resource_type: ResourceType,
    pub operation_type: OperationType,
    #[serde(default)]
    pub resource_path: Option<String>,
    #[serde(default)]
    pub resource_id: Option<String>,
    /// Nested JSON document whose schema depends on `resource_type`.
    #[serde(default, deserialize_with = "representation_as_string")]
    pub representation: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

// Provenance fields are informational; an explicit null reads as empty.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// Producers normally stringify the representation; some embed it as raw JSON.
fn representation_as_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(raw)) => Some(raw),
        Some(other) => Some(other.to_string()),
    })
}

/// User document decoded from a USER event's representation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalUserRepresentation {
    #[serde(rename = "id", alias = "externalId", default, deserialize_with = "null_as_default")]
    pub external_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub username: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub enabled: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub email_verified: bool,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub attributes: Option<HashMap<String, Vec<String>>>,
    #[serde(default)]
    pub created_timestamp: Option<i64>,
}

impl ExternalUserRepresentation {
    /// First value of the `role` attribute, if any.
    pub fn role_attribute(&self) -> Option<String> {
        self.attributes
            .as_ref()
            .and_then(|attributes| attributes.get("role"))
            .and_then(|values| values.first())
            .cloned()
    }
}

/// One entry of a REALM_ROLE_MAPPING representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalRole {
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Ordered role list. Only the first entry is authoritative.
pub type ExternalRoleList = Vec<ExternalRole>;

/// Service-owned copy of an identity provider user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUserRecord {
    pub local_id: Uuid,
    pub external_id: Uuid,
    pub username: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl LocalUserRecord {
    /// First materialization of an external user.
    pub fn materialize(
        external_id: Uuid,
        user: &ExternalUserRepresentation,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            local_id: Uuid::new_v4(),
            external_id,
            username: user.username.clone(),
            email: user.email.clone().unwrap_or_default(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            role: user.role_attribute(),
            created_at: now,
            updated_at: None,
        }
    }

    /// Copy of this record overwritten with the external user's fields.
    /// A null email keeps the current one.
    pub fn overwritten_by(&self, user: &ExternalUserRepresentation, now: DateTime<Utc>) -> Self {
        Self {
            username: user.username.clone(),
            email: user.email.clone().unwrap_or_else(|| self.email.clone()),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            role: user.role_attribute(),
            updated_at: Some(now),
            ..self.clone()
        }
    }

    pub fn with_role(&self, role: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            role,
            updated_at: Some(now),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Duplicate CREATE delivery.
    AlreadyPresent,
    /// DELETE for a record that does not exist.
    NotPresent,
    /// Role mapping arrived before the user was materialized.
    UserNotMaterialized,
    /// Role mapping with no usable role name.
    EmptyRoleList,
}

/// Result of applying one event to the replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    Created { local_id: Uuid },
    Updated { local_id: Uuid },
    Deleted { local_id: Uuid },
    RoleAssigned { local_id: Uuid, role: String },
    RoleCleared { local_id: Uuid },
    Skipped(SkipReason),
}

impl ApplyOutcome {
    pub fn is_mutation(&self) -> bool {
        !matches!(self, ApplyOutcome::Skipped(_))
    }
}

/// Poison message parked after exhausting its deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub subject: String,
    pub event_id: Option<String>,
    pub payload: String,
    pub reason: String,
    pub deliveries: u64,
    pub recorded_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        subject: impl Into<String>,
        event_id: Option<String>,
        payload: &[u8],
        reason: impl Into<String>,
        deliveries: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject: subject.into(),
            event_id,
            payload: String::from_utf8_lossy(payload).to_string(),
            reason: reason.into(),
            deliveries,
            recorded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn representation(email: Option<&str>, role: Option<&str>) -> ExternalUserRepresentation {
        let attributes = role.map(|r| {
            let mut map = HashMap::new();
            map.insert("role".to_string(), vec![r.to_string(), "ignored".to_string()]);
            map
        });
        ExternalUserRepresentation {
            username: "alice".to_string(),
            email: email.map(str::to_string),
            attributes,
            ..Default::default()
        }
    }

    #[test]
    fn test_resource_type_parsing_is_case_insensitive() {
        assert_eq!(ResourceType::from("USER"), ResourceType::User);
        assert_eq!(ResourceType::from("user"), ResourceType::User);
        assert_eq!(
            ResourceType::from("realm_role_mapping"),
            ResourceType::RealmRoleMapping
        );
        assert_eq!(
            ResourceType::from("CLIENT"),
            ResourceType::Other("CLIENT".to_string())
        );
        assert_eq!(ResourceType::Other("CLIENT".into()).to_string(), "CLIENT");
    }

    #[test]
    fn test_operation_type_parsing() {
        assert_eq!(OperationType::from("Create"), OperationType::Create);
        assert_eq!(OperationType::from("DELETE"), OperationType::Delete);
        assert_eq!(OperationType::from("ACTION"), OperationType::Action);
        assert_eq!(
            OperationType::from("PATCH"),
            OperationType::Other("PATCH".to_string())
        );
    }

    #[test]
    fn test_role_attribute_takes_first_value() {
        assert_eq!(
            representation(None, Some("manager")).role_attribute(),
            Some("manager".to_string())
        );
        assert_eq!(representation(None, None).role_attribute(), None);
    }

    #[test]
    fn test_materialize_defaults_missing_email_to_empty() {
        let now = Utc::now();
        let external_id = Uuid::new_v4();
        let record = LocalUserRecord::materialize(external_id, &representation(None, None), now);

        assert_eq!(record.external_id, external_id);
        assert_eq!(record.email, "");
        assert_eq!(record.created_at, now);
        assert!(record.updated_at.is_none());
    }

    #[test]
    fn test_overwrite_keeps_email_and_creation_time() {
        let created = Utc::now();
        let record = LocalUserRecord::materialize(
            Uuid::new_v4(),
            &representation(Some("old@x.com"), Some("user")),
            created,
        );

        let later = created + chrono::Duration::seconds(5);
        let updated = record.overwritten_by(&representation(None, None), later);

        assert_eq!(updated.local_id, record.local_id);
        assert_eq!(updated.email, "old@x.com");
        assert_eq!(updated.role, None);
        assert_eq!(updated.created_at, created);
        assert_eq!(updated.updated_at, Some(later));
    }
}
