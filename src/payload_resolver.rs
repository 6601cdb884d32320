/// Payload Resolver
///
/// Extracts the external user id and a typed, resource-specific payload from
/// a decoded envelope. The representation string is decoded exactly once,
/// here, after the resource type is known.
use thiserror::Error;
use uuid::Uuid;

use crate::types::{
    AdminEventEnvelope, ExternalRoleList, ExternalUserRepresentation, OperationType, ResourceType,
};

#[derive(Debug, Error, PartialEq)]
pub enum ResolutionError {
    #[error("No external user id found on {resource_type} event")]
    MissingExternalId { resource_type: ResourceType },

    #[error("Malformed external user id: {value}")]
    MalformedExternalId { value: String },

    #[error("{resource_type} {operation_type} event has no representation")]
    MissingRepresentation {
        resource_type: ResourceType,
        operation_type: OperationType,
    },

    #[error("Undecodable {resource_type} representation: {reason}")]
    InvalidRepresentation {
        resource_type: ResourceType,
        reason: String,
    },
}

/// What an event asks the replica to do.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncAction {
    CreateUser(ExternalUserRepresentation),
    UpdateUser(ExternalUserRepresentation),
    DeleteUser,
    AssignRoles(ExternalRoleList),
    ClearRole,
}

impl SyncAction {
    pub fn name(&self) -> &'static str {
        match self {
            SyncAction::CreateUser(_) => "create_user",
            SyncAction::UpdateUser(_) => "update_user",
            SyncAction::DeleteUser => "delete_user",
            SyncAction::AssignRoles(_) => "assign_roles",
            SyncAction::ClearRole => "clear_role",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEvent {
    pub event_id: String,
    pub external_id: Uuid,
    pub action: SyncAction,
}

/// Event outside the synchronized vocabulary. Not an error.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsupportedEvent {
    pub resource_type: ResourceType,
    pub operation_type: OperationType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Apply(ResolvedEvent),
    Unsupported(UnsupportedEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Upsert { create: bool },
    Delete,
}

pub fn resolve(envelope: &AdminEventEnvelope) -> Result<Resolution, ResolutionError> {
    let operation = match &envelope.operation_type {
        OperationType::Create => Operation::Upsert { create: true },
        OperationType::Update => Operation::Upsert { create: false },
        OperationType::Delete => Operation::Delete,
        OperationType::Action | OperationType::Other(_) => return Ok(unsupported(envelope)),
    };

    let (external_id, action) = match &envelope.resource_type {
        ResourceType::User => {
            let external_id = user_external_id(envelope)?;
            let action = match operation {
                Operation::Upsert { create } => {
                    let user: ExternalUserRepresentation = decode_representation(envelope)?;
                    if create {
                        SyncAction::CreateUser(user)
                    } else {
                        SyncAction::UpdateUser(user)
                    }
                }
                Operation::Delete => SyncAction::DeleteUser,
            };
            (external_id, action)
        }
        ResourceType::RealmRoleMapping => {
            let external_id = role_mapping_external_id(envelope)?;
            let action = match operation {
                Operation::Upsert { .. } => SyncAction::AssignRoles(decode_representation(envelope)?),
                Operation::Delete => SyncAction::ClearRole,
            };
            (external_id, action)
        }
        ResourceType::Other(_) => return Ok(unsupported(envelope)),
    };

    Ok(Resolution::Apply(ResolvedEvent {
        event_id: envelope.event_id.clone(),
        external_id,
        action,
    }))
}

fn unsupported(envelope: &AdminEventEnvelope) -> Resolution {
    Resolution::Unsupported(UnsupportedEvent {
        resource_type: envelope.resource_type.clone(),
        operation_type: envelope.operation_type.clone(),
    })
}

/// USER events: `resourceId`, then the path, then the representation's own id.
fn user_external_id(envelope: &AdminEventEnvelope) -> Result<Uuid, ResolutionError> {
    if let Some(resource_id) = non_empty(envelope.resource_id.as_deref()) {
        return parse_external_id(resource_id);
    }

    if let Some(segment) = envelope.resource_path.as_deref().and_then(user_segment) {
        return parse_external_id(segment);
    }

    let embedded = envelope
        .representation
        .as_deref()
        .and_then(|raw| serde_json::from_str::<ExternalUserRepresentation>(raw).ok())
        .map(|user| user.external_id)
        .filter(|id| !id.trim().is_empty());

    match embedded {
        Some(id) => parse_external_id(&id),
        None => Err(ResolutionError::MissingExternalId {
            resource_type: envelope.resource_type.clone(),
        }),
    }
}

/// REALM_ROLE_MAPPING events: the `users/{id}/role-mappings/realm` path, then `resourceId`.
fn role_mapping_external_id(envelope: &AdminEventEnvelope) -> Result<Uuid, ResolutionError> {
    if let Some(segment) = envelope.resource_path.as_deref().and_then(user_segment) {
        return parse_external_id(segment);
    }

    match non_empty(envelope.resource_id.as_deref()) {
        Some(resource_id) => parse_external_id(resource_id),
        None => Err(ResolutionError::MissingExternalId {
            resource_type: envelope.resource_type.clone(),
        }),
    }
}

/// The path segment immediately following `users`.
pub fn user_segment(resource_path: &str) -> Option<&str> {
    let mut segments = resource_path.split('/').filter(|s| !s.is_empty());
    segments.by_ref().find(|s| *s == "users")?;
    segments.next()
}

fn parse_external_id(raw: &str) -> Result<Uuid, ResolutionError> {
    Uuid::parse_str(raw.trim()).map_err(|_| ResolutionError::MalformedExternalId {
        value: raw.to_string(),
    })
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn decode_representation<T>(envelope: &AdminEventEnvelope) -> Result<T, ResolutionError>
where
    T: serde::de::DeserializeOwned,
{
    let raw = non_empty(envelope.representation.as_deref()).ok_or_else(|| {
        ResolutionError::MissingRepresentation {
            resource_type: envelope.resource_type.clone(),
            operation_type: envelope.operation_type.clone(),
        }
    })?;

    serde_json::from_str(raw).map_err(|e| ResolutionError::InvalidRepresentation {
        resource_type: envelope.resource_type.clone(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: &str = "11111111-1111-1111-1111-111111111111";

    fn envelope(resource_type: &str, operation_type: &str) -> AdminEventEnvelope {
        AdminEventEnvelope {
            event_id: "evt".to_string(),
            timestamp: 0,
            realm_id: String::new(),
            realm_name: String::new(),
            actor: None,
            resource_type: resource_type.into(),
            operation_type: operation_type.into(),
            resource_path: None,
            resource_id: None,
            representation: None,
            error: None,
        }
    }

    fn expect_apply(resolution: Resolution) -> ResolvedEvent {
        match resolution {
            Resolution::Apply(event) => event,
            other => panic!("expected an applicable event, got {other:?}"),
        }
    }

    #[test]
    fn test_user_create_uses_resource_id() {
        let mut env = envelope("USER", "CREATE");
        env.resource_id = Some(ALICE.to_string());
        env.representation = Some(r#"{"id":"ignored","username":"alice"}"#.to_string());

        let event = expect_apply(resolve(&env).unwrap());
        assert_eq!(event.external_id, Uuid::parse_str(ALICE).unwrap());
        match event.action {
            SyncAction::CreateUser(user) => assert_eq!(user.username, "alice"),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn test_user_falls_back_to_path_then_representation_id() {
        let mut env = envelope("USER", "UPDATE");
        env.resource_path = Some(format!("users/{ALICE}"));
        env.representation = Some(r#"{"username":"alice"}"#.to_string());
        assert_eq!(
            expect_apply(resolve(&env).unwrap()).external_id.to_string(),
            ALICE
        );

        let mut env = envelope("USER", "UPDATE");
        env.representation = Some(format!(r#"{{"id":"{ALICE}","username":"alice"}}"#));
        assert_eq!(
            expect_apply(resolve(&env).unwrap()).external_id.to_string(),
            ALICE
        );
    }

    #[test]
    fn test_user_delete_needs_no_representation() {
        let mut env = envelope("USER", "DELETE");
        env.resource_id = Some(ALICE.to_string());

        let event = expect_apply(resolve(&env).unwrap());
        assert_eq!(event.action, SyncAction::DeleteUser);
    }

    #[test]
    fn test_role_mapping_id_from_resource_path() {
        let mut env = envelope("REALM_ROLE_MAPPING", "CREATE");
        env.resource_path = Some(format!("users/{ALICE}/role-mappings/realm"));
        env.representation = Some(r#"[{"name":"manager","id":"r1"}]"#.to_string());

        let event = expect_apply(resolve(&env).unwrap());
        assert_eq!(event.external_id.to_string(), ALICE);
        match event.action {
            SyncAction::AssignRoles(roles) => {
                assert_eq!(roles.len(), 1);
                assert_eq!(roles[0].name, "manager");
                assert_eq!(roles[0].id.as_deref(), Some("r1"));
            }
            other => panic!("unexpected action {other:?}"),
        }

        let mut delete = envelope("REALM_ROLE_MAPPING", "DELETE");
        delete.resource_path = Some(format!("users/{ALICE}/role-mappings/realm"));
        assert_eq!(
            expect_apply(resolve(&delete).unwrap()).action,
            SyncAction::ClearRole
        );
    }

    #[test]
    fn test_user_segment_extraction() {
        assert_eq!(
            user_segment("users/abc/role-mappings/realm"),
            Some("abc")
        );
        assert_eq!(user_segment("/users/abc"), Some("abc"));
        assert_eq!(user_segment("groups/abc"), None);
        assert_eq!(user_segment("users"), None);
    }

    #[test]
    fn test_malformed_ids_are_resolution_errors() {
        let mut env = envelope("USER", "DELETE");
        env.resource_id = Some("not-a-uuid".to_string());
        assert_eq!(
            resolve(&env),
            Err(ResolutionError::MalformedExternalId {
                value: "not-a-uuid".to_string()
            })
        );

        let mut env = envelope("REALM_ROLE_MAPPING", "DELETE");
        env.resource_path = Some("users/xyz/role-mappings/realm".to_string());
        assert!(matches!(
            resolve(&env),
            Err(ResolutionError::MalformedExternalId { .. })
        ));

        let env = envelope("REALM_ROLE_MAPPING", "DELETE");
        assert!(matches!(
            resolve(&env),
            Err(ResolutionError::MissingExternalId { .. })
        ));
    }

    #[test]
    fn test_create_without_representation_is_rejected() {
        let mut env = envelope("USER", "CREATE");
        env.resource_id = Some(ALICE.to_string());
        assert!(matches!(
            resolve(&env),
            Err(ResolutionError::MissingRepresentation { .. })
        ));

        env.representation = Some("[1, 2]".to_string());
        assert!(matches!(
            resolve(&env),
            Err(ResolutionError::InvalidRepresentation { .. })
        ));
    }

    #[test]
    fn test_unknown_resource_and_operation_are_unsupported() {
        let env = envelope("CLIENT", "CREATE");
        assert!(matches!(resolve(&env), Ok(Resolution::Unsupported(_))));

        let mut env = envelope("USER", "ACTION");
        env.resource_id = Some(ALICE.to_string());
        assert!(matches!(resolve(&env), Ok(Resolution::Unsupported(_))));
    }
}
