/**
 * Permission Oracle
 *
 * Answers (user, document) → access level for session admission.
 *
 * Resolution: the owner holds implicit admin; otherwise the effective
 * level is the maximum of the direct document grant and the inherited
 * vault grant, with read < write < admin. Missing and soft-deleted
 * documents resolve to not-found. Decisions are not cached; every
 * handshake performs one resolution.
 */

use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::ServiceError;

/// Effective access level, ordered read < write < admin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PermissionLevel {
    Read = 1,
    Write = 2,
    Admin = 3,
}

impl PermissionLevel {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Admin => "admin",
        }
    }
}

/// Outcome of an admission check against one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocAccess {
    /// Document missing or soft-deleted
    NotFound,
    /// Document exists but the user holds no grant
    Denied,
    /// Effective level for the user
    Allowed(PermissionLevel),
}

/// Combine direct and inherited grants into an effective level.
fn resolve(
    direct: Option<PermissionLevel>,
    inherited: Option<PermissionLevel>,
) -> Option<PermissionLevel> {
    match (direct, inherited) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

/// DB-backed permission oracle.
#[derive(Clone)]
pub struct PermissionOracle {
    pool: PgPool,
}

impl PermissionOracle {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Resolve the user's access to a document.
    pub async fn document_access(
        &self,
        user_id: Uuid,
        doc_id: Uuid,
    ) -> Result<DocAccess, ServiceError> {
        let row = sqlx::query(
            r#"
            SELECT owner_id, vault_id, is_deleted
            FROM documents WHERE id = $1
            "#,
        )
        .bind(doc_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(DocAccess::NotFound);
        };
        if row.get::<bool, _>("is_deleted") {
            return Ok(DocAccess::NotFound);
        }

        let owner_id: Uuid = row.get("owner_id");
        if owner_id == user_id {
            return Ok(DocAccess::Allowed(PermissionLevel::Admin));
        }

        let direct: Option<String> = sqlx::query_scalar(
            r#"
            SELECT permission FROM document_permissions
            WHERE document_id = $1 AND user_id = $2
            "#,
        )
        .bind(doc_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let vault_id: Option<Uuid> = row.get("vault_id");
        let inherited: Option<String> = match vault_id {
            Some(vault_id) => {
                sqlx::query_scalar(
                    r#"
                    SELECT permission FROM vault_permissions
                    WHERE vault_id = $1 AND user_id = $2
                    "#,
                )
                .bind(vault_id)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?
            }
            None => None,
        };

        let level = resolve(
            direct.as_deref().and_then(PermissionLevel::parse),
            inherited.as_deref().and_then(PermissionLevel::parse),
        );

        Ok(level.map(DocAccess::Allowed).unwrap_or(DocAccess::Denied))
    }

    pub async fn can_read(&self, user_id: Uuid, doc_id: Uuid) -> Result<bool, ServiceError> {
        Ok(matches!(
            self.document_access(user_id, doc_id).await?,
            DocAccess::Allowed(_)
        ))
    }

    pub async fn can_write(&self, user_id: Uuid, doc_id: Uuid) -> Result<bool, ServiceError> {
        Ok(matches!(
            self.document_access(user_id, doc_id).await?,
            DocAccess::Allowed(level) if level >= PermissionLevel::Write
        ))
    }

    pub async fn can_admin(&self, user_id: Uuid, doc_id: Uuid) -> Result<bool, ServiceError> {
        Ok(matches!(
            self.document_access(user_id, doc_id).await?,
            DocAccess::Allowed(level) if level >= PermissionLevel::Admin
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(PermissionLevel::Read < PermissionLevel::Write);
        assert!(PermissionLevel::Write < PermissionLevel::Admin);
    }

    #[test]
    fn test_parse_round_trip() {
        for level in [
            PermissionLevel::Read,
            PermissionLevel::Write,
            PermissionLevel::Admin,
        ] {
            assert_eq!(PermissionLevel::parse(level.as_str()), Some(level));
        }
        assert_eq!(PermissionLevel::parse("owner"), None);
    }

    #[test]
    fn test_resolve_takes_maximum() {
        assert_eq!(
            resolve(Some(PermissionLevel::Read), Some(PermissionLevel::Write)),
            Some(PermissionLevel::Write)
        );
        assert_eq!(
            resolve(Some(PermissionLevel::Admin), Some(PermissionLevel::Read)),
            Some(PermissionLevel::Admin)
        );
        assert_eq!(
            resolve(None, Some(PermissionLevel::Read)),
            Some(PermissionLevel::Read)
        );
        assert_eq!(resolve(None, None), None);
    }
}
