//! Permission conflict detection
//!
//! Some permissions are mutually exclusive tiers: a user should hold at most
//! one group of them. Reconciliation snapshots the conflict state before it
//! changes anything and compares afterwards, alerting only on a change.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::alerting::{AlertChannel, AlertSink};
use crate::error::BillingResult;

/// Scope the conflict check runs against
pub const ADMIN_SCOPE: &str = "admin";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PermissionQuery {
    pub user_id: Uuid,
    pub permission: String,
    pub scope_type: String,
    pub access_level: String,
}

impl PermissionQuery {
    /// Query for `permission` with admin scope and access
    pub fn admin(user_id: Uuid, permission: impl Into<String>) -> Self {
        Self {
            user_id,
            permission: permission.into(),
            scope_type: ADMIN_SCOPE.to_string(),
            access_level: ADMIN_SCOPE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionResponse {
    granted: bool,
}

impl PermissionResponse {
    pub fn new(granted: bool) -> Self {
        Self { granted }
    }

    pub fn has_permission(&self) -> bool {
        self.granted
    }
}

/// Opaque permission evaluation
#[async_trait]
pub trait PermissionManager: Send + Sync {
    async fn fetch_permission_response(
        &self,
        query: &PermissionQuery,
    ) -> BillingResult<PermissionResponse>;
}

/// Reads the `user_permissions` table
#[derive(Clone)]
pub struct PgPermissionManager {
    pool: PgPool,
}

impl PgPermissionManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PermissionManager for PgPermissionManager {
    async fn fetch_permission_response(
        &self,
        query: &PermissionQuery,
    ) -> BillingResult<PermissionResponse> {
        let granted: (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM user_permissions
                WHERE user_id = $1 AND permission = $2 AND scope_type = $3 AND access_level = $4
            )
            "#,
        )
        .bind(query.user_id)
        .bind(&query.permission)
        .bind(&query.scope_type)
        .bind(&query.access_level)
        .fetch_one(&self.pool)
        .await?;
        Ok(PermissionResponse::new(granted.0))
    }
}

/// Parse `a;b,c` into `[[a], [b, c]]`, skipping empty entries
pub fn parse_groups(raw: &str) -> Vec<Vec<String>> {
    raw.split(';')
        .map(|group| {
            group
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .filter(|group| !group.is_empty())
        .collect()
}

#[derive(Clone)]
pub struct PermissionConflict {
    manager: Arc<dyn PermissionManager>,
    alerts: Arc<dyn AlertSink>,
    groups: Vec<Vec<String>>,
}

impl PermissionConflict {
    pub fn new(
        manager: Arc<dyn PermissionManager>,
        alerts: Arc<dyn AlertSink>,
        groups: Vec<Vec<String>>,
    ) -> Self {
        Self {
            manager,
            alerts,
            groups,
        }
    }

    pub fn groups(&self) -> &[Vec<String>] {
        &self.groups
    }

    /// Whether the user currently satisfies more than one group
    pub async fn has_conflict(&self, user_id: Uuid) -> BillingResult<bool> {
        if self.groups.len() < 2 {
            return Ok(false);
        }

        let unique: HashSet<&str> = self
            .groups
            .iter()
            .flat_map(|group| group.iter().map(String::as_str))
            .collect();

        let mut held: HashMap<&str, bool> = HashMap::with_capacity(unique.len());
        for permission in unique {
            let response = self
                .manager
                .fetch_permission_response(&PermissionQuery::admin(user_id, permission))
                .await?;
            held.insert(permission, response.has_permission());
        }

        let satisfied = self
            .groups
            .iter()
            .filter(|group| {
                group
                    .iter()
                    .any(|p| held.get(p.as_str()).copied().unwrap_or(false))
            })
            .count();

        Ok(satisfied > 1)
    }

    /// Conflict state before reconciliation
    pub async fn snapshot(&self, user_id: Uuid) -> BillingResult<bool> {
        self.has_conflict(user_id).await
    }

    /// Recompute and alert if the state differs from `before`. Returns the
    /// new state.
    pub async fn notify_if_changed(&self, user_id: Uuid, before: bool) -> BillingResult<bool> {
        let after = self.has_conflict(user_id).await?;
        if after != before {
            let message = if after {
                format!("User {} now holds conflicting permissions", user_id)
            } else {
                format!("Permission conflict resolved for user {}", user_id)
            };
            tracing::warn!(user_id = %user_id, conflict = after, "Permission conflict state changed");
            self.alerts
                .notify(AlertChannel::PermissionConflict, &message)
                .await;
        }
        Ok(after)
    }
}
