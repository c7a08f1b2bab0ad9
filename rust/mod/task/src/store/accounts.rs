use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use autopilot_core::{now_rfc3339, ServiceError};
use autopilot_sql::{Row, SQLStore};

use super::{json_err, storage_err};
use crate::model::{AccountGroup, AccountGroupItem, ResourceKind};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS account_groups (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS account_group_items (
    id              TEXT PRIMARY KEY,
    group_id        TEXT NOT NULL,
    social_id       TEXT,
    email_id        TEXT,
    wallet_id       TEXT,
    proxy_id        TEXT,
    fingerprint_id  TEXT,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_account_item_group ON account_group_items(group_id);
CREATE TABLE IF NOT EXISTS account_resources (
    kind        TEXT NOT NULL,
    id          TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    data        TEXT NOT NULL,
    PRIMARY KEY (kind, id)
);
";

/// Read access to account groups, their items and the linked resources.
///
/// The engine only reads; the write methods exist for the credential
/// management layer and for seeding.
pub struct AccountStore {
    db: Arc<dyn SQLStore>,
}

impl AccountStore {
    pub fn new(db: Arc<dyn SQLStore>) -> Result<Self, ServiceError> {
        db.exec_batch(SCHEMA)
            .map_err(|e| ServiceError::Storage(format!("account schema init: {e}")))?;
        Ok(Self { db })
    }

    // -----------------------------------------------------------------------
    // Groups
    // -----------------------------------------------------------------------

    pub fn create_group(&self, group: &AccountGroup) -> Result<(), ServiceError> {
        self.db
            .exec(
                "INSERT INTO account_groups (id, name, user_id, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                &[
                    group.id.clone().into(),
                    group.name.clone().into(),
                    group.user_id.clone().into(),
                    group.created_at.clone().into(),
                ],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    pub fn get_group(&self, id: &str) -> Result<AccountGroup, ServiceError> {
        let rows = self
            .db
            .query(
                "SELECT id, name, user_id, created_at FROM account_groups WHERE id = ?1",
                &[id.into()],
            )
            .map_err(storage_err)?;
        let row = rows
            .first()
            .ok_or_else(|| ServiceError::NotFound(format!("account group {id}")))?;

        let text = |name: &str| {
            row.get_string(name)
                .ok_or_else(|| ServiceError::Storage(format!("account group: missing {name}")))
        };
        Ok(AccountGroup {
            id: text("id")?,
            name: text("name")?,
            user_id: text("user_id")?,
            created_at: text("created_at")?,
        })
    }

    // -----------------------------------------------------------------------
    // Items
    // -----------------------------------------------------------------------

    pub fn create_item(&self, item: &AccountGroupItem) -> Result<(), ServiceError> {
        self.db
            .exec(
                "INSERT INTO account_group_items \
                 (id, group_id, social_id, email_id, wallet_id, proxy_id, fingerprint_id, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                &[
                    item.id.clone().into(),
                    item.group_id.clone().into(),
                    item.social_id.clone().into(),
                    item.email_id.clone().into(),
                    item.wallet_id.clone().into(),
                    item.proxy_id.clone().into(),
                    item.fingerprint_id.clone().into(),
                    now_rfc3339().into(),
                ],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    /// Items of a group in insertion order.
    pub fn items_in_group(&self, group_id: &str) -> Result<Vec<AccountGroupItem>, ServiceError> {
        let rows = self
            .db
            .query(
                "SELECT id, group_id, social_id, email_id, wallet_id, proxy_id, fingerprint_id \
                 FROM account_group_items WHERE group_id = ?1 \
                 ORDER BY created_at ASC, rowid ASC",
                &[group_id.into()],
            )
            .map_err(storage_err)?;
        rows.iter().map(row_to_item).collect()
    }

    // -----------------------------------------------------------------------
    // Resources
    // -----------------------------------------------------------------------

    /// Insert or replace a resource record. Secret fields are expected to
    /// be ciphertext already.
    pub fn put_resource<T: Serialize>(
        &self,
        kind: ResourceKind,
        id: &str,
        user_id: &str,
        resource: &T,
    ) -> Result<(), ServiceError> {
        let data =
            serde_json::to_string(resource).map_err(|e| ServiceError::Internal(e.to_string()))?;
        self.db
            .exec(
                "INSERT OR REPLACE INTO account_resources (kind, id, user_id, data) \
                 VALUES (?1, ?2, ?3, ?4)",
                &[kind.as_str().into(), id.into(), user_id.into(), data.into()],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    /// Load a resource owned by `user_id`. Someone else's resource reads
    /// as missing.
    pub fn get_resource<T: DeserializeOwned>(
        &self,
        kind: ResourceKind,
        id: &str,
        user_id: &str,
    ) -> Result<T, ServiceError> {
        let rows = self
            .db
            .query(
                "SELECT data FROM account_resources WHERE kind = ?1 AND id = ?2 AND user_id = ?3",
                &[kind.as_str().into(), id.into(), user_id.into()],
            )
            .map_err(storage_err)?;
        let data = rows
            .first()
            .and_then(|r| r.get_str("data"))
            .ok_or_else(|| ServiceError::NotFound(format!("{kind} {id}")))?;
        serde_json::from_str(data).map_err(json_err)
    }
}

fn row_to_item(row: &Row) -> Result<AccountGroupItem, ServiceError> {
    Ok(AccountGroupItem {
        id: row
            .get_string("id")
            .ok_or_else(|| ServiceError::Storage("account item: missing id".into()))?,
        group_id: row
            .get_string("group_id")
            .ok_or_else(|| ServiceError::Storage("account item: missing group_id".into()))?,
        social_id: row.get_string("social_id"),
        email_id: row.get_string("email_id"),
        wallet_id: row.get_string("wallet_id"),
        proxy_id: row.get_string("proxy_id"),
        fingerprint_id: row.get_string("fingerprint_id"),
    })
}
