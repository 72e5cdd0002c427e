use async_trait::async_trait;
use rusqlite::{OptionalExtension, params};
use std::collections::BTreeMap;

use super::SqliteStore;
use crate::core::error::Result;
use crate::core::ports::{
    ConnectorRecord, ConnectorStore, ModelProviderRecord, ModelProviderStore, VariableStore,
};

/// Where a user-level variable is defined. Narrower scopes win on merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VariableScope {
    Org,
    User,
}

impl VariableScope {
    pub fn as_str(self) -> &'static str {
        match self {
            VariableScope::Org => "org",
            VariableScope::User => "user",
        }
    }
}

fn map_provider(row: &rusqlite::Row<'_>) -> rusqlite::Result<ModelProviderRecord> {
    Ok(ModelProviderRecord {
        user_id: row.get(0)?,
        provider_type: row.get(1)?,
        framework: row.get(2)?,
        is_default: row.get(3)?,
    })
}

#[async_trait]
impl VariableStore for SqliteStore {
    async fn merged_vars(&self, user_id: &str) -> Result<BTreeMap<String, String>> {
        let db = self.db.lock().await;
        // Org rows first so user rows overwrite them.
        let mut stmt = db.prepare(
            "SELECT name, value FROM user_variables WHERE user_id = ?1
             ORDER BY CASE scope WHEN 'org' THEN 0 ELSE 1 END, name",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut vars = BTreeMap::new();
        for row in rows {
            let (name, value) = row?;
            vars.insert(name, value);
        }
        Ok(vars)
    }
}

#[async_trait]
impl ModelProviderStore for SqliteStore {
    async fn get_model_provider(
        &self,
        user_id: &str,
        provider_type: &str,
    ) -> Result<Option<ModelProviderRecord>> {
        let db = self.db.lock().await;
        Ok(db
            .query_row(
                "SELECT user_id, provider_type, framework, is_default FROM model_providers
                 WHERE user_id = ?1 AND provider_type = ?2",
                params![user_id, provider_type],
                map_provider,
            )
            .optional()?)
    }

    async fn get_default_model_provider(
        &self,
        user_id: &str,
        framework: &str,
    ) -> Result<Option<ModelProviderRecord>> {
        let db = self.db.lock().await;
        Ok(db
            .query_row(
                "SELECT user_id, provider_type, framework, is_default FROM model_providers
                 WHERE user_id = ?1 AND framework = ?2 AND is_default = 1
                 LIMIT 1",
                params![user_id, framework],
                map_provider,
            )
            .optional()?)
    }
}

#[async_trait]
impl ConnectorStore for SqliteStore {
    async fn list_connectors(&self, user_id: &str) -> Result<Vec<ConnectorRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT user_id, connector_type, expires_at FROM connectors
             WHERE user_id = ?1 ORDER BY connector_type",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(ConnectorRecord {
                user_id: row.get(0)?,
                connector_type: row.get(1)?,
                expires_at: row.get(2)?,
            })
        })?;
        let mut connectors = Vec::new();
        for row in rows {
            connectors.push(row?);
        }
        Ok(connectors)
    }

    async fn update_connector_expiry(
        &self,
        user_id: &str,
        connector_type: &str,
        expires_at: Option<i64>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE connectors SET expires_at = ?1 WHERE user_id = ?2 AND connector_type = ?3",
            params![expires_at, user_id, connector_type],
        )?;
        Ok(())
    }
}
