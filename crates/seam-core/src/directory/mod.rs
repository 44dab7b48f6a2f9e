//! Resource Location Directory
//!
//! Cache of resource ownership: `(resource_type, resource_id)` to the
//! `(service_provider, project)` that owns it, persisted in a single
//! SQLite table and fed exclusively by the notification listener. It is a
//! cache, not a source of truth: entries can lag or go missing when
//! lifecycle events are lost, and a miss is a routing signal, never an
//! error. Every operation runs inside a transaction so concurrent readers
//! never observe a partially written row.

pub mod listener;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{FromRow, Pool, Sqlite};
use tracing::info;

use crate::error::{Error, Result};

/// The location of a particular resource.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ResourceMapping {
    pub resource_type: String,
    /// Hyphen-normalized resource id
    pub resource_id: String,
    /// Hyphen-normalized owning project id
    pub project_id: String,
    pub service_provider: String,
}

impl ResourceMapping {
    /// Build a mapping, normalizing both identifiers.
    pub fn new(
        resource_type: impl Into<String>,
        resource_id: &str,
        project_id: &str,
        service_provider: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: normalize_id(resource_id),
            project_id: normalize_id(project_id),
            service_provider: service_provider.into(),
        }
    }
}

/// Identifiers are stored and queried without hyphens so callers may use
/// either representation.
pub fn normalize_id(id: &str) -> String {
    id.replace('-', "")
}

/// SQLite-backed directory store
pub struct Directory {
    pool: Pool<Sqlite>,
}

impl Directory {
    /// Open (or create) the directory database and ensure the schema.
    pub async fn connect(database_url: &str) -> Result<Self> {
        // A private in-memory database lives and dies with its connection,
        // so it must be pinned to exactly one.
        let options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = options.connect(database_url).await?;
        let directory = Self { pool };
        directory.migrate().await?;
        Ok(directory)
    }

    /// Create the mapping table.
    pub async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resource_mapping (
                resource_type TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                service_provider TEXT NOT NULL,
                PRIMARY KEY (resource_type, resource_id)
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Exact-match lookup after normalization. Absence is not an error.
    pub async fn find(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Option<ResourceMapping>> {
        let mut tx = self.pool.begin().await?;
        let mapping: Option<ResourceMapping> = sqlx::query_as(
            "SELECT resource_type, resource_id, project_id, service_provider \
             FROM resource_mapping WHERE resource_type = ? AND resource_id = ?",
        )
        .bind(resource_type)
        .bind(normalize_id(resource_id))
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(mapping)
    }

    /// Insert or replace a mapping.
    pub async fn insert(&self, mapping: &ResourceMapping) -> Result<()> {
        info!(
            resource_type = %mapping.resource_type,
            resource_id = %mapping.resource_id,
            service_provider = %mapping.service_provider,
            "creating resource mapping"
        );
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT OR REPLACE INTO resource_mapping \
             (resource_type, resource_id, project_id, service_provider) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(&mapping.resource_type)
        .bind(&mapping.resource_id)
        .bind(&mapping.project_id)
        .bind(&mapping.service_provider)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Remove a mapping. Deleting an absent row is a no-op: the delete
    /// event may arrive for a resource created before the gateway started
    /// listening.
    pub async fn delete(&self, resource_type: &str, resource_id: &str) -> Result<()> {
        info!(
            resource_type = %resource_type,
            resource_id = %resource_id,
            "deleting resource mapping"
        );
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM resource_mapping WHERE resource_type = ? AND resource_id = ?")
            .bind(resource_type)
            .bind(normalize_id(resource_id))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Change only the owning project of an existing mapping. A transfer
    /// for an unknown resource is an error, not a silent no-op.
    pub async fn update_owner(
        &self,
        resource_type: &str,
        resource_id: &str,
        new_project_id: &str,
    ) -> Result<()> {
        info!(
            resource_type = %resource_type,
            resource_id = %resource_id,
            "moving resource mapping"
        );
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE resource_mapping SET project_id = ? \
             WHERE resource_type = ? AND resource_id = ?",
        )
        .bind(normalize_id(new_project_id))
        .bind(resource_type)
        .bind(normalize_id(resource_id))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        if result.rows_affected() == 0 {
            return Err(Error::MappingNotFound(
                resource_type.to_string(),
                normalize_id(resource_id),
            ));
        }
        Ok(())
    }
}
