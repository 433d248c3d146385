//! Tenant isolation
//!
//! Every tenant owns one SQLite database under `<root>/tenants/`. Callers
//! obtain a `TenantContext` from the registry and pass it explicitly to
//! every operation; nothing switches tenants implicitly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use classif_common::db::{init_database, init_memory_database};
use classif_common::{Error, Result};
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tracing::info;

use crate::meta_schema::MetaInfoSchema;

/// Handle to one tenant's data
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub tenant: String,
    pub db: SqlitePool,
    pub meta_schema: Option<Arc<MetaInfoSchema>>,
}

impl TenantContext {
    pub fn new(tenant: impl Into<String>, db: SqlitePool) -> Self {
        Self {
            tenant: tenant.into(),
            db,
            meta_schema: None,
        }
    }

    pub fn with_meta_schema(mut self, schema: MetaInfoSchema) -> Self {
        self.meta_schema = Some(Arc::new(schema));
        self
    }

    /// Throwaway tenant backed by an in-memory database
    pub async fn in_memory(tenant: impl Into<String>) -> Result<Self> {
        Ok(Self::new(tenant, init_memory_database().await?))
    }

    pub fn meta_schema(&self) -> Option<&MetaInfoSchema> {
        self.meta_schema.as_deref()
    }
}

/// Lazily opened tenant databases rooted at one folder
pub struct TenantRegistry {
    root: PathBuf,
    tenants: RwLock<HashMap<String, TenantContext>>,
}

impl TenantRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            tenants: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn database_path(&self, tenant: &str) -> PathBuf {
        self.root.join("tenants").join(format!("{}.db", tenant))
    }

    pub fn schema_path(&self, tenant: &str) -> PathBuf {
        self.root.join("tenants").join(format!("{}.schema.json", tenant))
    }

    /// Context for `tenant`, opening (and creating) its database on first use
    pub async fn context(&self, tenant: &str) -> Result<TenantContext> {
        validate_tenant_name(tenant)?;

        if let Some(ctx) = self.tenants.read().await.get(tenant) {
            return Ok(ctx.clone());
        }

        let mut tenants = self.tenants.write().await;
        if let Some(ctx) = tenants.get(tenant) {
            return Ok(ctx.clone());
        }

        let db = init_database(&self.database_path(tenant)).await?;
        let mut ctx = TenantContext::new(tenant, db);

        let schema_path = self.schema_path(tenant);
        if schema_path.exists() {
            ctx = ctx.with_meta_schema(MetaInfoSchema::load(&schema_path)?);
            info!(tenant, "Loaded meta_info schema from {}", schema_path.display());
        }

        tenants.insert(tenant.to_string(), ctx.clone());
        Ok(ctx)
    }

    /// Close a tenant's pool and forget it
    pub async fn close(&self, tenant: &str) {
        if let Some(ctx) = self.tenants.write().await.remove(tenant) {
            ctx.db.close().await;
            info!(tenant, "Closed tenant database");
        }
    }

    pub async fn open_tenants(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tenants.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Tenant names become file names: ASCII alphanumerics, `-` and `_` only
pub fn validate_tenant_name(tenant: &str) -> Result<()> {
    let valid = !tenant.is_empty()
        && tenant.len() <= 64
        && tenant
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("Invalid tenant name '{}'", tenant)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_tenant_name_validation() {
        assert!(validate_tenant_name("fab-7_east").is_ok());
        assert!(validate_tenant_name("").is_err());
        assert!(validate_tenant_name("../etc").is_err());
        assert!(validate_tenant_name("a b").is_err());
    }

    #[tokio::test]
    async fn test_context_is_opened_once_and_isolated() {
        let temp = TempDir::new().unwrap();
        let registry = TenantRegistry::new(temp.path());

        let a = registry.context("alpha").await.unwrap();
        sqlx::query("INSERT INTO defects (name, code) VALUES ('Scratch', 'SCR')")
            .execute(&a.db)
            .await
            .unwrap();

        let b = registry.context("beta").await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM defects")
            .fetch_one(&b.db)
            .await
            .unwrap();
        assert_eq!(count, 0);

        assert!(registry.database_path("alpha").exists());
        assert_eq!(registry.open_tenants().await, vec!["alpha", "beta"]);

        registry.close("alpha").await;
        assert_eq!(registry.open_tenants().await, vec!["beta"]);
    }

    #[tokio::test]
    async fn test_schema_file_is_attached() {
        let temp = TempDir::new().unwrap();
        let registry = TenantRegistry::new(temp.path());
        std::fs::create_dir_all(temp.path().join("tenants")).unwrap();
        std::fs::write(
            registry.schema_path("gamma"),
            r#"{"fields": [{"field_name": "LotId", "type": "string", "required": true}]}"#,
        )
        .unwrap();

        let ctx = registry.context("gamma").await.unwrap();
        assert_eq!(ctx.meta_schema().unwrap().fields.len(), 1);
    }
}
