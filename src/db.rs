// src/db.rs
//
// Documents live as JSON in TEXT columns, one row per document. Assets carry
// a version column so the quantity check and the transaction append land as
// one guarded write (LWT); everything else is plain upsert.
use crate::error::StoreError;
use crate::models::{Asset, Portfolio, User};
use async_trait::async_trait;
use log::info;
use scylla::frame::response::result::{CqlValue, Row};
use scylla::query::Query;
use scylla::{Session, SessionBuilder};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_user(&self, user: &User) -> Result<(), StoreError>;
    async fn user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    async fn user_by_id(&self, id: &str) -> Result<Option<User>, StoreError>;
    async fn save_user(&self, user: &User) -> Result<(), StoreError>;

    async fn assets_for_user(&self, user_id: &str) -> Result<Vec<Asset>, StoreError>;
    async fn asset_by_id(&self, id: &str) -> Result<Option<(Asset, i64)>, StoreError>;
    async fn asset_for_symbol(
        &self,
        user_id: &str,
        symbol: &str,
    ) -> Result<Option<(Asset, i64)>, StoreError>;
    async fn insert_asset(&self, asset: &Asset) -> Result<(), StoreError>;
    /// Guarded write: applies only when the stored version still matches.
    /// Returns false when another writer got there first.
    async fn update_asset(&self, asset: &Asset, expected_version: i64) -> Result<bool, StoreError>;
    async fn delete_asset(&self, asset: &Asset) -> Result<(), StoreError>;

    async fn portfolio_for_user(&self, user_id: &str) -> Result<Option<Portfolio>, StoreError>;
    async fn save_portfolio(&self, portfolio: &Portfolio) -> Result<(), StoreError>;
}

pub struct ScyllaStore {
    session: Session,
}

impl ScyllaStore {
    pub async fn init(node: &str) -> Result<Self, StoreError> {
        let session = SessionBuilder::new().known_node(node).build().await?;

        session.query("CREATE KEYSPACE IF NOT EXISTS portfolio_tracker WITH REPLICATION = {'class': 'SimpleStrategy', 'replication_factor': 1}", &[]).await?;
        session
            .query(
                "CREATE TABLE IF NOT EXISTS portfolio_tracker.users (id TEXT PRIMARY KEY, doc TEXT)",
                &[],
            )
            .await?;
        session.query("CREATE TABLE IF NOT EXISTS portfolio_tracker.users_by_email (email TEXT PRIMARY KEY, user_id TEXT)", &[]).await?;
        session.query("CREATE TABLE IF NOT EXISTS portfolio_tracker.assets (id TEXT PRIMARY KEY, user_id TEXT, doc TEXT, version BIGINT)", &[]).await?;
        session.query("CREATE TABLE IF NOT EXISTS portfolio_tracker.user_assets (user_id TEXT, asset_id TEXT, PRIMARY KEY (user_id, asset_id))", &[]).await?;
        session.query("CREATE TABLE IF NOT EXISTS portfolio_tracker.portfolios (user_id TEXT PRIMARY KEY, doc TEXT)", &[]).await?;

        info!("Connected to ScyllaDB and ensured schema.");
        Ok(ScyllaStore { session })
    }

    async fn asset_row(&self, id: &str) -> Result<Option<(Asset, i64)>, StoreError> {
        let query = Query::new("SELECT doc, version FROM portfolio_tracker.assets WHERE id = ?");
        let result = self.session.query(query, (id,)).await?;
        let row = match result.rows.and_then(|rows| rows.into_iter().next()) {
            Some(row) => row,
            None => return Ok(None),
        };
        let doc = row_text(&row, 0)?;
        let version = row_bigint(&row, 1)?;
        let asset: Asset = serde_json::from_str(&doc)?;
        Ok(Some((asset, version)))
    }
}

fn row_text(row: &Row, idx: usize) -> Result<String, StoreError> {
    row.columns
        .get(idx)
        .and_then(|col| col.as_ref())
        .and_then(|value| value.as_text())
        .map(|text| text.to_string())
        .ok_or_else(|| StoreError::Corrupt(format!("missing text column {}", idx)))
}

fn row_bigint(row: &Row, idx: usize) -> Result<i64, StoreError> {
    row.columns
        .get(idx)
        .and_then(|col| col.as_ref())
        .and_then(|value| value.as_bigint())
        .ok_or_else(|| StoreError::Corrupt(format!("missing bigint column {}", idx)))
}

fn row_applied(row: &Row) -> bool {
    matches!(
        row.columns.first().and_then(|col| col.as_ref()),
        Some(CqlValue::Boolean(true))
    )
}

#[async_trait]
impl Store for ScyllaStore {
    async fn create_user(&self, user: &User) -> Result<(), StoreError> {
        let doc = serde_json::to_string(user)?;
        let query = Query::new("INSERT INTO portfolio_tracker.users (id, doc) VALUES (?, ?)");
        self.session.query(query, (&user.id, doc)).await?;
        let query = Query::new(
            "INSERT INTO portfolio_tracker.users_by_email (email, user_id) VALUES (?, ?)",
        );
        self.session.query(query, (&user.email, &user.id)).await?;
        Ok(())
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let query =
            Query::new("SELECT user_id FROM portfolio_tracker.users_by_email WHERE email = ?");
        let result = self.session.query(query, (email,)).await?;
        let row = match result.rows.and_then(|rows| rows.into_iter().next()) {
            Some(row) => row,
            None => return Ok(None),
        };
        let user_id = row_text(&row, 0)?;
        self.user_by_id(&user_id).await
    }

    async fn user_by_id(&self, id: &str) -> Result<Option<User>, StoreError> {
        let query = Query::new("SELECT doc FROM portfolio_tracker.users WHERE id = ?");
        let result = self.session.query(query, (id,)).await?;
        let row = match result.rows.and_then(|rows| rows.into_iter().next()) {
            Some(row) => row,
            None => return Ok(None),
        };
        let doc = row_text(&row, 0)?;
        Ok(Some(serde_json::from_str(&doc)?))
    }

    async fn save_user(&self, user: &User) -> Result<(), StoreError> {
        let doc = serde_json::to_string(user)?;
        let query = Query::new("INSERT INTO portfolio_tracker.users (id, doc) VALUES (?, ?)");
        self.session.query(query, (&user.id, doc)).await?;
        Ok(())
    }

    async fn assets_for_user(&self, user_id: &str) -> Result<Vec<Asset>, StoreError> {
        let query =
            Query::new("SELECT asset_id FROM portfolio_tracker.user_assets WHERE user_id = ?");
        let result = self.session.query(query, (user_id,)).await?;
        let mut assets = Vec::new();
        for row in result.rows.unwrap_or_default() {
            let asset_id = row_text(&row, 0)?;
            if let Some((asset, _)) = self.asset_row(&asset_id).await? {
                assets.push(asset);
            }
        }
        Ok(assets)
    }

    async fn asset_by_id(&self, id: &str) -> Result<Option<(Asset, i64)>, StoreError> {
        self.asset_row(id).await
    }

    async fn asset_for_symbol(
        &self,
        user_id: &str,
        symbol: &str,
    ) -> Result<Option<(Asset, i64)>, StoreError> {
        let query =
            Query::new("SELECT asset_id FROM portfolio_tracker.user_assets WHERE user_id = ?");
        let result = self.session.query(query, (user_id,)).await?;
        for row in result.rows.unwrap_or_default() {
            let asset_id = row_text(&row, 0)?;
            if let Some((asset, version)) = self.asset_row(&asset_id).await? {
                if asset.symbol == symbol {
                    return Ok(Some((asset, version)));
                }
            }
        }
        Ok(None)
    }

    async fn insert_asset(&self, asset: &Asset) -> Result<(), StoreError> {
        let doc = serde_json::to_string(asset)?;
        let query = Query::new(
            "INSERT INTO portfolio_tracker.assets (id, user_id, doc, version) VALUES (?, ?, ?, ?)",
        );
        self.session
            .query(query, (&asset.id, &asset.user_id, doc, 1_i64))
            .await?;
        let query = Query::new(
            "INSERT INTO portfolio_tracker.user_assets (user_id, asset_id) VALUES (?, ?)",
        );
        self.session
            .query(query, (&asset.user_id, &asset.id))
            .await?;
        Ok(())
    }

    async fn update_asset(&self, asset: &Asset, expected_version: i64) -> Result<bool, StoreError> {
        let doc = serde_json::to_string(asset)?;
        let query = Query::new(
            "UPDATE portfolio_tracker.assets SET doc = ?, version = ? WHERE id = ? IF version = ?",
        );
        let result = self
            .session
            .query(query, (doc, expected_version + 1, &asset.id, expected_version))
            .await?;
        let applied = result
            .rows
            .and_then(|rows| rows.into_iter().next())
            .map(|row| row_applied(&row))
            .unwrap_or(false);
        Ok(applied)
    }

    async fn delete_asset(&self, asset: &Asset) -> Result<(), StoreError> {
        let query = Query::new("DELETE FROM portfolio_tracker.assets WHERE id = ?");
        self.session.query(query, (&asset.id,)).await?;
        let query = Query::new(
            "DELETE FROM portfolio_tracker.user_assets WHERE user_id = ? AND asset_id = ?",
        );
        self.session
            .query(query, (&asset.user_id, &asset.id))
            .await?;
        Ok(())
    }

    async fn portfolio_for_user(&self, user_id: &str) -> Result<Option<Portfolio>, StoreError> {
        let query = Query::new("SELECT doc FROM portfolio_tracker.portfolios WHERE user_id = ?");
        let result = self.session.query(query, (user_id,)).await?;
        let row = match result.rows.and_then(|rows| rows.into_iter().next()) {
            Some(row) => row,
            None => return Ok(None),
        };
        let doc = row_text(&row, 0)?;
        Ok(Some(serde_json::from_str(&doc)?))
    }

    async fn save_portfolio(&self, portfolio: &Portfolio) -> Result<(), StoreError> {
        let doc = serde_json::to_string(portfolio)?;
        let query =
            Query::new("INSERT INTO portfolio_tracker.portfolios (user_id, doc) VALUES (?, ?)");
        self.session
            .query(query, (&portfolio.user_id, doc))
            .await?;
        Ok(())
    }
}

/// In-memory store with the same versioning semantics as the Scylla one.
/// Backs the route tests and doubles as a no-infrastructure dev mode.
#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<String, User>>,
    emails: RwLock<HashMap<String, String>>,
    assets: RwLock<HashMap<String, (Asset, i64)>>,
    portfolios: RwLock<HashMap<String, Portfolio>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_user(&self, user: &User) -> Result<(), StoreError> {
        self.users
            .write()
            .await
            .insert(user.id.clone(), user.clone());
        self.emails
            .write()
            .await
            .insert(user.email.clone(), user.id.clone());
        Ok(())
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let id = match self.emails.read().await.get(email) {
            Some(id) => id.clone(),
            None => return Ok(None),
        };
        self.user_by_id(&id).await
    }

    async fn user_by_id(&self, id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.users.read().await.get(id).cloned())
    }

    async fn save_user(&self, user: &User) -> Result<(), StoreError> {
        self.users
            .write()
            .await
            .insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn assets_for_user(&self, user_id: &str) -> Result<Vec<Asset>, StoreError> {
        let mut assets: Vec<Asset> = self
            .assets
            .read()
            .await
            .values()
            .filter(|(asset, _)| asset.user_id == user_id)
            .map(|(asset, _)| asset.clone())
            .collect();
        assets.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(assets)
    }

    async fn asset_by_id(&self, id: &str) -> Result<Option<(Asset, i64)>, StoreError> {
        Ok(self.assets.read().await.get(id).cloned())
    }

    async fn asset_for_symbol(
        &self,
        user_id: &str,
        symbol: &str,
    ) -> Result<Option<(Asset, i64)>, StoreError> {
        Ok(self
            .assets
            .read()
            .await
            .values()
            .find(|(asset, _)| asset.user_id == user_id && asset.symbol == symbol)
            .cloned())
    }

    async fn insert_asset(&self, asset: &Asset) -> Result<(), StoreError> {
        self.assets
            .write()
            .await
            .insert(asset.id.clone(), (asset.clone(), 1));
        Ok(())
    }

    async fn update_asset(&self, asset: &Asset, expected_version: i64) -> Result<bool, StoreError> {
        let mut assets = self.assets.write().await;
        match assets.get_mut(&asset.id) {
            Some((stored, version)) if *version == expected_version => {
                *stored = asset.clone();
                *version = expected_version + 1;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    async fn delete_asset(&self, asset: &Asset) -> Result<(), StoreError> {
        self.assets.write().await.remove(&asset.id);
        Ok(())
    }

    async fn portfolio_for_user(&self, user_id: &str) -> Result<Option<Portfolio>, StoreError> {
        Ok(self.portfolios.read().await.get(user_id).cloned())
    }

    async fn save_portfolio(&self, portfolio: &Portfolio) -> Result<(), StoreError> {
        self.portfolios
            .write()
            .await
            .insert(portfolio.user_id.clone(), portfolio.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AssetType;
    use chrono::Utc;

    #[tokio::test]
    async fn memory_store_guards_versions() {
        let store = MemoryStore::new();
        let mut asset = Asset::new("u1", "BTC", "Bitcoin", AssetType::Crypto, 100.0, Utc::now());
        store.insert_asset(&asset).await.unwrap();

        asset.quantity = 2.0;
        assert!(store.update_asset(&asset, 1).await.unwrap());
        // Stale version loses.
        assert!(!store.update_asset(&asset, 1).await.unwrap());
        assert!(store.update_asset(&asset, 2).await.unwrap());

        let (stored, version) = store.asset_by_id(&asset.id).await.unwrap().unwrap();
        assert_eq!(stored.quantity, 2.0);
        assert_eq!(version, 3);
    }

    #[tokio::test]
    async fn memory_store_user_lookup_by_email() {
        let store = MemoryStore::new();
        let user = User::new("Ana", "ana@example.com", "hash".to_string());
        store.create_user(&user).await.unwrap();
        let found = store.user_by_email("ana@example.com").await.unwrap().unwrap();
        assert_eq!(found.id, user.id);
        assert!(store.user_by_email("bob@example.com").await.unwrap().is_none());
    }
}
