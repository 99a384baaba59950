// src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    Stock,
    Crypto,
    Bond,
    Etf,
    // Absorbs anything we don't recognize so composition math never fails.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionKind {
    Buy,
    Sell,
    TransferIn,
    TransferOut,
    StakingReward,
}

impl TransactionKind {
    /// Sells and outbound transfers remove units from the holding.
    pub fn is_outflow(self) -> bool {
        matches!(self, TransactionKind::Sell | TransactionKind::TransferOut)
    }

    /// Quantity delta this transaction applies to its asset.
    pub fn signed_quantity(self, quantity: f64) -> f64 {
        if self.is_outflow() {
            -quantity
        } else {
            quantity
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    pub quantity: f64,
    pub price: f64,
    pub date: DateTime<Utc>,
    pub total: f64,
    #[serde(default)]
    pub notes: Option<String>,
}

impl Transaction {
    pub fn new(
        kind: TransactionKind,
        quantity: f64,
        price: f64,
        date: DateTime<Utc>,
        total: Option<f64>,
    ) -> Self {
        Transaction {
            id: Uuid::new_v4().to_string(),
            kind,
            quantity,
            price,
            date,
            total: total.unwrap_or(quantity * price),
            notes: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub id: String,
    pub user_id: String,
    pub symbol: String,
    pub name: String,
    #[serde(rename = "type")]
    pub asset_type: AssetType,
    pub quantity: f64,
    pub purchase_price: f64,
    pub purchase_date: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Newest first.
    #[serde(default)]
    pub transactions: Vec<Transaction>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Asset {
    pub fn new(
        user_id: &str,
        symbol: &str,
        name: &str,
        asset_type: AssetType,
        purchase_price: f64,
        purchase_date: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Asset {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            symbol: normalize_symbol(symbol),
            name: name.to_string(),
            asset_type,
            quantity: 0.0,
            purchase_price,
            purchase_date,
            notes: None,
            tags: Vec::new(),
            transactions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Price used when no live quote is available: the most recent
    /// transaction price, then the reference purchase price.
    pub fn fallback_price(&self) -> f64 {
        self.transactions
            .first()
            .map(|t| t.price)
            .unwrap_or(self.purchase_price)
    }
}

pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchlistEntry {
    pub symbol: String,
    #[serde(rename = "type")]
    pub asset_type: String,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSettings {
    pub currency: String,
    pub theme: String,
    pub notifications: bool,
}

impl Default for ProfileSettings {
    fn default() -> Self {
        ProfileSettings {
            currency: "USD".to_string(),
            theme: "Light".to_string(),
            notifications: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    #[serde(default)]
    pub watchlist: Vec<WatchlistEntry>,
    #[serde(default)]
    pub profile_settings: ProfileSettings,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(name: &str, email: &str, password_hash: String) -> Self {
        User {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            email: email.trim().to_lowercase(),
            password_hash,
            watchlist: Vec::new(),
            profile_settings: ProfileSettings::default(),
            created_at: Utc::now(),
        }
    }

    /// Response shape for profile endpoints. The credential hash stays in the
    /// stored document and never leaves the server.
    pub fn view(&self) -> UserView {
        UserView {
            id: self.id.clone(),
            name: self.name.clone(),
            email: self.email.clone(),
            watchlist: self.watchlist.clone(),
            profile_settings: self.profile_settings.clone(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: String,
    pub name: String,
    pub email: String,
    pub watchlist: Vec<WatchlistEntry>,
    pub profile_settings: ProfileSettings,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Composition {
    #[serde(default)]
    pub stocks: f64,
    #[serde(default)]
    pub crypto: f64,
    #[serde(default)]
    pub bonds: f64,
    #[serde(default)]
    pub etfs: f64,
    #[serde(default)]
    pub other: f64,
}

impl Composition {
    pub fn bucket_mut(&mut self, asset_type: AssetType) -> &mut f64 {
        match asset_type {
            AssetType::Stock => &mut self.stocks,
            AssetType::Crypto => &mut self.crypto,
            AssetType::Bond => &mut self.bonds,
            AssetType::Etf => &mut self.etfs,
            AssetType::Other => &mut self.other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPoint {
    pub date: DateTime<Utc>,
    pub total_value: f64,
    pub composition: Composition,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Performance {
    pub daily_change: f64,
    pub weekly_change: f64,
    pub monthly_change: f64,
    pub yearly_change: f64,
    pub total_change: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Portfolio {
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Chronological, oldest first.
    #[serde(default)]
    pub history: Vec<HistoryPoint>,
    #[serde(default)]
    pub performance: Performance,
    pub updated_at: DateTime<Utc>,
}

impl Portfolio {
    pub fn new(user_id: &str) -> Self {
        Portfolio {
            user_id: user_id.to_string(),
            name: "My Portfolio".to_string(),
            description: None,
            history: Vec::new(),
            performance: Performance::default(),
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_kinds_serialize_as_kebab_case() {
        let json = serde_json::to_string(&TransactionKind::StakingReward).unwrap();
        assert_eq!(json, "\"staking-reward\"");
        let parsed: TransactionKind = serde_json::from_str("\"transfer-out\"").unwrap();
        assert_eq!(parsed, TransactionKind::TransferOut);
    }

    #[test]
    fn unknown_asset_type_falls_into_other() {
        let parsed: AssetType = serde_json::from_str("\"commodity\"").unwrap();
        assert_eq!(parsed, AssetType::Other);
    }

    #[test]
    fn signed_quantity_matches_kind() {
        assert_eq!(TransactionKind::Buy.signed_quantity(2.0), 2.0);
        assert_eq!(TransactionKind::Sell.signed_quantity(2.0), -2.0);
        assert_eq!(TransactionKind::TransferIn.signed_quantity(1.5), 1.5);
        assert_eq!(TransactionKind::TransferOut.signed_quantity(1.5), -1.5);
        assert_eq!(TransactionKind::StakingReward.signed_quantity(0.1), 0.1);
    }

    #[test]
    fn transaction_total_defaults_to_quantity_times_price() {
        let tx = Transaction::new(TransactionKind::Buy, 2.0, 10.0, Utc::now(), None);
        assert_eq!(tx.total, 20.0);
        let tx = Transaction::new(TransactionKind::Buy, 2.0, 10.0, Utc::now(), Some(19.5));
        assert_eq!(tx.total, 19.5);
    }

    #[test]
    fn fallback_price_prefers_latest_transaction() {
        let mut asset = Asset::new("u1", "aapl", "Apple", AssetType::Stock, 100.0, Utc::now());
        assert_eq!(asset.symbol, "AAPL");
        assert_eq!(asset.fallback_price(), 100.0);
        asset.transactions.insert(
            0,
            Transaction::new(TransactionKind::Buy, 1.0, 120.0, Utc::now(), None),
        );
        assert_eq!(asset.fallback_price(), 120.0);
    }

    #[test]
    fn user_view_has_no_credential_hash() {
        let user = User::new("Ana", " Ana@Example.COM ", "hash".to_string());
        assert_eq!(user.email, "ana@example.com");
        let json = serde_json::to_value(user.view()).unwrap();
        assert!(json.get("passwordHash").is_none());
    }
}
