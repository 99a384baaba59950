// src/api.rs
use crate::auth;
use crate::config::Config;
use crate::db::Store;
use crate::error::{handle_rejection, reject, ApiError, StoreError};
use crate::market::{self, MarketDataGateway};
use crate::models::{
    normalize_symbol, Asset, AssetType, Portfolio, Transaction, TransactionKind, WatchlistEntry,
};
use crate::portfolio::{self, Valuation};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

// Guarded asset writes are retried this many times before giving up.
const UPDATE_RETRIES: usize = 3;

// Tolerance for float drift when a sell empties a holding.
const QUANTITY_EPSILON: f64 = 1e-9;

pub fn routes(
    store: Arc<dyn Store>,
    market: Arc<MarketDataGateway>,
    config: Arc<Config>,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let secret = config.jwt_secret.clone();
    user_routes(store.clone(), config, secret.clone())
        .or(asset_routes(store.clone(), market.clone(), secret.clone()))
        .or(transaction_routes(store.clone(), market.clone(), secret.clone()))
        .or(portfolio_routes(store, market.clone(), secret.clone()))
        .or(market_routes(market, secret))
        .recover(handle_rejection)
}

fn with_store(
    store: Arc<dyn Store>,
) -> impl Filter<Extract = (Arc<dyn Store>,), Error = Infallible> + Clone {
    warp::any().map(move || store.clone())
}

fn with_market(
    market: Arc<MarketDataGateway>,
) -> impl Filter<Extract = (Arc<MarketDataGateway>,), Error = Infallible> + Clone {
    warp::any().map(move || market.clone())
}

fn with_config(
    config: Arc<Config>,
) -> impl Filter<Extract = (Arc<Config>,), Error = Infallible> + Clone {
    warp::any().map(move || config.clone())
}

fn db_err(e: StoreError) -> Rejection {
    reject(e.into())
}

// --- users ---

#[derive(Deserialize)]
struct RegisterRequest {
    name: String,
    email: String,
    password: String,
}

#[derive(Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchlistRequest {
    action: String,
    symbol: String,
    #[serde(rename = "type")]
    asset_type: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileSettingsPatch {
    currency: Option<String>,
    theme: Option<String>,
    notifications: Option<bool>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileUpdateRequest {
    name: Option<String>,
    profile_settings: Option<ProfileSettingsPatch>,
}

fn user_routes(
    store: Arc<dyn Store>,
    config: Arc<Config>,
    secret: String,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let register = warp::path!("api" / "users" / "register")
        .and(warp::post())
        .and(with_store(store.clone()))
        .and(with_config(config.clone()))
        .and(warp::body::json())
        .and_then(register_handler);

    let login = warp::path!("api" / "users" / "login")
        .and(warp::post())
        .and(with_store(store.clone()))
        .and(with_config(config))
        .and(warp::body::json())
        .and_then(login_handler);

    let me = warp::path!("api" / "users" / "me")
        .and(warp::get())
        .and(auth::with_auth(secret.clone()))
        .and(with_store(store.clone()))
        .and_then(me_handler);

    let watchlist = warp::path!("api" / "users" / "watchlist")
        .and(warp::put())
        .and(auth::with_auth(secret.clone()))
        .and(with_store(store.clone()))
        .and(warp::body::json())
        .and_then(watchlist_handler);

    let profile = warp::path!("api" / "users" / "profile")
        .and(warp::put())
        .and(auth::with_auth(secret))
        .and(with_store(store))
        .and(warp::body::json())
        .and_then(profile_handler);

    register.or(login).or(me).or(watchlist).or(profile)
}

async fn register_handler(
    store: Arc<dyn Store>,
    config: Arc<Config>,
    body: RegisterRequest,
) -> Result<impl Reply, Rejection> {
    if body.name.trim().is_empty() {
        return Err(reject(ApiError::Validation("Name is required".into())));
    }
    if !body.email.contains('@') {
        return Err(reject(ApiError::Validation(
            "Please include a valid email".into(),
        )));
    }
    if body.password.len() < 6 {
        return Err(reject(ApiError::Validation(
            "Please enter a password with 6 or more characters".into(),
        )));
    }

    let email = body.email.trim().to_lowercase();
    if store.user_by_email(&email).await.map_err(db_err)?.is_some() {
        return Err(reject(ApiError::Validation("User already exists".into())));
    }

    let hash = auth::hash_password(&body.password).map_err(reject)?;
    let user = crate::models::User::new(body.name.trim(), &email, hash);
    store.create_user(&user).await.map_err(db_err)?;

    let token = auth::create_token(&user.id, &config.jwt_secret).map_err(reject)?;
    info!("Registered user {}", user.email);
    Ok(warp::reply::json(&json!({ "token": token })))
}

async fn login_handler(
    store: Arc<dyn Store>,
    config: Arc<Config>,
    body: LoginRequest,
) -> Result<impl Reply, Rejection> {
    let email = body.email.trim().to_lowercase();
    let user = store
        .user_by_email(&email)
        .await
        .map_err(db_err)?
        .ok_or_else(|| reject(ApiError::Validation("Invalid credentials".into())))?;

    if !auth::verify_password(&body.password, &user.password_hash) {
        return Err(reject(ApiError::Validation("Invalid credentials".into())));
    }

    let token = auth::create_token(&user.id, &config.jwt_secret).map_err(reject)?;
    info!("User {} logged in", user.email);
    Ok(warp::reply::json(&json!({ "token": token })))
}

async fn me_handler(user_id: String, store: Arc<dyn Store>) -> Result<impl Reply, Rejection> {
    let user = store
        .user_by_id(&user_id)
        .await
        .map_err(db_err)?
        .ok_or_else(|| reject(ApiError::NotFound("User")))?;
    Ok(warp::reply::json(&user.view()))
}

async fn watchlist_handler(
    user_id: String,
    store: Arc<dyn Store>,
    body: WatchlistRequest,
) -> Result<impl Reply, Rejection> {
    if body.symbol.trim().is_empty() {
        return Err(reject(ApiError::Validation(
            "Action and symbol are required".into(),
        )));
    }

    let mut user = store
        .user_by_id(&user_id)
        .await
        .map_err(db_err)?
        .ok_or_else(|| reject(ApiError::NotFound("User")))?;

    let symbol = normalize_symbol(&body.symbol);
    match body.action.as_str() {
        "add" => {
            if user.watchlist.iter().any(|entry| entry.symbol == symbol) {
                return Err(reject(ApiError::Validation(
                    "Symbol already in watchlist".into(),
                )));
            }
            user.watchlist.push(WatchlistEntry {
                symbol,
                asset_type: body.asset_type.unwrap_or_else(|| "unknown".to_string()),
                added_at: Utc::now(),
            });
        }
        "remove" => {
            user.watchlist.retain(|entry| entry.symbol != symbol);
        }
        _ => return Err(reject(ApiError::Validation("Invalid action".into()))),
    }

    store.save_user(&user).await.map_err(db_err)?;
    Ok(warp::reply::json(&user.watchlist))
}

async fn profile_handler(
    user_id: String,
    store: Arc<dyn Store>,
    body: ProfileUpdateRequest,
) -> Result<impl Reply, Rejection> {
    let mut user = store
        .user_by_id(&user_id)
        .await
        .map_err(db_err)?
        .ok_or_else(|| reject(ApiError::NotFound("User")))?;

    if let Some(name) = body.name {
        if !name.trim().is_empty() {
            user.name = name.trim().to_string();
        }
    }
    if let Some(patch) = body.profile_settings {
        if let Some(currency) = patch.currency {
            user.profile_settings.currency = currency;
        }
        if let Some(theme) = patch.theme {
            user.profile_settings.theme = theme;
        }
        if let Some(notifications) = patch.notifications {
            user.profile_settings.notifications = notifications;
        }
    }

    store.save_user(&user).await.map_err(db_err)?;
    Ok(warp::reply::json(&user.view()))
}

// --- assets ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateAssetRequest {
    symbol: String,
    name: String,
    #[serde(rename = "type")]
    asset_type: AssetType,
    quantity: f64,
    purchase_price: f64,
    purchase_date: Option<DateTime<Utc>>,
    notes: Option<String>,
    tags: Option<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateAssetRequest {
    name: Option<String>,
    #[serde(rename = "type")]
    asset_type: Option<AssetType>,
    purchase_price: Option<f64>,
    purchase_date: Option<DateTime<Utc>>,
    notes: Option<String>,
    tags: Option<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssetTransactionRequest {
    #[serde(rename = "type")]
    kind: TransactionKind,
    quantity: f64,
    price: f64,
    date: Option<DateTime<Utc>>,
    total: Option<f64>,
}

fn asset_routes(
    store: Arc<dyn Store>,
    market: Arc<MarketDataGateway>,
    secret: String,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let list = warp::path!("api" / "assets")
        .and(warp::get())
        .and(auth::with_auth(secret.clone()))
        .and(with_store(store.clone()))
        .and_then(list_assets_handler);

    let get = warp::path!("api" / "assets" / String)
        .and(warp::get())
        .and(auth::with_auth(secret.clone()))
        .and(with_store(store.clone()))
        .and_then(get_asset_handler);

    let create = warp::path!("api" / "assets")
        .and(warp::post())
        .and(auth::with_auth(secret.clone()))
        .and(with_store(store.clone()))
        .and(warp::body::json())
        .and_then(create_asset_handler);

    let update = warp::path!("api" / "assets" / String)
        .and(warp::put())
        .and(auth::with_auth(secret.clone()))
        .and(with_store(store.clone()))
        .and(warp::body::json())
        .and_then(update_asset_handler);

    let delete = warp::path!("api" / "assets" / String)
        .and(warp::delete())
        .and(auth::with_auth(secret.clone()))
        .and(with_store(store.clone()))
        .and_then(delete_asset_handler);

    let transact = warp::path!("api" / "assets" / String / "transaction")
        .and(warp::post())
        .and(auth::with_auth(secret))
        .and(with_store(store))
        .and(with_market(market))
        .and(warp::body::json())
        .and_then(asset_transaction_handler);

    list.or(get).or(create).or(update).or(delete).or(transact)
}

async fn list_assets_handler(
    user_id: String,
    store: Arc<dyn Store>,
) -> Result<impl Reply, Rejection> {
    let assets = store.assets_for_user(&user_id).await.map_err(db_err)?;
    Ok(warp::reply::json(&assets))
}

async fn owned_asset(
    store: &dyn Store,
    asset_id: &str,
    user_id: &str,
) -> Result<(Asset, i64), ApiError> {
    let (asset, version) = store
        .asset_by_id(asset_id)
        .await?
        .ok_or(ApiError::NotFound("Asset"))?;
    if asset.user_id != user_id {
        return Err(ApiError::Forbidden);
    }
    Ok((asset, version))
}

async fn get_asset_handler(
    asset_id: String,
    user_id: String,
    store: Arc<dyn Store>,
) -> Result<impl Reply, Rejection> {
    let (asset, _) = owned_asset(store.as_ref(), &asset_id, &user_id)
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&asset))
}

async fn create_asset_handler(
    user_id: String,
    store: Arc<dyn Store>,
    body: CreateAssetRequest,
) -> Result<impl Reply, Rejection> {
    validate_amounts(body.quantity, body.purchase_price).map_err(reject)?;

    let purchase_date = body.purchase_date.unwrap_or_else(Utc::now);
    let mut asset = Asset::new(
        &user_id,
        &body.symbol,
        &body.name,
        body.asset_type,
        body.purchase_price,
        purchase_date,
    );
    asset.notes = body.notes;
    asset.tags = body.tags.unwrap_or_default();

    let initial = Transaction::new(
        TransactionKind::Buy,
        body.quantity,
        body.purchase_price,
        purchase_date,
        None,
    );
    apply_transaction(&mut asset, &initial).map_err(reject)?;
    store.insert_asset(&asset).await.map_err(db_err)?;

    info!("Created asset {} for user {}", asset.symbol, user_id);
    Ok(warp::reply::with_status(
        warp::reply::json(&asset),
        StatusCode::CREATED,
    ))
}

async fn update_asset_handler(
    asset_id: String,
    user_id: String,
    store: Arc<dyn Store>,
    body: UpdateAssetRequest,
) -> Result<impl Reply, Rejection> {
    if let Some(price) = body.purchase_price {
        if price < 0.0 || !price.is_finite() {
            return Err(reject(ApiError::Validation(
                "Price must not be negative".into(),
            )));
        }
    }

    for _ in 0..UPDATE_RETRIES {
        let (mut asset, version) = owned_asset(store.as_ref(), &asset_id, &user_id)
            .await
            .map_err(reject)?;

        if let Some(name) = &body.name {
            asset.name = name.clone();
        }
        if let Some(asset_type) = body.asset_type {
            asset.asset_type = asset_type;
        }
        if let Some(price) = body.purchase_price {
            asset.purchase_price = price;
        }
        if let Some(date) = body.purchase_date {
            asset.purchase_date = date;
        }
        if let Some(notes) = &body.notes {
            asset.notes = Some(notes.clone());
        }
        if let Some(tags) = &body.tags {
            asset.tags = tags.clone();
        }
        asset.updated_at = Utc::now();

        if store.update_asset(&asset, version).await.map_err(db_err)? {
            return Ok(warp::reply::json(&asset));
        }
    }
    Err(reject(ApiError::Persistence(StoreError::Contended)))
}

async fn delete_asset_handler(
    asset_id: String,
    user_id: String,
    store: Arc<dyn Store>,
) -> Result<impl Reply, Rejection> {
    let (asset, _) = owned_asset(store.as_ref(), &asset_id, &user_id)
        .await
        .map_err(reject)?;
    store.delete_asset(&asset).await.map_err(db_err)?;
    info!("Deleted asset {} for user {}", asset.symbol, user_id);
    Ok(warp::reply::json(&json!({ "msg": "Asset removed" })))
}

async fn asset_transaction_handler(
    asset_id: String,
    user_id: String,
    store: Arc<dyn Store>,
    market: Arc<MarketDataGateway>,
    body: AssetTransactionRequest,
) -> Result<impl Reply, Rejection> {
    validate_amounts(body.quantity, body.price).map_err(reject)?;
    let date = body.date.unwrap_or_else(Utc::now);

    let asset = {
        let mut result = None;
        for _ in 0..UPDATE_RETRIES {
            let (mut asset, version) = owned_asset(store.as_ref(), &asset_id, &user_id)
                .await
                .map_err(reject)?;
            let tx = Transaction::new(body.kind, body.quantity, body.price, date, body.total);
            apply_transaction(&mut asset, &tx).map_err(reject)?;
            if store.update_asset(&asset, version).await.map_err(db_err)? {
                result = Some(asset);
                break;
            }
        }
        result.ok_or_else(|| reject(ApiError::Persistence(StoreError::Contended)))?
    };

    let history_stale = refresh_portfolio(store.as_ref(), market.as_ref(), &user_id)
        .await
        .is_err();
    if history_stale {
        warn!("Portfolio refresh failed after transaction for user {}", user_id);
    }

    Ok(warp::reply::json(&json!({
        "asset": asset,
        "historyStale": history_stale,
    })))
}

// --- transactions ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordTransactionRequest {
    symbol: String,
    name: Option<String>,
    #[serde(rename = "type")]
    kind: TransactionKind,
    amount: f64,
    price: f64,
    total_value: Option<f64>,
    date: Option<DateTime<Utc>>,
    asset_type: Option<AssetType>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TransactionRecord {
    #[serde(flatten)]
    transaction: Transaction,
    symbol: String,
    name: String,
    asset_id: String,
}

fn transaction_routes(
    store: Arc<dyn Store>,
    market: Arc<MarketDataGateway>,
    secret: String,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let record = warp::path!("api" / "portfolio" / "transactions")
        .and(warp::post())
        .and(auth::with_auth(secret.clone()))
        .and(with_store(store.clone()))
        .and(with_market(market.clone()))
        .and(warp::body::json())
        .and_then(record_transaction_handler);

    let list = warp::path!("api" / "portfolio" / "transactions")
        .and(warp::get())
        .and(auth::with_auth(secret.clone()))
        .and(with_store(store.clone()))
        .and_then(list_transactions_handler);

    let holdings = warp::path!("api" / "portfolio" / "holdings" / String)
        .and(warp::get())
        .and(auth::with_auth(secret.clone()))
        .and(with_store(store.clone()))
        .and_then(holdings_handler);

    let delete = warp::path!("api" / "portfolio" / "transactions" / String / String)
        .and(warp::delete())
        .and(auth::with_auth(secret))
        .and(with_store(store))
        .and(with_market(market))
        .and_then(delete_transaction_handler);

    record.or(list).or(holdings).or(delete)
}

/// Applies the quantity delta and prepends the transaction. Rejections happen
/// before any mutation so a failed sell leaves the asset untouched.
fn apply_transaction(asset: &mut Asset, tx: &Transaction) -> Result<(), ApiError> {
    let next = asset.quantity + tx.kind.signed_quantity(tx.quantity);
    if next < -QUANTITY_EPSILON {
        return Err(ApiError::InsufficientBalance);
    }
    // Repeated fractional buys accumulate binary drift; a full sell must
    // land on exactly zero.
    asset.quantity = if next.abs() < QUANTITY_EPSILON { 0.0 } else { next };
    asset.transactions.insert(0, tx.clone());
    asset.updated_at = Utc::now();
    Ok(())
}

fn validate_amounts(quantity: f64, price: f64) -> Result<(), ApiError> {
    if !quantity.is_finite() || quantity <= 0.0 {
        return Err(ApiError::Validation(
            "Quantity must be greater than zero".into(),
        ));
    }
    if !price.is_finite() || price < 0.0 {
        return Err(ApiError::Validation("Price must not be negative".into()));
    }
    Ok(())
}

async fn record_transaction_handler(
    user_id: String,
    store: Arc<dyn Store>,
    market: Arc<MarketDataGateway>,
    body: RecordTransactionRequest,
) -> Result<impl Reply, Rejection> {
    if body.symbol.trim().is_empty() {
        return Err(reject(ApiError::Validation(
            "Please provide all required fields".into(),
        )));
    }
    validate_amounts(body.amount, body.price).map_err(reject)?;

    let symbol = normalize_symbol(&body.symbol);
    let date = body.date.unwrap_or_else(Utc::now);

    let mut outcome = None;
    for _ in 0..UPDATE_RETRIES {
        match store
            .asset_for_symbol(&user_id, &symbol)
            .await
            .map_err(db_err)?
        {
            Some((mut asset, version)) => {
                let tx =
                    Transaction::new(body.kind, body.amount, body.price, date, body.total_value);
                apply_transaction(&mut asset, &tx).map_err(reject)?;
                if store.update_asset(&asset, version).await.map_err(db_err)? {
                    outcome = Some((asset, tx));
                    break;
                }
            }
            None => {
                // Nothing held yet: an outflow has no balance to draw from.
                if body.kind.is_outflow() {
                    return Err(reject(ApiError::InsufficientBalance));
                }
                let asset_type = body.asset_type.unwrap_or(if market::is_crypto_like(&symbol) {
                    AssetType::Crypto
                } else {
                    AssetType::Stock
                });
                let name = body.name.clone().unwrap_or_else(|| symbol.clone());
                let mut asset =
                    Asset::new(&user_id, &symbol, &name, asset_type, body.price, date);
                let tx =
                    Transaction::new(body.kind, body.amount, body.price, date, body.total_value);
                apply_transaction(&mut asset, &tx).map_err(reject)?;
                store.insert_asset(&asset).await.map_err(db_err)?;
                outcome = Some((asset, tx));
                break;
            }
        }
    }
    let (asset, tx) =
        outcome.ok_or_else(|| reject(ApiError::Persistence(StoreError::Contended)))?;

    let history_stale = refresh_portfolio(store.as_ref(), market.as_ref(), &user_id)
        .await
        .is_err();
    if history_stale {
        warn!("Portfolio refresh failed after transaction for user {}", user_id);
    }
    info!("Recorded {:?} of {} for user {}", tx.kind, symbol, user_id);

    Ok(warp::reply::json(&json!({
        "success": true,
        "asset": asset,
        "transaction": tx,
        "historyStale": history_stale,
    })))
}

async fn list_transactions_handler(
    user_id: String,
    store: Arc<dyn Store>,
) -> Result<impl Reply, Rejection> {
    let assets = store.assets_for_user(&user_id).await.map_err(db_err)?;

    let mut records: Vec<TransactionRecord> = assets
        .iter()
        .flat_map(|asset| {
            asset.transactions.iter().map(move |tx| TransactionRecord {
                transaction: tx.clone(),
                symbol: asset.symbol.clone(),
                name: asset.name.clone(),
                asset_id: asset.id.clone(),
            })
        })
        .collect();
    records.sort_by(|a, b| b.transaction.date.cmp(&a.transaction.date));

    Ok(warp::reply::json(&records))
}

async fn holdings_handler(
    symbol: String,
    user_id: String,
    store: Arc<dyn Store>,
) -> Result<impl Reply, Rejection> {
    let symbol = normalize_symbol(&symbol);
    match store
        .asset_for_symbol(&user_id, &symbol)
        .await
        .map_err(db_err)?
    {
        Some((asset, _)) => Ok(warp::reply::json(&json!({
            "amount": asset.quantity,
            "asset": asset,
        }))),
        None => Ok(warp::reply::json(&json!({ "amount": 0.0 }))),
    }
}

async fn delete_transaction_handler(
    asset_id: String,
    transaction_id: String,
    user_id: String,
    store: Arc<dyn Store>,
    market: Arc<MarketDataGateway>,
) -> Result<impl Reply, Rejection> {
    let mut done = false;
    for _ in 0..UPDATE_RETRIES {
        let (mut asset, version) = owned_asset(store.as_ref(), &asset_id, &user_id)
            .await
            .map_err(reject)?;

        let index = asset
            .transactions
            .iter()
            .position(|tx| tx.id == transaction_id)
            .ok_or_else(|| reject(ApiError::NotFound("Transaction")))?;
        let tx = asset.transactions[index].clone();

        // Reversal is the inverse delta, subject to the same floor and the
        // same snap to zero.
        let next = asset.quantity - tx.kind.signed_quantity(tx.quantity);
        if next < -QUANTITY_EPSILON {
            return Err(reject(ApiError::InsufficientBalance));
        }
        asset.quantity = if next.abs() < QUANTITY_EPSILON { 0.0 } else { next };
        asset.transactions.remove(index);
        asset.updated_at = Utc::now();

        if asset.transactions.is_empty() {
            store.delete_asset(&asset).await.map_err(db_err)?;
            done = true;
            break;
        }
        if store.update_asset(&asset, version).await.map_err(db_err)? {
            done = true;
            break;
        }
    }
    if !done {
        return Err(reject(ApiError::Persistence(StoreError::Contended)));
    }

    let history_stale = refresh_portfolio(store.as_ref(), market.as_ref(), &user_id)
        .await
        .is_err();
    Ok(warp::reply::json(&json!({
        "msg": "Transaction removed",
        "assetId": asset_id,
        "transactionId": transaction_id,
        "historyStale": history_stale,
    })))
}

// --- portfolio ---

#[derive(Deserialize)]
struct PortfolioUpdateRequest {
    name: Option<String>,
    description: Option<String>,
}

fn portfolio_routes(
    store: Arc<dyn Store>,
    market: Arc<MarketDataGateway>,
    secret: String,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let summary = warp::path!("api" / "portfolio")
        .and(warp::get())
        .and(auth::with_auth(secret.clone()))
        .and(with_store(store.clone()))
        .and(with_market(market))
        .and_then(summary_handler);

    let history = warp::path!("api" / "portfolio" / "history")
        .and(warp::get())
        .and(auth::with_auth(secret.clone()))
        .and(with_store(store.clone()))
        .and_then(history_handler);

    let performance = warp::path!("api" / "portfolio" / "performance")
        .and(warp::get())
        .and(auth::with_auth(secret.clone()))
        .and(with_store(store.clone()))
        .and_then(performance_handler);

    let update = warp::path!("api" / "portfolio")
        .and(warp::put())
        .and(auth::with_auth(secret))
        .and(with_store(store))
        .and(warp::body::json())
        .and_then(update_portfolio_handler);

    summary.or(history).or(performance).or(update)
}

/// Recomputes aggregates from the asset documents, applies the daily snapshot
/// policy, refreshes the stored performance windows, and persists the result.
async fn refresh_portfolio(
    store: &dyn Store,
    market: &MarketDataGateway,
    user_id: &str,
) -> Result<(Portfolio, Valuation), ApiError> {
    let assets = store.assets_for_user(user_id).await?;
    let symbols: Vec<String> = assets.iter().map(|a| a.symbol.clone()).collect();
    let quotes = market.prices_for_symbols(&symbols).await;

    let valuation = portfolio::value_assets(&assets, &quotes);
    let now = Utc::now();

    let mut stored = store
        .portfolio_for_user(user_id)
        .await?
        .unwrap_or_else(|| Portfolio::new(user_id));
    portfolio::record_snapshot(
        &mut stored,
        now,
        valuation.total_value,
        valuation.composition.clone(),
    );
    stored.performance = portfolio::trailing_performance(&stored.history, now);
    store.save_portfolio(&stored).await?;

    Ok((stored, valuation))
}

async fn summary_handler(
    user_id: String,
    store: Arc<dyn Store>,
    market: Arc<MarketDataGateway>,
) -> Result<impl Reply, Rejection> {
    let (stored, valuation) = refresh_portfolio(store.as_ref(), market.as_ref(), &user_id)
        .await
        .map_err(reject)?;

    Ok(warp::reply::json(&json!({
        "portfolio": stored,
        "totalValue": valuation.total_value,
        "composition": valuation.composition,
        "costBasis": valuation.cost_basis,
        "unrealizedPnl": valuation.unrealized_pnl,
        "unrealizedPnlPct": valuation.unrealized_pnl_pct,
        "positions": valuation.positions,
    })))
}

async fn history_handler(user_id: String, store: Arc<dyn Store>) -> Result<impl Reply, Rejection> {
    let stored = store
        .portfolio_for_user(&user_id)
        .await
        .map_err(db_err)?
        .ok_or_else(|| reject(ApiError::NotFound("Portfolio")))?;
    Ok(warp::reply::json(&stored.history))
}

async fn performance_handler(
    user_id: String,
    store: Arc<dyn Store>,
) -> Result<impl Reply, Rejection> {
    let stored = store
        .portfolio_for_user(&user_id)
        .await
        .map_err(db_err)?
        .ok_or_else(|| reject(ApiError::NotFound("Portfolio")))?;
    Ok(warp::reply::json(&stored.performance))
}

async fn update_portfolio_handler(
    user_id: String,
    store: Arc<dyn Store>,
    body: PortfolioUpdateRequest,
) -> Result<impl Reply, Rejection> {
    let mut stored = store
        .portfolio_for_user(&user_id)
        .await
        .map_err(db_err)?
        .unwrap_or_else(|| Portfolio::new(&user_id));

    if let Some(name) = body.name {
        if !name.trim().is_empty() {
            stored.name = name;
        }
    }
    if let Some(description) = body.description {
        stored.description = Some(description);
    }
    stored.updated_at = Utc::now();

    store.save_portfolio(&stored).await.map_err(db_err)?;
    Ok(warp::reply::json(&stored))
}

// --- market data ---

#[derive(Deserialize)]
struct HistoryQuery {
    range: Option<String>,
}

#[derive(Deserialize)]
struct SearchQuery {
    query: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Deserialize)]
struct NewsQuery {
    symbols: Option<String>,
    limit: Option<usize>,
}

fn market_routes(
    market: Arc<MarketDataGateway>,
    secret: String,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let price = warp::path!("api" / "market" / "price" / String)
        .and(warp::get())
        .and(auth::with_auth(secret.clone()))
        .and(with_market(market.clone()))
        .and_then(price_handler);

    let history = warp::path!("api" / "market" / "history" / String)
        .and(warp::get())
        .and(auth::with_auth(secret.clone()))
        .and(with_market(market.clone()))
        .and(warp::query::<HistoryQuery>())
        .and_then(market_history_handler);

    let search = warp::path!("api" / "market" / "search")
        .and(warp::get())
        .and(auth::with_auth(secret.clone()))
        .and(with_market(market.clone()))
        .and(warp::query::<SearchQuery>())
        .and_then(search_handler);

    let news = warp::path!("api" / "market" / "news")
        .and(warp::get())
        .and(auth::with_auth(secret.clone()))
        .and(with_market(market.clone()))
        .and(warp::query::<NewsQuery>())
        .and_then(news_handler);

    let overview = warp::path!("api" / "market" / "overview")
        .and(warp::get())
        .and(auth::with_auth(secret))
        .and(with_market(market))
        .and_then(overview_handler);

    price.or(history).or(search).or(news).or(overview)
}

async fn price_handler(
    symbol: String,
    _user_id: String,
    market: Arc<MarketDataGateway>,
) -> Result<impl Reply, Rejection> {
    let symbol = normalize_symbol(&symbol);
    match market.price_for_symbol(&symbol).await {
        Some(price) => Ok(warp::reply::json(&json!({
            "symbol": symbol,
            "price": price,
        }))),
        None => Err(reject(ApiError::NotFound("Symbol"))),
    }
}

async fn market_history_handler(
    symbol: String,
    _user_id: String,
    market: Arc<MarketDataGateway>,
    query: HistoryQuery,
) -> Result<impl Reply, Rejection> {
    let range = query.range.as_deref().unwrap_or("1m");
    let data = market.historical_data(&symbol, range).await;
    Ok(warp::reply::json(&data))
}

async fn search_handler(
    _user_id: String,
    market: Arc<MarketDataGateway>,
    query: SearchQuery,
) -> Result<impl Reply, Rejection> {
    let term = query
        .query
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| reject(ApiError::Validation("Search query is required".into())))?;
    let results = market.search_assets(term, query.kind.as_deref()).await;
    Ok(warp::reply::json(&results))
}

async fn news_handler(
    _user_id: String,
    market: Arc<MarketDataGateway>,
    query: NewsQuery,
) -> Result<impl Reply, Rejection> {
    let news = market
        .market_news(query.symbols.as_deref(), query.limit.unwrap_or(10))
        .await;
    Ok(warp::reply::json(&news))
}

async fn overview_handler(
    _user_id: String,
    market: Arc<MarketDataGateway>,
) -> Result<impl Reply, Rejection> {
    let overview = market.market_overview().await;
    Ok(warp::reply::json(&overview))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AssetType;

    fn asset() -> Asset {
        Asset::new("u1", "ETH", "Ethereum", AssetType::Crypto, 2000.0, Utc::now())
    }

    #[test]
    fn apply_transaction_tracks_signed_sum() {
        let mut asset = asset();
        let buy = Transaction::new(TransactionKind::Buy, 1.0, 2000.0, Utc::now(), None);
        apply_transaction(&mut asset, &buy).unwrap();
        let sell = Transaction::new(TransactionKind::Sell, 0.4, 2500.0, Utc::now(), None);
        apply_transaction(&mut asset, &sell).unwrap();
        assert!((asset.quantity - 0.6).abs() < 1e-12);
        assert_eq!(asset.transactions.len(), 2);
        // Newest first.
        assert_eq!(asset.transactions[0].kind, TransactionKind::Sell);
    }

    #[test]
    fn oversell_rejected_without_mutation() {
        let mut asset = asset();
        let buy = Transaction::new(TransactionKind::Buy, 1.0, 2000.0, Utc::now(), None);
        apply_transaction(&mut asset, &buy).unwrap();

        let sell = Transaction::new(TransactionKind::Sell, 2.0, 2500.0, Utc::now(), None);
        let err = apply_transaction(&mut asset, &sell).unwrap_err();
        assert!(matches!(err, ApiError::InsufficientBalance));
        assert_eq!(asset.quantity, 1.0);
        assert_eq!(asset.transactions.len(), 1);
    }

    #[test]
    fn selling_everything_clamps_float_drift() {
        let mut asset = asset();
        for _ in 0..3 {
            let buy = Transaction::new(TransactionKind::Buy, 0.1, 2000.0, Utc::now(), None);
            apply_transaction(&mut asset, &buy).unwrap();
        }
        let sell = Transaction::new(TransactionKind::Sell, 0.3, 2500.0, Utc::now(), None);
        apply_transaction(&mut asset, &sell).unwrap();
        assert_eq!(asset.quantity, 0.0);
    }

    #[test]
    fn amount_validation() {
        assert!(validate_amounts(1.0, 0.0).is_ok());
        assert!(validate_amounts(0.0, 1.0).is_err());
        assert!(validate_amounts(-1.0, 1.0).is_err());
        assert!(validate_amounts(1.0, -0.5).is_err());
        assert!(validate_amounts(f64::NAN, 1.0).is_err());
    }
}
