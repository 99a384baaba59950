// src/market.rs
//
// Gateway to the external market-data providers. Every public method absorbs
// upstream failures: fresh cache first, then the live call, then whatever
// stale value is still around, then a defined empty result. Callers never see
// a provider error.
use crate::config::Config;
use crate::models::normalize_symbol;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use log::warn;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

const PRICE_TTL: Duration = Duration::from_secs(5 * 60);
const HISTORY_TTL: Duration = Duration::from_secs(60 * 60);
const SEARCH_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const NEWS_TTL: Duration = Duration::from_secs(30 * 60);
const OVERVIEW_TTL: Duration = Duration::from_secs(15 * 60);

// Expired entries stay around this long as a stale fallback before the
// periodic sweep drops them.
const STALE_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

const CRYPTO_TICKERS: &[&str] = &[
    "BTC", "ETH", "XRP", "LTC", "BCH", "ADA", "DOT", "LINK", "XLM",
];

pub fn is_crypto_like(symbol: &str) -> bool {
    symbol.contains('-')
        || CRYPTO_TICKERS
            .iter()
            .any(|t| t.eq_ignore_ascii_case(symbol))
}

pub fn range_days(range: &str) -> i64 {
    match range {
        "1d" => 1,
        "5d" => 5,
        "1m" => 30,
        "3m" => 90,
        "6m" => 180,
        "1y" => 365,
        "5y" => 1825,
        _ => 30,
    }
}

struct CacheEntry {
    value: Value,
    stored_at: Instant,
    ttl: Duration,
}

/// Expiring key-value map owned by the gateway. Values are kept as JSON so
/// one map serves every category; typed getters deserialize on the way out.
pub struct TtlCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl TtlCache {
    pub fn new() -> Self {
        TtlCache {
            entries: RwLock::new(HashMap::new()),
        }
    }

    async fn fresh<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        if entry.stored_at.elapsed() > entry.ttl {
            return None;
        }
        serde_json::from_value(entry.value.clone()).ok()
    }

    async fn stale<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        serde_json::from_value(entry.value.clone()).ok()
    }

    async fn put<T: Serialize>(&self, key: &str, ttl: Duration, value: &T) {
        let json = match serde_json::to_value(value) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to cache {}: {}", key, e);
                return;
            }
        };
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: json,
                stored_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Drops entries that are past their stale-retention horizon.
    pub async fn sweep(&self) {
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.stored_at.elapsed() <= entry.ttl + STALE_RETENTION);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricePoint {
    pub date: DateTime<Utc>,
    pub price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub symbol: String,
    pub name: String,
    #[serde(rename = "type")]
    pub asset_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewsItem {
    pub title: String,
    pub description: Option<String>,
    pub url: String,
    pub source: String,
    pub published_at: Option<String>,
    pub image: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexQuote {
    pub symbol: String,
    pub name: String,
    pub price: f64,
    pub change: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendingAsset {
    pub symbol: String,
    pub name: String,
    pub price: Option<f64>,
    pub change: Option<f64>,
    pub market_cap: Option<f64>,
    pub volume: Option<f64>,
    pub image: Option<String>,
    #[serde(rename = "type")]
    pub asset_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketCapSummary {
    pub total_crypto: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketOverview {
    pub indices: Vec<IndexQuote>,
    pub trending: Vec<TrendingAsset>,
    pub market_cap: MarketCapSummary,
    pub timestamp: DateTime<Utc>,
}

impl MarketOverview {
    fn empty() -> Self {
        MarketOverview {
            indices: Vec::new(),
            trending: Vec::new(),
            market_cap: MarketCapSummary::default(),
            timestamp: Utc::now(),
        }
    }
}

// Provider wire formats, named the way the providers name them.

#[derive(Deserialize)]
struct GlobalQuoteResponse {
    #[serde(rename = "Global Quote")]
    quote: Option<GlobalQuote>,
}

#[derive(Deserialize)]
struct GlobalQuote {
    #[serde(rename = "05. price")]
    price: String,
}

#[derive(Deserialize)]
struct SymbolSearchResponse {
    #[serde(rename = "bestMatches", default)]
    best_matches: Vec<SymbolMatch>,
}

#[derive(Deserialize)]
struct SymbolMatch {
    #[serde(rename = "1. symbol")]
    symbol: String,
    #[serde(rename = "2. name")]
    name: String,
    #[serde(rename = "3. type")]
    kind: String,
    #[serde(rename = "4. region")]
    region: String,
}

#[derive(Clone, Deserialize, Serialize)]
struct CoinListing {
    id: String,
    symbol: String,
}

#[derive(Deserialize)]
struct CoinSearchResponse {
    #[serde(default)]
    coins: Vec<CoinMatch>,
}

#[derive(Deserialize)]
struct CoinMatch {
    id: String,
    symbol: String,
    name: String,
    large: Option<String>,
}

#[derive(Deserialize)]
struct MarketChartResponse {
    #[serde(default)]
    prices: Vec<(f64, f64)>,
}

#[derive(Deserialize)]
struct CoinMarket {
    symbol: String,
    name: String,
    current_price: Option<f64>,
    price_change_percentage_24h: Option<f64>,
    market_cap: Option<f64>,
    total_volume: Option<f64>,
    image: Option<String>,
}

#[derive(Deserialize)]
struct NewsResponse {
    #[serde(default)]
    articles: Vec<Article>,
}

#[derive(Deserialize)]
struct Article {
    title: String,
    description: Option<String>,
    url: String,
    source: ArticleSource,
    #[serde(rename = "publishedAt")]
    published_at: Option<String>,
    #[serde(rename = "urlToImage")]
    image: Option<String>,
}

#[derive(Deserialize)]
struct ArticleSource {
    name: String,
}

pub struct MarketDataGateway {
    client: Client,
    cache: TtlCache,
    coingecko_base: String,
    alphavantage_base: String,
    alphavantage_key: String,
    news_base: String,
    news_key: String,
}

impl MarketDataGateway {
    pub fn new(config: &Config) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(MarketDataGateway {
            client,
            cache: TtlCache::new(),
            coingecko_base: config.coingecko_base.clone(),
            alphavantage_base: config.alphavantage_base.clone(),
            alphavantage_key: config.alphavantage_key.clone(),
            news_base: config.news_base.clone(),
            news_key: config.news_key.clone(),
        })
    }

    pub async fn sweep_cache(&self) {
        self.cache.sweep().await;
    }

    /// Current price in USD, or None when the upstream is unavailable and
    /// nothing is cached.
    pub async fn price_for_symbol(&self, symbol: &str) -> Option<f64> {
        let symbol = normalize_symbol(symbol);
        let key = format!("price:{}", symbol);
        if let Some(price) = self.cache.fresh::<f64>(&key).await {
            return Some(price);
        }

        let fetched = if is_crypto_like(&symbol) {
            self.fetch_crypto_price(&symbol).await
        } else {
            self.fetch_quote(&symbol).await
        };

        match fetched {
            Ok(Some(price)) => {
                self.cache.put(&key, PRICE_TTL, &price).await;
                Some(price)
            }
            Ok(None) => self.cache.stale::<f64>(&key).await,
            Err(e) => {
                warn!("Price fetch failed for {}: {}", symbol, e);
                self.cache.stale::<f64>(&key).await
            }
        }
    }

    /// Batch lookup; crypto symbols go out in a single upstream call,
    /// traditional symbols resolve individually. Symbols that cannot be
    /// resolved are simply absent from the result.
    pub async fn prices_for_symbols(&self, symbols: &[String]) -> HashMap<String, f64> {
        let mut results = HashMap::new();
        let mut crypto_pending = Vec::new();
        let mut traditional = Vec::new();

        for raw in symbols {
            let symbol = normalize_symbol(raw);
            if results.contains_key(&symbol) {
                continue;
            }
            if let Some(price) = self.cache.fresh::<f64>(&format!("price:{}", symbol)).await {
                results.insert(symbol, price);
            } else if is_crypto_like(&symbol) {
                crypto_pending.push(symbol);
            } else {
                traditional.push(symbol);
            }
        }

        if !crypto_pending.is_empty() {
            let ids: Vec<String> = crypto_pending.iter().map(|s| s.to_lowercase()).collect();
            match self.simple_prices(&ids).await {
                Ok(prices) => {
                    for symbol in &crypto_pending {
                        if let Some(price) = prices.get(&symbol.to_lowercase()) {
                            self.cache
                                .put(&format!("price:{}", symbol), PRICE_TTL, price)
                                .await;
                            results.insert(symbol.clone(), *price);
                        }
                    }
                }
                Err(e) => warn!("Batch crypto price fetch failed: {}", e),
            }
            // Anything the batch call missed gets the full fallback chain.
            for symbol in crypto_pending {
                if !results.contains_key(&symbol) {
                    if let Some(price) = self.price_for_symbol(&symbol).await {
                        results.insert(symbol, price);
                    }
                }
            }
        }

        for symbol in traditional {
            if let Some(price) = self.price_for_symbol(&symbol).await {
                results.insert(symbol, price);
            }
        }

        results
    }

    pub async fn historical_data(&self, symbol: &str, range: &str) -> Vec<PricePoint> {
        let symbol = normalize_symbol(symbol);
        let key = format!("history:{}:{}", symbol, range);
        if let Some(points) = self.cache.fresh::<Vec<PricePoint>>(&key).await {
            return points;
        }

        let days = range_days(range);
        let fetched = if is_crypto_like(&symbol) {
            self.fetch_crypto_history(&symbol, days).await
        } else {
            self.fetch_series(&symbol, days).await
        };

        match fetched {
            Ok(points) if !points.is_empty() => {
                self.cache.put(&key, HISTORY_TTL, &points).await;
                points
            }
            Ok(_) => self.cache.stale(&key).await.unwrap_or_default(),
            Err(e) => {
                warn!("History fetch failed for {}: {}", symbol, e);
                self.cache.stale(&key).await.unwrap_or_default()
            }
        }
    }

    pub async fn search_assets(&self, query: &str, type_filter: Option<&str>) -> Vec<SearchResult> {
        let key = format!("search:{}:{}", query, type_filter.unwrap_or("all"));
        if let Some(results) = self.cache.fresh::<Vec<SearchResult>>(&key).await {
            return results;
        }

        let mut results = Vec::new();

        if type_filter.is_none() || type_filter == Some("crypto") {
            match self.search_coins(query).await {
                Ok(mut coins) => results.append(&mut coins),
                Err(e) => warn!("Crypto search failed for {}: {}", query, e),
            }
        }

        if matches!(type_filter, None | Some("stock") | Some("etf")) {
            match self.search_symbols(query).await {
                Ok(mut matches) => results.append(&mut matches),
                Err(e) => warn!("Symbol search failed for {}: {}", query, e),
            }
        }

        if results.is_empty() {
            return self.cache.stale(&key).await.unwrap_or_default();
        }
        self.cache.put(&key, SEARCH_TTL, &results).await;
        results
    }

    pub async fn market_news(&self, symbols: Option<&str>, limit: usize) -> Vec<NewsItem> {
        let general = symbols.is_none();
        if general {
            if let Some(news) = self.cache.fresh::<Vec<NewsItem>>("news:general").await {
                return news.into_iter().take(limit).collect();
            }
        }

        match self.fetch_news(symbols).await {
            Ok(news) => {
                if general {
                    self.cache.put("news:general", NEWS_TTL, &news).await;
                }
                news.into_iter().take(limit).collect()
            }
            Err(e) => {
                warn!("News fetch failed: {}", e);
                self.cache
                    .stale::<Vec<NewsItem>>("news:general")
                    .await
                    .unwrap_or_default()
                    .into_iter()
                    .take(limit)
                    .collect()
            }
        }
    }

    pub async fn market_overview(&self) -> MarketOverview {
        if let Some(overview) = self.cache.fresh::<MarketOverview>("overview").await {
            return overview;
        }

        let mut overview = MarketOverview::empty();

        for (symbol, name) in [("SPY", "S&P 500"), ("DIA", "Dow Jones"), ("QQQ", "NASDAQ")] {
            let price = self.price_for_symbol(symbol).await.unwrap_or(0.0);
            overview.indices.push(IndexQuote {
                symbol: symbol.to_string(),
                name: name.to_string(),
                price,
                change: 0.0,
            });
        }

        match self.fetch_coin_markets().await {
            Ok(markets) => {
                overview.market_cap.total_crypto =
                    markets.iter().filter_map(|m| m.market_cap).sum();
                overview.trending = markets
                    .into_iter()
                    .take(10)
                    .map(|m| TrendingAsset {
                        symbol: m.symbol.to_uppercase(),
                        name: m.name,
                        price: m.current_price,
                        change: m.price_change_percentage_24h,
                        market_cap: m.market_cap,
                        volume: m.total_volume,
                        image: m.image,
                        asset_type: "crypto".to_string(),
                    })
                    .collect();
            }
            Err(e) => {
                warn!("Trending fetch failed: {}", e);
                if let Some(cached) = self.cache.stale::<MarketOverview>("overview").await {
                    return cached;
                }
            }
        }

        self.cache.put("overview", OVERVIEW_TTL, &overview).await;
        overview
    }

    async fn fetch_quote(&self, symbol: &str) -> Result<Option<f64>, reqwest::Error> {
        let url = format!(
            "{}/query?function=GLOBAL_QUOTE&symbol={}&apikey={}",
            self.alphavantage_base, symbol, self.alphavantage_key
        );
        let response: GlobalQuoteResponse = self.client.get(&url).send().await?.json().await?;
        Ok(response
            .quote
            .and_then(|q| q.price.parse::<f64>().ok()))
    }

    async fn fetch_crypto_price(&self, symbol: &str) -> Result<Option<f64>, reqwest::Error> {
        let id = symbol.to_lowercase();
        if let Some(price) = self.simple_prices(&[id.clone()]).await?.get(&id) {
            return Ok(Some(*price));
        }
        // The ticker is not a CoinGecko id; map it through the coin list.
        if let Some(mapped) = self.coin_id_for_symbol(symbol).await? {
            let prices = self.simple_prices(&[mapped.clone()]).await?;
            return Ok(prices.get(&mapped).copied());
        }
        Ok(None)
    }

    async fn simple_prices(&self, ids: &[String]) -> Result<HashMap<String, f64>, reqwest::Error> {
        let url = format!(
            "{}/simple/price?ids={}&vs_currencies=usd",
            self.coingecko_base,
            ids.join(",")
        );
        let response: HashMap<String, HashMap<String, f64>> =
            self.client.get(&url).send().await?.json().await?;
        Ok(response
            .into_iter()
            .filter_map(|(id, currencies)| currencies.get("usd").map(|p| (id, *p)))
            .collect())
    }

    async fn coin_id_for_symbol(&self, symbol: &str) -> Result<Option<String>, reqwest::Error> {
        let listings = match self.cache.fresh::<Vec<CoinListing>>("coingecko:coins").await {
            Some(listings) => listings,
            None => {
                let url = format!("{}/coins/list", self.coingecko_base);
                let listings: Vec<CoinListing> =
                    self.client.get(&url).send().await?.json().await?;
                self.cache.put("coingecko:coins", SEARCH_TTL, &listings).await;
                listings
            }
        };
        Ok(listings
            .iter()
            .find(|c| c.symbol.eq_ignore_ascii_case(symbol))
            .map(|c| c.id.clone()))
    }

    async fn fetch_crypto_history(
        &self,
        symbol: &str,
        days: i64,
    ) -> Result<Vec<PricePoint>, reqwest::Error> {
        let mut id = symbol.to_lowercase();
        if !symbol.contains('-') {
            if let Some(mapped) = self.coin_id_for_symbol(symbol).await? {
                id = mapped;
            }
        }
        let url = format!(
            "{}/coins/{}/market_chart?vs_currency=usd&days={}",
            self.coingecko_base, id, days
        );
        let response: MarketChartResponse = self.client.get(&url).send().await?.json().await?;
        Ok(response
            .prices
            .into_iter()
            .filter_map(|(millis, price)| {
                DateTime::<Utc>::from_timestamp_millis(millis as i64)
                    .map(|date| PricePoint { date, price })
            })
            .collect())
    }

    async fn fetch_series(&self, symbol: &str, days: i64) -> Result<Vec<PricePoint>, reqwest::Error> {
        let (function, series_key) = if days <= 5 {
            ("TIME_SERIES_INTRADAY&interval=60min", "Time Series (60min)")
        } else {
            ("TIME_SERIES_DAILY", "Time Series (Daily)")
        };
        let url = format!(
            "{}/query?function={}&symbol={}&outputsize=full&apikey={}",
            self.alphavantage_base, function, symbol, self.alphavantage_key
        );
        let body: Value = self.client.get(&url).send().await?.json().await?;

        let mut points: Vec<PricePoint> = body
            .get(series_key)
            .and_then(Value::as_object)
            .map(|series| {
                series
                    .iter()
                    .filter_map(|(date_str, values)| {
                        let price = values.get("4. close")?.as_str()?.parse().ok()?;
                        let date = parse_series_date(date_str)?;
                        Some(PricePoint { date, price })
                    })
                    .collect()
            })
            .unwrap_or_default();

        points.sort_by_key(|p| p.date);
        if points.len() > days as usize {
            let excess = points.len() - days as usize;
            points.drain(..excess);
        }
        Ok(points)
    }

    async fn search_coins(&self, query: &str) -> Result<Vec<SearchResult>, reqwest::Error> {
        let url = format!("{}/search?query={}", self.coingecko_base, query);
        let response: CoinSearchResponse = self.client.get(&url).send().await?.json().await?;
        Ok(response
            .coins
            .into_iter()
            .take(10)
            .map(|coin| SearchResult {
                symbol: coin.symbol.to_uppercase(),
                name: coin.name,
                asset_type: "crypto".to_string(),
                region: None,
                image: coin.large,
                id: Some(coin.id),
            })
            .collect())
    }

    async fn search_symbols(&self, query: &str) -> Result<Vec<SearchResult>, reqwest::Error> {
        let url = format!(
            "{}/query?function=SYMBOL_SEARCH&keywords={}&apikey={}",
            self.alphavantage_base, query, self.alphavantage_key
        );
        let response: SymbolSearchResponse = self.client.get(&url).send().await?.json().await?;
        Ok(response
            .best_matches
            .into_iter()
            .map(|m| SearchResult {
                symbol: m.symbol,
                name: m.name,
                asset_type: if m.kind.eq_ignore_ascii_case("etf") {
                    "etf".to_string()
                } else {
                    "stock".to_string()
                },
                region: Some(m.region),
                image: None,
                id: None,
            })
            .collect())
    }

    async fn fetch_news(&self, symbols: Option<&str>) -> Result<Vec<NewsItem>, reqwest::Error> {
        let url = match symbols {
            Some(symbols) => format!(
                "{}/everything?q={}&language=en&sortBy=publishedAt",
                self.news_base, symbols
            ),
            None => format!(
                "{}/top-headlines?category=business&language=en",
                self.news_base
            ),
        };
        let response: NewsResponse = self
            .client
            .get(&url)
            .header("X-Api-Key", &self.news_key)
            .send()
            .await?
            .json()
            .await?;
        Ok(response
            .articles
            .into_iter()
            .map(|a| NewsItem {
                title: a.title,
                description: a.description,
                url: a.url,
                source: a.source.name,
                published_at: a.published_at,
                image: a.image,
            })
            .collect())
    }

    async fn fetch_coin_markets(&self) -> Result<Vec<CoinMarket>, reqwest::Error> {
        let url = format!(
            "{}/coins/markets?vs_currency=usd&order=market_cap_desc&per_page=50&page=1&sparkline=false",
            self.coingecko_base
        );
        self.client.get(&url).send().await?.json().await
    }
}

fn parse_series_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(datetime) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(datetime.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|datetime| datetime.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_classification() {
        assert!(is_crypto_like("BTC"));
        assert!(is_crypto_like("eth"));
        assert!(is_crypto_like("SOL-USD"));
        assert!(!is_crypto_like("AAPL"));
        assert!(!is_crypto_like("SPY"));
    }

    #[test]
    fn range_mapping_defaults_to_a_month() {
        assert_eq!(range_days("1d"), 1);
        assert_eq!(range_days("5y"), 1825);
        assert_eq!(range_days("bogus"), 30);
    }

    #[test]
    fn series_dates_parse_both_granularities() {
        assert!(parse_series_date("2026-08-28").is_some());
        assert!(parse_series_date("2026-08-28 15:00:00").is_some());
        assert!(parse_series_date("yesterday").is_none());
    }

    #[tokio::test]
    async fn cache_serves_fresh_then_stale() {
        let cache = TtlCache::new();
        cache.put("price:BTC", Duration::from_millis(10), &42.0).await;
        assert_eq!(cache.fresh::<f64>("price:BTC").await, Some(42.0));

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(cache.fresh::<f64>("price:BTC").await, None);
        assert_eq!(cache.stale::<f64>("price:BTC").await, Some(42.0));
    }

    #[tokio::test]
    async fn sweep_keeps_entries_inside_retention() {
        let cache = TtlCache::new();
        cache.put("price:BTC", Duration::from_millis(10), &42.0).await;
        tokio::time::sleep(Duration::from_millis(25)).await;
        // Expired but inside the stale-retention horizon.
        cache.sweep().await;
        assert_eq!(cache.len().await, 1);
    }
}
