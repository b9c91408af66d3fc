//! Search orchestration for SkyScout: provider registry, the per-request
//! pipeline (provider chain, ranking, history recording), promotional deal
//! generation, and the optional background refresh scheduler.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Days, Utc};
use serde::{Deserialize, Serialize};
use skyscout_adapters::{adapter_for_provider, load_fixture_payload, mock_offers, ProviderConfig};
use skyscout_core::{
    parse_duration_minutes, FlightOffer, LayoverBucket, PipelineError, SearchCriteria,
    SearchParams, SortMode, StopBucket, TimeBucket, DEFAULT_CURRENCY,
};
use skyscout_store::{Deal, DealStore, HistoryStore, HttpClientConfig, HttpFetcher, TokenBucketConfig};
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

pub const CRATE_NAME: &str = "skyscout-search";

/// Applied to the cheapest offer per destination when minting deals.
pub const DEAL_DISCOUNT_PERCENT: u8 = 15;
pub const DEAL_VALIDITY_DAYS: u64 = 7;

/// Routes probed for deals when nobody has searched anything yet.
const DEFAULT_DEAL_ROUTES: &[(&str, &str)] = &[("MAD", "BER"), ("MAD", "FCO"), ("LIS", "LHR")];

// ---------------------------------------------------------------------------
// Ranking and filtering
// ---------------------------------------------------------------------------

/// Weighted score for the `best` sort; lower is better. Unparsable durations
/// score infinitely bad so they sink to the end.
pub fn composite_score(offer: &FlightOffer) -> f64 {
    let duration_minutes = parse_duration_minutes(&offer.duration)
        .map(|m| m as f64)
        .unwrap_or(f64::INFINITY);
    offer.price_major() + offer.stops as f64 * 50.0 + duration_minutes / 10.0
}

/// One offer against the whole filter bundle. Empty filter collections do
/// not restrict; a layover filter can only match offers that have one.
pub fn passes_filters(offer: &FlightOffer, criteria: &SearchCriteria) -> bool {
    if !criteria.destinations.matches(&offer.to_airport) {
        return false;
    }
    let filters = &criteria.filters;

    if let Some(range) = &filters.price_range {
        if !range.contains(offer.price_major()) {
            return false;
        }
    }
    if !filters.stops.is_empty() && !filters.stops.contains(&StopBucket::for_stops(offer.stops)) {
        return false;
    }
    if !filters.airlines.is_empty()
        && !filters
            .airlines
            .iter()
            .any(|a| a.eq_ignore_ascii_case(&offer.airline))
    {
        return false;
    }
    if !filters.departure_windows.is_empty() {
        match offer.departure_hour() {
            Some(hour) if filters.departure_windows.contains(&TimeBucket::for_hour(hour)) => {}
            _ => return false,
        }
    }
    if !filters.layovers.is_empty() {
        let minutes = offer
            .layover_duration
            .as_deref()
            .and_then(parse_duration_minutes);
        match minutes {
            Some(m) if filters.layovers.contains(&LayoverBucket::for_minutes(m)) => {}
            _ => return false,
        }
    }
    true
}

/// Filter then order. Sorts are stable, so equal keys keep provider order.
pub fn rank_and_filter(
    offers: Vec<FlightOffer>,
    criteria: &SearchCriteria,
    sort: SortMode,
) -> Vec<FlightOffer> {
    let mut kept: Vec<FlightOffer> = offers
        .into_iter()
        .filter(|offer| passes_filters(offer, criteria))
        .collect();

    match sort {
        SortMode::Cheapest => kept.sort_by_key(|offer| offer.price),
        SortMode::Fastest => {
            kept.sort_by_key(|offer| parse_duration_minutes(&offer.duration).unwrap_or(i64::MAX));
        }
        SortMode::Best => {
            kept.sort_by(|a, b| composite_score(a).total_cmp(&composite_score(b)));
        }
    }
    kept
}

// ---------------------------------------------------------------------------
// Provider registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderMode {
    /// Parse a stored payload instead of calling the network.
    #[default]
    Fixture,
    Live,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Lower goes first.
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub mode: ProviderMode,
    #[serde(default)]
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub api_host: Option<String>,
    #[serde(default)]
    pub fixture: Option<PathBuf>,
    /// IATA code to provider entity id, for providers that need it.
    #[serde(default)]
    pub airport_ids: std::collections::HashMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderRegistry {
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
}

impl ProviderRegistry {
    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(text).context("parsing provider registry YAML")
    }

    pub async fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading provider registry {}", path.display()))?;
        Self::from_yaml_str(&text)
    }

    pub fn enabled_in_priority_order(&self) -> Vec<&ProviderEntry> {
        let mut entries: Vec<&ProviderEntry> =
            self.providers.iter().filter(|e| e.enabled).collect();
        entries.sort_by_key(|e| e.priority);
        entries
    }
}

fn provider_config(entry: &ProviderEntry) -> ProviderConfig {
    ProviderConfig {
        base_url: entry.base_url.clone(),
        api_key: entry
            .api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok()),
        api_host: entry.api_host.clone(),
        airport_ids: entry.airport_ids.clone(),
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub registry_path: PathBuf,
    pub request_timeout: Duration,
    pub user_agent: String,
    /// Outbound request budget per second; unset means unlimited.
    pub rate_limit_per_sec: Option<u32>,
    pub scheduler_enabled: bool,
    pub deals_cron: String,
}

impl SearchConfig {
    /// Environment-driven configuration; every knob has a default so a bare
    /// process starts in fixture mode with the bundled registry.
    pub fn from_env() -> Self {
        Self {
            registry_path: PathBuf::from(env_string("SKYSCOUT_PROVIDERS_FILE", "providers.yaml")),
            request_timeout: Duration::from_secs(env_u64("SKYSCOUT_HTTP_TIMEOUT_SECS", 15)),
            user_agent: env_string("SKYSCOUT_USER_AGENT", "skyscout/0.1"),
            rate_limit_per_sec: std::env::var("SKYSCOUT_HTTP_RPS")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
            scheduler_enabled: env_flag("SKYSCOUT_SCHEDULER_ENABLED"),
            deals_cron: env_string("SKYSCOUT_DEALS_CRON", "0 0 */6 * * *"),
        }
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| parse_flag(&v)).unwrap_or(false)
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SearchRunSummary {
    pub run_id: Uuid,
    /// Provider that produced the offers; `None` means the mock fallback.
    pub provider: Option<String>,
    pub used_fallback: bool,
    pub offer_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub offers: Vec<FlightOffer>,
    pub summary: SearchRunSummary,
}

/// One pipeline instance serves the whole process; per-request state is
/// confined to the run id.
pub struct SearchPipeline {
    registry: ProviderRegistry,
    http: Arc<HttpFetcher>,
    history: Arc<HistoryStore>,
    deals: Arc<DealStore>,
}

impl SearchPipeline {
    pub fn new(
        registry: ProviderRegistry,
        http: Arc<HttpFetcher>,
        history: Arc<HistoryStore>,
        deals: Arc<DealStore>,
    ) -> Self {
        Self {
            registry,
            http,
            history,
            deals,
        }
    }

    pub async fn from_config(config: &SearchConfig) -> anyhow::Result<Self> {
        let registry = ProviderRegistry::load(&config.registry_path).await?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.request_timeout,
            user_agent: Some(config.user_agent.clone()),
            token_bucket: config.rate_limit_per_sec.map(|rps| TokenBucketConfig {
                capacity: rps.max(1),
                refill_every: Duration::from_secs(1),
            }),
            ..HttpClientConfig::default()
        })?;
        Ok(Self::new(
            registry,
            Arc::new(http),
            Arc::new(HistoryStore::new()),
            Arc::new(DealStore::new()),
        ))
    }

    pub fn history(&self) -> Arc<HistoryStore> {
        self.history.clone()
    }

    pub fn deals(&self) -> Arc<DealStore> {
        self.deals.clone()
    }

    /// Full search: provider chain, ranking, history recording. Provider
    /// failures are recoverable per request; the chain moves to the next
    /// entry and bottoms out at the mock generator.
    pub async fn run_search(
        &self,
        params: &SearchParams,
        criteria: &SearchCriteria,
        sort: SortMode,
    ) -> SearchOutcome {
        let run_id = Uuid::new_v4();
        let (offers, provider, used_fallback) = self.collect_offers(run_id, params).await;
        let ranked = rank_and_filter(offers, criteria, sort);

        let best_price = ranked.iter().map(|o| o.price).min();
        let currency = ranked
            .first()
            .map(|o| o.currency.clone())
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());
        self.history.record_search(params, best_price, &currency).await;

        let summary = SearchRunSummary {
            run_id,
            provider,
            used_fallback,
            offer_count: ranked.len(),
        };
        tracing::info!(
            run_id = %summary.run_id,
            provider = summary.provider.as_deref().unwrap_or("mock"),
            offers = summary.offer_count,
            "search completed"
        );
        SearchOutcome {
            offers: ranked,
            summary,
        }
    }

    async fn collect_offers(
        &self,
        run_id: Uuid,
        params: &SearchParams,
    ) -> (Vec<FlightOffer>, Option<String>, bool) {
        for entry in self.registry.enabled_in_priority_order() {
            let Some(adapter) = adapter_for_provider(&entry.id) else {
                tracing::warn!(provider = %entry.id, "no adapter registered; skipping");
                continue;
            };

            let parsed = match entry.mode {
                ProviderMode::Fixture => {
                    let Some(path) = &entry.fixture else {
                        tracing::warn!(provider = %entry.id, "fixture mode without a fixture path; skipping");
                        continue;
                    };
                    match load_fixture_payload(path) {
                        Ok(raw) => adapter.parse(&raw, params),
                        Err(err) => {
                            tracing::warn!(provider = %entry.id, error = %err, "fixture unreadable; skipping");
                            continue;
                        }
                    }
                }
                ProviderMode::Live => {
                    let config = provider_config(entry);
                    match adapter.fetch(&self.http, run_id, &config, params).await {
                        Ok(raw) => adapter.parse(&raw, params),
                        Err(err) => Err(err),
                    }
                }
            };

            match parsed {
                Ok(offers) if !offers.is_empty() => {
                    return (offers, Some(entry.id.clone()), false);
                }
                Ok(_) => {
                    tracing::info!(provider = %entry.id, "provider returned no offers; trying next");
                }
                Err(PipelineError::ProviderBlocked { provider }) => {
                    tracing::warn!(provider, "provider blocked the request; trying next");
                }
                Err(err) => {
                    tracing::warn!(provider = %entry.id, error = %err, "provider unusable; trying next");
                }
            }
        }

        tracing::info!("all providers exhausted; serving mock offers");
        (mock_offers(params), None, true)
    }

    /// Rebuild the promotional deal set from the cheapest current offer per
    /// destination. Probes recently searched routes, or a default set when
    /// the history is empty. Does not touch the search history.
    pub async fn refresh_deals(&self) -> anyhow::Result<usize> {
        let departure_date = Utc::now()
            .date_naive()
            .checked_add_days(Days::new(30))
            .context("departure date out of range")?;

        let mut routes: Vec<(String, String)> = self
            .history
            .recent(5)
            .await
            .into_iter()
            .map(|stats| (stats.origin, stats.destination))
            .collect();
        if routes.is_empty() {
            routes = DEFAULT_DEAL_ROUTES
                .iter()
                .map(|(o, d)| (o.to_string(), d.to_string()))
                .collect();
        }

        let mut pool: Vec<FlightOffer> = Vec::new();
        for (origin, destination) in routes {
            let params = SearchParams {
                origin,
                destination,
                departure_date,
                return_date: None,
                adults: 1,
                max_results: None,
            };
            let run_id = Uuid::new_v4();
            let (offers, _, _) = self.collect_offers(run_id, &params).await;
            pool.extend(offers);
        }

        let deals = generate_deals(&pool, Utc::now());
        let count = deals.len();
        self.deals.replace_all(deals).await;
        tracing::info!(deals = count, "deal set refreshed");
        Ok(count)
    }
}

/// Cheapest offer per destination, discounted and stamped with a validity
/// window. Output is ordered by destination for stable presentation.
pub fn generate_deals(offers: &[FlightOffer], now: DateTime<Utc>) -> Vec<Deal> {
    let mut cheapest: std::collections::HashMap<String, &FlightOffer> =
        std::collections::HashMap::new();
    for offer in offers {
        cheapest
            .entry(offer.to_airport.clone())
            .and_modify(|current| {
                if offer.price < current.price {
                    *current = offer;
                }
            })
            .or_insert(offer);
    }

    let mut deals: Vec<Deal> = cheapest
        .into_values()
        .map(|offer| Deal {
            id: Uuid::new_v4(),
            destination: offer.to_airport.clone(),
            airline: offer.airline.clone(),
            price: discounted(offer.price),
            currency: offer.currency.clone(),
            discount_percent: DEAL_DISCOUNT_PERCENT,
            valid_until: now + chrono::Duration::days(DEAL_VALIDITY_DAYS as i64),
        })
        .collect();
    deals.sort_by(|a, b| a.destination.cmp(&b.destination));
    deals
}

fn discounted(price: i64) -> i64 {
    (price as f64 * f64::from(100 - DEAL_DISCOUNT_PERCENT) / 100.0).round() as i64
}

// ---------------------------------------------------------------------------
// Background refresh
// ---------------------------------------------------------------------------

/// Cron-driven deal refresh. Off unless explicitly enabled; returns the
/// running scheduler so the caller owns its lifetime.
pub async fn maybe_build_scheduler(
    pipeline: Arc<SearchPipeline>,
    config: &SearchConfig,
) -> anyhow::Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let scheduler = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(config.deals_cron.as_str(), move |_job_id, _lock| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            if let Err(err) = pipeline.refresh_deals().await {
                tracing::warn!(error = %err, "scheduled deal refresh failed");
            }
        })
    })
    .with_context(|| format!("creating deal refresh job for cron {}", config.deals_cron))?;
    scheduler.add(job).await.context("adding deal refresh job")?;
    scheduler.start().await.context("starting scheduler")?;
    tracing::info!(cron = %config.deals_cron, "deal refresh scheduler started");
    Ok(Some(scheduler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use skyscout_core::{DestinationSet, FilterBundle, PriceRange};
    use std::path::Path;

    fn offer(id: u32, price: i64, stops: u32, duration: &str) -> FlightOffer {
        FlightOffer {
            id,
            airline: "Iberia".into(),
            flight_number: format!("IB{id:04}"),
            aircraft_type: "A320".into(),
            from_airport: "MAD".into(),
            to_airport: "BER".into(),
            departure_time: "08:30".into(),
            arrival_time: "12:00".into(),
            duration: duration.into(),
            stops,
            layover_airport: (stops > 0).then(|| "CDG".into()),
            layover_duration: (stops > 0).then(|| "2h 0m".into()),
            price,
            currency: DEFAULT_CURRENCY.into(),
            is_long_layover: false,
            amenities: vec!["Refreshments".into()],
        }
    }

    fn criteria() -> SearchCriteria {
        SearchCriteria::for_route("MAD", "BER", NaiveDate::from_ymd_opt(2026, 9, 1).unwrap())
    }

    fn params() -> SearchParams {
        SearchParams {
            origin: "MAD".into(),
            destination: "BER".into(),
            departure_date: NaiveDate::from_ymd_opt(2026, 9, 1).unwrap(),
            return_date: None,
            adults: 1,
            max_results: None,
        }
    }

    fn ids(offers: &[FlightOffer]) -> Vec<u32> {
        offers.iter().map(|o| o.id).collect()
    }

    #[test]
    fn sort_modes_produce_their_documented_orders() {
        let offers = vec![
            offer(1, 10000, 2, "20h 0m"),  // best 100 + 100 + 120 = 320
            offer(2, 15000, 0, "3h 0m"),   // best 150 + 0 + 18 = 168
            offer(3, 12000, 1, "5h 0m"),   // best 120 + 50 + 30 = 200
            offer(4, 9000, 2, "23h 20m"),  // best 90 + 100 + 140 = 330
        ];

        let cheapest = rank_and_filter(offers.clone(), &criteria(), SortMode::Cheapest);
        assert_eq!(ids(&cheapest), vec![4, 1, 3, 2]);

        let fastest = rank_and_filter(offers.clone(), &criteria(), SortMode::Fastest);
        assert_eq!(ids(&fastest), vec![2, 3, 1, 4]);

        let best = rank_and_filter(offers, &criteria(), SortMode::Best);
        assert_eq!(ids(&best), vec![2, 3, 1, 4]);
    }

    #[test]
    fn sorting_is_stable_for_equal_keys() {
        let offers = vec![
            offer(1, 10000, 0, "2h 0m"),
            offer(2, 10000, 0, "2h 0m"),
            offer(3, 10000, 0, "2h 0m"),
        ];
        let sorted = rank_and_filter(offers, &criteria(), SortMode::Cheapest);
        assert_eq!(ids(&sorted), vec![1, 2, 3]);
    }

    #[test]
    fn unparsable_durations_sort_last() {
        // a cheap offer with an unresolved duration must not win on speed
        let unknown = offer(9, 5000, 0, skyscout_core::PLACEHOLDER_DURATION);
        let offers = vec![unknown, offer(1, 20000, 0, "2h 0m")];

        let fastest = rank_and_filter(offers.clone(), &criteria(), SortMode::Fastest);
        assert_eq!(ids(&fastest), vec![1, 9]);

        let best = rank_and_filter(offers, &criteria(), SortMode::Best);
        assert_eq!(ids(&best), vec![1, 9]);
    }

    #[test]
    fn price_filter_is_inclusive_and_inverted_ranges_match_nothing() {
        let offers = vec![offer(1, 10000, 0, "2h 0m"), offer(2, 30000, 0, "2h 0m")];
        let mut c = criteria();
        c.filters.price_range = Some(PriceRange {
            min: 100.0,
            max: 250.0,
        });
        assert_eq!(ids(&rank_and_filter(offers.clone(), &c, SortMode::Cheapest)), vec![1]);

        c.filters.price_range = Some(PriceRange {
            min: 250.0,
            max: 100.0,
        });
        assert!(rank_and_filter(offers, &c, SortMode::Cheapest).is_empty());
    }

    #[test]
    fn stop_and_airline_filters_restrict_when_non_empty() {
        let mut foreign = offer(2, 9000, 1, "4h 0m");
        foreign.airline = "Ryanair".into();
        let offers = vec![offer(1, 10000, 0, "2h 0m"), foreign];

        let mut c = criteria();
        c.filters.stops = vec![StopBucket::Direct];
        assert_eq!(ids(&rank_and_filter(offers.clone(), &c, SortMode::Cheapest)), vec![1]);

        let mut c = criteria();
        c.filters.airlines = vec!["ryanair".into()];
        assert_eq!(ids(&rank_and_filter(offers.clone(), &c, SortMode::Cheapest)), vec![2]);

        // empty filter collections leave everything in
        assert_eq!(rank_and_filter(offers, &criteria(), SortMode::Cheapest).len(), 2);
    }

    #[test]
    fn departure_window_filter_excludes_placeholder_times() {
        let mut unknown = offer(2, 9000, 0, "2h 0m");
        unknown.departure_time = "--:--".into();
        let offers = vec![offer(1, 10000, 0, "2h 0m"), unknown];

        let mut c = criteria();
        c.filters.departure_windows = vec![TimeBucket::Morning];
        // offer 1 departs 08:30; the placeholder cannot satisfy any window
        assert_eq!(ids(&rank_and_filter(offers, &c, SortMode::Cheapest)), vec![1]);
    }

    #[test]
    fn layover_filter_excludes_direct_flights() {
        let offers = vec![offer(1, 10000, 0, "2h 0m"), offer(2, 9000, 1, "6h 0m")];
        let mut c = criteria();
        c.filters.layovers = vec![LayoverBucket::Short];
        assert_eq!(ids(&rank_and_filter(offers, &c, SortMode::Cheapest)), vec![2]);
    }

    #[test]
    fn destination_set_anywhere_accepts_all_destinations() {
        let mut elsewhere = offer(2, 9000, 0, "2h 0m");
        elsewhere.to_airport = "FCO".into();
        let offers = vec![offer(1, 10000, 0, "2h 0m"), elsewhere];

        let mut c = criteria();
        c.destinations = DestinationSet::Anywhere;
        assert_eq!(rank_and_filter(offers.clone(), &c, SortMode::Cheapest).len(), 2);

        // the route-scoped criteria only keeps BER
        assert_eq!(ids(&rank_and_filter(offers, &criteria(), SortMode::Cheapest)), vec![1]);
    }

    #[test]
    fn tightening_filters_only_shrinks_the_result() {
        let offers = vec![
            offer(1, 10000, 0, "2h 0m"),
            offer(2, 15000, 1, "6h 0m"),
            offer(3, 30000, 2, "14h 0m"),
        ];

        let loose = rank_and_filter(offers.clone(), &criteria(), SortMode::Cheapest);

        let mut c = criteria();
        c.filters.price_range = Some(PriceRange {
            min: 0.0,
            max: 200.0,
        });
        let tighter = rank_and_filter(offers.clone(), &c, SortMode::Cheapest);
        c.filters.stops = vec![StopBucket::Direct];
        let tightest = rank_and_filter(offers, &c, SortMode::Cheapest);

        assert!(tighter.len() <= loose.len());
        assert!(tightest.len() <= tighter.len());
        assert!(tighter.iter().all(|o| loose.contains(o)));
        assert!(tightest.iter().all(|o| tighter.contains(o)));
    }

    #[test]
    fn direct_filter_keeps_only_the_direct_mock_offer() {
        let offers = skyscout_adapters::mock_offers(&params());
        let mut c = criteria();
        c.filters.stops = vec![StopBucket::Direct];
        let kept = rank_and_filter(offers, &c, SortMode::Cheapest);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].price, 18900);
        assert_eq!(kept[0].stops, 0);
    }

    #[test]
    fn ranking_is_idempotent() {
        let offers = vec![
            offer(1, 10000, 2, "20h 0m"),
            offer(2, 15000, 0, "3h 0m"),
            offer(3, 12000, 1, "5h 0m"),
        ];
        let once = rank_and_filter(offers, &criteria(), SortMode::Best);
        let twice = rank_and_filter(once.clone(), &criteria(), SortMode::Best);
        assert_eq!(once, twice);
    }

    #[test]
    fn registry_orders_enabled_providers_by_priority() {
        let registry = ProviderRegistry::from_yaml_str(
            r#"
providers:
  - id: skyscan
    priority: 2
    mode: fixture
    fixture: fixtures/skyscan/sample/response.json
  - id: amadeus
    priority: 1
    mode: live
    base_url: https://test.api.amadeus.com
    api_key_env: SKYSCOUT_AMADEUS_KEY
  - id: legacy
    enabled: false
    priority: 0
"#,
        )
        .unwrap();

        let ordered = registry.enabled_in_priority_order();
        assert_eq!(
            ordered.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            vec!["amadeus", "skyscan"]
        );
        assert_eq!(ordered[0].mode, ProviderMode::Live);
        assert_eq!(ordered[1].mode, ProviderMode::Fixture);
    }

    #[test]
    fn flag_parsing_accepts_common_truthy_spellings() {
        assert!(parse_flag("1"));
        assert!(parse_flag("true"));
        assert!(parse_flag(" Yes "));
        assert!(parse_flag("on"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag("off"));
        assert!(!parse_flag(""));
    }

    #[test]
    fn deals_take_the_cheapest_offer_per_destination() {
        let mut fco = offer(3, 7400, 0, "2h 0m");
        fco.to_airport = "FCO".into();
        let offers = vec![offer(1, 18900, 0, "2h 15m"), offer(2, 24500, 1, "12h 30m"), fco];

        let now = Utc::now();
        let deals = generate_deals(&offers, now);
        assert_eq!(deals.len(), 2);
        assert_eq!(deals[0].destination, "BER");
        assert_eq!(deals[0].price, 16065); // 18900 minus 15%
        assert_eq!(deals[0].discount_percent, DEAL_DISCOUNT_PERCENT);
        assert_eq!(deals[1].destination, "FCO");
        assert_eq!(deals[1].price, 6290);
        assert!(deals.iter().all(|d| d.valid_until > now));
    }

    fn fixture_registry(entries: &[(&str, &str)]) -> ProviderRegistry {
        ProviderRegistry {
            providers: entries
                .iter()
                .enumerate()
                .map(|(index, (id, fixture))| ProviderEntry {
                    id: id.to_string(),
                    enabled: true,
                    priority: index as u32,
                    mode: ProviderMode::Fixture,
                    base_url: String::new(),
                    api_key_env: None,
                    api_host: None,
                    fixture: Some(
                        Path::new(env!("CARGO_MANIFEST_DIR"))
                            .join("../../fixtures")
                            .join(fixture),
                    ),
                    airport_ids: Default::default(),
                })
                .collect(),
        }
    }

    fn pipeline(registry: ProviderRegistry) -> SearchPipeline {
        SearchPipeline::new(
            registry,
            Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap()),
            Arc::new(HistoryStore::new()),
            Arc::new(DealStore::new()),
        )
    }

    #[tokio::test]
    async fn pipeline_serves_fixture_offers_and_records_history() {
        let p = pipeline(fixture_registry(&[("amadeus", "amadeus/sample/response.json")]));
        let outcome = p.run_search(&params(), &criteria(), SortMode::Cheapest).await;

        assert_eq!(outcome.summary.provider.as_deref(), Some("amadeus"));
        assert!(!outcome.summary.used_fallback);
        assert_eq!(outcome.offers.len(), 3);
        assert_eq!(outcome.offers[0].price, 18900);

        let stats = p.history().stats_for(&params()).await.unwrap();
        assert_eq!(stats.search_count, 1);
        assert_eq!(stats.best_price_seen, Some(18900));
    }

    #[tokio::test]
    async fn blocked_provider_falls_through_to_the_next_one() {
        let p = pipeline(fixture_registry(&[
            ("skyscan", "skyscan/blocked/response.json"),
            ("amadeus", "amadeus/sample/response.json"),
        ]));
        let outcome = p.run_search(&params(), &criteria(), SortMode::Best).await;
        assert_eq!(outcome.summary.provider.as_deref(), Some("amadeus"));
        assert!(!outcome.summary.used_fallback);
    }

    #[tokio::test]
    async fn exhausted_providers_fall_back_to_mock_offers() {
        let p = pipeline(fixture_registry(&[("amadeus", "no/such/fixture.json")]));
        let outcome = p.run_search(&params(), &criteria(), SortMode::Best).await;
        assert!(outcome.summary.used_fallback);
        assert!(outcome.summary.provider.is_none());
        assert_eq!(outcome.offers.len(), 3);
        // the fallback search still lands in the history
        assert_eq!(p.history().len().await, 1);
    }

    #[tokio::test]
    async fn refresh_deals_populates_the_deal_store() {
        let p = pipeline(fixture_registry(&[("amadeus", "amadeus/sample/response.json")]));
        let count = p.refresh_deals().await.unwrap();
        assert!(count >= 1);
        let deals = p.deals().all().await;
        assert_eq!(deals.len(), count);
        assert!(deals.iter().all(|d| d.discount_percent == DEAL_DISCOUNT_PERCENT));
        // refreshing deals is not a user search
        assert!(p.history().is_empty().await);
    }
}
