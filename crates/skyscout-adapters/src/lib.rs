//! Provider adapters for SkyScout.
//!
//! One stateless adapter per upstream flight-data provider. Each adapter
//! builds the provider request, fetches through the shared [`HttpFetcher`],
//! and normalizes the provider payload into [`FlightOffer`] values. Parsing
//! is synchronous and pure so fixture payloads exercise the exact same code
//! path as live responses.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use skyscout_core::{
    format_duration_minutes, to_minor_units, FlightOffer, PipelineError, SearchParams,
    DEFAULT_CURRENCY, PLACEHOLDER_DURATION, PLACEHOLDER_TIME, UNKNOWN_AIRCRAFT,
};
use skyscout_store::HttpFetcher;
use uuid::Uuid;

pub mod derive;

use derive::RawSegment;

pub const CRATE_NAME: &str = "skyscout-adapters";

/// Carrier code used when a segment does not name its airline.
pub const PLACEHOLDER_CARRIER: &str = "XX";

pub const AMADEUS_PROVIDER_ID: &str = "amadeus";
pub const SKYSCAN_PROVIDER_ID: &str = "skyscan";

const AMADEUS_RESULT_CAP: usize = 15;
const SKYSCAN_DEFAULT_CAP: usize = 10;

/// Per-provider connection settings, resolved by the caller from the
/// provider registry and environment.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Host header value for API-gateway providers that require one.
    pub api_host: Option<String>,
    /// IATA code to provider entity id, for providers that key airports by
    /// an internal id instead of the IATA code.
    pub airport_ids: HashMap<String, String>,
}

/// A stateless translator from one provider's search API to canonical
/// offers. Implementations hold no connection state; everything they need
/// arrives as arguments.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_id(&self) -> &'static str;

    /// Maximum offers returned for one search.
    fn result_cap(&self, params: &SearchParams) -> usize;

    fn search_url(&self, config: &ProviderConfig, params: &SearchParams) -> String;

    fn request_headers(&self, _config: &ProviderConfig) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Fetch the raw search payload. Transport retries live in the fetcher;
    /// this method only maps the outcome onto pipeline errors.
    async fn fetch(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
        config: &ProviderConfig,
        params: &SearchParams,
    ) -> Result<JsonValue, PipelineError> {
        let url = self.search_url(config, params);
        let headers = self.request_headers(config);
        let response = http
            .fetch_bytes(run_id, self.provider_id(), &url, &headers)
            .await
            .map_err(|err| PipelineError::ProviderError {
                provider: self.provider_id(),
                status: err.status(),
                message: err.to_string(),
            })?;
        serde_json::from_slice(&response.body).map_err(|_| PipelineError::ProviderError {
            provider: self.provider_id(),
            status: Some(response.status.as_u16()),
            message: "response body is not JSON".into(),
        })
    }

    /// Normalize a raw payload into canonical offers. Pure; never fetches.
    fn parse(
        &self,
        raw: &JsonValue,
        params: &SearchParams,
    ) -> Result<Vec<FlightOffer>, PipelineError>;
}

/// Look up the adapter registered under `provider_id`.
pub fn adapter_for_provider(provider_id: &str) -> Option<Box<dyn ProviderAdapter>> {
    match provider_id {
        AMADEUS_PROVIDER_ID => Some(Box::new(AmadeusAdapter)),
        SKYSCAN_PROVIDER_ID => Some(Box::new(SkyscanAdapter)),
        _ => None,
    }
}

/// Read a stored provider payload, as captured from a live response.
pub fn load_fixture_payload(path: &Path) -> anyhow::Result<JsonValue> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading fixture {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing fixture {}", path.display()))
}

// ---------------------------------------------------------------------------
// Amadeus (flight-offers search)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct AmadeusAdapter;

#[async_trait]
impl ProviderAdapter for AmadeusAdapter {
    fn provider_id(&self) -> &'static str {
        AMADEUS_PROVIDER_ID
    }

    fn result_cap(&self, params: &SearchParams) -> usize {
        params
            .max_results
            .map_or(AMADEUS_RESULT_CAP, |m| m.min(AMADEUS_RESULT_CAP))
    }

    fn search_url(&self, config: &ProviderConfig, params: &SearchParams) -> String {
        let mut url = format!(
            "{}/v2/shopping/flight-offers?originLocationCode={}&destinationLocationCode={}&departureDate={}&adults={}&max={}",
            config.base_url.trim_end_matches('/'),
            params.origin.to_ascii_uppercase(),
            params.destination.to_ascii_uppercase(),
            params.departure_date,
            params.adults,
            self.result_cap(params),
        );
        if let Some(return_date) = params.return_date {
            url.push_str(&format!("&returnDate={return_date}"));
        }
        url
    }

    fn request_headers(&self, config: &ProviderConfig) -> Vec<(String, String)> {
        match &config.api_key {
            Some(key) => vec![("Authorization".into(), format!("Bearer {key}"))],
            None => Vec::new(),
        }
    }

    fn parse(
        &self,
        raw: &JsonValue,
        params: &SearchParams,
    ) -> Result<Vec<FlightOffer>, PipelineError> {
        let data = raw
            .get("data")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| provider_error(AMADEUS_PROVIDER_ID, "response has no data array"))?;
        let carrier_names = raw
            .pointer("/dictionaries/carriers")
            .and_then(JsonValue::as_object);

        let mut offers = Vec::new();
        for item in data.iter().take(self.result_cap(params)) {
            let itinerary = item
                .pointer("/itineraries/0")
                .ok_or(PipelineError::MalformedItinerary)?;
            let segments: Vec<RawSegment> = itinerary
                .get("segments")
                .and_then(JsonValue::as_array)
                .map(|list| list.iter().map(amadeus_segment).collect())
                .unwrap_or_default();

            let duration_minutes = json_str(itinerary, &["duration"])
                .and_then(parse_iso8601_minutes)
                .or_else(|| derive::elapsed_minutes(&segments));

            let price_major = json_str(item, &["price", "total"])
                .and_then(|text| text.parse::<f64>().ok())
                .ok_or_else(|| provider_error(AMADEUS_PROVIDER_ID, "offer has no price.total"))?;
            let price = valid_price(AMADEUS_PROVIDER_ID, price_major)?;
            let currency = json_str(item, &["price", "currency"]).unwrap_or(DEFAULT_CURRENCY);

            let airline = segments
                .first()
                .and_then(|s| s.carrier.as_deref())
                .and_then(|code| carrier_names?.get(code)?.as_str())
                .map(str::to_string);

            offers.push(offer_from_segments(
                offers.len() as u32 + 1,
                &segments,
                duration_minutes,
                price,
                currency,
                airline,
            )?);
        }
        Ok(offers)
    }
}

fn amadeus_segment(raw: &JsonValue) -> RawSegment {
    RawSegment {
        origin: json_str(raw, &["departure", "iataCode"])
            .unwrap_or_default()
            .to_ascii_uppercase(),
        destination: json_str(raw, &["arrival", "iataCode"])
            .unwrap_or_default()
            .to_ascii_uppercase(),
        departure: json_str(raw, &["departure", "at"]).and_then(parse_local_datetime),
        arrival: json_str(raw, &["arrival", "at"]).and_then(parse_local_datetime),
        carrier: json_str(raw, &["carrierCode"]).map(str::to_string),
        carrier_name: None,
        flight_number: json_string_or_number(raw, &["number"]),
        aircraft: json_str(raw, &["aircraft", "code"]).map(str::to_string),
    }
}

// ---------------------------------------------------------------------------
// Skyscan (API-gateway provider)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct SkyscanAdapter;

#[async_trait]
impl ProviderAdapter for SkyscanAdapter {
    fn provider_id(&self) -> &'static str {
        SKYSCAN_PROVIDER_ID
    }

    fn result_cap(&self, params: &SearchParams) -> usize {
        params.max_results.unwrap_or(SKYSCAN_DEFAULT_CAP)
    }

    fn search_url(&self, config: &ProviderConfig, params: &SearchParams) -> String {
        let origin = params.origin.to_ascii_uppercase();
        let destination = params.destination.to_ascii_uppercase();
        let entity = |code: &str| {
            config
                .airport_ids
                .get(code)
                .cloned()
                .unwrap_or_else(|| code.to_string())
        };
        let mut url = format!(
            "{}/api/v1/flights/searchFlights?originSkyId={}&destinationSkyId={}&originEntityId={}&destinationEntityId={}&date={}&adults={}&currency={}",
            config.base_url.trim_end_matches('/'),
            origin,
            destination,
            entity(&origin),
            entity(&destination),
            params.departure_date,
            params.adults,
            DEFAULT_CURRENCY,
        );
        if let Some(return_date) = params.return_date {
            url.push_str(&format!("&returnDate={return_date}"));
        }
        url
    }

    fn request_headers(&self, config: &ProviderConfig) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        if let Some(key) = &config.api_key {
            headers.push(("x-rapidapi-key".into(), key.clone()));
        }
        if let Some(host) = &config.api_host {
            headers.push(("x-rapidapi-host".into(), host.clone()));
        }
        headers
    }

    /// Non-JSON bodies from this provider are usually an interstitial
    /// challenge page, so the body is inspected before giving up.
    async fn fetch(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
        config: &ProviderConfig,
        params: &SearchParams,
    ) -> Result<JsonValue, PipelineError> {
        let url = self.search_url(config, params);
        let headers = self.request_headers(config);
        let response = http
            .fetch_bytes(run_id, self.provider_id(), &url, &headers)
            .await
            .map_err(|err| PipelineError::ProviderError {
                provider: SKYSCAN_PROVIDER_ID,
                status: err.status(),
                message: err.to_string(),
            })?;

        match serde_json::from_slice(&response.body) {
            Ok(value) => Ok(value),
            Err(_) => {
                let text = String::from_utf8_lossy(&response.body);
                if is_challenge_html(&text) {
                    Err(PipelineError::ProviderBlocked {
                        provider: SKYSCAN_PROVIDER_ID,
                    })
                } else {
                    Err(PipelineError::ProviderError {
                        provider: SKYSCAN_PROVIDER_ID,
                        status: Some(response.status.as_u16()),
                        message: "response body is not JSON".into(),
                    })
                }
            }
        }
    }

    fn parse(
        &self,
        raw: &JsonValue,
        params: &SearchParams,
    ) -> Result<Vec<FlightOffer>, PipelineError> {
        if is_captcha_payload(raw) {
            return Err(PipelineError::ProviderBlocked {
                provider: SKYSCAN_PROVIDER_ID,
            });
        }

        let itineraries = raw
            .pointer("/data/itineraries")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| {
                provider_error(SKYSCAN_PROVIDER_ID, "response has no data.itineraries array")
            })?;

        let mut offers = Vec::new();
        for item in itineraries.iter().take(self.result_cap(params)) {
            // outbound leg only; return legs are a separate itinerary entry
            let leg = item
                .pointer("/legs/0")
                .ok_or(PipelineError::MalformedItinerary)?;
            let segments: Vec<RawSegment> = leg
                .get("segments")
                .and_then(JsonValue::as_array)
                .map(|list| list.iter().map(skyscan_segment).collect())
                .unwrap_or_default();

            let duration_minutes = leg
                .get("durationInMinutes")
                .and_then(JsonValue::as_i64)
                .or_else(|| derive::elapsed_minutes(&segments));

            let price_major = json_f64(item, &["price", "raw"])
                .ok_or_else(|| provider_error(SKYSCAN_PROVIDER_ID, "itinerary has no price.raw"))?;
            let price = valid_price(SKYSCAN_PROVIDER_ID, price_major)?;

            offers.push(offer_from_segments(
                offers.len() as u32 + 1,
                &segments,
                duration_minutes,
                price,
                DEFAULT_CURRENCY,
                None,
            )?);
        }
        Ok(offers)
    }
}

fn skyscan_segment(raw: &JsonValue) -> RawSegment {
    RawSegment {
        origin: json_str(raw, &["origin", "displayCode"])
            .unwrap_or_default()
            .to_ascii_uppercase(),
        destination: json_str(raw, &["destination", "displayCode"])
            .unwrap_or_default()
            .to_ascii_uppercase(),
        departure: json_str(raw, &["departure"]).and_then(parse_local_datetime),
        arrival: json_str(raw, &["arrival"]).and_then(parse_local_datetime),
        carrier: json_str(raw, &["marketingCarrier", "alternateId"]).map(str::to_string),
        carrier_name: json_str(raw, &["marketingCarrier", "name"]).map(str::to_string),
        flight_number: json_string_or_number(raw, &["flightNumber"]),
        aircraft: None,
    }
}

/// Structured captcha refusals arrive as JSON with a message or error list
/// mentioning the challenge.
fn is_captcha_payload(raw: &JsonValue) -> bool {
    fn mentions_challenge(text: &str) -> bool {
        let lower = text.to_ascii_lowercase();
        lower.contains("captcha") || lower.contains("challenge")
    }

    if json_str(raw, &["message"]).is_some_and(mentions_challenge) {
        return true;
    }
    raw.get("errors")
        .and_then(JsonValue::as_array)
        .is_some_and(|errors| {
            errors
                .iter()
                .filter_map(JsonValue::as_str)
                .any(mentions_challenge)
        })
}

/// Detect an HTML anti-automation interstitial in place of a JSON body.
fn is_challenge_html(body: &str) -> bool {
    if !body.trim_start().starts_with('<') {
        return false;
    }
    let document = Html::parse_document(body);
    for selector in [
        "form#challenge-form",
        "div.g-recaptcha",
        "iframe[src*=\"captcha\"]",
        "#captcha",
    ] {
        if let Ok(parsed) = Selector::parse(selector) {
            if document.select(&parsed).next().is_some() {
                return true;
            }
        }
    }
    if let Ok(title) = Selector::parse("title") {
        if let Some(node) = document.select(&title).next() {
            let text = node.text().collect::<String>().to_ascii_lowercase();
            return text.contains("captcha") || text.contains("are you a human");
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Mock provider
// ---------------------------------------------------------------------------

/// Deterministic offline offers for the requested route. Last-resort
/// fallback when every configured provider fails, and the payload behind
/// demo deployments.
pub fn mock_offers(params: &SearchParams) -> Vec<FlightOffer> {
    let origin = params.origin.to_ascii_uppercase();
    let destination = params.destination.to_ascii_uppercase();

    let mut offers = vec![
        FlightOffer {
            id: 1,
            airline: "Iberia".into(),
            flight_number: "IB3190".into(),
            aircraft_type: "A320".into(),
            from_airport: origin.clone(),
            to_airport: destination.clone(),
            departure_time: "08:30".into(),
            arrival_time: "10:45".into(),
            duration: "2h 15m".into(),
            stops: 0,
            layover_airport: None,
            layover_duration: None,
            price: 18900,
            currency: DEFAULT_CURRENCY.into(),
            is_long_layover: false,
            amenities: vec!["Refreshments".into(), "In-flight entertainment".into()],
        },
        FlightOffer {
            id: 2,
            airline: "Lufthansa".into(),
            flight_number: "LH1801 + LH2402".into(),
            aircraft_type: "A319".into(),
            from_airport: origin.clone(),
            to_airport: destination.clone(),
            departure_time: "11:30".into(),
            arrival_time: "00:00".into(),
            duration: "12h 30m".into(),
            stops: 1,
            layover_airport: Some("AMS".into()),
            layover_duration: Some("8h 30m".into()),
            price: 24500,
            currency: DEFAULT_CURRENCY.into(),
            is_long_layover: true,
            amenities: vec![
                "Refreshments".into(),
                "In-flight entertainment".into(),
                "WiFi".into(),
            ],
        },
        FlightOffer {
            id: 3,
            airline: "Air France".into(),
            flight_number: "AF1001 + AF1434".into(),
            aircraft_type: UNKNOWN_AIRCRAFT.into(),
            from_airport: origin,
            to_airport: destination,
            departure_time: "09:05".into(),
            arrival_time: "17:20".into(),
            duration: "8h 15m".into(),
            stops: 1,
            layover_airport: Some("CDG".into()),
            layover_duration: Some("2h 40m".into()),
            price: 21500,
            currency: DEFAULT_CURRENCY.into(),
            is_long_layover: false,
            amenities: vec!["Refreshments".into(), "Power outlets".into()],
        },
    ];

    if let Some(max) = params.max_results {
        offers.truncate(max);
    }
    offers
}

// ---------------------------------------------------------------------------
// Shared normalization
// ---------------------------------------------------------------------------

fn offer_from_segments(
    id: u32,
    segments: &[RawSegment],
    duration_minutes: Option<i64>,
    price: i64,
    currency: &str,
    airline_override: Option<String>,
) -> Result<FlightOffer, PipelineError> {
    let stops = derive::stop_count(segments)?;
    let first = &segments[0];
    let last = &segments[segments.len() - 1];

    let flight_number = segments
        .iter()
        .map(segment_flight_number)
        .collect::<Vec<_>>()
        .join(" + ");
    let aircraft_type = segments
        .iter()
        .find_map(|s| s.aircraft.clone())
        .unwrap_or_else(|| UNKNOWN_AIRCRAFT.to_string());
    let airline = airline_override
        .or_else(|| first.carrier_name.clone())
        .or_else(|| first.carrier.clone())
        .unwrap_or_else(|| PLACEHOLDER_CARRIER.to_string());

    let layover_minutes = derive::layover_minutes(segments);
    let amenities = derive::amenities(segments, &flight_number);

    Ok(FlightOffer {
        id,
        airline,
        flight_number,
        aircraft_type,
        from_airport: first.origin.clone(),
        to_airport: last.destination.clone(),
        departure_time: wall_clock(first.departure),
        arrival_time: wall_clock(last.arrival),
        // unknown stays unknown; a fabricated "0h 0m" would win every
        // duration-based sort
        duration: duration_minutes
            .map(format_duration_minutes)
            .unwrap_or_else(|| PLACEHOLDER_DURATION.to_string()),
        stops,
        layover_airport: derive::layover_airport(segments),
        layover_duration: layover_minutes.map(format_duration_minutes),
        price,
        currency: currency.to_string(),
        is_long_layover: layover_minutes.map(derive::is_long_layover).unwrap_or(false),
        amenities,
    })
}

fn segment_flight_number(segment: &RawSegment) -> String {
    let carrier = segment.carrier.as_deref().unwrap_or(PLACEHOLDER_CARRIER);
    let number = segment.flight_number.as_deref().unwrap_or("000");
    format!("{carrier}{number}")
}

fn wall_clock(instant: Option<NaiveDateTime>) -> String {
    match instant {
        Some(dt) => dt.format("%H:%M").to_string(),
        None => PLACEHOLDER_TIME.to_string(),
    }
}

fn provider_error(provider: &'static str, message: &str) -> PipelineError {
    PipelineError::ProviderError {
        provider,
        status: None,
        message: message.to_string(),
    }
}

/// Prices must be finite and non-negative before conversion to minor units.
fn valid_price(provider: &'static str, major: f64) -> Result<i64, PipelineError> {
    if !major.is_finite() || major < 0.0 {
        return Err(PipelineError::ProviderError {
            provider,
            status: None,
            message: format!("offer has an invalid price: {major}"),
        });
    }
    Ok(to_minor_units(major))
}

/// Local timestamps as providers send them, with or without seconds.
fn parse_local_datetime(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M"))
        .ok()
}

/// `"PT12H30M"` style durations, minutes precision.
fn parse_iso8601_minutes(text: &str) -> Option<i64> {
    let rest = text.strip_prefix("PT")?;
    let mut minutes = 0i64;
    let mut current = String::new();
    let mut seen = false;
    for ch in rest.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        match ch {
            'H' => minutes += current.parse::<i64>().ok()? * 60,
            'M' => minutes += current.parse::<i64>().ok()?,
            _ => return None,
        }
        seen = true;
        current.clear();
    }
    seen.then_some(minutes)
}

// JSON path helpers; provider payloads are too irregular for typed structs.

fn json_value<'a>(root: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut current = root;
    for key in path {
        current = current.get(key)?;
    }
    Some(current)
}

fn json_str<'a>(root: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_value(root, path)?.as_str()
}

fn json_f64(root: &JsonValue, path: &[&str]) -> Option<f64> {
    let value = json_value(root, path)?;
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn json_string_or_number(root: &JsonValue, path: &[&str]) -> Option<String> {
    let value = json_value(root, path)?;
    value
        .as_str()
        .map(str::to_string)
        .or_else(|| value.as_u64().map(|n| n.to_string()))
}
