//! Canonical flight-offer domain model for SkyScout.
//!
//! Every provider adapter normalizes into [`FlightOffer`]; the ranking and
//! filtering stage consumes the same shape. Offers are constructed once per
//! search and never mutated afterwards.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "skyscout-core";

/// Currency assumed when a provider does not state one.
pub const DEFAULT_CURRENCY: &str = "EUR";
/// Aircraft string used when the provider omits the aircraft code.
pub const UNKNOWN_AIRCRAFT: &str = "Unknown";
/// Wall-clock placeholder for timestamps the adapter could not resolve.
pub const PLACEHOLDER_TIME: &str = "--:--";
/// Placeholder for durations the adapter could not resolve. Deliberately
/// not parsable as minutes, so unknown durations sort last, never first.
pub const PLACEHOLDER_DURATION: &str = "--";
/// Layovers at or above this many minutes are classified as long.
pub const LONG_LAYOVER_MINUTES: i64 = 480;

/// One priced, bookable itinerary in provider-agnostic form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightOffer {
    /// Sequential within one search response, starting at 1. Not persistent.
    pub id: u32,
    pub airline: String,
    /// Carrier code + number; multi-segment itineraries join with `" + "`.
    pub flight_number: String,
    pub aircraft_type: String,
    pub from_airport: String,
    pub to_airport: String,
    /// Provider-local `"HH:MM"` string. No timezone or date anchor; layover
    /// arithmetic assumes same-day, same-zone segments.
    pub departure_time: String,
    pub arrival_time: String,
    /// Elapsed time, `"2h 15m"` style.
    pub duration: String,
    pub stops: u32,
    /// Arrival airport of the first segment; present iff `stops > 0`.
    pub layover_airport: Option<String>,
    /// `"Xh Ym"`, only when both adjacent segment instants resolved.
    pub layover_duration: Option<String>,
    /// Minor currency units; always `round(major * 100)`.
    pub price: i64,
    pub currency: String,
    pub is_long_layover: bool,
    /// Heuristic annotations, deduplicated. Not sourced from fare rules.
    pub amenities: Vec<String>,
}

impl FlightOffer {
    pub fn price_major(&self) -> f64 {
        self.price as f64 / 100.0
    }

    /// Hour component of `departure_time`, if the string is a wall-clock time.
    pub fn departure_hour(&self) -> Option<u32> {
        let (hh, _rest) = self.departure_time.split_once(':')?;
        let hour: u32 = hh.trim().parse().ok()?;
        (hour < 24).then_some(hour)
    }
}

/// Original search request, passed through to adapters unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    pub origin: String,
    pub destination: String,
    pub departure_date: NaiveDate,
    #[serde(default)]
    pub return_date: Option<NaiveDate>,
    pub adults: u32,
    #[serde(default)]
    pub max_results: Option<usize>,
}

/// Named total orders over a filtered offer list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortMode {
    #[default]
    Best,
    Cheapest,
    Fastest,
}

impl SortMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortMode::Best => "best",
            SortMode::Cheapest => "cheapest",
            SortMode::Fastest => "fastest",
        }
    }
}

impl std::str::FromStr for SortMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "best" => Ok(SortMode::Best),
            "cheapest" => Ok(SortMode::Cheapest),
            "fastest" => Ok(SortMode::Fastest),
            other => Err(format!("unknown sort mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBucket {
    #[serde(rename = "direct")]
    Direct,
    #[serde(rename = "1-stop")]
    OneStop,
    #[serde(rename = "2-stops")]
    TwoPlusStops,
}

impl StopBucket {
    pub fn for_stops(stops: u32) -> Self {
        match stops {
            0 => StopBucket::Direct,
            1 => StopBucket::OneStop,
            _ => StopBucket::TwoPlusStops,
        }
    }
}

/// Fixed quadrants of the 24-hour clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeBucket {
    #[serde(rename = "00-06")]
    Night,
    #[serde(rename = "06-12")]
    Morning,
    #[serde(rename = "12-18")]
    Afternoon,
    #[serde(rename = "18-24")]
    Evening,
}

impl TimeBucket {
    pub fn for_hour(hour: u32) -> Self {
        match hour {
            0..=5 => TimeBucket::Night,
            6..=11 => TimeBucket::Morning,
            12..=17 => TimeBucket::Afternoon,
            _ => TimeBucket::Evening,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayoverBucket {
    #[serde(rename = "0-3h")]
    Short,
    #[serde(rename = "3-8h")]
    Medium,
    #[serde(rename = "8h+")]
    Long,
}

impl LayoverBucket {
    pub fn for_minutes(minutes: i64) -> Self {
        if minutes < 180 {
            LayoverBucket::Short
        } else if minutes < LONG_LAYOVER_MINUTES {
            LayoverBucket::Medium
        } else {
            LayoverBucket::Long
        }
    }
}

/// Inclusive price range in major currency units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceRange {
    pub min: f64,
    pub max: f64,
}

impl PriceRange {
    /// `min > max` matches nothing; the range is not silently repaired.
    pub fn contains(&self, major: f64) -> bool {
        self.min <= self.max && major >= self.min && major <= self.max
    }
}

/// User-selected filters. Empty collections mean "no restriction".
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FilterBundle {
    #[serde(default)]
    pub price_range: Option<PriceRange>,
    #[serde(default)]
    pub stops: Vec<StopBucket>,
    #[serde(default)]
    pub airlines: Vec<String>,
    #[serde(default)]
    pub departure_windows: Vec<TimeBucket>,
    #[serde(default)]
    pub layovers: Vec<LayoverBucket>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationSet {
    #[default]
    Anywhere,
    Airports(Vec<String>),
}

impl DestinationSet {
    pub fn matches(&self, code: &str) -> bool {
        match self {
            DestinationSet::Anywhere => true,
            DestinationSet::Airports(codes) => {
                codes.iter().any(|c| c.eq_ignore_ascii_case(code))
            }
        }
    }
}

/// Input to the ranking and filtering stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchCriteria {
    pub origins: Vec<String>,
    #[serde(default)]
    pub destinations: DestinationSet,
    pub departure_date: NaiveDate,
    #[serde(default)]
    pub return_date: Option<NaiveDate>,
    pub passengers: u32,
    #[serde(default)]
    pub filters: FilterBundle,
}

impl SearchCriteria {
    pub fn for_route(origin: &str, destination: &str, departure_date: NaiveDate) -> Self {
        Self {
            origins: vec![origin.to_ascii_uppercase()],
            destinations: DestinationSet::Airports(vec![destination.to_ascii_uppercase()]),
            departure_date,
            return_date: None,
            passengers: 1,
            filters: FilterBundle::default(),
        }
    }
}

/// Recoverable failures scoped to a single search request.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("provider {provider} rejected the request with an anti-automation challenge")]
    ProviderBlocked { provider: &'static str },
    #[error("provider {provider} returned an unusable response (status {status:?}): {message}")]
    ProviderError {
        provider: &'static str,
        status: Option<u16>,
        message: String,
    },
    #[error("itinerary contains no segments")]
    MalformedItinerary,
}

/// Render elapsed minutes as `"Xh Ym"`.
pub fn format_duration_minutes(total: i64) -> String {
    let total = total.max(0);
    format!("{}h {}m", total / 60, total % 60)
}

/// Tolerant parse of `"Xh Ym"` strings; accepts `"2h"`, `"45m"`, `"2h 15m"`.
pub fn parse_duration_minutes(text: &str) -> Option<i64> {
    let mut hours: Option<i64> = None;
    let mut minutes: Option<i64> = None;
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        match ch.to_ascii_lowercase() {
            'h' if !current.is_empty() => hours = current.parse().ok(),
            'm' if !current.is_empty() => minutes = current.parse().ok(),
            _ => {}
        }
        current.clear();
    }
    if hours.is_none() && minutes.is_none() {
        return None;
    }
    Some(hours.unwrap_or(0) * 60 + minutes.unwrap_or(0))
}

/// Convert major currency units to minor units, rounding to the cent.
pub fn to_minor_units(major: f64) -> i64 {
    (major * 100.0).round() as i64
}
