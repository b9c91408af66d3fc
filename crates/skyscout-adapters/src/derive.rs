//! Derivation of offer fields that are not copied from provider payloads:
//! stop counts, layover identification, and the heuristic amenity set.

use chrono::NaiveDateTime;
use skyscout_core::{PipelineError, LONG_LAYOVER_MINUTES};

/// Provider-agnostic view of one flown leg, assembled by an adapter before
/// derivation runs.
#[derive(Debug, Clone, Default)]
pub struct RawSegment {
    pub origin: String,
    pub destination: String,
    pub departure: Option<NaiveDateTime>,
    pub arrival: Option<NaiveDateTime>,
    pub carrier: Option<String>,
    pub carrier_name: Option<String>,
    pub flight_number: Option<String>,
    pub aircraft: Option<String>,
}

/// `max(0, n - 1)`; zero segments is a data error, never a negative count.
pub fn stop_count(segments: &[RawSegment]) -> Result<u32, PipelineError> {
    if segments.is_empty() {
        return Err(PipelineError::MalformedItinerary);
    }
    Ok((segments.len() - 1) as u32)
}

/// Arrival airport of the first segment, when the itinerary has a stop.
/// Itineraries with more than one stop still report only the first layover
/// (known limitation of the bare segment model).
pub fn layover_airport(segments: &[RawSegment]) -> Option<String> {
    (segments.len() > 1).then(|| segments[0].destination.clone())
}

/// Wall-clock minutes between segment 1 arrival and segment 2 departure.
/// A negative delta means an overnight or cross-zone itinerary that bare
/// local times cannot resolve; it is reported as unavailable, not wrapped.
pub fn layover_minutes(segments: &[RawSegment]) -> Option<i64> {
    if segments.len() < 2 {
        return None;
    }
    let arrival = segments[0].arrival?;
    let departure = segments[1].departure?;
    let minutes = (departure - arrival).num_minutes();
    (minutes >= 0).then_some(minutes)
}

pub fn is_long_layover(minutes: i64) -> bool {
    minutes >= LONG_LAYOVER_MINUTES
}

/// Total elapsed minutes, first departure to last arrival, when both resolve.
pub fn elapsed_minutes(segments: &[RawSegment]) -> Option<i64> {
    let departure = segments.first()?.departure?;
    let arrival = segments.last()?.arrival?;
    let minutes = (arrival - departure).num_minutes();
    (minutes >= 0).then_some(minutes)
}

/// Heuristic amenity annotations, deduplicated. Always `Refreshments`;
/// `In-flight entertainment` when any segment reports an aircraft; the
/// WiFi / power-outlet draws come from a stable hash of the flight number
/// so results are reproducible without being tied to real fare data.
pub fn amenities(segments: &[RawSegment], flight_number: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(4);
    let push = |label: &str, out: &mut Vec<String>| {
        if !out.iter().any(|a| a == label) {
            out.push(label.to_string());
        }
    };

    push("Refreshments", &mut out);
    if segments.iter().any(|s| s.aircraft.is_some()) {
        push("In-flight entertainment", &mut out);
    }
    let seed = stable_seed(flight_number);
    if seed & 0b01 == 0 {
        push("WiFi", &mut out);
    }
    if seed & 0b10 == 0 {
        push("Power outlets", &mut out);
    }
    out
}

// FNV-1a; std's DefaultHasher is not guaranteed stable across releases.
fn stable_seed(input: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in input.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
