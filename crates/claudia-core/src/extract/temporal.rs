//! Temporal Extraction
//!
//! Resolves deadline dates and temporal markers from text against a
//! reference date, preferring future dates when the year is ambiguous.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use regex::Regex;
use serde_json::json;

/// Classification of a temporal reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerType {
    Deadline,
    Event,
    Period,
    Recurring,
}

impl MarkerType {
    pub fn as_str(self) -> &'static str {
        match self {
            MarkerType::Deadline => "deadline",
            MarkerType::Event => "event",
            MarkerType::Period => "period",
            MarkerType::Recurring => "recurring",
        }
    }
}

/// A temporal reference extracted from text.
#[derive(Debug, Clone, PartialEq)]
pub struct TemporalMarker {
    pub raw_text: String,
    pub resolved_date: Option<NaiveDate>,
    pub marker_type: MarkerType,
    pub confidence: f64,
}

fn weekday_index(name: &str) -> Option<Weekday> {
    match name {
        "monday" | "mon" => Some(Weekday::Mon),
        "tuesday" | "tue" | "tues" => Some(Weekday::Tue),
        "wednesday" | "wed" => Some(Weekday::Wed),
        "thursday" | "thu" | "thur" | "thurs" => Some(Weekday::Thu),
        "friday" | "fri" => Some(Weekday::Fri),
        "saturday" | "sat" => Some(Weekday::Sat),
        "sunday" | "sun" => Some(Weekday::Sun),
        _ => None,
    }
}

fn month_index(name: &str) -> Option<u32> {
    match name {
        "january" | "jan" => Some(1),
        "february" | "feb" => Some(2),
        "march" | "mar" => Some(3),
        "april" | "apr" => Some(4),
        "may" => Some(5),
        "june" | "jun" => Some(6),
        "july" | "jul" => Some(7),
        "august" | "aug" => Some(8),
        "september" | "sep" | "sept" => Some(9),
        "october" | "oct" => Some(10),
        "november" | "nov" => Some(11),
        "december" | "dec" => Some(12),
        _ => None,
    }
}

const DAY_ALTERNATION: &str =
    "monday|tuesday|wednesday|thursday|friday|saturday|sunday|mon|tue|tues|wed|thu|thur|thurs|fri|sat|sun";
const MONTH_ALTERNATION: &str =
    "january|jan|february|feb|march|mar|april|apr|may|june|jun|july|jul|august|aug|september|sept|sep|october|oct|november|nov|december|dec";

static RE_TOMORROW: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\btomorrow\b").unwrap());
static RE_TODAY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\btoday\b").unwrap());
static RE_NEXT_THIS_DAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"\b(next|this)\s+({})\b", DAY_ALTERNATION)).unwrap());
static RE_BY_DAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"\b(?:by|before)\s+({})\b", DAY_ALTERNATION)).unwrap());
static RE_IN_N_UNITS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bin\s+(\d+)\s+(day|days|week|weeks|month|months)\b").unwrap());
static RE_MONTH_DAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"\b(?:by|before|due|on)?\s*({})\s+(\d{{1,2}})(?:st|nd|rd|th)?(?:\s*,?\s*(\d{{4}}))?",
        MONTH_ALTERNATION
    ))
    .unwrap()
});
static RE_DAY_MONTH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"\b(?:by|before|due|on)?\s*(\d{{1,2}})(?:st|nd|rd|th)?\s+({})(?:\s*,?\s*(\d{{4}}))?",
        MONTH_ALTERNATION
    ))
    .unwrap()
});
static RE_QUARTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:(?:end\s+of|before|by)\s+)?[Qq]([1-4])(?:\s+(\d{4}))?\b").unwrap());
static RE_END_OF_MONTH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bend\s+of\s+(?:the\s+)?month\b").unwrap());
static RE_END_OF_WEEK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bend\s+of\s+(?:the\s+)?week\b").unwrap());
static RE_END_OF_YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bend\s+of\s+(?:the\s+)?year\b").unwrap());
static RE_NEXT_WEEK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bnext\s+week\b").unwrap());
static RE_NEXT_MONTH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bnext\s+month\b").unwrap());

/// Next occurrence of `weekday` strictly after `reference`.
fn next_weekday(reference: NaiveDate, weekday: Weekday) -> NaiveDate {
    let mut days_ahead = weekday.num_days_from_monday() as i64
        - reference.weekday().num_days_from_monday() as i64;
    if days_ahead <= 0 {
        days_ahead += 7;
    }
    reference + Duration::days(days_ahead)
}

/// Resolve month/day against the reference year, rolling to next year when
/// the date already passed.
fn resolve_month_day(month: u32, day: u32, reference: NaiveDate) -> Option<NaiveDate> {
    let this_year = NaiveDate::from_ymd_opt(reference.year(), month, day)?;
    if this_year < reference {
        NaiveDate::from_ymd_opt(reference.year() + 1, month, day)
    } else {
        Some(this_year)
    }
}

fn quarter_start(quarter: u32, year: i32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, (quarter - 1) * 3 + 1, 1)
}

fn quarter_end(quarter: u32, year: i32) -> Option<NaiveDate> {
    if quarter == 4 {
        NaiveDate::from_ymd_opt(year, 12, 31)
    } else {
        NaiveDate::from_ymd_opt(year, quarter * 3 + 1, 1).map(|d| d - Duration::days(1))
    }
}

fn last_day_of_month(reference: NaiveDate) -> NaiveDate {
    let (year, month) = if reference.month() == 12 {
        (reference.year() + 1, 1)
    } else {
        (reference.year(), reference.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).expect("valid first-of-month") - Duration::days(1)
}

/// Extract all temporal references from text, deduplicated by
/// (resolved date, marker type) keeping the highest confidence.
pub fn extract_temporal_markers(text: &str, reference: NaiveDate) -> Vec<TemporalMarker> {
    let lowered = text.to_lowercase();
    let mut markers: Vec<TemporalMarker> = Vec::new();

    if RE_TOMORROW.is_match(&lowered) {
        markers.push(TemporalMarker {
            raw_text: "tomorrow".into(),
            resolved_date: Some(reference + Duration::days(1)),
            marker_type: MarkerType::Deadline,
            confidence: 0.95,
        });
    }

    if RE_TODAY.is_match(&lowered) {
        markers.push(TemporalMarker {
            raw_text: "today".into(),
            resolved_date: Some(reference),
            marker_type: MarkerType::Deadline,
            confidence: 0.95,
        });
    }

    for caps in RE_NEXT_THIS_DAY.captures_iter(&lowered) {
        let prefix = &caps[1];
        if let Some(weekday) = weekday_index(&caps[2]) {
            let mut target = next_weekday(reference, weekday);
            if prefix == "next" && target - reference <= Duration::days(7) {
                target += Duration::days(7);
            }
            markers.push(TemporalMarker {
                raw_text: caps[0].to_string(),
                resolved_date: Some(target),
                marker_type: MarkerType::Deadline,
                confidence: 0.9,
            });
        }
    }

    for caps in RE_BY_DAY.captures_iter(&lowered) {
        if let Some(weekday) = weekday_index(&caps[1]) {
            markers.push(TemporalMarker {
                raw_text: caps[0].to_string(),
                resolved_date: Some(next_weekday(reference, weekday)),
                marker_type: MarkerType::Deadline,
                confidence: 0.9,
            });
        }
    }

    for caps in RE_IN_N_UNITS.captures_iter(&lowered) {
        let count: i64 = match caps[1].parse() {
            Ok(n) => n,
            Err(_) => continue,
        };
        let unit = &caps[2];
        let delta = if unit.starts_with("day") {
            Duration::days(count)
        } else if unit.starts_with("week") {
            Duration::weeks(count)
        } else {
            Duration::days(count * 30) // months, approximate
        };
        markers.push(TemporalMarker {
            raw_text: caps[0].to_string(),
            resolved_date: Some(reference + delta),
            marker_type: MarkerType::Deadline,
            confidence: 0.85,
        });
    }

    let month_day = |caps: &regex::Captures, month_group: usize, day_group: usize, conf: f64| {
        let month = month_index(&caps[month_group]);
        let day: Option<u32> = caps[day_group].parse().ok();
        if let (Some(month), Some(day)) = (month, day) {
            if !(1..=31).contains(&day) {
                return None;
            }
            let resolved = match caps.get(3).map(|m| m.as_str()) {
                Some(year_str) => year_str
                    .parse::<i32>()
                    .ok()
                    .and_then(|y| NaiveDate::from_ymd_opt(y, month, day)),
                None => resolve_month_day(month, day, reference),
            };
            return resolved.map(|date| TemporalMarker {
                raw_text: caps[0].trim().to_string(),
                resolved_date: Some(date),
                marker_type: MarkerType::Deadline,
                confidence: conf,
            });
        }
        None
    };

    for caps in RE_MONTH_DAY.captures_iter(&lowered) {
        if let Some(marker) = month_day(&caps, 1, 2, 0.9) {
            markers.push(marker);
        }
    }

    for caps in RE_DAY_MONTH.captures_iter(&lowered) {
        if let Some(marker) = month_day(&caps, 2, 1, 0.85) {
            markers.push(marker);
        }
    }

    for caps in RE_QUARTER.captures_iter(&lowered) {
        let quarter: u32 = match caps[1].parse() {
            Ok(q) => q,
            Err(_) => continue,
        };
        let explicit_year = caps.get(2).and_then(|m| m.as_str().parse::<i32>().ok());
        let year = explicit_year.unwrap_or(reference.year());
        let raw = caps[0].trim().to_string();

        let resolved = if raw.contains("end") || raw.contains("before") || raw.contains("by") {
            quarter_end(quarter, year)
        } else {
            quarter_start(quarter, year)
        };
        let resolved = resolved.map(|d| {
            if d < reference && explicit_year.is_none() {
                d.with_year(d.year() + 1).unwrap_or(d)
            } else {
                d
            }
        });

        markers.push(TemporalMarker {
            raw_text: raw,
            resolved_date: resolved,
            marker_type: MarkerType::Period,
            confidence: 0.8,
        });
    }

    if RE_END_OF_MONTH.is_match(&lowered) {
        markers.push(TemporalMarker {
            raw_text: "end of month".into(),
            resolved_date: Some(last_day_of_month(reference)),
            marker_type: MarkerType::Deadline,
            confidence: 0.85,
        });
    }

    if RE_END_OF_WEEK.is_match(&lowered) {
        // Friday of the current week (or next Friday when already past)
        let mut days_to_friday = Weekday::Fri.num_days_from_monday() as i64
            - reference.weekday().num_days_from_monday() as i64;
        if days_to_friday <= 0 {
            days_to_friday += 7;
        }
        markers.push(TemporalMarker {
            raw_text: "end of week".into(),
            resolved_date: Some(reference + Duration::days(days_to_friday)),
            marker_type: MarkerType::Deadline,
            confidence: 0.85,
        });
    }

    if RE_END_OF_YEAR.is_match(&lowered) {
        markers.push(TemporalMarker {
            raw_text: "end of year".into(),
            resolved_date: NaiveDate::from_ymd_opt(reference.year(), 12, 31),
            marker_type: MarkerType::Deadline,
            confidence: 0.8,
        });
    }

    if RE_NEXT_WEEK.is_match(&lowered) {
        let days_to_monday = 7 - reference.weekday().num_days_from_monday() as i64;
        markers.push(TemporalMarker {
            raw_text: "next week".into(),
            resolved_date: Some(reference + Duration::days(days_to_monday)),
            marker_type: MarkerType::Period,
            confidence: 0.7,
        });
    }

    if RE_NEXT_MONTH.is_match(&lowered) {
        let next = if reference.month() == 12 {
            NaiveDate::from_ymd_opt(reference.year() + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(reference.year(), reference.month() + 1, 1)
        };
        markers.push(TemporalMarker {
            raw_text: "next month".into(),
            resolved_date: next,
            marker_type: MarkerType::Period,
            confidence: 0.7,
        });
    }

    // Deduplicate by (resolved_date, marker_type), keeping the most confident
    let mut best: HashMap<(Option<NaiveDate>, MarkerType), TemporalMarker> = HashMap::new();
    for marker in markers {
        let key = (marker.resolved_date, marker.marker_type);
        match best.get(&key) {
            Some(existing) if existing.confidence >= marker.confidence => {}
            _ => {
                best.insert(key, marker);
            }
        }
    }
    best.into_values().collect()
}

/// Resolve a single temporal expression to its most confident date.
pub fn resolve_relative_date(marker: &str, reference: NaiveDate) -> Option<NaiveDate> {
    extract_temporal_markers(marker, reference)
        .into_iter()
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
        .and_then(|m| m.resolved_date)
}

/// The most likely deadline in commitment text as an ISO date, preferring
/// deadline-typed markers, falling back to any resolved marker.
pub fn extract_deadline(content: &str, reference: NaiveDate) -> Option<String> {
    let markers = extract_temporal_markers(content, reference);

    let best_deadline = markers
        .iter()
        .filter(|m| m.marker_type == MarkerType::Deadline && m.resolved_date.is_some())
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence));
    if let Some(marker) = best_deadline {
        return marker.resolved_date.map(|d| d.to_string());
    }

    markers
        .iter()
        .filter(|m| m.resolved_date.is_some())
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
        .and_then(|m| m.resolved_date)
        .map(|d| d.to_string())
}

/// Serialize markers for the `temporal_markers` column. None when empty.
pub fn markers_to_json(markers: &[TemporalMarker]) -> Option<String> {
    if markers.is_empty() {
        return None;
    }
    let data = json!({
        "references": markers.iter().map(|m| m.raw_text.clone()).collect::<Vec<_>>(),
        "resolved_dates": markers
            .iter()
            .map(|m| m.resolved_date.map(|d| d.to_string()))
            .collect::<Vec<_>>(),
        "types": markers.iter().map(|m| m.marker_type.as_str()).collect::<Vec<_>>(),
    });
    Some(data.to_string())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn wednesday() -> NaiveDate {
        // 2025-06-18 is a Wednesday
        NaiveDate::from_ymd_opt(2025, 6, 18).unwrap()
    }

    #[test]
    fn tomorrow_and_today_resolve() {
        let markers = extract_temporal_markers("finish it tomorrow", wednesday());
        assert_eq!(
            markers[0].resolved_date,
            Some(NaiveDate::from_ymd_opt(2025, 6, 19).unwrap())
        );

        let markers = extract_temporal_markers("due today", wednesday());
        assert_eq!(markers[0].resolved_date, Some(wednesday()));
    }

    #[test]
    fn by_weekday_resolves_to_next_occurrence() {
        let markers = extract_temporal_markers("send it by friday", wednesday());
        let friday = markers
            .iter()
            .find(|m| m.raw_text.contains("friday"))
            .unwrap();
        assert_eq!(
            friday.resolved_date,
            Some(NaiveDate::from_ymd_opt(2025, 6, 20).unwrap())
        );
        assert_eq!(friday.marker_type, MarkerType::Deadline);
    }

    #[test]
    fn next_weekday_skips_a_week() {
        // "next friday" from Wednesday should skip this week's Friday
        let markers = extract_temporal_markers("next friday works", wednesday());
        let friday = markers
            .iter()
            .find(|m| m.raw_text.contains("friday"))
            .unwrap();
        assert_eq!(
            friday.resolved_date,
            Some(NaiveDate::from_ymd_opt(2025, 6, 27).unwrap())
        );
    }

    #[test]
    fn in_n_days_and_weeks() {
        let markers = extract_temporal_markers("ready in 3 days", wednesday());
        assert_eq!(
            markers[0].resolved_date,
            Some(NaiveDate::from_ymd_opt(2025, 6, 21).unwrap())
        );

        let markers = extract_temporal_markers("ready in 2 weeks", wednesday());
        assert_eq!(
            markers[0].resolved_date,
            Some(NaiveDate::from_ymd_opt(2025, 7, 2).unwrap())
        );
    }

    #[test]
    fn month_day_prefers_future_year() {
        // March 1 has passed in June; roll to next year
        let markers = extract_temporal_markers("due march 1", wednesday());
        let resolved = markers
            .iter()
            .filter_map(|m| m.resolved_date)
            .find(|d| d.month() == 3)
            .unwrap();
        assert_eq!(resolved.year(), 2026);

        // September 5 is still ahead
        let markers = extract_temporal_markers("due september 5", wednesday());
        let resolved = markers
            .iter()
            .filter_map(|m| m.resolved_date)
            .find(|d| d.month() == 9)
            .unwrap();
        assert_eq!(resolved.year(), 2025);
    }

    #[test]
    fn explicit_year_is_honored() {
        let markers = extract_temporal_markers("due january 15, 2027", wednesday());
        assert!(markers
            .iter()
            .any(|m| m.resolved_date == NaiveDate::from_ymd_opt(2027, 1, 15)));
    }

    #[test]
    fn quarters_resolve_as_periods() {
        let markers = extract_temporal_markers("targeting end of Q3", wednesday());
        let q3 = markers
            .iter()
            .find(|m| m.marker_type == MarkerType::Period)
            .unwrap();
        assert_eq!(
            q3.resolved_date,
            Some(NaiveDate::from_ymd_opt(2025, 9, 30).unwrap())
        );
    }

    #[test]
    fn end_of_month_week_year() {
        let markers = extract_temporal_markers("wrap up by end of month", wednesday());
        assert!(markers
            .iter()
            .any(|m| m.resolved_date == NaiveDate::from_ymd_opt(2025, 6, 30)));

        let markers = extract_temporal_markers("ship before end of week", wednesday());
        assert!(markers
            .iter()
            .any(|m| m.resolved_date == NaiveDate::from_ymd_opt(2025, 6, 20)));

        let markers = extract_temporal_markers("plan for end of year", wednesday());
        assert!(markers
            .iter()
            .any(|m| m.resolved_date == NaiveDate::from_ymd_opt(2025, 12, 31)));
    }

    #[test]
    fn dedup_keeps_highest_confidence() {
        // "tomorrow" (0.95) and "in 1 days" would both resolve to the same
        // date; the dedupe keeps one marker per (date, type)
        let markers = extract_temporal_markers("do it tomorrow, in 1 days", wednesday());
        let deadline_count = markers
            .iter()
            .filter(|m| {
                m.marker_type == MarkerType::Deadline
                    && m.resolved_date == NaiveDate::from_ymd_opt(2025, 6, 19)
            })
            .count();
        assert_eq!(deadline_count, 1);
        assert!(markers.iter().any(|m| (m.confidence - 0.95).abs() < 1e-9));
    }

    #[test]
    fn extract_deadline_prefers_deadline_markers() {
        let deadline = extract_deadline("I'll send the report by friday", wednesday());
        assert_eq!(deadline.as_deref(), Some("2025-06-20"));

        assert!(extract_deadline("no dates here at all", wednesday()).is_none());
    }

    #[test]
    fn markers_json_shape() {
        let markers = extract_temporal_markers("by friday", wednesday());
        let raw = markers_to_json(&markers).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(parsed["references"].is_array());
        assert!(parsed["resolved_dates"].is_array());
        assert!(parsed["types"].is_array());

        assert!(markers_to_json(&[]).is_none());
    }
}
