//! Instrument window models and catalog wire types.
//!
//! An [`InstrumentWindow`] is one time-boxed "Up or Down" market for a
//! tracked asset. Windows are built from catalog events whose title carries
//! the validity range, e.g. `"Bitcoin Up or Down - January 20, 1:30PM-1:45PM ET"`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Days, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Deserialize;

/// Zone in which window titles express their start and end times.
pub const SOURCE_TZ: Tz = chrono_tz::America::New_York;

/// Marker that every tracked event title contains.
pub const UP_OR_DOWN_MARKER: &str = "Up or Down";

/// Length class of the tracked instruments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    FiveMinutes,
    FifteenMinutes,
    OneHour,
}

impl WindowKind {
    /// Returns the short classifier used in configuration (`"5m"`, `"15m"`, `"1h"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowKind::FiveMinutes => "5m",
            WindowKind::FifteenMinutes => "15m",
            WindowKind::OneHour => "1h",
        }
    }

    /// Returns the catalog tag that selects this window class.
    pub fn tag_id(&self) -> u64 {
        match self {
            WindowKind::FiveMinutes => 102892,
            WindowKind::FifteenMinutes => 102467,
            WindowKind::OneHour => 102175,
        }
    }
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WindowKind {
    type Err = crate::RollbookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "5m" => Ok(WindowKind::FiveMinutes),
            "15m" => Ok(WindowKind::FifteenMinutes),
            "1h" => Ok(WindowKind::OneHour),
            other => Err(crate::RollbookError::Config(format!(
                "unknown window classifier {other:?}, expected 5m, 15m or 1h"
            ))),
        }
    }
}

/// One time-boxed instrument, valid on `[start, end)`.
///
/// Immutable once received; a later discovery poll supersedes it with a
/// fresh value rather than mutating it.
#[derive(Debug, Clone)]
pub struct InstrumentWindow {
    pub id: String,
    pub name: String,
    pub asset: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub status: String,
    /// Settlement condition identifiers; the first one is the one recorded.
    pub condition_ids: Vec<String>,
    pub creation_date: Option<String>,
    pub closing_date: Option<String>,
}

impl InstrumentWindow {
    /// Returns `true` if `now` falls in `[start, end)`.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.start <= now && now < self.end
    }

    /// Change-detection identity: two windows are the same session when
    /// their timing matches, whatever their other fields say.
    ///
    /// Two distinct instruments sharing a window are indistinguishable here.
    pub fn same_timing(&self, other: &InstrumentWindow) -> bool {
        self.start == other.start && self.end == other.end
    }
}

/// Parses the validity range out of a window title.
///
/// The title must end in `"- <Month> <Day>, <Start>-<End> ET"` with 12-hour
/// clock times (`1:30PM`). Times are read in [`SOURCE_TZ`] for the given
/// `year`; an end at or before the start crosses midnight and lands on the
/// next day. Returns `None` for any other shape.
pub fn parse_window_title(title: &str, year: i32) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let (_, time_part) = title.rsplit_once(" - ")?;
    let time_part = time_part.replace(" ET", "");
    let (date_str, range) = time_part.trim().split_once(", ")?;
    let (start_str, end_str) = range.split_once('-')?;

    let start = parse_local(date_str, year, start_str)?;
    let mut end = parse_local(date_str, year, end_str)?;
    if end <= start {
        end = end.checked_add_days(Days::new(1))?;
    }

    let start = SOURCE_TZ.from_local_datetime(&start).earliest()?;
    let end = SOURCE_TZ.from_local_datetime(&end).earliest()?;
    Some((start.with_timezone(&Utc), end.with_timezone(&Utc)))
}

fn parse_local(date_str: &str, year: i32, time_str: &str) -> Option<NaiveDateTime> {
    let raw = format!("{} {year} {}", date_str.trim(), time_str.trim());
    NaiveDateTime::parse_from_str(&raw, "%B %d %Y %I:%M%p").ok()
}

/// One event returned by the instrument catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEvent {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    pub title: Option<String>,
    pub ticker: Option<String>,
    pub slug: Option<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(rename = "startDate")]
    pub start_date: Option<String>,
    #[serde(rename = "endDate")]
    pub end_date: Option<String>,
    #[serde(default)]
    pub markets: Vec<CatalogMarket>,
}

impl CatalogEvent {
    /// Returns the first of title, ticker and slug that is present.
    pub fn display_name(&self) -> Option<&str> {
        self.title
            .as_deref()
            .or(self.ticker.as_deref())
            .or(self.slug.as_deref())
    }

    /// Returns the event id as text, whether the catalog sent a string or a number.
    pub fn id_string(&self) -> String {
        match &self.id {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }
}

/// A market nested inside a catalog event.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogMarket {
    #[serde(rename = "conditionId")]
    pub condition_id: Option<String>,
}

/// Market details returned by the subscription-key resolver.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolvedMarket {
    #[serde(default)]
    pub tokens: Vec<ResolvedToken>,
}

/// One tradable outcome token of a resolved market.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolvedToken {
    pub token_id: String,
    pub outcome: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(start: DateTime<Utc>, end: DateTime<Utc>, id: &str) -> InstrumentWindow {
        InstrumentWindow {
            id: id.to_string(),
            name: format!("window {id}"),
            asset: "Bitcoin".to_string(),
            start,
            end,
            status: "active".to_string(),
            condition_ids: vec![format!("0xcond{id}")],
            creation_date: None,
            closing_date: None,
        }
    }

    #[test]
    fn parses_afternoon_window_in_eastern_time() {
        let (start, end) =
            parse_window_title("Bitcoin Up or Down - January 20, 1:30PM-1:45PM ET", 2026).unwrap();
        // EST is UTC-5 in January.
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 1, 20, 18, 30, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 1, 20, 18, 45, 0).unwrap());
    }

    #[test]
    fn end_before_start_crosses_midnight() {
        let (start, end) =
            parse_window_title("XRP Up or Down - July 4, 11:45PM-12:00AM ET", 2026).unwrap();
        // EDT is UTC-4 in July.
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 7, 5, 3, 45, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 7, 5, 4, 0, 0).unwrap());
    }

    #[test]
    fn rejects_titles_without_a_range() {
        assert!(parse_window_title("Bitcoin Up or Down - January 20, 1PM ET", 2026).is_none());
        assert!(parse_window_title("Will it rain tomorrow?", 2026).is_none());
        assert!(
            parse_window_title("Bitcoin Up or Down - Smarch 40, 1:30PM-1:45PM ET", 2026).is_none()
        );
    }

    #[test]
    fn contains_is_half_open() {
        let start = Utc.with_ymd_and_hms(2026, 1, 20, 15, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 1, 20, 15, 15, 0).unwrap();
        let w = window(start, end, "1");
        assert!(w.contains(start));
        assert!(w.contains(end - chrono::Duration::seconds(1)));
        assert!(!w.contains(end));
        assert!(!w.contains(start - chrono::Duration::seconds(1)));
    }

    #[test]
    fn same_timing_ignores_identity_fields() {
        let start = Utc.with_ymd_and_hms(2026, 1, 20, 15, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 1, 20, 15, 15, 0).unwrap();
        let a = window(start, end, "1");
        let b = window(start, end, "2");
        let c = window(end, end + chrono::Duration::minutes(15), "1");
        assert!(a.same_timing(&b));
        assert!(!a.same_timing(&c));
    }

    #[test]
    fn window_kind_round_trips_classifier() {
        for kind in [
            WindowKind::FiveMinutes,
            WindowKind::FifteenMinutes,
            WindowKind::OneHour,
        ] {
            assert_eq!(kind.as_str().parse::<WindowKind>().unwrap(), kind);
        }
        assert_eq!(WindowKind::FifteenMinutes.tag_id(), 102467);
    }
}
