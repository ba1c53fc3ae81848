//! Disabled-window policy: day/time ranges during which a metric must not be
//! fetched.

// crates.io
use chrono::{Datelike, Timelike, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
// self
use crate::_prelude::*;

/// A day/time window during which a metric is disabled.
///
/// A window matches iff `(days empty OR today in days) AND (times empty OR
/// now in some span)`. Times crossing midnight are spans whose end advances
/// one day.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DisabledWindow {
	/// Cron-style comma list of days, e.g. `"0,2-4"`. Both `0` and `7` mean Sunday.
	#[serde(default)]
	pub disabled_days: String,
	/// Time spans of the form `"HH:MM-HH:MM [TZ]"`.
	#[serde(default)]
	pub disabled_times: Vec<String>,
}
impl DisabledWindow {
	/// Whether this window disables fetching at the given instant.
	pub fn matches(&self, now: DateTime<Utc>) -> bool {
		let day_match = match parse_day_set(&self.disabled_days) {
			Some(days) if !days.is_empty() => days.contains(&weekday_number(now, None)),
			_ => true,
		};

		if !day_match {
			return false;
		}

		if self.disabled_times.is_empty() {
			return true;
		}

		self.disabled_times.iter().any(|span| time_span_matches(span, now))
	}
}

/// Parse a cron-style day list (`"0,2-4"`) into a set of weekday numbers in
/// `0..=6` (Sunday = 0). Both `0` and `7` in the source map to Sunday.
fn parse_day_set(spec: &str) -> Option<Vec<u8>> {
	let spec = spec.trim();

	if spec.is_empty() {
		return Some(Vec::new());
	}

	let mut days = Vec::new();

	for part in spec.split(',') {
		let part = part.trim();

		if part.is_empty() {
			continue;
		}

		if let Some((start, end)) = part.split_once('-') {
			let start: u8 = start.trim().parse().ok()?;
			let end: u8 = end.trim().parse().ok()?;

			for day in start..=end {
				days.push(normalize_day(day));
			}
		} else {
			days.push(normalize_day(part.parse().ok()?));
		}
	}

	Some(days)
}

fn normalize_day(day: u8) -> u8 {
	if day == 7 { 0 } else { day }
}

fn weekday_number(now: DateTime<Utc>, tz: Option<Tz>) -> u8 {
	let weekday = match tz {
		Some(tz) => now.with_timezone(&tz).weekday(),
		None => now.weekday(),
	};

	match weekday {
		Weekday::Sun => 0,
		Weekday::Mon => 1,
		Weekday::Tue => 2,
		Weekday::Wed => 3,
		Weekday::Thu => 4,
		Weekday::Fri => 5,
		Weekday::Sat => 6,
	}
}

/// Parse and evaluate one `"HH:MM-HH:MM [TZ]"` span against `now`.
fn time_span_matches(span: &str, now: DateTime<Utc>) -> bool {
	let span = span.trim();
	let mut parts = span.splitn(2, char::is_whitespace);
	let range = parts.next().unwrap_or_default();
	let tz_part = parts.next().map(str::trim).filter(|s| !s.is_empty());

	let Some((start, end)) = range.split_once('-') else { return false };
	let Some(start) = parse_hhmm(start) else { return false };
	let Some(end) = parse_hhmm(end) else { return false };

	let current = match tz_part {
		Some(tz_str) => seconds_from_midnight_in_zone(now, tz_str),
		None => now.num_seconds_from_midnight(),
	};

	if end >= start {
		current >= start && current < end
	} else {
		// Crosses midnight: advance the end by one day's worth of seconds.
		current >= start || current < end
	}
}

fn parse_hhmm(value: &str) -> Option<u32> {
	let (h, m) = value.trim().split_once(':')?;
	let h: u32 = h.parse().ok()?;
	let m: u32 = m.parse().ok()?;

	if h > 23 || m > 59 {
		return None;
	}

	Some(h * 3600 + m * 60)
}

/// Resolve a `TZ` token (alpha zone name or numeric offset like `+0000`) and
/// return the seconds-since-midnight of `now` in that zone.
fn seconds_from_midnight_in_zone(now: DateTime<Utc>, tz: &str) -> u32 {
	if let Ok(zone) = tz.parse::<Tz>() {
		return now.with_timezone(&zone).num_seconds_from_midnight();
	}

	if let Some(offset) = parse_numeric_offset(tz) {
		return (now + offset).num_seconds_from_midnight();
	}

	now.num_seconds_from_midnight()
}

fn parse_numeric_offset(tz: &str) -> Option<chrono::TimeDelta> {
	let sign = if let Some(rest) = tz.strip_prefix('+') {
		(1, rest)
	} else if let Some(rest) = tz.strip_prefix('-') {
		(-1, rest)
	} else {
		return None;
	};
	let digits = sign.1;

	if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
		return None;
	}

	let hours: i64 = digits[0..2].parse().ok()?;
	let mins: i64 = digits[2..4].parse().ok()?;
	let total_secs = sign.0 * (hours * 3600 + mins * 60);

	Some(chrono::TimeDelta::seconds(total_secs))
}
