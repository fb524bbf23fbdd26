//! HTTP-date parsing and formatting
//!
//! Accepts the three formats found in `Date` and cookie `Expires` values:
//!
//! - IMF-fixdate: `Sun, 06 Nov 1994 08:49:37 GMT`
//! - RFC 850: `Sunday, 06-Nov-94 08:49:37 GMT` (four-digit years too)
//! - asctime: `Sun Nov  6 08:49:37 1994`
//!
//! Output is always IMF-fixdate.

use super::{Error, Result};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];
/// Years accepted in parsed dates
const YEARS: std::ops::RangeInclusive<i64> = 1601..=9999;

const DAYS: [&str; 7] = ["Thu", "Fri", "Sat", "Sun", "Mon", "Tue", "Wed"];

/// Broken-down UTC time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Civil {
    year: i64,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
}

impl Civil {
    fn validate(self) -> Result<Self> {
        let valid = YEARS.contains(&self.year)
            && (1..=12).contains(&self.month)
            && (1..=31).contains(&self.day)
            && self.hour < 24
            && self.minute < 60
            && self.second <= 60;
        if valid {
            Ok(self)
        } else {
            Err(Error::Parse(format!("date out of range: {:?}", self)))
        }
    }

    fn to_system_time(self) -> Result<SystemTime> {
        let days = days_from_civil(self.year, self.month, self.day);
        let secs = days * 86_400
            + i64::from(self.hour) * 3_600
            + i64::from(self.minute) * 60
            + i64::from(self.second);
        if secs >= 0 {
            UNIX_EPOCH
                .checked_add(Duration::from_secs(secs as u64))
                .ok_or_else(|| Error::Parse("date past representable range".to_string()))
        } else {
            UNIX_EPOCH
                .checked_sub(Duration::from_secs(secs.unsigned_abs()))
                .ok_or_else(|| Error::Parse("date before representable range".to_string()))
        }
    }
}

/// Days since 1970-01-01 of a proleptic Gregorian date
fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let m = i64::from(month);
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + i64::from(day) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// Inverse of [`days_from_civil`]
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

fn parse_month(s: &str) -> Result<u32> {
    MONTHS
        .iter()
        .position(|m| m.eq_ignore_ascii_case(s))
        .map(|i| i as u32 + 1)
        .ok_or_else(|| Error::Parse(format!("invalid month: {}", s)))
}

fn parse_number<T: std::str::FromStr>(s: &str, what: &str) -> Result<T> {
    s.parse()
        .map_err(|_| Error::Parse(format!("invalid {}: {}", what, s)))
}

fn parse_clock(s: &str) -> Result<(u32, u32, u32)> {
    let mut parts = s.split(':');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(m), Some(s), None) => Ok((
            parse_number(h, "hour")?,
            parse_number(m, "minute")?,
            parse_number(s, "second")?,
        )),
        _ => Err(Error::Parse(format!("invalid time of day: {}", s))),
    }
}

fn expect_gmt(zone: &str) -> Result<()> {
    if zone.eq_ignore_ascii_case("GMT") || zone.eq_ignore_ascii_case("UTC") {
        Ok(())
    } else {
        Err(Error::Parse(format!("unsupported time zone: {}", zone)))
    }
}

/// Two-digit years 70-99 belong to the 1900s, the rest to the 2000s
fn widen_year(year: i64) -> i64 {
    match year {
        0..=69 => year + 2000,
        70..=99 => year + 1900,
        _ => year,
    }
}

/// `06 Nov 1994 08:49:37 GMT`
fn parse_imf_fixdate(rest: &str) -> Result<Civil> {
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let [day, month, year, clock, zone] = parts[..] else {
        return Err(Error::Parse(format!("invalid IMF-fixdate: {}", rest)));
    };
    expect_gmt(zone)?;
    let (hour, minute, second) = parse_clock(clock)?;
    Civil {
        year: parse_number(year, "year")?,
        month: parse_month(month)?,
        day: parse_number(day, "day")?,
        hour,
        minute,
        second,
    }
    .validate()
}

/// `06-Nov-94 08:49:37 GMT`
fn parse_rfc850(rest: &str) -> Result<Civil> {
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let [date, clock, zone] = parts[..] else {
        return Err(Error::Parse(format!("invalid RFC 850 date: {}", rest)));
    };
    let fields: Vec<&str> = date.split('-').collect();
    let [day, month, year] = fields[..] else {
        return Err(Error::Parse(format!("invalid RFC 850 date: {}", rest)));
    };
    expect_gmt(zone)?;
    let (hour, minute, second) = parse_clock(clock)?;
    Civil {
        year: widen_year(parse_number(year, "year")?),
        month: parse_month(month)?,
        day: parse_number(day, "day")?,
        hour,
        minute,
        second,
    }
    .validate()
}

/// `Sun Nov  6 08:49:37 1994`
fn parse_asctime(input: &str) -> Result<Civil> {
    let parts: Vec<&str> = input.split_whitespace().collect();
    let [_weekday, month, day, clock, year] = parts[..] else {
        return Err(Error::Parse(format!("invalid asctime date: {}", input)));
    };
    let (hour, minute, second) = parse_clock(clock)?;
    Civil {
        year: parse_number(year, "year")?,
        month: parse_month(month)?,
        day: parse_number(day, "day")?,
        hour,
        minute,
        second,
    }
    .validate()
}

/// Parse an HTTP-date in any of the accepted formats.
///
/// The weekday name is not checked against the date.
pub fn parse_http_date(input: &str) -> Result<SystemTime> {
    let input = input.trim();
    if input.is_empty() {
        return Err(Error::Parse("empty date".to_string()));
    }

    let civil = match input.split_once(',') {
        Some((_weekday, rest)) if rest.contains('-') => parse_rfc850(rest)?,
        Some((_weekday, rest)) => parse_imf_fixdate(rest)?,
        None => parse_asctime(input)?,
    };
    civil.to_system_time()
}

/// Format `time` as an IMF-fixdate
pub fn format_http_date(time: SystemTime) -> String {
    let secs = match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    };
    let days = secs.div_euclid(86_400);
    let tod = secs.rem_euclid(86_400);
    let (year, month, day) = civil_from_days(days);

    format!(
        "{}, {:02} {} {:04} {:02}:{:02}:{:02} GMT",
        DAYS[days.rem_euclid(7) as usize],
        day,
        MONTHS[month as usize - 1],
        year,
        tod / 3_600,
        tod % 3_600 / 60,
        tod % 60
    )
}
