//! VBScript dates: an OLE automation date, i.e. days since 1899-12-30 with
//! the time of day in the fractional part.

use std::time::{SystemTime, UNIX_EPOCH};

/// Days from 1970-01-01 to 1899-12-30.
const OLE_EPOCH_OFFSET: i64 = -25_569;

const SECONDS_PER_DAY: f64 = 86_400.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateParts {
    pub year: i64,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let m = i64::from(m);
    let mp = if m > 2 { m - 3 } else { m + 9 };
    let doy = (153 * mp + 2) / 5 + i64::from(d) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

fn days_in_month(year: i64, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        _ => {
            if (year % 4 == 0 && year % 100 != 0) || year % 400 == 0 {
                29
            } else {
                28
            }
        }
    }
}

/// Build an OLE date. Returns `None` for an invalid calendar date or time.
pub fn from_parts(parts: DateParts) -> Option<f64> {
    if !(1..=12).contains(&parts.month) || parts.day == 0 || parts.day > days_in_month(parts.year, parts.month) {
        return None;
    }
    if parts.hour > 23 || parts.minute > 59 || parts.second > 59 {
        return None;
    }
    let days = days_from_civil(parts.year, parts.month, parts.day) - OLE_EPOCH_OFFSET;
    let secs = f64::from(parts.hour * 3600 + parts.minute * 60 + parts.second);
    Some(days as f64 + secs / SECONDS_PER_DAY)
}

/// `DateSerial`: month and day overflow roll into the next unit.
pub fn serial(year: i64, month: i64, day: i64) -> f64 {
    let total_months = year * 12 + (month - 1);
    let y = total_months.div_euclid(12);
    let m = (total_months.rem_euclid(12) + 1) as u32;
    let base = days_from_civil(y, m, 1) - OLE_EPOCH_OFFSET;
    (base + day - 1) as f64
}

pub fn to_parts(ole: f64) -> DateParts {
    let days = ole.floor();
    let mut secs = ((ole - days) * SECONDS_PER_DAY).round() as i64;
    let mut day_index = days as i64;
    if secs >= 86_400 {
        secs -= 86_400;
        day_index += 1;
    }
    let (year, month, day) = civil_from_days(day_index + OLE_EPOCH_OFFSET);
    DateParts {
        year,
        month,
        day,
        hour: (secs / 3600) as u32,
        minute: ((secs % 3600) / 60) as u32,
        second: (secs % 60) as u32,
    }
}

/// Render the way `CStr` does: date only, time only, or both.
pub fn format(ole: f64) -> String {
    let p = to_parts(ole);
    let has_time = p.hour != 0 || p.minute != 0 || p.second != 0;
    let date_only = ole.fract() == 0.0;
    let time_only = (0.0..1.0).contains(&ole);
    let date = format!("{}/{}/{}", p.month, p.day, p.year);
    let (h12, ampm) = match p.hour {
        0 => (12, "AM"),
        1..=11 => (p.hour, "AM"),
        12 => (12, "PM"),
        h => (h - 12, "PM"),
    };
    let time = format!("{h12}:{:02}:{:02} {ampm}", p.minute, p.second);
    if time_only && has_time {
        time
    } else if date_only || !has_time {
        date
    } else {
        format!("{date} {time}")
    }
}

fn parse_time(text: &str) -> Option<(u32, u32, u32)> {
    let lower = text.trim().to_ascii_lowercase();
    let (clock, meridiem) = if let Some(rest) = lower.strip_suffix("am") {
        (rest.trim(), Some(false))
    } else if let Some(rest) = lower.strip_suffix("pm") {
        (rest.trim(), Some(true))
    } else {
        (lower.as_str(), None)
    };
    let mut fields = clock.split(':');
    let mut hour: u32 = fields.next()?.trim().parse().ok()?;
    let minute: u32 = match fields.next() {
        Some(m) => m.trim().parse().ok()?,
        None if meridiem.is_some() => 0,
        None => return None,
    };
    let second: u32 = match fields.next() {
        Some(s) => s.trim().parse().ok()?,
        None => 0,
    };
    if fields.next().is_some() {
        return None;
    }
    match meridiem {
        Some(pm) => {
            if hour == 0 || hour > 12 {
                return None;
            }
            hour %= 12;
            if pm {
                hour += 12;
            }
        }
        None if hour > 23 => return None,
        None => {}
    }
    Some((hour, minute, second))
}

fn parse_calendar(text: &str) -> Option<(i64, u32, u32)> {
    let sep = if text.contains('/') { '/' } else { '-' };
    let fields: Vec<&str> = text.split(sep).collect();
    let [a, b, c] = fields.as_slice() else {
        return None;
    };
    let a_num: i64 = a.trim().parse().ok()?;
    let b_num: u32 = b.trim().parse().ok()?;
    let c_num: i64 = c.trim().parse().ok()?;
    if a.trim().len() == 4 {
        // yyyy-mm-dd
        Some((a_num, b_num, u32::try_from(c_num).ok()?))
    } else {
        // m/d/yyyy, two-digit years pivot at 30 like VBScript
        let year = if c.trim().len() <= 2 {
            if c_num < 30 { 2000 + c_num } else { 1900 + c_num }
        } else {
            c_num
        };
        Some((year, u32::try_from(a_num).ok()?, b_num))
    }
}

/// Parse a date literal body or a string passed to `CDate`.
pub fn parse(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let looks_like_date = text.contains('/') || text.matches('-').count() == 2;
    if !looks_like_date {
        let (h, m, s) = parse_time(text)?;
        return Some(f64::from(h * 3600 + m * 60 + s) / SECONDS_PER_DAY);
    }
    let (date_part, time_part) = match text.split_once(char::is_whitespace) {
        Some((d, t)) => (d, Some(t)),
        None => (text, None),
    };
    let (year, month, day) = parse_calendar(date_part)?;
    let (hour, minute, second) = match time_part {
        Some(t) => parse_time(t)?,
        None => (0, 0, 0),
    };
    from_parts(DateParts { year, month, day, hour, minute, second })
}

/// Current UTC time as an OLE date.
pub fn now() -> f64 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64());
    (secs / SECONDS_PER_DAY).floor() - OLE_EPOCH_OFFSET as f64 + (secs % SECONDS_PER_DAY).floor() / SECONDS_PER_DAY
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn epoch_is_day_zero() {
        assert_eq!(parse("12/30/1899"), Some(0.0));
        assert_eq!(parse("1/1/1900"), Some(2.0));
    }

    #[test]
    fn iso_and_us_forms_agree() {
        assert_eq!(parse("2024-02-29"), parse("2/29/2024"));
        assert!(parse("2023-02-29").is_none());
    }

    #[test]
    fn time_fraction() {
        let v = parse("1/1/2000 6:00 PM").unwrap();
        assert!((v.fract() - 0.75).abs() < 1e-9);
        let p = to_parts(v);
        assert_eq!((p.year, p.month, p.day, p.hour), (2000, 1, 1, 18));
    }

    #[test]
    fn format_round_trip() {
        let v = parse("7/4/1999").unwrap();
        assert_eq!(format(v), "7/4/1999");
        let t = parse("13:05:09").unwrap();
        assert_eq!(format(t), "1:05:09 PM");
        let both = parse("7/4/1999 13:05:09").unwrap();
        assert_eq!(format(both), "7/4/1999 1:05:09 PM");
    }

    #[test]
    fn serial_rolls_months() {
        assert_eq!(serial(2020, 13, 1), parse("1/1/2021").unwrap());
        assert_eq!(serial(2020, 3, 0), parse("2/29/2020").unwrap());
    }
}
