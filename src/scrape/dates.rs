//! Date extraction from Italian institutional pages
//!
//! Sitting pages and listing rows spell dates as "23 marzo 2025",
//! "2025-03-23", or "23/03/2025". All three are recognized.

use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref ITALIAN_DATE: Regex = Regex::new(
        r"(?i)(\d{1,2})\s+(gennaio|febbraio|marzo|aprile|maggio|giugno|luglio|agosto|settembre|ottobre|novembre|dicembre)\s+(\d{4})"
    )
    .expect("static regex");
    static ref ISO_DATE: Regex = Regex::new(r"(\d{4})-(\d{2})-(\d{2})").expect("static regex");
    static ref SLASH_DATE: Regex =
        Regex::new(r"(\d{1,2})/(\d{1,2})/(\d{4})").expect("static regex");
}

fn month_number(name: &str) -> Option<u32> {
    let n = match name.to_lowercase().as_str() {
        "gennaio" => 1,
        "febbraio" => 2,
        "marzo" => 3,
        "aprile" => 4,
        "maggio" => 5,
        "giugno" => 6,
        "luglio" => 7,
        "agosto" => 8,
        "settembre" => 9,
        "ottobre" => 10,
        "novembre" => 11,
        "dicembre" => 12,
        _ => return None,
    };
    Some(n)
}

/// Find the first recognizable date in free text.
///
/// Italian long form wins over ISO, which wins over DD/MM/YYYY, matching
/// how the source pages are usually written.
pub fn extract_date(text: &str) -> Option<NaiveDate> {
    if let Some(caps) = ITALIAN_DATE.captures(text) {
        let day: u32 = caps[1].parse().ok()?;
        let month = month_number(&caps[2])?;
        let year: i32 = caps[3].parse().ok()?;
        if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
            return Some(date);
        }
    }

    if let Some(caps) = ISO_DATE.captures(text) {
        let year: i32 = caps[1].parse().ok()?;
        let month: u32 = caps[2].parse().ok()?;
        let day: u32 = caps[3].parse().ok()?;
        if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
            return Some(date);
        }
    }

    if let Some(caps) = SLASH_DATE.captures(text) {
        let day: u32 = caps[1].parse().ok()?;
        let month: u32 = caps[2].parse().ok()?;
        let year: i32 = caps[3].parse().ok()?;
        if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
            return Some(date);
        }
    }

    None
}

/// Extract an ISO date embedded in a filename, e.g. `senato_ddl_2024-03-15_rossi.pdf`
pub fn date_from_filename(filename: &str) -> Option<NaiveDate> {
    for caps in ISO_DATE.captures_iter(filename) {
        let year: i32 = caps[1].parse().ok()?;
        let month: u32 = caps[2].parse().ok()?;
        let day: u32 = caps[3].parse().ok()?;
        if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
            return Some(date);
        }
    }
    None
}
