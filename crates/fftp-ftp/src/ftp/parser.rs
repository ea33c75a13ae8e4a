//! LIST response parser.
//!
//! Two line shapes are understood:
//! 1. **Unix** (`ls -l`): `-rw-r--r-- 1 owner group 1234 Jan  1 12:00 file.txt`
//! 2. **Windows/IIS**: `01-01-26  12:00AM       1234 file.txt`
//!
//! Lines matching neither (e.g. `total 12`) are dropped, as are the `.`
//! and `..` pseudo-entries.

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref UNIX_RE: Option<Regex> = Regex::new(
        r"(?x)
        ^([dlcbps-][rwxsStT-]{9})[@+.]?\s+  # permissions
        (\d+)\s+                             # link count
        (\S+)\s+                             # owner
        (?:(\S+)\s+)?                        # group
        (\d+)\s+                             # size
        (\w{3}\s+\d{1,2}\s+(?:\d{1,2}:\d{2}|\d{4}))\s # date
        (.+)$                                # name (possibly `link -> target`)
        ",
    )
    .ok();
    static ref WINDOWS_RE: Option<Regex> = Regex::new(
        r"(?x)
        ^(\d{2}-\d{2}-\d{2,4})\s+            # date
        (\d{1,2}:\d{2}\s*(?:AM|PM)?)\s+      # time
        (<DIR>|\d+)\s+                       # size or <DIR>
        (.+)$                                # name
        ",
    )
    .ok();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    pub name: String,
    pub is_dir: bool,
    pub is_link: bool,
    pub size: u64,
    /// Date text as the server printed it.
    pub modified: String,
    /// The same instant as unix seconds, read as server-local time.
    pub modified_unix: Option<i64>,
}

/// Parse a full LIST body.
pub fn parse_listing(raw: &str) -> Vec<ListedEntry> {
    raw.lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty())
        .filter_map(parse_line)
        .filter(|e| e.name != "." && e.name != "..")
        .collect()
}

pub fn parse_line(line: &str) -> Option<ListedEntry> {
    parse_unix(line).or_else(|| parse_windows(line))
}

// ─── Unix-style ──────────────────────────────────────────────────────

fn parse_unix(line: &str) -> Option<ListedEntry> {
    let caps = UNIX_RE.as_ref()?.captures(line.trim_start())?;

    let perms = caps.get(1)?.as_str();
    let size = caps.get(5)?.as_str().parse::<u64>().unwrap_or(0);
    let date = caps.get(6)?.as_str();
    let name_raw = caps.get(7)?.as_str();

    let is_dir = perms.starts_with('d');
    let is_link = perms.starts_with('l');
    let name = if is_link {
        name_raw.split(" -> ").next().unwrap_or(name_raw)
    } else {
        name_raw
    };

    let modified = date.split_whitespace().collect::<Vec<_>>().join(" ");
    Some(ListedEntry {
        name: name.to_string(),
        is_dir,
        is_link,
        size: if is_dir { 0 } else { size },
        modified_unix: parse_unix_date(&modified, Local::now().naive_local()),
        modified,
    })
}

/// `Jan 1 12:00` (within the last year) or `Jan 1 2025`.
pub(crate) fn parse_unix_date(s: &str, now: NaiveDateTime) -> Option<i64> {
    let dt = if s.contains(':') {
        let in_year = |year: i32| NaiveDateTime::parse_from_str(&format!("{} {}", year, s), "%Y %b %d %H:%M").ok();
        // Entries with a time of day are recent, so a date "in the future"
        // belongs to last year. Feb 29 outside a leap year goes back to the
        // latest one.
        match in_year(now.year()) {
            Some(dt) if dt <= now + chrono::Duration::days(1) => dt,
            _ => (1..=4).find_map(|back| in_year(now.year() - back))?,
        }
    } else {
        NaiveDate::parse_from_str(s, "%b %d %Y")
            .ok()?
            .and_time(NaiveTime::from_hms_opt(0, 0, 0)?)
    };
    local_timestamp(dt)
}

// ─── Windows-style ───────────────────────────────────────────────────

fn parse_windows(line: &str) -> Option<ListedEntry> {
    let caps = WINDOWS_RE.as_ref()?.captures(line.trim_start())?;

    let date = caps.get(1)?.as_str();
    let time = caps.get(2)?.as_str();
    let size_or_dir = caps.get(3)?.as_str();
    let name = caps.get(4)?.as_str().trim_end().to_string();

    let is_dir = size_or_dir == "<DIR>";
    let size = if is_dir { 0 } else { size_or_dir.parse::<u64>().unwrap_or(0) };
    let modified = format!("{} {}", date, time);

    Some(ListedEntry {
        name,
        is_dir,
        is_link: false,
        size,
        modified_unix: parse_windows_date(date, time),
        modified,
    })
}

fn parse_windows_date(date: &str, time: &str) -> Option<i64> {
    let time = time.replace(' ', "");
    let combined = format!("{} {}", date, time);
    let formats = ["%m-%d-%y %I:%M%p", "%m-%d-%Y %I:%M%p", "%m-%d-%y %H:%M", "%m-%d-%Y %H:%M"];
    formats
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(&combined, f).ok())
        .and_then(local_timestamp)
}

fn local_timestamp(dt: NaiveDateTime) -> Option<i64> {
    Local.from_local_datetime(&dt).earliest().map(|t| t.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_file_and_dir() {
        let raw = "total 8\r\n\
                   drwxr-xr-x   2 root root  4096 Mar  1 09:30 subdir\r\n\
                   -rw-r--r--   1 user group  1234 Jan  1  2024 read me.txt\r\n";
        let entries = parse_listing(raw);
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_dir);
        assert_eq!(entries[0].size, 0);
        assert_eq!(entries[1].name, "read me.txt");
        assert_eq!(entries[1].size, 1234);
        assert_eq!(entries[1].modified, "Jan 1 2024");
        assert!(entries[1].modified_unix.is_some());
    }

    #[test]
    fn symlink_keeps_link_name() {
        let entries = parse_listing("lrwxrwxrwx   1 root root    22 Jan  5 08:00 link -> /var/target");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "link");
        assert!(entries[0].is_link);
        assert!(!entries[0].is_dir);
    }

    #[test]
    fn dot_entries_are_dropped() {
        let raw = "drwxr-xr-x 2 u g 4096 Jan 1 12:00 .\n\
                   drwxr-xr-x 2 u g 4096 Jan 1 12:00 ..\n\
                   -rw-r--r-- 1 u g 10 Jan 1 12:00 real.txt";
        let names: Vec<_> = parse_listing(raw).into_iter().map(|e| e.name).collect();
        assert_eq!(names, ["real.txt"]);
    }

    #[test]
    fn windows_lines() {
        let raw = "01-01-26  12:00AM      <DIR>          My Documents\r\n\
                   02-15-26  03:04PM               512 notes.txt\r\n";
        let entries = parse_listing(raw);
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_dir);
        assert_eq!(entries[0].name, "My Documents");
        assert_eq!(entries[1].size, 512);
        assert!(entries[1].modified_unix.is_some());
    }

    #[test]
    fn future_time_rolls_back_a_year() {
        let now = NaiveDate::from_ymd_opt(2026, 1, 10)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .unwrap();
        let ts = parse_unix_date("Dec 30 08:00", now).unwrap();
        let expected = local_timestamp(
            NaiveDate::from_ymd_opt(2025, 12, 30)
                .and_then(|d| d.and_hms_opt(8, 0, 0))
                .unwrap(),
        )
        .unwrap();
        assert_eq!(ts, expected);
    }

    #[test]
    fn leap_day_in_a_common_year() {
        let now = NaiveDate::from_ymd_opt(2025, 3, 10)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .unwrap();
        let ts = parse_unix_date("Feb 29 10:00", now).unwrap();
        let expected = local_timestamp(
            NaiveDate::from_ymd_opt(2024, 2, 29)
                .and_then(|d| d.and_hms_opt(10, 0, 0))
                .unwrap(),
        )
        .unwrap();
        assert_eq!(ts, expected);
        assert!(parse_unix_date("Feb 30 10:00", now).is_none());
    }
}
