//! TTL expression parsing and partition-cutoff resolution (spec §4.8).

use crate::error::{BackupError, Result};
use chrono::{Datelike, Days, Months, NaiveDate};

/// The resolved partition scope a run will operate under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionScope {
    /// Exact partition keys (a literal key, or a comma-separated set).
    Exact(Vec<String>),
    /// All partitions less-than-or-equal-to the given cutoff key.
    Cutoff(String),
}

impl PartitionScope {
    pub fn exact_from_flag(partition: &str) -> Self {
        PartitionScope::Exact(partition.split(',').map(|s| s.trim().to_string()).collect())
    }
}

/// Parses `"<integer> <unit>"` with unit in {D, DAY, W, WEEK, M, MON, MONTH, Y, YEAR}
/// and computes `today - interval`, formatted `YYYYMMDD`.
pub fn resolve_ttl_cutoff(ttl: &str, today: NaiveDate) -> Result<String> {
    let ttl = ttl.trim();
    let (amount_str, unit) = ttl
        .split_once(' ')
        .ok_or_else(|| BackupError::Config(format!("malformed ttl expression: `{ttl}`")))?;
    let amount: u64 = amount_str
        .trim()
        .parse()
        .map_err(|_| BackupError::Config(format!("ttl interval is not an integer: `{ttl}`")))?;

    let cutoff = match unit.trim().to_uppercase().as_str() {
        "D" | "DAY" => today
            .checked_sub_days(Days::new(amount))
            .ok_or_else(|| BackupError::Config("ttl day interval overflowed calendar".into()))?,
        "W" | "WEEK" => today
            .checked_sub_days(Days::new(amount * 7))
            .ok_or_else(|| BackupError::Config("ttl week interval overflowed calendar".into()))?,
        "M" | "MON" | "MONTH" => today
            .checked_sub_months(Months::new(amount as u32))
            .ok_or_else(|| BackupError::Config("ttl month interval overflowed calendar".into()))?,
        "Y" | "YEAR" => today
            .checked_sub_months(Months::new(amount as u32 * 12))
            .ok_or_else(|| BackupError::Config("ttl year interval overflowed calendar".into()))?,
        other => {
            return Err(BackupError::Config(format!(
                "unknown ttl unit `{other}` (expected D/W/M/Y or DAY/WEEK/MONTH/YEAR)"
            )))
        }
    };

    Ok(format_partition_key(cutoff))
}

pub fn format_partition_key(date: NaiveDate) -> String {
    format!("{:04}{:02}{:02}", date.year(), date.month(), date.day())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn seven_days_before_2024_01_15_is_20240108() {
        let cutoff = resolve_ttl_cutoff("7 D", date(2024, 1, 15)).unwrap();
        assert_eq!(cutoff, "20240108");
    }

    #[test]
    fn accepts_long_unit_names_case_insensitively() {
        assert_eq!(
            resolve_ttl_cutoff("2 week", date(2024, 1, 15)).unwrap(),
            resolve_ttl_cutoff("14 d", date(2024, 1, 15)).unwrap()
        );
        assert_eq!(
            resolve_ttl_cutoff("1 month", date(2024, 3, 31)).unwrap(),
            "20240229"
        );
        assert_eq!(resolve_ttl_cutoff("1 year", date(2024, 3, 31)).unwrap(), "20230331");
    }

    #[test]
    fn rejects_unknown_unit() {
        assert!(resolve_ttl_cutoff("7 fortnight", date(2024, 1, 15)).is_err());
    }

    #[test]
    fn rejects_non_integer_interval() {
        assert!(resolve_ttl_cutoff("a D", date(2024, 1, 15)).is_err());
    }

    #[test]
    fn exact_scope_splits_comma_separated_list() {
        let scope = PartitionScope::exact_from_flag("20230731,20230801");
        assert_eq!(
            scope,
            PartitionScope::Exact(vec!["20230731".into(), "20230801".into()])
        );
    }
}
