//! Timeline aggregation of probe history.
//!
//! Buckets are recomputed on every query and never stored.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use crate::db::{Category, DbError, ProbeRecord, RecordFilter, Store, TargetId};

/// Aggregation resolution for a timeline query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// One point per record.
    None,
    Hour,
    #[serde(rename = "6hour")]
    SixHour,
    Day,
}

impl Resolution {
    /// Bucket width in seconds, `None` for per-record points.
    pub fn width_secs(&self) -> Option<i64> {
        match self {
            Resolution::None => None,
            Resolution::Hour => Some(3600),
            Resolution::SixHour => Some(6 * 3600),
            Resolution::Day => Some(86400),
        }
    }

    /// Default resolution for a window reaching back `hours`.
    pub fn for_span(hours: f64) -> Self {
        if hours <= 1.5 {
            Resolution::None
        } else if hours <= 48.0 {
            Resolution::Hour
        } else if hours <= 168.0 {
            Resolution::SixHour
        } else {
            Resolution::Day
        }
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Resolution::None),
            "hour" => Ok(Resolution::Hour),
            "6hour" => Ok(Resolution::SixHour),
            "day" => Ok(Resolution::Day),
            other => Err(format!("unknown aggregation: {}", other)),
        }
    }
}

/// A half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The range ending now and reaching back the given number of hours.
    pub fn last_hours(hours: f64) -> Self {
        let end = Utc::now();
        let span = ChronoDuration::milliseconds((hours * 3_600_000.0) as i64);
        Self { start: end - span, end }
    }
}

/// Aggregate over one bucket of a timeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineBucket {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total: u32,
    pub healthy: u32,
    pub degraded: u32,
    pub unhealthy: u32,
    pub unmatched: u32,
    /// Healthy share of categorized records; `None` when there are none.
    pub uptime_percentage: Option<f64>,
    pub avg_latency_ms: Option<f64>,
    /// Worst category present, ignoring unmatched records.
    pub dominant: Option<Category>,
    /// Most frequent rule name among records of the dominant category.
    pub status_name: Option<String>,
}

impl TimelineBucket {
    fn empty(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            total: 0,
            healthy: 0,
            degraded: 0,
            unhealthy: 0,
            unmatched: 0,
            uptime_percentage: None,
            avg_latency_ms: None,
            dominant: None,
            status_name: None,
        }
    }

    fn from_records(start: DateTime<Utc>, end: DateTime<Utc>, records: &[&ProbeRecord]) -> Self {
        let mut bucket = Self::empty(start, end);
        let mut latency_sum = 0u64;
        let mut latency_count = 0u64;

        for record in records {
            bucket.total += 1;
            match record.category {
                Category::Healthy => bucket.healthy += 1,
                Category::Degraded => bucket.degraded += 1,
                Category::Unhealthy => bucket.unhealthy += 1,
                Category::Unmatched => bucket.unmatched += 1,
            }
            if let Some(latency) = record.latency_ms {
                latency_sum += latency;
                latency_count += 1;
            }
        }

        bucket.uptime_percentage = uptime(bucket.healthy, bucket.healthy + bucket.degraded + bucket.unhealthy);
        if latency_count > 0 {
            bucket.avg_latency_ms = Some(latency_sum as f64 / latency_count as f64);
        }

        bucket.dominant = [Category::Unhealthy, Category::Degraded, Category::Healthy]
            .into_iter()
            .find(|c| bucket.count(*c) > 0);
        if let Some(dominant) = bucket.dominant {
            bucket.status_name = most_frequent_rule(records.iter().copied().filter(|r| r.category == dominant));
        }

        bucket
    }

    fn count(&self, category: Category) -> u32 {
        match category {
            Category::Healthy => self.healthy,
            Category::Degraded => self.degraded,
            Category::Unhealthy => self.unhealthy,
            Category::Unmatched => self.unmatched,
        }
    }
}

/// One target's buckets plus the uptime over the whole range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineSeries {
    pub buckets: Vec<TimelineBucket>,
    pub uptime_percentage: Option<f64>,
}

fn uptime(healthy: u32, categorized: u32) -> Option<f64> {
    if categorized == 0 {
        return None;
    }
    Some(f64::from(healthy) / f64::from(categorized) * 100.0)
}

fn most_frequent_rule<'a>(records: impl Iterator<Item = &'a ProbeRecord>) -> Option<String> {
    let mut counts: BTreeMap<&str, u32> = BTreeMap::new();
    for record in records {
        if let Some(name) = record.rule_name.as_deref() {
            *counts.entry(name).or_default() += 1;
        }
    }
    // Ties go to the alphabetically first name
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(a.0)))
        .map(|(name, _)| name.to_string())
}

/// Truncate a timestamp to the start of its window.
pub fn truncate_to_window(dt: DateTime<Utc>, window_seconds: i64) -> DateTime<Utc> {
    let ts = dt.timestamp();
    let truncated = ts - ts.rem_euclid(window_seconds);
    DateTime::from_timestamp(truncated, 0).unwrap_or(dt)
}

/// Aggregate records into buckets covering `range`, oldest first.
///
/// Records outside the range are ignored. Empty windows are kept as
/// placeholders so the result has a fixed length for a given range.
pub fn aggregate(records: &[ProbeRecord], range: TimeRange, resolution: Resolution) -> Vec<TimelineBucket> {
    let mut in_range: Vec<&ProbeRecord> = records
        .iter()
        .filter(|r| r.checked_at >= range.start && r.checked_at < range.end)
        .collect();
    in_range.sort_by_key(|r| (r.checked_at, r.id));

    let Some(width) = resolution.width_secs() else {
        return in_range
            .iter()
            .map(|r| TimelineBucket::from_records(r.checked_at, r.checked_at, &[*r]))
            .collect();
    };
    let step = ChronoDuration::seconds(width);

    let mut buckets = Vec::new();
    let mut records = in_range.into_iter().peekable();
    let mut start = truncate_to_window(range.start, width);

    while start < range.end {
        let end = start + step;
        let mut members = Vec::new();
        while let Some(record) = records.next_if(|r| r.checked_at < end) {
            members.push(record);
        }
        buckets.push(TimelineBucket::from_records(start, end, &members));
        start = end;
    }

    buckets
}

/// Healthy share of all categorized records.
pub fn series_uptime(records: &[ProbeRecord]) -> Option<f64> {
    let healthy = records.iter().filter(|r| r.category == Category::Healthy).count() as u32;
    let categorized = records.iter().filter(|r| r.category != Category::Unmatched).count() as u32;
    uptime(healthy, categorized)
}

/// Timeline of one target.
pub fn get_timeline(
    store: &Store,
    target: TargetId,
    range: TimeRange,
    resolution: Resolution,
) -> Result<TimelineSeries, DbError> {
    let records = store.query_records(target, range.start, range.end)?;
    Ok(TimelineSeries {
        buckets: aggregate(&records, range, resolution),
        uptime_percentage: series_uptime(&records),
    })
}

/// Timelines of every target passing `filter`, read with a single query.
///
/// Targets without records in the range are left out.
pub fn get_timeline_batch(
    store: &Store,
    filter: &RecordFilter,
    range: TimeRange,
    resolution: Resolution,
) -> Result<BTreeMap<TargetId, TimelineSeries>, DbError> {
    let mut grouped: HashMap<TargetId, Vec<ProbeRecord>> = HashMap::new();
    for record in store.get_records_in_range(filter, range.start, range.end)? {
        grouped.entry(record.target).or_default().push(record);
    }

    Ok(grouped
        .into_iter()
        .map(|(target, records)| {
            let series = TimelineSeries {
                buckets: aggregate(&records, range, resolution),
                uptime_percentage: series_uptime(&records),
            };
            (target, series)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{record_at, seeded_store};
    use crate::db::Provider;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    fn day_range() -> TimeRange {
        TimeRange::new(at(0, 0), at(0, 0) + ChronoDuration::hours(24))
    }

    #[test]
    fn test_resolution_parse() {
        assert_eq!("hour".parse::<Resolution>().unwrap(), Resolution::Hour);
        assert_eq!("6hour".parse::<Resolution>().unwrap(), Resolution::SixHour);
        assert_eq!("Day".parse::<Resolution>().unwrap(), Resolution::Day);
        assert_eq!("none".parse::<Resolution>().unwrap(), Resolution::None);
        assert!("week".parse::<Resolution>().is_err());
    }

    #[test]
    fn test_resolution_for_span() {
        assert_eq!(Resolution::for_span(1.5), Resolution::None);
        assert_eq!(Resolution::for_span(24.0), Resolution::Hour);
        assert_eq!(Resolution::for_span(7.0 * 24.0), Resolution::SixHour);
        assert_eq!(Resolution::for_span(720.0), Resolution::Day);
    }

    #[test]
    fn test_truncate_to_window() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 56).unwrap();
        assert_eq!(truncate_to_window(dt, 3600), at(12, 0));
        assert_eq!(truncate_to_window(dt, 6 * 3600), at(12, 0));
        assert_eq!(truncate_to_window(at(17, 59), 6 * 3600), at(12, 0));
        assert_eq!(truncate_to_window(dt, 86400), at(0, 0));
    }

    #[test]
    fn test_sparse_day_has_empty_placeholders() {
        let target = TargetId::new(1, 1);
        let records = vec![
            record_at(target, Category::Healthy, at(3, 10)),
            record_at(target, Category::Unhealthy, at(3, 40)),
            record_at(target, Category::Healthy, at(15, 0)),
        ];

        let buckets = aggregate(&records, day_range(), Resolution::Hour);
        assert_eq!(buckets.len(), 24);
        assert_eq!(buckets.iter().filter(|b| b.total == 0).count(), 22);

        let third = &buckets[3];
        assert_eq!(third.start, at(3, 0));
        assert_eq!((third.total, third.healthy, third.unhealthy), (2, 1, 1));
        assert_eq!(third.uptime_percentage, Some(50.0));
        assert_eq!(third.dominant, Some(Category::Unhealthy));
        assert_eq!(buckets[15].healthy, 1);

        let total: u32 = buckets.iter().map(|b| b.total).sum();
        assert_eq!(total as usize, records.len());
    }

    #[test]
    fn test_empty_and_unmatched_only_buckets_have_no_uptime() {
        let target = TargetId::new(1, 1);
        let records = vec![record_at(target, Category::Unmatched, at(1, 0))];

        let buckets = aggregate(&records, day_range(), Resolution::Hour);
        assert_eq!(buckets[0].uptime_percentage, None);
        assert_eq!(buckets[1].uptime_percentage, None);
        assert_eq!(buckets[1].unmatched, 1);
        assert_eq!(buckets[1].dominant, None);
        assert_eq!(series_uptime(&records), None);
    }

    #[test]
    fn test_unaligned_range_starts_at_window_boundary() {
        let range = TimeRange::new(at(1, 30), at(1, 30) + ChronoDuration::hours(24));
        let buckets = aggregate(&[], range, Resolution::Hour);
        assert_eq!(buckets.len(), 25);
        assert_eq!(buckets[0].start, at(1, 0));

        let six = aggregate(&[], range, Resolution::SixHour);
        assert_eq!(six[0].start, at(0, 0));
        assert_eq!(six.len(), 5);
    }

    #[test]
    fn test_latency_average_ignores_missing_values() {
        let target = TargetId::new(1, 1);
        let mut failed = record_at(target, Category::Unhealthy, at(2, 5));
        failed.latency_ms = None;
        let mut slow = record_at(target, Category::Healthy, at(2, 10));
        slow.latency_ms = Some(300);
        let fast = record_at(target, Category::Healthy, at(2, 20));

        let buckets = aggregate(&[failed, slow, fast], day_range(), Resolution::Hour);
        assert_eq!(buckets[2].avg_latency_ms, Some(210.0));
    }

    #[test]
    fn test_status_name_from_dominant_category() {
        let target = TargetId::new(1, 1);
        let named = |category, name: &str, m| {
            let mut r = record_at(target, category, at(4, m));
            r.rule_name = Some(name.to_string());
            r
        };
        let records = vec![
            named(Category::Healthy, "OK", 0),
            named(Category::Healthy, "OK", 1),
            named(Category::Degraded, "Overloaded", 2),
            named(Category::Degraded, "Rate limited", 3),
            named(Category::Degraded, "Rate limited", 4),
        ];

        let bucket = &aggregate(&records, day_range(), Resolution::Hour)[4];
        assert_eq!(bucket.dominant, Some(Category::Degraded));
        assert_eq!(bucket.status_name.as_deref(), Some("Rate limited"));
    }

    #[test]
    fn test_no_resolution_is_one_point_per_record() {
        let target = TargetId::new(1, 1);
        let records = vec![
            record_at(target, Category::Healthy, at(5, 0)),
            record_at(target, Category::Degraded, at(5, 1)),
        ];
        let points = aggregate(&records, day_range(), Resolution::None);
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].start, at(5, 1));
        assert_eq!(points[1].dominant, Some(Category::Degraded));
    }

    #[test]
    fn test_timeline_batch_groups_by_target() {
        let (_tmp, store, id) = seeded_store("https://api.example.com");
        let mut provider = Provider {
            name: "Other".to_string(),
            base_url: "https://other.example.com".to_string(),
            enabled: true,
            ..Default::default()
        };
        store.add_provider(&mut provider).unwrap();
        let other = TargetId::new(provider.id, id.model_id);
        for (target, category, minute) in [
            (id, Category::Healthy, 0),
            (id, Category::Unhealthy, 10),
            (id, Category::Healthy, 20),
            (id, Category::Healthy, 30),
            (other, Category::Degraded, 0),
        ] {
            store.append_record(&record_at(target, category, at(6, minute))).unwrap();
        }

        let batch = get_timeline_batch(&store, &RecordFilter::default(), day_range(), Resolution::Day).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[&id].uptime_percentage, Some(75.0));
        assert_eq!(batch[&id].buckets.len(), 1);
        assert_eq!(batch[&other].uptime_percentage, Some(0.0));

        let filtered = RecordFilter {
            provider_ids: Some(vec![id.provider_id]),
            model_ids: None,
        };
        let batch = get_timeline_batch(&store, &filtered, day_range(), Resolution::Hour).unwrap();
        assert_eq!(batch.keys().copied().collect::<Vec<_>>(), vec![id]);

        let single = get_timeline(&store, id, day_range(), Resolution::Hour).unwrap();
        assert_eq!(single, batch[&id]);
    }
}
