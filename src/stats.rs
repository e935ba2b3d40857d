//! Ranking and summary statistics over enrichment results.
//!
//! Enrichment rows are ranked independently by log-p-value, odds ratio
//! and support (descending value, ascending rank, ties share the rank of
//! the first record with a strictly different value), then summarized per
//! biological source and mark type after trimming outliers with a
//! standard-deviation dropoff filter.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One row of an enrichment result, with the ranks computed locally.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    #[serde(default)]
    pub biosource: String,
    #[serde(default)]
    pub epigenetic_mark: String,
    #[serde(default)]
    pub p_value_log: f64,
    #[serde(default)]
    pub odds_ratio: f64,
    #[serde(default)]
    pub support: f64,
    #[serde(default)]
    pub log_rank: f64,
    #[serde(default)]
    pub odds_rank: f64,
    #[serde(default)]
    pub support_rank: f64,
    #[serde(default)]
    pub mean_rank: f64,
    #[serde(default)]
    pub max_rank: f64,
    /// Remaining engine columns, carried through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Percentile with linear interpolation between order statistics.
/// `values` must already be sorted ascending.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    if p <= 0.0 {
        return values[0];
    }
    if p >= 1.0 {
        return values[values.len() - 1];
    }

    let index = (values.len() - 1) as f64 * p;
    let lower = index.floor() as usize;
    let upper = lower + 1;
    let weight = index.fract();

    if upper >= values.len() {
        return values[lower];
    }
    values[lower] * (1.0 - weight) + values[upper] * weight
}

fn sample_stddev(values: &[f64]) -> f64 {
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let squared: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    (squared / (values.len() - 1) as f64).sqrt()
}

/// Outlier trim: sort ascending and keep the prefix of values not
/// exceeding `first + dropoff_sds * stddev`. The first element is always
/// kept; arrays of length <= 1 and degenerate deviations (zero or
/// non-finite) keep everything.
pub fn dropoff_filter(values: &[f64], dropoff_sds: f64) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    if sorted.len() <= 1 {
        return sorted;
    }

    let sd = sample_stddev(&sorted);
    if !sd.is_finite() || sd == 0.0 {
        return sorted;
    }

    let limit = sorted[0] + sd * dropoff_sds;
    sorted.into_iter().take_while(|v| *v <= limit).collect()
}

/// Five-number summary plus mean of one record group.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct GroupStats {
    pub low: f64,
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
    pub high: f64,
    pub mean: f64,
    pub elements: usize,
}

/// Summary statistics of one group of ranks, computed after the dropoff
/// filter.
pub fn group_stats(values: &[f64], dropoff_sds: f64) -> GroupStats {
    let filtered = dropoff_filter(values, dropoff_sds);
    let Some((&low, &high)) = filtered.first().zip(filtered.last()) else {
        return GroupStats::default();
    };
    GroupStats {
        low,
        q1: percentile(&filtered, 0.25),
        median: percentile(&filtered, 0.5),
        q3: percentile(&filtered, 0.75),
        high,
        mean: filtered.iter().sum::<f64>() / filtered.len() as f64,
        elements: filtered.len(),
    }
}

fn assign_ranks(
    records: &mut [EnrichmentRecord],
    value: fn(&EnrichmentRecord) -> f64,
    set_rank: fn(&mut EnrichmentRecord, f64),
) {
    records.sort_by(|a, b| value(b).partial_cmp(&value(a)).unwrap_or(Ordering::Equal));
    let Some(first) = records.first() else {
        return;
    };

    let mut position = 0;
    let mut current = value(first);
    for i in 0..records.len() {
        let v = value(&records[i]);
        if v != current {
            position = i;
            current = v;
        }
        set_rank(&mut records[i], (position + 1) as f64);
    }
}

/// Rank records independently by log-p-value, odds ratio and support
/// (descending), derive mean/max ranks, and re-sort by ascending mean
/// rank.
pub fn rank_records(records: &mut [EnrichmentRecord]) {
    assign_ranks(records, |r| r.p_value_log, |r, rank| r.log_rank = rank);
    assign_ranks(records, |r| r.odds_ratio, |r, rank| r.odds_rank = rank);
    assign_ranks(records, |r| r.support, |r, rank| r.support_rank = rank);

    for record in records.iter_mut() {
        record.mean_rank = (record.log_rank + record.odds_rank + record.support_rank) / 3.0;
        record.max_rank = record
            .log_rank
            .max(record.odds_rank)
            .max(record.support_rank);
    }

    records.sort_by(|a, b| {
        a.mean_rank
            .partial_cmp(&b.mean_rank)
            .unwrap_or(Ordering::Equal)
    });
}

/// Per-group summaries of ranked records, grouped by biological source
/// and by mark type, each sorted by ascending group mean.
#[derive(Clone, Debug, Default, Serialize)]
pub struct EnrichmentSummary {
    pub biosources: Vec<(String, GroupStats)>,
    pub epigenetic_marks: Vec<(String, GroupStats)>,
}

pub fn summarize(records: &[EnrichmentRecord], dropoff_sds: f64) -> EnrichmentSummary {
    let mut biosources: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    let mut marks: BTreeMap<String, Vec<f64>> = BTreeMap::new();

    for record in records {
        biosources
            .entry(record.biosource.clone())
            .or_default()
            .push(record.mean_rank);
        marks
            .entry(record.epigenetic_mark.clone())
            .or_default()
            .push(record.mean_rank);
    }

    let grouped = |groups: BTreeMap<String, Vec<f64>>| {
        let mut stats: Vec<(String, GroupStats)> = groups
            .into_iter()
            .map(|(name, ranks)| (name, group_stats(&ranks, dropoff_sds)))
            .collect();
        stats.sort_by(|a, b| a.1.mean.partial_cmp(&b.1.mean).unwrap_or(Ordering::Equal));
        stats
    };

    EnrichmentSummary {
        biosources: grouped(biosources),
        epigenetic_marks: grouped(marks),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(p: f64, odds: f64, support: f64) -> EnrichmentRecord {
        EnrichmentRecord {
            p_value_log: p,
            odds_ratio: odds,
            support,
            ..EnrichmentRecord::default()
        }
    }

    #[test]
    fn percentile_interpolates_linearly() {
        assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0], 0.5), 2.5);
        assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0], 0.25), 1.75);
        assert_eq!(percentile(&[1.0, 2.0, 3.0], 0.5), 2.0);
    }

    #[test]
    fn percentile_degenerate_inputs() {
        assert_eq!(percentile(&[], 0.5), 0.0);
        for p in [0.0, 0.25, 0.5, 0.99, 1.0] {
            assert_eq!(percentile(&[5.0], p), 5.0);
        }
        assert_eq!(percentile(&[1.0, 2.0], -0.5), 1.0);
        assert_eq!(percentile(&[1.0, 2.0], 1.5), 2.0);
    }

    #[test]
    fn dropoff_excludes_outliers_beyond_one_stddev() {
        let filtered = dropoff_filter(&[10.0, 11.0, 12.0, 100.0], 1.0);
        assert_eq!(filtered, vec![10.0, 11.0, 12.0]);
    }

    #[test]
    fn dropoff_keeps_degenerate_arrays() {
        assert_eq!(dropoff_filter(&[7.0, 7.0, 7.0], 1.0), vec![7.0, 7.0, 7.0]);
        assert_eq!(dropoff_filter(&[3.0], 1.0), vec![3.0]);
        assert!(dropoff_filter(&[], 1.0).is_empty());
    }

    #[test]
    fn ranks_are_tied_for_equal_values() {
        let mut records = vec![
            record(3.0, 1.0, 10.0),
            record(5.0, 2.0, 20.0),
            record(5.0, 3.0, 30.0),
        ];
        rank_records(&mut records);

        // Both p=5.0 rows share log rank 1, the p=3.0 row ranks 3.
        let ranks: Vec<(f64, f64)> = records
            .iter()
            .map(|r| (r.p_value_log, r.log_rank))
            .collect();
        assert!(ranks.contains(&(5.0, 1.0)));
        assert!(!ranks.contains(&(5.0, 2.0)));
        assert!(ranks.contains(&(3.0, 3.0)));

        // Re-sorted ascending by mean rank.
        for pair in records.windows(2) {
            assert!(pair[0].mean_rank <= pair[1].mean_rank);
        }
    }

    #[test]
    fn mean_and_max_ranks() {
        let mut records = vec![record(5.0, 1.0, 30.0), record(3.0, 2.0, 20.0)];
        rank_records(&mut records);
        let best = records
            .iter()
            .find(|r| r.p_value_log == 5.0)
            .expect("record present");
        // log rank 1, odds rank 2, support rank 1.
        assert_eq!(best.mean_rank, 4.0 / 3.0);
        assert_eq!(best.max_rank, 2.0);
    }

    #[test]
    fn summaries_group_by_source_and_mark() {
        let mut records = vec![
            EnrichmentRecord {
                biosource: "blood".into(),
                epigenetic_mark: "H3K4me3".into(),
                ..record(5.0, 2.0, 30.0)
            },
            EnrichmentRecord {
                biosource: "blood".into(),
                epigenetic_mark: "H3K27ac".into(),
                ..record(3.0, 1.0, 10.0)
            },
        ];
        rank_records(&mut records);
        let summary = summarize(&records, 1.0);

        assert_eq!(summary.biosources.len(), 1);
        assert_eq!(summary.biosources[0].0, "blood");
        assert_eq!(summary.biosources[0].1.elements, 2);
        assert_eq!(summary.epigenetic_marks.len(), 2);
    }
}
