//! Folding raw production entries into summary buckets.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use crs_core::{
    AggregationKey, CalcSettings, DerivedMetrics, Granularity, ProductionSummaryRecord,
    RawProductionRecord, Scope, SumTuple,
};
use tracing::debug;

/// Result of one aggregation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregation {
    pub buckets: BTreeMap<AggregationKey, SumTuple>,
    pub records_seen: usize,
    /// Entries without a date, group or material type, plus entities that
    /// could not be decoded at all.
    pub records_dropped: usize,
    /// Entries for other groups when the scope names one group.
    pub records_out_of_scope: usize,
}

/// Incremental aggregator: feed entries one at a time as they are pulled
/// from the store, then `finish`.
#[derive(Debug)]
pub struct Aggregator {
    scope: Scope,
    state: Aggregation,
}

impl Aggregator {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            state: Aggregation::default(),
        }
    }

    pub fn push(&mut self, record: &RawProductionRecord) {
        self.state.records_seen += 1;

        let (Some(year), Some(group_id), Some(material)) =
            (record.year(), record.group_id(), record.material_type())
        else {
            self.state.records_dropped += 1;
            debug!(id = record.id.as_deref().unwrap_or("?"), "skipping incomplete production entry");
            return;
        };

        if !self.scope.matches(group_id) {
            self.state.records_out_of_scope += 1;
            return;
        }

        let sums = SumTuple::from_record(record);
        self.state
            .buckets
            .entry(AggregationKey::new(year, group_id, material))
            .or_default()
            .add(&sums);
    }

    /// Count an entity the store could not decode as seen and dropped.
    pub fn record_undecodable(&mut self) {
        self.state.records_seen += 1;
        self.state.records_dropped += 1;
    }

    pub fn finish(self) -> Aggregation {
        self.state
    }
}

pub fn aggregate<'a>(
    records: impl IntoIterator<Item = &'a RawProductionRecord>,
    scope: &Scope,
) -> BTreeMap<AggregationKey, SumTuple> {
    let mut aggregator = Aggregator::new(scope.clone());
    for record in records {
        aggregator.push(record);
    }
    aggregator.finish().buckets
}

/// Turn per-material buckets into summary rows.
///
/// Factors are always applied per material; under `Granularity::Group` the
/// resulting sums and metrics are then added up per (year, group).
pub fn summarize(
    buckets: &BTreeMap<AggregationKey, SumTuple>,
    settings: &CalcSettings,
    granularity: Granularity,
    run_started_at: DateTime<Utc>,
) -> Vec<ProductionSummaryRecord> {
    let mut rolled: BTreeMap<AggregationKey, (SumTuple, DerivedMetrics)> = BTreeMap::new();
    for (key, sums) in buckets {
        let material = key.material_type.as_deref().unwrap_or_default();
        let derived = DerivedMetrics::compute(sums, material, settings);
        let out_key = match granularity {
            Granularity::Material => key.clone(),
            Granularity::Group => key.without_material(),
        };
        let (total, metrics) = rolled.entry(out_key).or_default();
        total.add(sums);
        metrics.add(&derived);
    }

    rolled
        .iter()
        .map(|(key, (sums, derived))| {
            ProductionSummaryRecord::new(key, sums, derived, run_started_at)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use crs_core::LooseNumber;

    fn entry(date: &str, group: &str, material: &str, charcoal: &str) -> RawProductionRecord {
        RawProductionRecord {
            id: Some(format!("{date}-{group}-{material}-{charcoal}")),
            date: Some(date.to_string()),
            material_type: Some(material.to_string()),
            charcoal_produced: Some(LooseNumber::Text(charcoal.to_string())),
            group_id: Some(group.to_string()),
            ..Default::default()
        }
    }

    fn started_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 15, 0, 0).single().unwrap()
    }

    #[test]
    fn sums_per_year_group_and_material() {
        let records = vec![
            entry("2024-01-10", "G", "bamboo", "10"),
            entry("2024-05-02", "G", "bamboo", "20"),
            entry("2024-12-31", "G", "bamboo", "30"),
            entry("2023-07-07", "G", "bamboo", "5"),
            entry("2024-02-02", "G", "pruning", "1.5"),
        ];
        let buckets = aggregate(&records, &Scope::All);
        assert_eq!(buckets.len(), 3);
        assert_eq!(
            buckets[&AggregationKey::new("2024", "G", "bamboo")].charcoal_produced,
            60.0
        );
        assert_eq!(
            buckets[&AggregationKey::new("2023", "G", "bamboo")].charcoal_produced,
            5.0
        );
        assert_eq!(
            buckets[&AggregationKey::new("2024", "G", "pruning")].charcoal_produced,
            1.5
        );
    }

    #[test]
    fn non_numeric_quantities_count_as_zero() {
        let mut record = entry("2024-01-01", "G", "bamboo", "abc");
        record.material_amount = Some(LooseNumber::Number(12.0));
        record.charcoal_volume = Some(LooseNumber::Text(String::new()));
        let buckets = aggregate([&record], &Scope::All);
        let sums = buckets[&AggregationKey::new("2024", "G", "bamboo")];
        assert_eq!(sums.charcoal_produced, 0.0);
        assert_eq!(sums.material_amount, 12.0);
        assert_eq!(sums.charcoal_volume, 0.0);
        assert!(!sums.co2_reduction.is_nan());
    }

    #[test]
    fn incomplete_entries_are_dropped() {
        let mut no_group = entry("2024-01-01", "G", "bamboo", "10");
        no_group.group_id = None;
        let mut no_date = entry("2024-01-01", "G", "bamboo", "10");
        no_date.date = Some(String::new());
        let mut no_material = entry("2024-01-01", "G", "bamboo", "10");
        no_material.material_type = None;
        let kept = entry("2024-01-01", "H", "bamboo", "1");

        let mut aggregator = Aggregator::new(Scope::All);
        for record in [&no_group, &no_date, &no_material, &kept] {
            aggregator.push(record);
        }
        let result = aggregator.finish();
        assert_eq!(result.records_seen, 4);
        assert_eq!(result.records_dropped, 3);
        assert_eq!(result.buckets.len(), 1);
        assert!(result.buckets.keys().all(|k| k.group_id == "H"));
    }

    #[test]
    fn group_scope_ignores_other_groups_even_if_unfiltered_upstream() {
        let records = vec![
            entry("2024-01-01", "G", "bamboo", "10"),
            entry("2024-01-01", "H", "bamboo", "99"),
        ];
        let mut aggregator = Aggregator::new(Scope::Group("G".into()));
        for r in &records {
            aggregator.push(r);
        }
        let result = aggregator.finish();
        assert_eq!(result.records_out_of_scope, 1);
        assert_eq!(result.buckets.len(), 1);
        assert_eq!(result.buckets.keys().next().unwrap().group_id, "G");
    }

    #[test]
    fn aggregation_is_order_independent() {
        let mut records = vec![
            entry("2024-01-01", "G", "bamboo", "0.1"),
            entry("2024-01-02", "G", "bamboo", "0.2"),
            entry("2024-01-03", "G", "bamboo", "0.3"),
            entry("2024-01-04", "G", "herbaceous", "7"),
        ];
        let forward = aggregate(&records, &Scope::All);
        records.reverse();
        let backward = aggregate(&records, &Scope::All);
        assert_eq!(forward.len(), backward.len());
        for (key, sums) in &forward {
            let other = backward[key];
            assert!((sums.charcoal_produced - other.charcoal_produced).abs() < 1e-9);
        }
    }

    #[test]
    fn material_rows_carry_derived_metrics() {
        let records = vec![
            entry("2024-01-10", "G", "bamboo", "10"),
            entry("2024-05-02", "G", "bamboo", "20"),
            entry("2024-12-31", "G", "bamboo", "30"),
        ];
        let buckets = aggregate(&records, &Scope::Group("G".into()));
        let rows = summarize(&buckets, &CalcSettings::default(), Granularity::Material, started_at());
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.row_key, "2024-G-bamboo");
        assert_eq!(row.material_type.as_deref(), Some("bamboo"));
        assert_eq!(row.charcoal_produced, 60.0);
        assert!((row.carbon_content - 48.0).abs() < 1e-9);
        assert!((row.co2_reduction - 176.16).abs() < 1e-9);
        assert_eq!(row.created_at, started_at());
        assert_eq!(row.updated_at, started_at());
    }

    #[test]
    fn group_rollup_applies_factors_per_material_first() {
        let records = vec![
            entry("2024-01-01", "G", "bamboo", "10"),
            entry("2024-01-01", "G", "herbaceous", "10"),
        ];
        let buckets = aggregate(&records, &Scope::All);
        let settings = CalcSettings::default();
        let rows = summarize(&buckets, &settings, Granularity::Group, started_at());
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.row_key, "2024-G");
        assert_eq!(row.material_type, None);
        assert_eq!(row.charcoal_produced, 20.0);
        let expected_carbon = 10.0 * 0.8 + 10.0 * 0.65;
        assert!((row.carbon_content - expected_carbon).abs() < 1e-9);
        let expected_long_term = 10.0 * 0.8 * 3.67 * 0.8 + 10.0 * 0.65 * 3.67 * 0.65;
        assert!((row.ipcc_long_term - expected_long_term).abs() < 1e-9);
    }
}
