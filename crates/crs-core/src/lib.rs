//! Core domain model for the carbon record store: raw production entries,
//! calculation settings, and the yearly summary rows derived from them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "crs-core";

/// Partition every summary row is written under.
pub const SUMMARY_PARTITION_KEY: &str = "ProductionSum";

/// Quantity captured by the production entry flow: a JSON number, a numeric
/// string, or whatever else a client managed to store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LooseNumber {
    Number(f64),
    Text(String),
    Other(JsonValue),
}

impl LooseNumber {
    /// Absent, empty, non-numeric and non-finite values all count as zero.
    pub fn parse_or_zero(value: Option<&LooseNumber>) -> f64 {
        let parsed = match value {
            Some(LooseNumber::Number(n)) => *n,
            Some(LooseNumber::Text(text)) => leading_float(text),
            Some(LooseNumber::Other(_)) | None => 0.0,
        };
        if parsed.is_finite() {
            parsed
        } else {
            0.0
        }
    }
}

/// Longest numeric prefix of `text` after leading whitespace, so `"10kg"` is
/// 10 and `"1.5e1x"` is 15. No digits before the exponent means zero.
fn leading_float(text: &str) -> f64 {
    let text = text.trim_start();
    let bytes = text.as_bytes();
    let digits_from = |mut i: usize| {
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        i
    };

    let mut end = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end = 1;
    }
    let int_end = digits_from(end);
    let mut mantissa_digits = int_end - end;
    end = int_end;
    if bytes.get(end) == Some(&b'.') {
        let frac_end = digits_from(end + 1);
        mantissa_digits += frac_end - (end + 1);
        end = frac_end;
    }
    if mantissa_digits == 0 {
        return 0.0;
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp = end + 1;
        if matches!(bytes.get(exp), Some(b'+' | b'-')) {
            exp += 1;
        }
        let exp_end = digits_from(exp);
        if exp_end > exp {
            end = exp_end;
        }
    }
    text[..end].parse::<f64>().unwrap_or(0.0)
}

/// Text view of a loosely typed scalar: strings as-is, numbers and booleans in
/// their JSON spelling, anything else absent.
pub fn loose_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn deserialize_loose_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(loose_text))
}

impl From<f64> for LooseNumber {
    fn from(value: f64) -> Self {
        LooseNumber::Number(value)
    }
}

impl From<&str> for LooseNumber {
    fn from(value: &str) -> Self {
        LooseNumber::Text(value.to_string())
    }
}

/// One production event as captured upstream. Read-only for the engine.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawProductionRecord {
    #[serde(default, deserialize_with = "deserialize_loose_text")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_loose_text")]
    pub date: Option<String>,
    #[serde(default, deserialize_with = "deserialize_loose_text")]
    pub material_type: Option<String>,
    #[serde(default)]
    pub material_amount: Option<LooseNumber>,
    #[serde(default)]
    pub charcoal_produced: Option<LooseNumber>,
    #[serde(default)]
    pub charcoal_volume: Option<LooseNumber>,
    #[serde(default)]
    pub co2_reduction: Option<LooseNumber>,
    #[serde(default, deserialize_with = "deserialize_loose_text")]
    pub group_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_loose_text")]
    pub user_id: Option<String>,
}

impl RawProductionRecord {
    /// Year bucket: the first four characters of `date`.
    pub fn year(&self) -> Option<&str> {
        let date = non_empty(self.date.as_deref())?;
        Some(match date.char_indices().nth(4) {
            Some((idx, _)) => &date[..idx],
            None => date,
        })
    }

    pub fn group_id(&self) -> Option<&str> {
        non_empty(self.group_id.as_deref())
    }

    pub fn material_type(&self) -> Option<&str> {
        non_empty(self.material_type.as_deref())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaterialType {
    Bamboo,
    Pruning,
    Herbaceous,
    Other,
}

impl MaterialType {
    /// Any label outside the three named categories is `Other`.
    pub fn classify(label: &str) -> Self {
        match label {
            "bamboo" => MaterialType::Bamboo,
            "pruning" => MaterialType::Pruning,
            "herbaceous" => MaterialType::Herbaceous,
            _ => MaterialType::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MaterialType::Bamboo => "bamboo",
            MaterialType::Pruning => "pruning",
            MaterialType::Herbaceous => "herbaceous",
            MaterialType::Other => "other",
        }
    }
}

/// Per-material factor map. All four entries are required when deserializing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FactorTable {
    pub bamboo: f64,
    pub pruning: f64,
    pub herbaceous: f64,
    pub other: f64,
}

impl FactorTable {
    pub fn factor_for(&self, material: MaterialType) -> f64 {
        match material {
            MaterialType::Bamboo => self.bamboo,
            MaterialType::Pruning => self.pruning,
            MaterialType::Herbaceous => self.herbaceous,
            MaterialType::Other => self.other,
        }
    }

    fn entries(&self) -> [(MaterialType, f64); 4] {
        [
            (MaterialType::Bamboo, self.bamboo),
            (MaterialType::Pruning, self.pruning),
            (MaterialType::Herbaceous, self.herbaceous),
            (MaterialType::Other, self.other),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SettingsError {
    #[error("{table}.{material} must be a positive finite number, got {value}")]
    InvalidFactor {
        table: &'static str,
        material: &'static str,
        value: f64,
    },
    #[error("co2ConversionFactor must be a positive finite number, got {0}")]
    InvalidConversionFactor(f64),
    #[error("settings document is not valid: {0}")]
    Malformed(String),
}

/// Factors used to turn charcoal mass into carbon and CO2-equivalent figures.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalcSettings {
    pub carbon_content_factors: FactorTable,
    pub co2_conversion_factor: f64,
    pub ipcc_long_term_factors: FactorTable,
}

impl Default for CalcSettings {
    fn default() -> Self {
        let factors = FactorTable {
            bamboo: 0.8,
            pruning: 0.8,
            herbaceous: 0.65,
            other: 0.8,
        };
        Self {
            carbon_content_factors: factors,
            co2_conversion_factor: 3.67,
            ipcc_long_term_factors: factors,
        }
    }
}

impl CalcSettings {
    /// Parse a settings document, ignoring unrelated keys, and validate it.
    pub fn from_json_value(value: &JsonValue) -> Result<Self, SettingsError> {
        let settings: CalcSettings = serde_json::from_value(value.clone())
            .map_err(|err| SettingsError::Malformed(err.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        for (table, factors) in [
            ("carbonContentFactors", &self.carbon_content_factors),
            ("ipccLongTermFactors", &self.ipcc_long_term_factors),
        ] {
            for (material, value) in factors.entries() {
                if !is_positive_finite(value) {
                    return Err(SettingsError::InvalidFactor {
                        table,
                        material: material.as_str(),
                        value,
                    });
                }
            }
        }
        if !is_positive_finite(self.co2_conversion_factor) {
            return Err(SettingsError::InvalidConversionFactor(
                self.co2_conversion_factor,
            ));
        }
        Ok(())
    }
}

fn is_positive_finite(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

/// Which slice of the summary table a run owns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Group(String),
    All,
}

impl Scope {
    pub fn matches(&self, group_id: &str) -> bool {
        match self {
            Scope::Group(id) => id == group_id,
            Scope::All => true,
        }
    }

    pub fn group_filter(&self) -> Option<&str> {
        match self {
            Scope::Group(id) => Some(id.as_str()),
            Scope::All => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Group(id) => write!(f, "group:{id}"),
            Scope::All => f.write_str("all"),
        }
    }
}

/// Bucketing granularity of summary rows. `Material` is canonical; `Group`
/// collapses materials into one row per (year, group).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    #[default]
    Material,
    Group,
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "material" => Ok(Granularity::Material),
            "group" => Ok(Granularity::Group),
            other => Err(format!("unknown granularity `{other}` (expected material|group)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AggregationKey {
    pub year: String,
    pub group_id: String,
    pub material_type: Option<String>,
}

impl AggregationKey {
    pub fn new(year: impl Into<String>, group_id: impl Into<String>, material_type: impl Into<String>) -> Self {
        Self {
            year: year.into(),
            group_id: group_id.into(),
            material_type: Some(material_type.into()),
        }
    }

    /// Drop the material component, used when rolling up to `Granularity::Group`.
    pub fn without_material(&self) -> Self {
        Self {
            year: self.year.clone(),
            group_id: self.group_id.clone(),
            material_type: None,
        }
    }

    pub fn row_key(&self) -> String {
        match &self.material_type {
            Some(material) => format!("{}-{}-{}", self.year, self.group_id, material),
            None => format!("{}-{}", self.year, self.group_id),
        }
    }
}

impl fmt::Display for AggregationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.row_key())
    }
}

/// Raw quantities summed over one aggregation bucket.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SumTuple {
    pub material_amount: f64,
    pub charcoal_produced: f64,
    pub charcoal_volume: f64,
    /// Sum of the reductions reported on the raw entries. Not persisted; the
    /// summary's `co2Reduction` is always recomputed from charcoal mass.
    pub co2_reduction: f64,
}

impl SumTuple {
    pub fn from_record(record: &RawProductionRecord) -> Self {
        Self {
            material_amount: LooseNumber::parse_or_zero(record.material_amount.as_ref()),
            charcoal_produced: LooseNumber::parse_or_zero(record.charcoal_produced.as_ref()),
            charcoal_volume: LooseNumber::parse_or_zero(record.charcoal_volume.as_ref()),
            co2_reduction: LooseNumber::parse_or_zero(record.co2_reduction.as_ref()),
        }
    }

    pub fn add(&mut self, other: &SumTuple) {
        self.material_amount += other.material_amount;
        self.charcoal_produced += other.charcoal_produced;
        self.charcoal_volume += other.charcoal_volume;
        self.co2_reduction += other.co2_reduction;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedMetrics {
    pub carbon_content: f64,
    pub co2_reduction: f64,
    pub ipcc_long_term: f64,
}

impl DerivedMetrics {
    /// carbon = charcoal * carbon factor; CO2 = carbon * conversion;
    /// long term = CO2 * IPCC factor. Unknown materials use the `other` factors.
    pub fn compute(sum: &SumTuple, material_type: &str, settings: &CalcSettings) -> Self {
        let material = MaterialType::classify(material_type);
        let carbon_content = sum.charcoal_produced * settings.carbon_content_factors.factor_for(material);
        let co2_reduction = carbon_content * settings.co2_conversion_factor;
        let ipcc_long_term = co2_reduction * settings.ipcc_long_term_factors.factor_for(material);
        Self {
            carbon_content,
            co2_reduction,
            ipcc_long_term,
        }
    }

    pub fn add(&mut self, other: &DerivedMetrics) {
        self.carbon_content += other.carbon_content;
        self.co2_reduction += other.co2_reduction;
        self.ipcc_long_term += other.ipcc_long_term;
    }
}

/// Persisted yearly summary row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductionSummaryRecord {
    pub partition_key: String,
    pub row_key: String,
    pub year: String,
    pub group_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub material_type: Option<String>,
    pub material_amount: f64,
    pub charcoal_produced: f64,
    pub charcoal_volume: f64,
    pub co2_reduction: f64,
    pub carbon_content: f64,
    pub ipcc_long_term: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProductionSummaryRecord {
    pub fn new(
        key: &AggregationKey,
        sum: &SumTuple,
        derived: &DerivedMetrics,
        run_started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            partition_key: SUMMARY_PARTITION_KEY.to_string(),
            row_key: key.row_key(),
            year: key.year.clone(),
            group_id: key.group_id.clone(),
            material_type: key.material_type.clone(),
            material_amount: sum.material_amount,
            charcoal_produced: sum.charcoal_produced,
            charcoal_volume: sum.charcoal_volume,
            co2_reduction: derived.co2_reduction,
            carbon_content: derived.carbon_content,
            ipcc_long_term: derived.ipcc_long_term,
            created_at: run_started_at,
            updated_at: run_started_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn parse_or_zero_handles_loose_inputs() {
        assert_eq!(LooseNumber::parse_or_zero(None), 0.0);
        assert_eq!(LooseNumber::parse_or_zero(Some(&"".into())), 0.0);
        assert_eq!(LooseNumber::parse_or_zero(Some(&"abc".into())), 0.0);
        assert_eq!(LooseNumber::parse_or_zero(Some(&"NaN".into())), 0.0);
        assert_eq!(LooseNumber::parse_or_zero(Some(&" 12.5 ".into())), 12.5);
        assert_eq!(LooseNumber::parse_or_zero(Some(&7.0_f64.into())), 7.0);
        assert_eq!(LooseNumber::parse_or_zero(Some(&"1e999".into())), 0.0);
        assert_eq!(
            LooseNumber::parse_or_zero(Some(&LooseNumber::Other(serde_json::json!(true)))),
            0.0
        );
    }

    #[test]
    fn parse_or_zero_reads_numeric_prefix() {
        let parse = |text: &str| LooseNumber::parse_or_zero(Some(&text.into()));
        assert_eq!(parse("10kg"), 10.0);
        assert_eq!(parse("12.5 t"), 12.5);
        assert_eq!(parse("1.5e1x"), 15.0);
        assert_eq!(parse("  -3abc"), -3.0);
        assert_eq!(parse("+.5"), 0.5);
        assert_eq!(parse("5."), 5.0);
        assert_eq!(parse("2e"), 2.0);
        assert_eq!(parse("4E+2 units"), 400.0);
        assert_eq!(parse(".e3"), 0.0);
        assert_eq!(parse("kg10"), 0.0);
        assert_eq!(parse("-"), 0.0);
    }

    #[test]
    fn raw_record_text_fields_accept_numbers() {
        let record: RawProductionRecord = serde_json::from_value(serde_json::json!({
            "id": 17,
            "date": 20240501,
            "materialType": "bamboo",
            "charcoalProduced": 3,
            "groupId": 42,
            "userId": null
        }))
        .expect("record");
        assert_eq!(record.id.as_deref(), Some("17"));
        assert_eq!(record.group_id(), Some("42"));
        assert_eq!(record.year(), Some("2024"));
        assert_eq!(record.user_id, None);
    }

    #[test]
    fn raw_record_ignores_row_key_next_to_id() {
        let record: RawProductionRecord = serde_json::from_value(serde_json::json!({
            "id": "p-1",
            "rowKey": "p-1",
            "partitionKey": "Production",
            "date": "2024-05-01",
            "groupId": "g-1"
        }))
        .expect("record");
        assert_eq!(record.id.as_deref(), Some("p-1"));
        assert_eq!(record.group_id(), Some("g-1"));
    }

    #[test]
    fn raw_record_accepts_numbers_and_strings() {
        let record: RawProductionRecord = serde_json::from_value(serde_json::json!({
            "id": "p-1",
            "date": "2024-05-01",
            "materialType": "bamboo",
            "materialAmount": 100,
            "charcoalProduced": "12.5",
            "charcoalVolume": null,
            "groupId": "g-1",
            "extra": {"ignored": true}
        }))
        .expect("record");
        assert_eq!(record.id.as_deref(), Some("p-1"));
        assert_eq!(record.year(), Some("2024"));
        let sum = SumTuple::from_record(&record);
        assert_eq!(sum.material_amount, 100.0);
        assert_eq!(sum.charcoal_produced, 12.5);
        assert_eq!(sum.charcoal_volume, 0.0);
    }

    #[test]
    fn year_is_first_four_characters() {
        let mut record = RawProductionRecord {
            date: Some("2023/12/31".into()),
            ..Default::default()
        };
        assert_eq!(record.year(), Some("2023"));
        record.date = Some("202".into());
        assert_eq!(record.year(), Some("202"));
        record.date = Some(String::new());
        assert_eq!(record.year(), None);
    }

    #[test]
    fn bamboo_metrics_match_reference_numbers() {
        let sum = SumTuple {
            charcoal_produced: 60.0,
            ..Default::default()
        };
        let m = DerivedMetrics::compute(&sum, "bamboo", &CalcSettings::default());
        assert!(close(m.carbon_content, 48.0));
        assert!(close(m.co2_reduction, 176.16));
        assert!(close(m.ipcc_long_term, 176.16 * 0.8));
    }

    #[test]
    fn unknown_material_uses_other_factors_in_both_maps() {
        let mut settings = CalcSettings::default();
        settings.carbon_content_factors.other = 0.5;
        settings.ipcc_long_term_factors.other = 0.25;
        let sum = SumTuple {
            charcoal_produced: 10.0,
            ..Default::default()
        };
        let m = DerivedMetrics::compute(&sum, "unknown-material", &settings);
        assert!(close(m.carbon_content, 5.0));
        assert!(close(m.co2_reduction, 5.0 * 3.67));
        assert!(close(m.ipcc_long_term, 5.0 * 3.67 * 0.25));

        let defaults = DerivedMetrics::compute(&sum, "unknown-material", &CalcSettings::default());
        assert!(close(defaults.carbon_content, 8.0));
        assert!(close(defaults.co2_reduction, 29.36));
    }

    #[test]
    fn compute_is_deterministic_and_zero_for_no_charcoal() {
        let sum = SumTuple {
            material_amount: 40.0,
            charcoal_produced: 3.3,
            ..Default::default()
        };
        let settings = CalcSettings::default();
        let a = DerivedMetrics::compute(&sum, "herbaceous", &settings);
        let b = DerivedMetrics::compute(&sum, "herbaceous", &settings);
        assert_eq!(a.carbon_content.to_bits(), b.carbon_content.to_bits());
        assert_eq!(a.ipcc_long_term.to_bits(), b.ipcc_long_term.to_bits());

        let zero = DerivedMetrics::compute(&SumTuple::default(), "bamboo", &settings);
        assert_eq!(zero, DerivedMetrics::default());
    }

    #[test]
    fn settings_require_all_keys_and_positive_values() {
        let defaults = serde_json::to_value(CalcSettings::default()).expect("json");
        assert_eq!(
            CalcSettings::from_json_value(&defaults).expect("valid"),
            CalcSettings::default()
        );

        let mut missing = defaults.clone();
        missing["carbonContentFactors"]
            .as_object_mut()
            .expect("object")
            .remove("other");
        assert!(matches!(
            CalcSettings::from_json_value(&missing),
            Err(SettingsError::Malformed(_))
        ));

        let mut negative = defaults.clone();
        negative["ipccLongTermFactors"]["pruning"] = serde_json::json!(-1.0);
        assert!(matches!(
            CalcSettings::from_json_value(&negative),
            Err(SettingsError::InvalidFactor { material: "pruning", .. })
        ));

        let mut zero_conversion = defaults;
        zero_conversion["co2ConversionFactor"] = serde_json::json!(0);
        assert!(matches!(
            CalcSettings::from_json_value(&zero_conversion),
            Err(SettingsError::InvalidConversionFactor(_))
        ));
    }

    #[test]
    fn row_keys_follow_granularity() {
        let key = AggregationKey::new("2024", "g-1", "bamboo");
        assert_eq!(key.row_key(), "2024-g-1-bamboo");
        assert_eq!(key.without_material().row_key(), "2024-g-1");
        assert_eq!("Group".parse::<Granularity>(), Ok(Granularity::Group));
        assert!("weekly".parse::<Granularity>().is_err());
    }

    #[test]
    fn scope_matching() {
        let scope = Scope::Group("g-1".into());
        assert!(scope.matches("g-1"));
        assert!(!scope.matches("g-2"));
        assert_eq!(scope.group_filter(), Some("g-1"));
        assert!(Scope::All.matches("anything"));
        assert_eq!(Scope::All.to_string(), "all");
    }
}
