//! Defensive extraction of scalar values from record source payloads.
//!
//! Missing and null values normalize to an empty string. Dates accept epoch
//! milliseconds (number or digit string) or ISO-8601 and render as
//! `YYYY-MM-DD`. Numbers parse or render empty.

use crate::config::PropertyKind;
use crate::models::{Record, RecordId};
use crate::records::traits::RecordQuery;
use crate::Result;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub fn text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => other.to_string(),
    }
}

pub fn number(value: Option<&Value>) -> String {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().replace(',', "").parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(n) if n.is_finite() => format_number(n),
        _ => String::new(),
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

pub fn timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        Value::String(s) => parse_timestamp_str(s.trim()),
        _ => None,
    }
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if s.chars().all(|c| c.is_ascii_digit()) {
        return s.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.and_utc());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

pub fn date(value: Option<&Value>) -> String {
    timestamp(value)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

pub fn by_kind(kind: PropertyKind, value: Option<&Value>) -> String {
    match kind {
        PropertyKind::Text => text(value),
        PropertyKind::Number => number(value),
        PropertyKind::Date => date(value),
    }
}

/// Well-known property names carrying record metadata.
pub struct MetaProperties<'a> {
    pub owner: &'a str,
    pub stage: &'a str,
    pub created: &'a str,
    pub updated: &'a str,
}

/// Build a `Record` from a source object id and its raw property map.
pub fn record_from_properties(
    id: &str,
    raw: &Map<String, Value>,
    query: &RecordQuery,
    meta: &MetaProperties<'_>,
) -> Result<Record> {
    let id = RecordId::new(id)?;
    let mut properties = BTreeMap::new();
    for spec in &query.properties {
        properties.insert(spec.name.clone(), by_kind(spec.kind, raw.get(&spec.name)));
    }
    Ok(Record {
        id,
        owner_id: text(raw.get(meta.owner)),
        name: text(raw.get(&query.name_property)),
        stage: text(raw.get(meta.stage)),
        properties,
        created_at: timestamp(raw.get(meta.created)),
        updated_at: timestamp(raw.get(meta.updated)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dates_accept_epoch_ms_and_iso() {
        assert_eq!(date(Some(&json!(1714521600000i64))), "2024-05-01");
        assert_eq!(date(Some(&json!("1714521600000"))), "2024-05-01");
        assert_eq!(date(Some(&json!("2024-05-01T15:30:00.000Z"))), "2024-05-01");
        assert_eq!(date(Some(&json!("2024-05-01T15:30:00"))), "2024-05-01");
        assert_eq!(date(Some(&json!("2024-05-01"))), "2024-05-01");
        assert_eq!(date(Some(&json!("next tuesday"))), "");
        assert_eq!(date(Some(&Value::Null)), "");
        assert_eq!(date(None), "");
    }

    #[test]
    fn numbers_parse_or_empty() {
        assert_eq!(number(Some(&json!("1500"))), "1500");
        assert_eq!(number(Some(&json!("1500.0"))), "1500");
        assert_eq!(number(Some(&json!("1,250.5"))), "1250.5");
        assert_eq!(number(Some(&json!(42.25))), "42.25");
        assert_eq!(number(Some(&json!("n/a"))), "");
        assert_eq!(number(Some(&json!(""))), "");
        assert_eq!(number(None), "");
    }

    #[test]
    fn text_trims_and_nulls_are_empty() {
        assert_eq!(text(Some(&json!("  Acme renewal "))), "Acme renewal");
        assert_eq!(text(Some(&Value::Null)), "");
        assert_eq!(text(Some(&json!(true))), "true");
    }

    #[test]
    fn record_from_properties_normalizes_every_requested_property() {
        let cfg = crate::test_support::sample_config();
        let query = RecordQuery::for_dataset(
            &cfg.datasets[0],
            &[],
            chrono::Utc::now(),
            cfg.fetch_cap,
        );
        let raw = json!({
            "dealname": "Acme renewal",
            "dealstage": "qualifiedtobuy",
            "hubspot_owner_id": "77",
            "amount": "1200.00",
            "closedate": "2025-06-30T00:00:00Z",
            "createdate": "1714521600000",
        });
        let meta = MetaProperties {
            owner: "hubspot_owner_id",
            stage: "dealstage",
            created: "createdate",
            updated: "hs_lastmodifieddate",
        };
        let rec = record_from_properties("901", raw.as_object().unwrap(), &query, &meta).unwrap();
        assert_eq!(rec.id.as_str(), "901");
        assert_eq!(rec.owner_id, "77");
        assert_eq!(rec.name, "Acme renewal");
        assert_eq!(rec.property("amount"), "1200");
        assert_eq!(rec.property("closedate"), "2025-06-30");
        assert_eq!(rec.property("hs_deal_score"), "");
        assert!(rec.properties.contains_key("hs_deal_score"));
        assert!(rec.created_at.is_some());
        assert!(rec.updated_at.is_none());
    }
}
