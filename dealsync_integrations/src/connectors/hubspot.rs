//! HubSpot deals as a record source.
//!
//! Uses CRM API v3: `POST /crm/v3/objects/deals/search` with cursor paging
//! (`paging.next.after`) and `GET /crm/v3/owners` for email lookups. The
//! bearer token is read from the secret store on every request.

use async_trait::async_trait;
use dealsync_core::config::ThresholdOp;
use dealsync_core::models::Record;
use dealsync_core::records::normalize::{self, MetaProperties};
use dealsync_core::records::{RecordPage, RecordQuery, RecordSource};
use dealsync_core::secrets::{self, SecretStore};
use dealsync_core::{Error, Result};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

pub const DEFAULT_API_BASE: &str = "https://api.hubapi.com";
/// Largest page the search endpoint returns.
const PAGE_LIMIT: u32 = 100;

const META: MetaProperties<'static> = MetaProperties {
    owner: "hubspot_owner_id",
    stage: "dealstage",
    created: "createdate",
    updated: "hs_lastmodifieddate",
};

#[derive(Debug, Serialize, PartialEq)]
struct SearchRequest {
    #[serde(rename = "filterGroups")]
    filter_groups: Vec<FilterGroup>,
    properties: Vec<String>,
    sorts: Vec<Sort>,
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    after: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
struct FilterGroup {
    filters: Vec<Filter>,
}

#[derive(Debug, Serialize, PartialEq)]
struct Filter {
    #[serde(rename = "propertyName")]
    property_name: String,
    operator: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    values: Vec<String>,
}

impl Filter {
    fn single(property: &str, operator: &'static str, value: impl Into<String>) -> Self {
        Self {
            property_name: property.to_string(),
            operator,
            value: Some(value.into()),
            values: Vec::new(),
        }
    }

    fn many(property: &str, operator: &'static str, values: &[String]) -> Self {
        Self {
            property_name: property.to_string(),
            operator,
            value: None,
            values: values.to_vec(),
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
struct Sort {
    #[serde(rename = "propertyName")]
    property_name: &'static str,
    direction: &'static str,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<HubspotObject>,
    #[serde(default)]
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    #[serde(default)]
    next: Option<NextPage>,
}

#[derive(Debug, Deserialize)]
struct NextPage {
    after: String,
}

#[derive(Debug, Deserialize)]
struct HubspotObject {
    id: String,
    #[serde(default)]
    properties: Map<String, Value>,
    #[serde(rename = "createdAt", default)]
    created_at: Option<String>,
    #[serde(rename = "updatedAt", default)]
    updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OwnersResponse {
    #[serde(default)]
    results: Vec<HubspotOwner>,
}

#[derive(Debug, Deserialize)]
struct HubspotOwner {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Clone)]
pub struct HubSpotDeals {
    client: Client,
    api_base: String,
    secrets: Arc<dyn SecretStore>,
    token_secret: String,
}

impl HubSpotDeals {
    pub fn new(secrets: Arc<dyn SecretStore>, token_secret: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(Error::backend_reqwest)?;
        Ok(Self {
            client,
            api_base: DEFAULT_API_BASE.to_string(),
            secrets,
            token_secret: token_secret.into(),
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn authorized(&self, req: RequestBuilder) -> Result<RequestBuilder> {
        let token = secrets::require(self.secrets.as_ref(), &self.token_secret)?;
        Ok(req.bearer_auth(token))
    }

    fn build_search(owner_id: &str, query: &RecordQuery, cursor: Option<&str>) -> SearchRequest {
        let mut filters = vec![Filter::single(META.owner, "EQ", owner_id)];
        if !query.stages.is_empty() {
            filters.push(Filter::many(META.stage, "IN", &query.stages));
        }
        if !query.excluded_stages.is_empty() {
            filters.push(Filter::many(META.stage, "NOT_IN", &query.excluded_stages));
        }
        if let Some(after) = query.created_after {
            filters.push(Filter::single(
                META.created,
                "GTE",
                after.timestamp_millis().to_string(),
            ));
        }
        for t in &query.thresholds {
            let op = match t.op {
                ThresholdOp::Gt => "GT",
                ThresholdOp::Gte => "GTE",
                ThresholdOp::Lt => "LT",
                ThresholdOp::Lte => "LTE",
            };
            filters.push(Filter::single(&t.property, op, t.value.to_string()));
        }

        let mut properties = query.property_names();
        for extra in [
            query.name_property.as_str(),
            META.owner,
            META.stage,
            META.created,
            META.updated,
        ] {
            if !properties.iter().any(|p| p == extra) {
                properties.push(extra.to_string());
            }
        }

        SearchRequest {
            filter_groups: vec![FilterGroup { filters }],
            properties,
            // Stable order keeps cursor pages from overlapping.
            sorts: vec![Sort {
                property_name: "hs_object_id",
                direction: "ASCENDING",
            }],
            limit: PAGE_LIMIT,
            after: cursor.map(str::to_string),
        }
    }

    fn records_from(objects: Vec<HubspotObject>, query: &RecordQuery) -> Vec<Record> {
        let mut out = Vec::with_capacity(objects.len());
        for obj in objects {
            match normalize::record_from_properties(&obj.id, &obj.properties, query, &META) {
                Ok(mut record) => {
                    if record.created_at.is_none() {
                        record.created_at = obj
                            .created_at
                            .map(Value::String)
                            .and_then(|v| normalize::timestamp(Some(&v)));
                    }
                    if record.updated_at.is_none() {
                        record.updated_at = obj
                            .updated_at
                            .map(Value::String)
                            .and_then(|v| normalize::timestamp(Some(&v)));
                    }
                    out.push(record);
                }
                Err(e) => tracing::warn!(id = %obj.id, error = %e, "skipping deal with unusable id"),
            }
        }
        out
    }

    /// Only an owner whose email equals the queried address counts.
    fn owner_matching(owners: Vec<HubspotOwner>, email: &str) -> Option<String> {
        owners
            .into_iter()
            .find(|o| {
                o.email
                    .as_deref()
                    .is_some_and(|e| e.trim().eq_ignore_ascii_case(email.trim()))
            })
            .map(|o| o.id)
    }

    async fn ensure_success(resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(Error::Remote {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl RecordSource for HubSpotDeals {
    fn id(&self) -> &'static str {
        "hubspot"
    }

    #[instrument(level = "debug", skip(self))]
    async fn lookup_owner_id(&self, email: &str) -> Result<Option<String>> {
        let url = format!("{}/crm/v3/owners", self.api_base);
        let req = self
            .client
            .get(url)
            .query(&[("email", email), ("limit", "1")]);
        let resp = self
            .authorized(req)?
            .send()
            .await
            .map_err(Error::backend_reqwest)?;
        let body: OwnersResponse = Self::ensure_success(resp)
            .await?
            .json()
            .await
            .map_err(Error::backend_reqwest)?;
        Ok(Self::owner_matching(body.results, email))
    }

    #[instrument(level = "debug", skip(self, query))]
    async fn fetch_page(
        &self,
        owner_id: &str,
        query: &RecordQuery,
        cursor: Option<&str>,
    ) -> Result<RecordPage> {
        let url = format!("{}/crm/v3/objects/deals/search", self.api_base);
        let body = Self::build_search(owner_id, query, cursor);
        let req = self.client.post(url).json(&body);
        let resp = self
            .authorized(req)?
            .send()
            .await
            .map_err(Error::backend_reqwest)?;
        let parsed: SearchResponse = Self::ensure_success(resp)
            .await?
            .json()
            .await
            .map_err(Error::backend_reqwest)?;

        let next_cursor = parsed.paging.and_then(|p| p.next).map(|n| n.after);
        Ok(RecordPage {
            records: Self::records_from(parsed.results, query),
            next_cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use dealsync_core::config::{PropertyKind, PropertySpec, ThresholdFilter};
    use dealsync_core::secrets::MemorySecretStore;
    use serde_json::json;

    fn query() -> RecordQuery {
        RecordQuery {
            properties: vec![
                PropertySpec {
                    name: "dealname".to_string(),
                    header: "Deal".to_string(),
                    kind: PropertyKind::Text,
                    score: false,
                },
                PropertySpec {
                    name: "amount".to_string(),
                    header: "Amount".to_string(),
                    kind: PropertyKind::Number,
                    score: false,
                },
                PropertySpec {
                    name: "closedate".to_string(),
                    header: "Close Date".to_string(),
                    kind: PropertyKind::Date,
                    score: false,
                },
            ],
            name_property: "dealname".to_string(),
            stages: vec!["qualifiedtobuy".to_string(), "contractsent".to_string()],
            excluded_stages: vec!["closedlost".to_string()],
            created_after: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            thresholds: vec![ThresholdFilter {
                property: "amount".to_string(),
                op: ThresholdOp::Gte,
                value: 5000.0,
            }],
            cap: 10_000,
        }
    }

    #[test]
    fn search_body_ands_every_filter() {
        let body = serde_json::to_value(HubSpotDeals::build_search("77", &query(), Some("200"))).unwrap();
        let filters = body["filterGroups"][0]["filters"].as_array().unwrap();
        assert_eq!(body["filterGroups"].as_array().unwrap().len(), 1);
        assert_eq!(
            filters[0],
            json!({"propertyName": "hubspot_owner_id", "operator": "EQ", "value": "77"})
        );
        assert_eq!(
            filters[1],
            json!({"propertyName": "dealstage", "operator": "IN", "values": ["qualifiedtobuy", "contractsent"]})
        );
        assert_eq!(filters[2]["operator"], "NOT_IN");
        assert_eq!(filters[3]["value"], "1704067200000");
        assert_eq!(
            filters[4],
            json!({"propertyName": "amount", "operator": "GTE", "value": "5000"})
        );
        assert_eq!(body["limit"], 100);
        assert_eq!(body["after"], "200");

        let props: Vec<&str> = body["properties"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(props.iter().filter(|p| **p == "dealname").count(), 1);
        assert!(props.contains(&"dealstage"));
        assert!(props.contains(&"hubspot_owner_id"));
    }

    #[test]
    fn first_page_omits_cursor() {
        let body = serde_json::to_value(HubSpotDeals::build_search("77", &query(), None)).unwrap();
        assert!(body.get("after").is_none());
    }

    #[test]
    fn response_maps_to_normalized_records_and_cursor() {
        let raw = json!({
            "results": [
                {
                    "id": "901",
                    "properties": {
                        "dealname": " Acme renewal ",
                        "amount": "12000.0",
                        "closedate": "2025-06-30T00:00:00.000Z",
                        "dealstage": "contractsent",
                        "hubspot_owner_id": "77",
                        "createdate": null
                    },
                    "createdAt": "2025-01-02T10:00:00Z"
                },
                {"id": "", "properties": {}}
            ],
            "paging": {"next": {"after": "2"}}
        });
        let parsed: SearchResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(
            parsed.paging.as_ref().and_then(|p| p.next.as_ref()).map(|n| n.after.as_str()),
            Some("2")
        );
        let records = HubSpotDeals::records_from(parsed.results, &query());
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.id.as_str(), "901");
        assert_eq!(r.name, "Acme renewal");
        assert_eq!(r.stage, "contractsent");
        assert_eq!(r.owner_id, "77");
        assert_eq!(r.property("amount"), "12000");
        assert_eq!(r.property("closedate"), "2025-06-30");
        assert_eq!(
            r.created_at,
            Some(Utc.with_ymd_and_hms(2025, 1, 2, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn owner_lookup_requires_matching_email() {
        let body: OwnersResponse = serde_json::from_value(json!({
            "results": [
                {"id": "5"},
                {"id": "6", "email": "someone.else@example.com"},
                {"id": "7", "email": "Ana@Example.com"}
            ]
        }))
        .unwrap();
        assert_eq!(
            HubSpotDeals::owner_matching(body.results, "ana@example.com"),
            Some("7".to_string())
        );

        let body: OwnersResponse =
            serde_json::from_value(json!({"results": [{"id": "5", "email": null}]})).unwrap();
        assert_eq!(HubSpotDeals::owner_matching(body.results, "ana@example.com"), None);
    }

    #[tokio::test]
    async fn missing_token_is_a_config_error_before_any_request() {
        let deals = HubSpotDeals::new(Arc::new(MemorySecretStore::new()), "HUBSPOT_ACCESS_TOKEN")
            .unwrap()
            .with_api_base("http://127.0.0.1:9/");
        let err = deals.fetch_page("77", &query(), None).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        let err = deals.lookup_owner_id("ana@example.com").await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
