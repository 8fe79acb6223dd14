//! Typed shapes for successful provider responses.
//!
//! Only the fields the application consumes are decoded. Anything that does
//! not fit (wrong types, missing ids, negative metrics, bad dates) is an
//! `InvalidResponse` rather than a partially filled value.

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::GatewayError;
use crate::provider::{ApiRequest, Provider};
use crate::sanitize::sanitize_message;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdAccount {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub status: String,
}

/// One day of delivery metrics.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightRow {
    pub date: NaiveDate,
    /// Spend in the account currency
    pub spend: f64,
    pub impressions: u64,
    pub clicks: u64,
}

/// Validated result of a gateway call.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", content = "items", rename_all = "snake_case")]
pub enum ApiResponse {
    AdAccounts(Vec<AdAccount>),
    Campaigns(Vec<Campaign>),
    Insights(Vec<InsightRow>),
}

// Meta Graph API

#[derive(Deserialize)]
struct MetaPage<T> {
    data: Vec<T>,
}

#[derive(Deserialize)]
struct MetaAdAccount {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    currency: Option<String>,
}

#[derive(Deserialize)]
struct MetaCampaign {
    id: String,
    name: String,
    status: String,
}

#[derive(Deserialize)]
struct MetaInsight {
    date_start: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    spend: f64,
    #[serde(default, deserialize_with = "lenient_u64")]
    impressions: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    clicks: u64,
}

// Google Ads REST

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleCustomers {
    #[serde(default)]
    resource_names: Vec<String>,
}

/// `googleAds:search` omits `results` entirely when nothing matched.
#[derive(Deserialize)]
struct GoogleSearch<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

#[derive(Deserialize)]
struct GoogleCampaignRow {
    campaign: GoogleCampaign,
}

#[derive(Deserialize)]
struct GoogleCampaign {
    #[serde(deserialize_with = "lenient_string")]
    id: String,
    name: String,
    status: String,
}

#[derive(Deserialize)]
struct GoogleInsightRow {
    segments: GoogleSegments,
    #[serde(default)]
    metrics: GoogleMetrics,
}

#[derive(Deserialize)]
struct GoogleSegments {
    date: String,
}

/// Zero-valued metrics are omitted by the API.
#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GoogleMetrics {
    #[serde(default, deserialize_with = "lenient_u64")]
    cost_micros: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    impressions: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    clicks: u64,
}

/// Decodes and validates a 2xx body for `request`.
pub fn parse_response(
    provider: Provider,
    request: &ApiRequest,
    body: &[u8],
) -> Result<ApiResponse, GatewayError> {
    match (provider, request) {
        (Provider::Meta, ApiRequest::ListAdAccounts) => {
            let page: MetaPage<MetaAdAccount> = decode(body)?;
            page.data
                .into_iter()
                .map(|a| {
                    Ok(AdAccount {
                        id: require_id(a.id)?,
                        name: a.name,
                        currency: a.currency,
                    })
                })
                .collect::<Result<_, _>>()
                .map(ApiResponse::AdAccounts)
        }
        (Provider::Meta, ApiRequest::ListCampaigns { .. }) => {
            let page: MetaPage<MetaCampaign> = decode(body)?;
            page.data
                .into_iter()
                .map(|c| {
                    Ok(Campaign {
                        id: require_id(c.id)?,
                        name: c.name,
                        status: c.status,
                    })
                })
                .collect::<Result<_, _>>()
                .map(ApiResponse::Campaigns)
        }
        (Provider::Meta, ApiRequest::GetInsights { .. }) => {
            let page: MetaPage<MetaInsight> = decode(body)?;
            page.data
                .into_iter()
                .map(|row| insight(&row.date_start, row.spend, row.impressions, row.clicks))
                .collect::<Result<_, _>>()
                .map(ApiResponse::Insights)
        }
        (Provider::GoogleAds, ApiRequest::ListAdAccounts) => {
            let customers: GoogleCustomers = decode(body)?;
            customers
                .resource_names
                .into_iter()
                .map(|name| {
                    let id = name.strip_prefix("customers/").unwrap_or(&name).to_string();
                    Ok(AdAccount {
                        id: require_id(id)?,
                        name: None,
                        currency: None,
                    })
                })
                .collect::<Result<_, _>>()
                .map(ApiResponse::AdAccounts)
        }
        (Provider::GoogleAds, ApiRequest::ListCampaigns { .. }) => {
            let search: GoogleSearch<GoogleCampaignRow> = decode(body)?;
            search
                .results
                .into_iter()
                .map(|row| {
                    Ok(Campaign {
                        id: require_id(row.campaign.id)?,
                        name: row.campaign.name,
                        status: row.campaign.status,
                    })
                })
                .collect::<Result<_, _>>()
                .map(ApiResponse::Campaigns)
        }
        (Provider::GoogleAds, ApiRequest::GetInsights { .. }) => {
            let search: GoogleSearch<GoogleInsightRow> = decode(body)?;
            search
                .results
                .into_iter()
                .map(|row| {
                    insight(
                        &row.segments.date,
                        row.metrics.cost_micros as f64 / 1_000_000.0,
                        row.metrics.impressions,
                        row.metrics.clicks,
                    )
                })
                .collect::<Result<_, _>>()
                .map(ApiResponse::Insights)
        }
    }
}

fn decode<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, GatewayError> {
    serde_json::from_slice(body)
        .map_err(|e| GatewayError::InvalidResponse(sanitize_message(&e.to_string())))
}

fn require_id(id: String) -> Result<String, GatewayError> {
    if id.trim().is_empty() {
        Err(GatewayError::InvalidResponse("missing id".to_string()))
    } else {
        Ok(id)
    }
}

fn insight(date: &str, spend: f64, impressions: u64, clicks: u64) -> Result<InsightRow, GatewayError> {
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|_| GatewayError::InvalidResponse(format!("invalid date '{}'", sanitize_message(date))))?;
    if !spend.is_finite() || spend < 0.0 {
        return Err(GatewayError::InvalidResponse("invalid spend".to_string()));
    }
    Ok(InsightRow {
        date,
        spend,
        impressions,
        clicks,
    })
}

// Both APIs encode 64-bit numbers as JSON strings.

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("expected string or number, got {}", other))),
    }
}

fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => s.parse().map_err(serde::de::Error::custom),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom("number out of range")),
        other => Err(serde::de::Error::custom(format!("expected number, got {}", other))),
    }
}

fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => s.parse().map_err(serde::de::Error::custom),
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom("expected non-negative integer")),
        other => Err(serde::de::Error::custom(format!("expected number, got {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insights_request() -> ApiRequest {
        ApiRequest::GetInsights {
            account_id: "1".to_string(),
            since: "2024-03-01".to_string(),
            until: "2024-03-02".to_string(),
        }
    }

    #[test]
    fn test_meta_ad_accounts() {
        let body = br#"{"data":[{"id":"act_1","name":"Main","currency":"USD","account_status":1}],"paging":{}}"#;
        let response = parse_response(Provider::Meta, &ApiRequest::ListAdAccounts, body).unwrap();
        assert_eq!(
            response,
            ApiResponse::AdAccounts(vec![AdAccount {
                id: "act_1".to_string(),
                name: Some("Main".to_string()),
                currency: Some("USD".to_string()),
            }])
        );
    }

    #[test]
    fn test_meta_insights_with_string_numbers() {
        let body = br#"{"data":[{"date_start":"2024-03-01","date_stop":"2024-03-01","spend":"12.34","impressions":"1000","clicks":"7"}]}"#;
        let ApiResponse::Insights(rows) =
            parse_response(Provider::Meta, &insights_request(), body).unwrap()
        else {
            panic!("expected insights");
        };
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].date, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert!((rows[0].spend - 12.34).abs() < f64::EPSILON);
        assert_eq!(rows[0].impressions, 1000);
        assert_eq!(rows[0].clicks, 7);
    }

    #[test]
    fn test_google_customers_strip_resource_prefix() {
        let body = br#"{"resourceNames":["customers/1234567890","customers/42"]}"#;
        let ApiResponse::AdAccounts(accounts) =
            parse_response(Provider::GoogleAds, &ApiRequest::ListAdAccounts, body).unwrap()
        else {
            panic!("expected ad accounts");
        };
        let ids: Vec<_> = accounts.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["1234567890", "42"]);
    }

    #[test]
    fn test_google_campaigns_numeric_ids() {
        let body = br#"{"results":[{"campaign":{"resourceName":"customers/1/campaigns/9","id":9,"name":"Drive","status":"PAUSED"}}]}"#;
        let request = ApiRequest::ListCampaigns {
            account_id: "1".to_string(),
        };
        let response = parse_response(Provider::GoogleAds, &request, body).unwrap();
        assert_eq!(
            response,
            ApiResponse::Campaigns(vec![Campaign {
                id: "9".to_string(),
                name: "Drive".to_string(),
                status: "PAUSED".to_string(),
            }])
        );
    }

    #[test]
    fn test_google_insights_convert_micros_and_default_missing_metrics() {
        let body = br#"{"results":[
            {"segments":{"date":"2024-03-01"},"metrics":{"costMicros":"2500000","impressions":"10"}},
            {"segments":{"date":"2024-03-02"}}
        ]}"#;
        let ApiResponse::Insights(rows) =
            parse_response(Provider::GoogleAds, &insights_request(), body).unwrap()
        else {
            panic!("expected insights");
        };
        assert!((rows[0].spend - 2.5).abs() < f64::EPSILON);
        assert_eq!(rows[0].clicks, 0);
        assert_eq!(rows[1].impressions, 0);
    }

    #[test]
    fn test_empty_google_search() {
        let request = ApiRequest::ListCampaigns {
            account_id: "1".to_string(),
        };
        let response = parse_response(Provider::GoogleAds, &request, b"{}").unwrap();
        assert_eq!(response, ApiResponse::Campaigns(vec![]));
    }

    #[test]
    fn test_invalid_payloads_rejected() {
        let cases: [(Provider, ApiRequest, &[u8]); 5] = [
            (Provider::Meta, ApiRequest::ListAdAccounts, b"not json"),
            (Provider::Meta, ApiRequest::ListAdAccounts, br#"{"items":[]}"#),
            (Provider::Meta, ApiRequest::ListAdAccounts, br#"{"data":[{"id":""}]}"#),
            (
                Provider::Meta,
                insights_request(),
                br#"{"data":[{"date_start":"March 1","spend":"1"}]}"#,
            ),
            (
                Provider::Meta,
                insights_request(),
                br#"{"data":[{"date_start":"2024-03-01","spend":"-5"}]}"#,
            ),
        ];

        for (provider, request, body) in cases {
            assert!(
                matches!(
                    parse_response(provider, &request, body),
                    Err(GatewayError::InvalidResponse(_))
                ),
                "accepted {}",
                String::from_utf8_lossy(body)
            );
        }
    }

    #[test]
    fn test_response_serialization() {
        let response = ApiResponse::Campaigns(vec![Campaign {
            id: "1".to_string(),
            name: "Drive".to_string(),
            status: "ACTIVE".to_string(),
        }]);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["kind"], "campaigns");
        assert_eq!(json["items"][0]["name"], "Drive");
    }
}
