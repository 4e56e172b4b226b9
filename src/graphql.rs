//! GraphQL query API used to seed counts and charts before the feed is live
//!
//! Response parsing is platform-agnostic; the HTTP client needs the `cli`
//! feature.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{LocationId, RawPoint, Timeframe};
use crate::error::{Error, Result};

pub const ALL_LOCATIONS_QUERY: &str = "query GetAllLocations { allLocations { id name liveCount } }";

pub const SAMPLING_DATA_QUERY: &str = "query GetSamplingData($locationId: String!, $period: String!) { samplingData(locationId: $locationId, period: $period) }";

#[derive(Debug, Serialize)]
pub struct GraphqlRequest<'a> {
    pub query: &'a str,
    pub variables: Value,
}

#[derive(Debug, Deserialize)]
pub struct GraphqlError {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct GraphqlResponse<T> {
    pub data: Option<T>,
    #[serde(default)]
    pub errors: Vec<GraphqlError>,
}

impl<T> GraphqlResponse<T> {
    /// First reported error wins over any partial data.
    pub fn into_result(self) -> Result<T> {
        if let Some(err) = self.errors.into_iter().next() {
            return Err(Error::Query(err.message));
        }
        self.data
            .ok_or_else(|| Error::Query("response has neither data nor errors".into()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSummary {
    pub id: LocationId,
    pub name: String,
    #[serde(default)]
    pub live_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AllLocations {
    #[serde(default)]
    all_locations: Vec<LocationSummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SamplingData {
    sampling_data: String,
}

/// Decode the `samplingData` scalar, a JSON document embedded in a string
/// whose `data` array holds the points.
pub fn parse_sampling_data(encoded: &str) -> Result<Vec<RawPoint>> {
    let doc: Value = serde_json::from_str(encoded)?;
    let points = doc
        .get("data")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .enumerate()
                .filter_map(|(i, v)| RawPoint::from_json(v, i))
                .collect()
        })
        .unwrap_or_default();
    Ok(points)
}

#[cfg(feature = "cli")]
pub use client::GraphqlClient;

#[cfg(feature = "cli")]
mod client {
    use super::*;
    use serde::de::DeserializeOwned;
    use serde_json::json;
    use tracing::debug;

    #[derive(Debug, Clone)]
    pub struct GraphqlClient {
        http: reqwest::Client,
        endpoint: String,
    }

    impl GraphqlClient {
        pub fn new(endpoint: impl Into<String>) -> Self {
            Self {
                http: reqwest::Client::new(),
                endpoint: endpoint.into(),
            }
        }

        pub async fn query<T: DeserializeOwned>(&self, query: &str, variables: Value) -> Result<T> {
            debug!(endpoint = %self.endpoint, "GraphQL request");
            let response = self
                .http
                .post(&self.endpoint)
                .json(&GraphqlRequest { query, variables })
                .send()
                .await
                .map_err(|e| Error::Query(e.to_string()))?;

            let body: GraphqlResponse<T> = response
                .json()
                .await
                .map_err(|e| Error::Query(e.to_string()))?;
            body.into_result()
        }

        pub async fn all_locations(&self) -> Result<Vec<LocationSummary>> {
            let data: AllLocations = self.query(ALL_LOCATIONS_QUERY, json!({})).await?;
            Ok(data.all_locations)
        }

        /// Chart history for `timeframe`, at the matching sampling period.
        pub async fn sampling_data(
            &self,
            location_id: &str,
            timeframe: Timeframe,
        ) -> Result<Vec<RawPoint>> {
            let variables = json!({
                "locationId": location_id,
                "period": timeframe.history_period(),
            });
            let data: SamplingData = self.query(SAMPLING_DATA_QUERY, variables).await?;
            parse_sampling_data(&data.sampling_data)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_take_precedence() {
        let json = r#"{"data": null, "errors": [{"message": "location not found"}, {"message": "second"}]}"#;
        let resp: GraphqlResponse<AllLocations> = serde_json::from_str(json).unwrap();
        match resp.into_result() {
            Err(Error::Query(msg)) => assert_eq!(msg, "location not found"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_all_locations_response() {
        let json = r#"{"data": {"allLocations": [
            {"id": "northern-gate", "name": "Northern Gate", "liveCount": 17},
            {"id": "women_region", "name": "Women", "liveCount": null}
        ]}}"#;
        let resp: GraphqlResponse<AllLocations> = serde_json::from_str(json).unwrap();
        let locations = resp.into_result().unwrap().all_locations;
        assert_eq!(locations.len(), 2);
        assert_eq!(locations[0].live_count, Some(17));
        assert_eq!(locations[1].live_count, None);
    }

    #[test]
    fn test_sampling_data_is_embedded_json() {
        let json = r#"{"data": {"samplingData": "{\"data\": [{\"timestamp\": \"10:00\", \"count\": 4}, {\"timestamp\": \"10:01\", \"count\": 2}]}"}}"#;
        let resp: GraphqlResponse<SamplingData> = serde_json::from_str(json).unwrap();
        let points = parse_sampling_data(&resp.into_result().unwrap().sampling_data).unwrap();
        assert_eq!(points, vec![RawPoint::new("10:00", 4), RawPoint::new("10:01", 2)]);

        assert!(parse_sampling_data("{}").unwrap().is_empty());
        assert!(matches!(parse_sampling_data("nope"), Err(Error::Malformed(_))));
    }
}
