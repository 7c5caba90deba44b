//! Request and response bodies of the statistics service.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use kwengine_shared::{Device, DynamicsPeriod, DynamicsPoint, FrequencyRecord, RegionShare};

/// Serialize devices as wire names; an empty filter means all devices.
pub(crate) fn wire_devices(devices: &[Device]) -> Vec<&'static str> {
    if devices.is_empty() {
        vec![Device::All.as_wire()]
    } else {
        devices.iter().map(Device::as_wire).collect()
    }
}

fn no_regions(regions: &&[u32]) -> bool {
    regions.is_empty()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TopRequestsBody<'a> {
    pub phrase: &'a str,
    #[serde(skip_serializing_if = "no_regions")]
    pub regions: &'a [u32],
    pub devices: Vec<&'static str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TopRequestsResponse {
    pub total_count: u64,
    #[serde(default)]
    pub top_requests: Vec<FrequencyRecord>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RegionsBody<'a> {
    pub phrase: &'a str,
    pub devices: Vec<&'static str>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RegionsResponse {
    pub results: Vec<RegionShare>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DynamicsBody<'a> {
    pub phrase: &'a str,
    pub period: &'static str,
    pub from_date: String,
    pub to_date: String,
    pub devices: Vec<&'static str>,
}

impl<'a> DynamicsBody<'a> {
    pub fn new(
        phrase: &'a str,
        period: DynamicsPeriod,
        from: NaiveDate,
        to: NaiveDate,
        devices: &[Device],
    ) -> Self {
        Self {
            phrase,
            period: period.as_wire(),
            from_date: from.format("%Y-%m-%d").to_string(),
            to_date: to.format("%Y-%m-%d").to_string(),
            devices: wire_devices(devices),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct DynamicsResponse {
    pub results: Vec<DynamicsPoint>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_requests_body_omits_empty_regions() {
        let body = TopRequestsBody {
            phrase: "тур в сочи",
            regions: &[],
            devices: wire_devices(&[]),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("regions").is_none());
        assert_eq!(json["devices"], serde_json::json!(["DEVICE_ALL"]));
    }

    #[test]
    fn dynamics_body_formats_dates() {
        let body = DynamicsBody::new(
            "тур",
            DynamicsPeriod::Monthly,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            &[Device::Phone, Device::Tablet],
        );
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["period"], "PERIOD_MONTHLY");
        assert_eq!(json["fromDate"], "2024-01-01");
        assert_eq!(json["toDate"], "2024-01-31");
        assert_eq!(json["devices"], serde_json::json!(["DEVICE_PHONE", "DEVICE_TABLET"]));
    }

    #[test]
    fn top_requests_response_tolerates_missing_list() {
        let parsed: TopRequestsResponse =
            serde_json::from_str(r#"{"requestPhrase":"x","totalCount":42}"#).unwrap();
        assert_eq!(parsed.total_count, 42);
        assert!(parsed.top_requests.is_empty());
    }
}
