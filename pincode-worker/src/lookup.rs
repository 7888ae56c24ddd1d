//! Client for the postal pincode lookup service.
//!
//! `GET <endpoint>/<pincode>` answers with a JSON array holding a single element:
//!
//! ```json
//! [{"Message": "Number of pincode(s) found:1", "Status": "Success", "PostOffice": [{"Block": "New Delhi", ...}]}]
//! ```
//!
//! Unknown pincodes come back as `"Status": "Error"` with a `null` `PostOffice`.
use std::fmt;
use std::str::FromStr;
use std::time;

use async_trait::async_trait;
use reqwest::header;
use serde::Deserialize;
use thiserror::Error;

use crate::error::LookupError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PincodeResponse {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub post_office: Option<Vec<PostOffice>>,
}

/// A single post office record. Fields are optional as the service returns `null` for some of them.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PostOffice {
    #[serde(default)]
    pub name: Option<String>,
    /// Free-form: seen as a string, `null` or missing.
    #[serde(default)]
    pub description: Option<serde_json::Value>,
    #[serde(default)]
    pub branch_type: Option<String>,
    #[serde(default)]
    pub delivery_status: Option<String>,
    #[serde(default)]
    pub circle: Option<String>,
    #[serde(default)]
    pub district: Option<String>,
    #[serde(default)]
    pub division: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub block: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub pincode: Option<String>,
}

/// The `PostOffice` field whose value is aggregated as the location identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocationField {
    Name,
    BranchType,
    DeliveryStatus,
    Circle,
    District,
    Division,
    Region,
    #[default]
    Block,
    State,
    Country,
    Pincode,
}

impl LocationField {
    /// Extract this field from `office`, skipping blank values.
    pub fn extract<'a>(&self, office: &'a PostOffice) -> Option<&'a str> {
        let value = match self {
            LocationField::Name => &office.name,
            LocationField::BranchType => &office.branch_type,
            LocationField::DeliveryStatus => &office.delivery_status,
            LocationField::Circle => &office.circle,
            LocationField::District => &office.district,
            LocationField::Division => &office.division,
            LocationField::Region => &office.region,
            LocationField::Block => &office.block,
            LocationField::State => &office.state,
            LocationField::Country => &office.country,
            LocationField::Pincode => &office.pincode,
        };

        value.as_deref().map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LocationField::Name => "Name",
            LocationField::BranchType => "BranchType",
            LocationField::DeliveryStatus => "DeliveryStatus",
            LocationField::Circle => "Circle",
            LocationField::District => "District",
            LocationField::Division => "Division",
            LocationField::Region => "Region",
            LocationField::Block => "Block",
            LocationField::State => "State",
            LocationField::Country => "Country",
            LocationField::Pincode => "Pincode",
        }
    }
}

impl fmt::Display for LocationField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a PostOffice field")]
pub struct ParseLocationFieldError(String);

impl FromStr for LocationField {
    type Err = ParseLocationFieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "").as_str() {
            "name" => Ok(LocationField::Name),
            "branchtype" => Ok(LocationField::BranchType),
            "deliverystatus" => Ok(LocationField::DeliveryStatus),
            "circle" => Ok(LocationField::Circle),
            "district" => Ok(LocationField::District),
            "division" => Ok(LocationField::Division),
            "region" => Ok(LocationField::Region),
            "block" => Ok(LocationField::Block),
            "state" => Ok(LocationField::State),
            "country" => Ok(LocationField::Country),
            "pincode" => Ok(LocationField::Pincode),
            _ => Err(ParseLocationFieldError(s.to_owned())),
        }
    }
}

/// Looks up the post offices registered under a pincode.
#[async_trait]
pub trait Lookup: Send + Sync {
    async fn lookup(&self, pincode: &str) -> Result<Vec<PostOffice>, LookupError>;
}

/// A `Lookup` over HTTP.
pub struct HttpLookupClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpLookupClient {
    pub fn new(endpoint: &str, request_timeout: time::Duration) -> Result<Self, reqwest::Error> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("pincode-worker")
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_owned(),
        })
    }
}

#[async_trait]
impl Lookup for HttpLookupClient {
    async fn lookup(&self, pincode: &str) -> Result<Vec<PostOffice>, LookupError> {
        let url = format!("{}/{}", self.endpoint, pincode);

        let response = self.client.get(url).send().await?.error_for_status()?;
        let body = response.bytes().await?;

        parse_response(&body)
    }
}

/// Decode a lookup response body into its post office records.
pub fn parse_response(body: &[u8]) -> Result<Vec<PostOffice>, LookupError> {
    let responses: Vec<PincodeResponse> = serde_json::from_slice(body)?;

    let Some(response) = responses.into_iter().next() else {
        return Err(LookupError::EmptyResult("empty response array".to_owned()));
    };

    match response.post_office {
        Some(offices) if !offices.is_empty() => Ok(offices),
        _ => Err(LookupError::EmptyResult(
            response
                .message
                .or(response.status)
                .unwrap_or_else(|| "no post offices".to_owned()),
        )),
    }
}
