//! Parsing and validation of inbound page fetch requests.

use crate::archive::ArchiveKey;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use url::Url;

pub const DEFAULT_SERVICE_CODE: &str = "PARKINGV";
pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const DEFAULT_EXTENSIONS: &str = "true";

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("Invalid or missing JSON body.\n{0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Invalid or missing JSON body.\nexpected a JSON object")]
    NotAnObject,

    #[error("Missing required json fields for page, start_date, or end_date.")]
    MissingFields,

    #[error("Invalid upstream url {url:?}.\n{source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
}

/// Request body as sent by clients. Every field is optional here; defaults
/// and required-field checks are applied by [`FetchRequest::from_json`].
#[derive(Deserialize, Debug)]
struct FetchRequestBody {
    url: Option<String>,
    service_code: Option<String>,
    page_size: Option<u32>,
    page: Option<u32>,
    start_date: Option<String>,
    end_date: Option<String>,
    #[serde(default, deserialize_with = "string_or_bool")]
    extensions: Option<String>,
}

/// A validated request for one page of upstream records.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub url: Url,
    pub service_code: String,
    pub page_size: u32,
    pub page: u32,
    pub start_date: String,
    pub end_date: String,
    pub extensions: String,
}

impl FetchRequest {
    /// Parses a request body, falling back to `default_url` when the body
    /// names no upstream.
    ///
    /// A `page` of 0 and empty date strings count as missing.
    pub fn from_json(body: &[u8], default_url: &Url) -> Result<Self, RequestError> {
        let value: serde_json::Value = serde_json::from_slice(body)?;
        if !value.is_object() {
            return Err(RequestError::NotAnObject);
        }
        let body: FetchRequestBody = serde_json::from_value(value)?;

        let page = body.page.filter(|page| *page > 0);
        let start_date = body.start_date.filter(|date| !date.is_empty());
        let end_date = body.end_date.filter(|date| !date.is_empty());

        let (Some(page), Some(start_date), Some(end_date)) = (page, start_date, end_date) else {
            return Err(RequestError::MissingFields);
        };

        let url = match body.url {
            Some(url) => Url::parse(&url).map_err(|source| RequestError::InvalidUrl { url, source })?,
            None => default_url.clone(),
        };

        Ok(FetchRequest {
            url,
            service_code: body
                .service_code
                .unwrap_or_else(|| DEFAULT_SERVICE_CODE.into()),
            page_size: body.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
            page,
            start_date,
            end_date,
            extensions: body.extensions.unwrap_or_else(|| DEFAULT_EXTENSIONS.into()),
        })
    }

    /// Query parameters for the upstream call, in the order the upstream
    /// documents them.
    pub fn query_params(&self) -> [(&'static str, String); 6] {
        [
            ("extensions", self.extensions.clone()),
            ("page_size", self.page_size.to_string()),
            ("service_code", self.service_code.clone()),
            ("page", self.page.to_string()),
            ("start_date", self.start_date.clone()),
            ("end_date", self.end_date.clone()),
        ]
    }

    pub fn archive_key(&self, extension: &str) -> ArchiveKey {
        ArchiveKey::new(&self.service_code, &self.start_date, self.page, extension)
    }
}

// Clients send the extensions flag both as a JSON boolean and as a string.
fn string_or_bool<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    Ok(Option::<Flag>::deserialize(deserializer)?.map(|flag| match flag {
        Flag::Bool(value) => value.to_string(),
        Flag::Text(value) => value,
    }))
}
