use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::Serialize;

use crate::config::TlsConfig;
use crate::error::TlsError;
use crate::htm::{Delegation, TrixelId};
use crate::schema::MeasurementType;

/// The slice of the TLS api the sweep depends on. Split out so the manager can
/// run against an in-process stub in tests.
#[async_trait]
pub trait CountPublisher: Send + Sync {
    /// Publish measurement station counts for a batch of trixels. Idempotent;
    /// a transient failure is retried on the next tick.
    async fn publish_counts(
        &self,
        measurement_type: MeasurementType,
        counts: &HashMap<TrixelId, u32>,
    ) -> Result<(), TlsError>;

    /// Populated trixels below `under` for one measurement type.
    async fn fetch_populated_trixels(
        &self,
        measurement_type: MeasurementType,
        under: TrixelId,
    ) -> Result<HashSet<TrixelId>, TlsError>;
}

/// HTTP client for the trixel lookup service.
#[derive(Debug)]
pub struct TlsClient {
    http: reqwest::Client,
    base_url: String,
    tms_id: u64,
    api_token: String,
}

#[derive(Debug, Serialize)]
struct CountEntry {
    trixel_id: TrixelId,
    ms_count: u32,
}

#[derive(Debug, Serialize)]
struct TrixelMapCounts<'a> {
    #[serde(rename = "type")]
    measurement_type: &'a str,
    entries: Vec<CountEntry>,
}

fn base_url(config: &TlsConfig) -> String {
    let scheme = if config.use_ssl { "https" } else { "http" };
    format!("{scheme}://{}", config.host)
}

impl TlsClient {
    pub fn new(config: &TlsConfig) -> Result<Self, TlsError> {
        let tms_id = config
            .tms_id
            .ok_or_else(|| TlsError::Critical("tls.tms_id is not configured".to_string()))?;
        let api_token = config
            .api_token
            .clone()
            .ok_or_else(|| TlsError::Critical("TLS api token is not configured".to_string()))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: base_url(config),
            tms_id,
            api_token,
        })
    }

    fn check_status(status: reqwest::StatusCode, context: &str) -> Result<(), TlsError> {
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(TlsError::Critical(format!("{context}: rejected with {status}")));
        }
        if !status.is_success() {
            return Err(TlsError::Transient(format!("{context}: {status}")));
        }
        Ok(())
    }

    /// Fetch the delegations assigned to this TMS.
    pub async fn fetch_delegations(&self) -> Result<Vec<Delegation>, TlsError> {
        let url = format!("{}/tms/{}/delegations", self.base_url, self.tms_id);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| TlsError::Transient(format!("fetch delegations: {e}")))?;
        Self::check_status(response.status(), "fetch delegations")?;
        response
            .json()
            .await
            .map_err(|e| TlsError::Transient(format!("fetch delegations: bad body: {e}")))
    }
}

#[async_trait]
impl CountPublisher for TlsClient {
    async fn publish_counts(
        &self,
        measurement_type: MeasurementType,
        counts: &HashMap<TrixelId, u32>,
    ) -> Result<(), TlsError> {
        if counts.is_empty() {
            return Ok(());
        }
        let body = TrixelMapCounts {
            measurement_type: measurement_type.as_str(),
            entries: counts
                .iter()
                .map(|(&trixel_id, &ms_count)| CountEntry { trixel_id, ms_count })
                .collect(),
        };
        let url = format!("{}/tms/{}/trixel_map_counts", self.base_url, self.tms_id);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| TlsError::Transient(format!("publish counts: {e}")))?;
        Self::check_status(response.status(), "publish counts")
    }

    async fn fetch_populated_trixels(
        &self,
        measurement_type: MeasurementType,
        under: TrixelId,
    ) -> Result<HashSet<TrixelId>, TlsError> {
        let url = format!(
            "{}/trixels?type={}&under={}",
            self.base_url,
            measurement_type.as_str(),
            under
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| TlsError::Transient(format!("fetch populated trixels: {e}")))?;
        Self::check_status(response.status(), "fetch populated trixels")?;
        let trixels: Vec<TrixelId> = response
            .json()
            .await
            .map_err(|e| TlsError::Transient(format!("fetch populated trixels: bad body: {e}")))?;
        Ok(trixels.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_scheme() {
        let mut config = TlsConfig { host: "lookup.example.org".into(), ..TlsConfig::default() };
        assert_eq!(base_url(&config), "https://lookup.example.org");
        config.use_ssl = false;
        assert_eq!(base_url(&config), "http://lookup.example.org");
    }

    #[test]
    fn test_missing_token_is_critical() {
        let config = TlsConfig { tms_id: Some(1), api_token: None, ..TlsConfig::default() };
        let err = TlsClient::new(&config).unwrap_err();
        assert!(err.is_critical());
    }

    #[test]
    fn test_status_mapping() {
        assert!(
            TlsClient::check_status(reqwest::StatusCode::UNAUTHORIZED, "x").unwrap_err().is_critical()
        );
        assert!(
            !TlsClient::check_status(reqwest::StatusCode::BAD_GATEWAY, "x").unwrap_err().is_critical()
        );
        assert!(TlsClient::check_status(reqwest::StatusCode::OK, "x").is_ok());
    }
}
