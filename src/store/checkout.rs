//! Checkout of final payoffs to the external code-redemption service

use std::sync::Arc;

use reqwest::Client;
use serde::Serialize;
use tracing::{error, info};

use crate::experiment::{Ecu, ParticipantId};

use super::codes::CodeStore;

/// Side-effect-only checkout collaborator
pub trait Checkout: Send + Sync {
    /// Report a participant's final win. Must not block.
    fn checkout(&self, participant: &ParticipantId, win: Ecu) -> Result<(), CheckoutError>;
}

/// Body posted to the checkout endpoint
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutRequest {
    #[serde(rename = "AccessCode")]
    pub access_code: String,
    #[serde(rename = "ExitCode")]
    pub exit_code: String,
    pub bonus: f64,
}

/// Checkout client; posts in the background when an endpoint is configured
#[derive(Clone)]
pub struct CheckoutClient {
    client: Client,
    url: Option<String>,
    codes: Arc<CodeStore>,
    ecu_per_unit: f64,
}

impl CheckoutClient {
    pub fn new(codes: Arc<CodeStore>, url: Option<String>, ecu_per_unit: f64) -> Self {
        Self {
            client: Client::new(),
            url,
            codes,
            ecu_per_unit,
        }
    }

    /// Convert experimental units to the payout currency
    pub fn convert(&self, win: Ecu) -> f64 {
        win as f64 / self.ecu_per_unit
    }

    async fn post(client: Client, url: String, body: CheckoutRequest) -> Result<(), CheckoutError> {
        let response = client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(CheckoutError::Request)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CheckoutError::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

impl Checkout for CheckoutClient {
    fn checkout(&self, participant: &ParticipantId, win: Ecu) -> Result<(), CheckoutError> {
        let code = self
            .codes
            .get(participant)
            .ok_or_else(|| CheckoutError::NoCode(participant.clone()))?;

        let bonus = self.convert(win);
        self.codes.record_win(participant, bonus);

        let body = CheckoutRequest {
            access_code: code.access_code.clone(),
            exit_code: code.exit_code.clone(),
            bonus,
        };

        let Some(url) = self.url.clone() else {
            info!(participant = %participant, bonus, "Checkout recorded (no endpoint configured)");
            return Ok(());
        };

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| CheckoutError::NoRuntime)?;
        let client = self.client.clone();
        let pid = participant.clone();
        runtime.spawn(async move {
            match Self::post(client, url, body).await {
                Ok(()) => info!(participant = %pid, bonus, "Checkout sent"),
                Err(e) => error!(participant = %pid, error = %e, "Checkout request failed"),
            }
        });

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    #[error("No code found for participant {0}")]
    NoCode(ParticipantId),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("No async runtime available for checkout")]
    NoRuntime,
}

/// Test double that records every checkout call
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingCheckout {
    calls: parking_lot::Mutex<Vec<(ParticipantId, Ecu)>>,
}

#[cfg(test)]
impl RecordingCheckout {
    pub fn calls(&self) -> Vec<(ParticipantId, Ecu)> {
        self.calls.lock().clone()
    }
}

#[cfg(test)]
impl Checkout for RecordingCheckout {
    fn checkout(&self, participant: &ParticipantId, win: Ecu) -> Result<(), CheckoutError> {
        self.calls.lock().push((participant.clone(), win));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::codes::CodeRecord;

    fn codes() -> Arc<CodeStore> {
        Arc::new(
            CodeStore::from_records(vec![CodeRecord {
                id: ParticipantId::new("p1"),
                access_code: "A1".into(),
                exit_code: "E1".into(),
            }])
            .unwrap(),
        )
    }

    #[test]
    fn checkout_without_endpoint_records_converted_win() {
        let store = codes();
        let client = CheckoutClient::new(store.clone(), None, 1000.0);

        client.checkout(&ParticipantId::new("p1"), 1500).unwrap();
        assert_eq!(store.win(&ParticipantId::new("p1")), Some(1.5));
    }

    #[test]
    fn unknown_participant_has_no_code() {
        let client = CheckoutClient::new(codes(), None, 1000.0);
        assert!(matches!(
            client.checkout(&ParticipantId::new("ghost"), 10),
            Err(CheckoutError::NoCode(_))
        ));
    }

    #[test]
    fn request_body_uses_code_field_names() {
        let body = CheckoutRequest {
            access_code: "A1".into(),
            exit_code: "E1".into(),
            bonus: 0.06,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["AccessCode"], "A1");
        assert_eq!(json["ExitCode"], "E1");
        assert_eq!(json["bonus"], 0.06);
    }
}
