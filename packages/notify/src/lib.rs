#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Notification fan-out.
//!
//! When a newly discovered citation matches a subscription, an alert goes
//! out to the subscription's target. Delivery is fire-and-forget: a dead
//! webhook endpoint must never stall or fail a crawl cycle, so failures
//! are logged and swallowed at the dispatch boundary.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use ticket_map_citation_models::{CitationRecord, NotifyTarget, Subscription};

/// Webhook delivery timeout.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("no delivery mechanism configured for {0}")]
    Unsupported(String),
}

/// Alert payload posted to webhook targets.
#[derive(Debug, Clone, Serialize)]
pub struct TicketAlert {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub citation_number: u64,
    pub plate_state: Option<String>,
    pub plate_number: Option<String>,
    pub issue_date: Option<String>,
    pub amount_due: Option<f64>,
    pub location: Option<String>,
    pub more_info_url: Option<String>,
}

impl TicketAlert {
    #[must_use]
    pub fn from_record(record: &CitationRecord) -> Self {
        Self {
            kind: "parking_ticket_alert",
            citation_number: record.citation_number,
            plate_state: record.plate_state.clone(),
            plate_number: record.plate_number.clone(),
            issue_date: record.issue_date.map(|x| x.to_rfc3339()),
            amount_due: record.amount_due,
            location: record.location.clone(),
            more_info_url: record.more_info_url.clone(),
        }
    }
}

/// Delivers a single alert to a single target.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: &TicketAlert, target: &NotifyTarget) -> Result<(), NotifyError>;
}

/// Webhook-only notifier. Email targets are accepted in the subscription
/// schema but have no delivery mechanism here yet.
pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    /// # Errors
    ///
    /// * If the HTTP client cannot be built
    pub fn new() -> Result<Self, NotifyError> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(DELIVERY_TIMEOUT)
                .build()?,
        })
    }

    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, alert: &TicketAlert, target: &NotifyTarget) -> Result<(), NotifyError> {
        match target {
            NotifyTarget::Webhook { url } => {
                self.client
                    .post(url)
                    .json(alert)
                    .send()
                    .await?
                    .error_for_status()?;
                Ok(())
            }
            NotifyTarget::Email { address } => {
                Err(NotifyError::Unsupported(format!("email:{address}")))
            }
        }
    }
}

/// Fans an alert out to every matching subscription. Per-target failures
/// are logged and swallowed; returns how many deliveries succeeded.
pub async fn dispatch(
    notifier: &dyn Notifier,
    record: &CitationRecord,
    subscriptions: &[Subscription],
) -> usize {
    let alert = TicketAlert::from_record(record);
    let mut delivered = 0;

    for subscription in subscriptions.iter().filter(|x| x.matches(record)) {
        match notifier.notify(&alert, &subscription.target).await {
            Ok(()) => {
                log::info!(
                    "alerted subscription {} for citation {}",
                    subscription.id,
                    record.citation_number
                );
                delivered += 1;
            }
            Err(e) => {
                log::warn!(
                    "notification for subscription {} failed: {e:?}",
                    subscription.id
                );
            }
        }
    }

    delivered
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use ticket_map_citation_models::{CitationRecord, NotifyTarget, Subscription};

    use super::{Notifier, NotifyError, TicketAlert, dispatch};

    #[derive(Default)]
    struct RecordingNotifier {
        delivered: Mutex<Vec<u64>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(
            &self,
            alert: &TicketAlert,
            _target: &NotifyTarget,
        ) -> Result<(), NotifyError> {
            if self.fail {
                return Err(NotifyError::Unsupported("test".into()));
            }
            self.delivered
                .lock()
                .unwrap()
                .push(alert.citation_number);
            Ok(())
        }
    }

    fn subscription(id: i64, plate: &str) -> Subscription {
        Subscription {
            id,
            plate_state: Some("MI".into()),
            plate_number: Some(plate.into()),
            target: NotifyTarget::Webhook {
                url: "https://hooks.example.test".into(),
            },
        }
    }

    fn record() -> CitationRecord {
        let mut record = CitationRecord::new(1_123_108);
        record.plate_state = Some("MI".into());
        record.plate_number = Some("ABC1234".into());
        record
    }

    #[tokio::test]
    async fn only_matching_subscriptions_are_alerted() {
        let notifier = RecordingNotifier::default();
        let subscriptions = vec![subscription(1, "ABC1234"), subscription(2, "XYZ9999")];

        let delivered = dispatch(&notifier, &record(), &subscriptions).await;

        assert_eq!(delivered, 1);
        assert_eq!(*notifier.delivered.lock().unwrap(), vec![1_123_108]);
    }

    #[tokio::test]
    async fn delivery_failures_are_swallowed() {
        let notifier = RecordingNotifier {
            fail: true,
            ..Default::default()
        };
        let delivered = dispatch(&notifier, &record(), &[subscription(1, "ABC1234")]).await;
        assert_eq!(delivered, 0);
    }

    #[test]
    fn alert_payload_shape() {
        let alert = TicketAlert::from_record(&record());
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["type"], "parking_ticket_alert");
        assert_eq!(json["citation_number"], 1_123_108);
        assert_eq!(json["plate_number"], "ABC1234");
    }
}
