//! Stripe Webhook Events
//!
//! Signature verification over the raw body, then decoding into a closed set
//! of typed events. Event types this service does not handle decode to
//! [`GatewayEvent::Unrecognized`] and are ignored.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::collections::HashMap;

use crate::error::{BillingError, Result};
use crate::model::BillingPeriod;

type HmacSha256 = Hmac<Sha256>;

/// Default replay window for signed timestamps
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Fallback period length when the gateway reports none
pub const FALLBACK_PERIOD_DAYS: i64 = 30;

/// Verifies the `Stripe-Signature` header (`t=<unix>,v1=<hex>[,v1=...]`)
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
    tolerance: Duration,
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            tolerance: Duration::seconds(DEFAULT_TOLERANCE_SECS),
        }
    }

    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn verify(&self, payload: &[u8], header: &str, now: DateTime<Utc>) -> Result<()> {
        let mut timestamp: Option<i64> = None;
        let mut candidates = Vec::new();

        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp
            .ok_or_else(|| BillingError::InvalidSignature("missing timestamp".into()))?;
        if candidates.is_empty() {
            return Err(BillingError::InvalidSignature("missing v1 signature".into()));
        }

        if (now.timestamp() - timestamp).abs() > self.tolerance.num_seconds() {
            return Err(BillingError::InvalidSignature(
                "timestamp outside tolerance".into(),
            ));
        }

        let mac = self.mac(timestamp, payload)?;
        let matched = candidates.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|expected| mac.clone().verify_slice(&expected).is_ok())
                .unwrap_or(false)
        });

        if matched {
            Ok(())
        } else {
            Err(BillingError::InvalidSignature("signature mismatch".into()))
        }
    }

    /// Build a header the way the gateway signs deliveries
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> Result<String> {
        let digest = self.mac(timestamp, payload)?.finalize().into_bytes();
        Ok(format!("t={timestamp},v1={}", hex::encode(digest)))
    }

    fn mac(&self, timestamp: i64, payload: &[u8]) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| BillingError::Config(format!("invalid webhook secret: {e}")))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac)
    }
}

/// A reference that may arrive as a bare id or an expanded object
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ObjectRef {
    Id(String),
    Expanded { id: String },
}

impl ObjectRef {
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) | Self::Expanded { id } => id,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,

    #[serde(default)]
    pub mode: Option<String>,

    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,

    #[serde(default)]
    pub customer: Option<ObjectRef>,

    #[serde(default)]
    pub payment_intent: Option<ObjectRef>,

    #[serde(default)]
    pub amount_total: Option<i64>,

    #[serde(default)]
    pub currency: Option<String>,
}

impl CheckoutSessionObject {
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.as_ref()?.get(key).map(String::as_str)
    }

    pub fn is_subscription(&self) -> bool {
        self.mode.as_deref() == Some("subscription")
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct SubscriptionDetails {
    #[serde(default)]
    pub subscription: Option<ObjectRef>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct InvoiceParent {
    #[serde(default)]
    pub subscription_details: Option<SubscriptionDetails>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct InvoiceObject {
    pub id: String,

    #[serde(default)]
    pub customer: Option<ObjectRef>,

    /// Newer API versions nest the subscription under `parent`
    #[serde(default)]
    pub parent: Option<InvoiceParent>,

    /// Older API versions
    #[serde(default)]
    pub subscription: Option<ObjectRef>,
}

impl InvoiceObject {
    pub fn subscription_ref(&self) -> Option<&str> {
        self.parent
            .as_ref()
            .and_then(|p| p.subscription_details.as_ref())
            .and_then(|d| d.subscription.as_ref())
            .or(self.subscription.as_ref())
            .map(ObjectRef::id)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub current_period_start: Option<i64>,

    #[serde(default)]
    pub current_period_end: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    pub status: String,

    #[serde(default)]
    pub cancel_at_period_end: bool,

    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,

    #[serde(default)]
    pub customer: Option<ObjectRef>,

    #[serde(default)]
    pub items: Option<SubscriptionItems>,

    #[serde(default)]
    pub current_period_start: Option<i64>,

    #[serde(default)]
    pub current_period_end: Option<i64>,
}

impl SubscriptionObject {
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.as_ref()?.get(key).map(String::as_str)
    }

    /// Per-item billing period, then the legacy top-level fields
    pub fn period(&self) -> Option<BillingPeriod> {
        let item = self.items.as_ref().and_then(|items| items.data.first());
        let start = item
            .and_then(|i| i.current_period_start)
            .or(self.current_period_start)?;
        let end = item
            .and_then(|i| i.current_period_end)
            .or(self.current_period_end)?;

        Some(BillingPeriod {
            start: DateTime::from_timestamp(start, 0)?,
            end: DateTime::from_timestamp(end, 0)?,
        })
    }

    /// [`Self::period`] or `now + 30 days`
    pub fn period_or_default(&self, now: DateTime<Utc>) -> BillingPeriod {
        self.period().unwrap_or(BillingPeriod {
            start: now,
            end: now + Duration::days(FALLBACK_PERIOD_DAYS),
        })
    }
}

/// Events this service acts on
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GatewayEvent {
    CheckoutCompleted(CheckoutSessionObject),
    CheckoutExpired(CheckoutSessionObject),
    InvoicePaid(InvoiceObject),
    SubscriptionUpdated(SubscriptionObject),
    SubscriptionDeleted(SubscriptionObject),
    Unrecognized { event_type: String },
}

#[derive(Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: RawEventData,
}

#[derive(Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

/// A decoded delivery
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventEnvelope {
    pub id: String,
    pub event_type: String,
    pub event: GatewayEvent,
}

impl EventEnvelope {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let raw: RawEvent = serde_json::from_slice(payload)
            .map_err(|e| BillingError::MalformedEvent(e.to_string()))?;

        let object = raw.data.object;
        let event = match raw.event_type.as_str() {
            "checkout.session.completed" => GatewayEvent::CheckoutCompleted(decode(object)?),
            "checkout.session.expired" => GatewayEvent::CheckoutExpired(decode(object)?),
            "invoice.paid" => GatewayEvent::InvoicePaid(decode(object)?),
            "customer.subscription.updated" => GatewayEvent::SubscriptionUpdated(decode(object)?),
            "customer.subscription.deleted" => GatewayEvent::SubscriptionDeleted(decode(object)?),
            other => GatewayEvent::Unrecognized {
                event_type: other.to_string(),
            },
        };

        Ok(Self {
            id: raw.id,
            event_type: raw.event_type,
            event,
        })
    }
}

fn decode<T: DeserializeOwned>(object: serde_json::Value) -> Result<T> {
    serde_json::from_value(object).map_err(|e| BillingError::MalformedEvent(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_740_000_000, 0).unwrap()
    }

    #[test]
    fn test_signature_accepts_own_header() {
        let verifier = SignatureVerifier::new("whsec_test");
        let body = br#"{"id":"evt_1"}"#;
        let header = verifier.sign(body, now().timestamp()).unwrap();
        assert!(verifier.verify(body, &header, now()).is_ok());
    }

    #[test]
    fn test_signature_rejects_tampered_body() {
        let verifier = SignatureVerifier::new("whsec_test");
        let header = verifier.sign(b"original", now().timestamp()).unwrap();
        assert!(matches!(
            verifier.verify(b"tampered", &header, now()),
            Err(BillingError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_signature_rejects_stale_timestamp() {
        let verifier = SignatureVerifier::new("whsec_test");
        let header = verifier.sign(b"body", now().timestamp() - 301).unwrap();
        assert!(verifier.verify(b"body", &header, now()).is_err());
    }

    #[test]
    fn test_signature_rejects_malformed_header() {
        let verifier = SignatureVerifier::new("whsec_test");
        assert!(verifier.verify(b"body", "garbage", now()).is_err());
        assert!(verifier.verify(b"body", "t=1740000000", now()).is_err());
        assert!(verifier.verify(b"body", "t=1740000000,v1=zz", now()).is_err());
    }

    #[test]
    fn test_signature_accepts_any_matching_v1() {
        let verifier = SignatureVerifier::new("whsec_test");
        let good = verifier.sign(b"body", now().timestamp()).unwrap();
        let (_, good_sig) = good.split_once(",v1=").unwrap();
        let header = format!("t={},v1={},v1={good_sig}", now().timestamp(), "00".repeat(32));
        assert!(verifier.verify(b"body", &header, now()).is_ok());
    }

    #[test]
    fn test_parse_checkout_completed() {
        let payload = json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": { "object": {
                "id": "cs_1",
                "mode": "payment",
                "customer": "cus_1",
                "payment_intent": { "id": "pi_1", "object": "payment_intent" },
                "amount_total": 1000,
                "currency": "usd",
                "metadata": { "account_id": "u1", "package_id": "starter", "points": "3750" }
            }}
        });
        let envelope = EventEnvelope::parse(payload.to_string().as_bytes()).unwrap();

        let GatewayEvent::CheckoutCompleted(session) = envelope.event else {
            panic!("expected checkout completed");
        };
        assert_eq!(session.metadata_value("points"), Some("3750"));
        assert_eq!(session.payment_intent.as_ref().map(ObjectRef::id), Some("pi_1"));
        assert!(!session.is_subscription());
    }

    #[test]
    fn test_parse_unknown_type_is_unrecognized() {
        let payload = json!({
            "id": "evt_2",
            "type": "charge.dispute.created",
            "data": { "object": { "anything": [1, 2, 3] } }
        });
        let envelope = EventEnvelope::parse(payload.to_string().as_bytes()).unwrap();
        assert_eq!(
            envelope.event,
            GatewayEvent::Unrecognized { event_type: "charge.dispute.created".into() }
        );
    }

    #[test]
    fn test_parse_rejects_bad_known_object() {
        let payload = json!({
            "id": "evt_3",
            "type": "customer.subscription.deleted",
            "data": { "object": { "status": "canceled" } }
        });
        assert!(matches!(
            EventEnvelope::parse(payload.to_string().as_bytes()),
            Err(BillingError::MalformedEvent(_))
        ));
        assert!(EventEnvelope::parse(b"not json").is_err());
    }

    #[test]
    fn test_invoice_subscription_ref_prefers_parent() {
        let invoice: InvoiceObject = serde_json::from_value(json!({
            "id": "in_1",
            "subscription": "sub_legacy",
            "parent": { "subscription_details": { "subscription": "sub_new" } }
        }))
        .unwrap();
        assert_eq!(invoice.subscription_ref(), Some("sub_new"));

        let legacy: InvoiceObject =
            serde_json::from_value(json!({ "id": "in_2", "subscription": "sub_legacy" })).unwrap();
        assert_eq!(legacy.subscription_ref(), Some("sub_legacy"));
    }

    #[test]
    fn test_subscription_period_sources() {
        let with_items: SubscriptionObject = serde_json::from_value(json!({
            "id": "sub_1",
            "status": "active",
            "items": { "data": [{ "current_period_start": 1_740_000_000, "current_period_end": 1_742_592_000 }] }
        }))
        .unwrap();
        let period = with_items.period().unwrap();
        assert_eq!(period.start.timestamp(), 1_740_000_000);
        assert_eq!(period.end.timestamp(), 1_742_592_000);

        let bare: SubscriptionObject =
            serde_json::from_value(json!({ "id": "sub_2", "status": "active" })).unwrap();
        assert!(bare.period().is_none());
        let fallback = bare.period_or_default(now());
        assert_eq!(fallback.end - fallback.start, Duration::days(30));
    }
}
