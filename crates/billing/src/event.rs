//! Webhook event envelope and typed payloads
//!
//! Stripe delivers events as a JSON envelope `{id, type, created, data: {object}}`.
//! The envelope is decoded once, at the router boundary, into a tagged
//! [`EventPayload`]; handlers never touch raw JSON.

use serde::Deserialize;
use std::collections::HashMap;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Raw webhook envelope as the processor sends it
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix timestamp of when the event occurred at the processor
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

/// Tenant references carried in the payload object's `metadata` map
///
/// Checkout sessions and Connect accounts are created with
/// `client_tenant_id` / `agency_tenant_id` metadata, which Stripe echoes
/// back on every event for that object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TenantRefs {
    pub client_tenant_id: Option<Uuid>,
    pub agency_tenant_id: Option<Uuid>,
}

impl TenantRefs {
    /// Extract refs from a metadata map. A malformed id is treated as absent
    /// rather than failing the event; routability is decided later.
    pub fn from_metadata(metadata: &HashMap<String, String>) -> Self {
        let parse = |key: &str| metadata.get(key).and_then(|v| Uuid::parse_str(v).ok());
        Self {
            client_tenant_id: parse("client_tenant_id"),
            agency_tenant_id: parse("agency_tenant_id"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.client_tenant_id.is_none() && self.agency_tenant_id.is_none()
    }

    /// Billing events land on the client sub-account when one is referenced,
    /// otherwise on the agency's own account.
    pub fn billing_target(&self) -> Option<Uuid> {
        self.client_tenant_id.or(self.agency_tenant_id)
    }

    /// Connect payout accounts belong to agencies; fall back to the client
    /// ref only when no agency is named.
    pub fn connect_target(&self) -> Option<Uuid> {
        self.agency_tenant_id.or(self.client_tenant_id)
    }
}

/// `data.object` of a payment_intent.* event
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntentObject {
    pub id: String,
    /// Amount in cents
    pub amount: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// `data.object` of an invoice.* event
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    #[serde(default)]
    pub amount_paid: i64,
    #[serde(default)]
    pub amount_due: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// `data.object` of a customer.subscription.* event
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    /// Unix timestamp of the period end (the next billing date)
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl SubscriptionObject {
    pub fn next_billing_date(&self) -> Option<OffsetDateTime> {
        self.current_period_end
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
    }
}

/// `data.object` of an account.updated (Connect) event
#[derive(Debug, Clone, Deserialize)]
pub struct AccountObject {
    pub id: String,
    #[serde(default)]
    pub details_submitted: bool,
    #[serde(default)]
    pub charges_enabled: bool,
    #[serde(default)]
    pub payouts_enabled: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Event body decoded once at the router boundary
///
/// Exactly one variant per handled event type; everything else is
/// `Unsupported` and acked without side effects.
#[derive(Debug, Clone)]
pub enum EventPayload {
    PaymentIntentSucceeded(PaymentIntentObject),
    PaymentIntentFailed(PaymentIntentObject),
    InvoicePaymentSucceeded(InvoiceObject),
    InvoicePaymentFailed(InvoiceObject),
    SubscriptionUpdated(SubscriptionObject),
    SubscriptionDeleted(SubscriptionObject),
    AccountUpdated(AccountObject),
    Unsupported,
}

/// A verified, decoded webhook event
#[derive(Debug, Clone)]
pub struct PaymentEvent {
    /// Processor-issued, globally unique event id (evt_...)
    pub id: String,
    /// Declared type string, kept for audit rows and logs
    pub event_type: String,
    /// When the event occurred at the processor
    pub occurred_at: OffsetDateTime,
    pub refs: TenantRefs,
    pub payload: EventPayload,
}

fn object_of<T: serde::de::DeserializeOwned>(
    event_type: &str,
    object: serde_json::Value,
) -> BillingResult<T> {
    serde_json::from_value(object)
        .map_err(|e| BillingError::PayloadMalformed(format!("invalid {} object: {}", event_type, e)))
}

impl PaymentEvent {
    /// Decode a raw (already signature-verified) webhook body
    pub fn decode(raw: &[u8]) -> BillingResult<Self> {
        let envelope: EventEnvelope = serde_json::from_slice(raw)
            .map_err(|e| BillingError::PayloadMalformed(format!("invalid envelope: {}", e)))?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: EventEnvelope) -> BillingResult<Self> {
        let occurred_at = OffsetDateTime::from_unix_timestamp(envelope.created).map_err(|e| {
            BillingError::PayloadMalformed(format!("invalid created timestamp: {}", e))
        })?;

        let event_type = envelope.event_type;
        let object = envelope.data.object;

        let (refs, payload) = match event_type.as_str() {
            "payment_intent.succeeded" => {
                let obj: PaymentIntentObject = object_of(&event_type, object)?;
                (
                    TenantRefs::from_metadata(&obj.metadata),
                    EventPayload::PaymentIntentSucceeded(obj),
                )
            }
            "payment_intent.payment_failed" => {
                let obj: PaymentIntentObject = object_of(&event_type, object)?;
                (
                    TenantRefs::from_metadata(&obj.metadata),
                    EventPayload::PaymentIntentFailed(obj),
                )
            }
            "invoice.payment_succeeded" => {
                let obj: InvoiceObject = object_of(&event_type, object)?;
                (
                    TenantRefs::from_metadata(&obj.metadata),
                    EventPayload::InvoicePaymentSucceeded(obj),
                )
            }
            "invoice.payment_failed" => {
                let obj: InvoiceObject = object_of(&event_type, object)?;
                (
                    TenantRefs::from_metadata(&obj.metadata),
                    EventPayload::InvoicePaymentFailed(obj),
                )
            }
            "customer.subscription.updated" => {
                let obj: SubscriptionObject = object_of(&event_type, object)?;
                (
                    TenantRefs::from_metadata(&obj.metadata),
                    EventPayload::SubscriptionUpdated(obj),
                )
            }
            "customer.subscription.deleted" => {
                let obj: SubscriptionObject = object_of(&event_type, object)?;
                (
                    TenantRefs::from_metadata(&obj.metadata),
                    EventPayload::SubscriptionDeleted(obj),
                )
            }
            "account.updated" => {
                let obj: AccountObject = object_of(&event_type, object)?;
                (
                    TenantRefs::from_metadata(&obj.metadata),
                    EventPayload::AccountUpdated(obj),
                )
            }
            _ => (TenantRefs::default(), EventPayload::Unsupported),
        };

        Ok(Self {
            id: envelope.id,
            event_type,
            occurred_at,
            refs,
            payload,
        })
    }
}
