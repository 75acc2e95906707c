//! Stripe webhook handling.
//!
//! Inbound provider events drive the subscription state machine. Delivery
//! is at-least-once and not necessarily in causal order, so every handler
//! writes an absolute target state, events are claimed atomically for
//! replay protection, and status transitions are guarded against stale
//! events by the provider event timestamp.

use std::collections::HashMap;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sketchbench_shared::SubscriptionStatus;
use sqlx::PgPool;
use stripe::{Event, EventObject, EventType, Invoice, Subscription as StripeSubscription, Webhook};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::store::SubscriptionStore;

type HmacSha256 = Hmac<Sha256>;

/// Reject events whose signature timestamp is further than this from now.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// An event stuck in `processing` longer than this can be re-claimed.
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// Map the provider's subscription status into the local enum. Unrecognized
/// or provider-only states map conservatively instead of failing the event.
pub fn map_subscription_status(status: stripe::SubscriptionStatus) -> SubscriptionStatus {
    use stripe::SubscriptionStatus as Provider;

    match status {
        Provider::Active => SubscriptionStatus::Active,
        // The initial payment has not been confirmed yet.
        Provider::Trialing | Provider::Incomplete => SubscriptionStatus::Trialing,
        Provider::PastDue => SubscriptionStatus::PastDue,
        Provider::Canceled => SubscriptionStatus::Canceled,
        _ => SubscriptionStatus::Unpaid,
    }
}

/// Serializes processing per external subscription id. Events for different
/// subscriptions proceed concurrently; events for the same one queue,
/// because absolute-state transitions do not commute under reordering.
#[derive(Clone, Default)]
struct KeyedLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl KeyedLocks {
    async fn acquire(&self, key: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().await;
        if map.len() > 1024 {
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Webhook processor for Stripe events.
pub struct WebhookProcessor {
    stripe: StripeClient,
    pool: PgPool,
    store: SubscriptionStore,
    locks: KeyedLocks,
}

impl WebhookProcessor {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let store = SubscriptionStore::new(pool.clone());
        Self {
            stripe,
            pool,
            store,
            locks: KeyedLocks::default(),
        }
    }

    /// Verify the envelope signature against the configured secret and parse
    /// the event. A failure here is an authenticity error, distinct from any
    /// later processing failure, and must not mutate state.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let secret = &self.stripe.config().webhook_secret;

        // The library handles the common case; fall back to manual
        // verification for API versions its parser rejects.
        if let Ok(event) = Webhook::construct_event(payload, signature, secret) {
            return Ok(event);
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        verify_signature(payload, signature, secret, now)?;

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Signed webhook payload is not a valid event");
            BillingError::WebhookSignatureInvalid
        })?;

        Ok(event)
    }

    /// Handle a verified event.
    ///
    /// Processing is idempotent twice over: the event id is claimed
    /// atomically so a duplicate delivery of a processed event acknowledges
    /// without reprocessing, and every transition writes an absolute target
    /// state. A delivery whose previous attempt errored re-claims and runs
    /// again.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();
        let event_ts = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        if !self.claim_event(&event_id, &event_type, event_ts).await? {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type,
                "Duplicate webhook event acknowledged without reprocessing"
            );
            return Ok(());
        }

        tracing::info!(
            event_id = %event_id,
            event_type = %event_type,
            "Processing Stripe webhook event"
        );

        let result = self.apply_event(&event, event_ts).await;
        self.record_outcome(&event_id, &result).await;
        result
    }

    /// Atomically claim exclusive processing rights for an event id.
    ///
    /// The conflict arm fires for rows whose previous attempt failed (the
    /// provider redelivers and the retry must make progress) and for rows
    /// stuck in `processing` past the timeout. Successfully processed rows
    /// never re-claim, and concurrent deliveries of the same event cannot
    /// both win.
    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_ts: OffsetDateTime,
    ) -> BillingResult<bool> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW()
            WHERE stripe_webhook_events.processing_result = 'error'
               OR (stripe_webhook_events.processing_result = 'processing'
                   AND stripe_webhook_events.processing_started_at < NOW() - ($4 || ' minutes')::INTERVAL)
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(event_ts)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    async fn record_outcome(&self, event_id: &str, result: &BillingResult<()>) {
        let (processing_result, error_message) = match result {
            Ok(()) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };

        if let Err(e) = sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(processing_result)
        .bind(&error_message)
        .bind(event_id)
        .execute(&self.pool)
        .await
        {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to record webhook outcome; event may appear stuck in processing"
            );
        }
    }

    async fn apply_event(&self, event: &Event, event_ts: OffsetDateTime) -> BillingResult<()> {
        match event.type_ {
            EventType::InvoicePaymentSucceeded => {
                self.handle_payment_succeeded(event, event_ts).await
            }
            EventType::InvoicePaymentFailed => self.handle_payment_failed(event, event_ts).await,
            EventType::CustomerSubscriptionUpdated => {
                self.handle_subscription_updated(event, event_ts).await
            }
            EventType::CustomerSubscriptionDeleted => {
                self.handle_subscription_deleted(event).await
            }
            _ => {
                tracing::info!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "Ignoring webhook event type with no handler"
                );
                Ok(())
            }
        }
    }

    /// `payment_succeeded`: status becomes `active`; the period end may move
    /// forward. Re-delivery on an already-active row is a no-op.
    async fn handle_payment_succeeded(
        &self,
        event: &Event,
        event_ts: OffsetDateTime,
    ) -> BillingResult<()> {
        let invoice = extract_invoice(event)?;
        let Some(sub_id) = invoice_subscription_id(&invoice) else {
            tracing::debug!(event_id = %event.id, "Invoice has no subscription; nothing to do");
            return Ok(());
        };

        let lock = self.locks.acquire(&sub_id).await;
        let _guard = lock.lock().await;

        let period = match (invoice.period_start, invoice.period_end) {
            (Some(start), Some(end)) => Some((timestamp(start), timestamp(end))),
            _ => None,
        };

        let rows = self.store.mark_active(&sub_id, period, event_ts).await?;
        if rows == 0 {
            tracing::info!(
                subscription_id = %sub_id,
                "Payment event matched no row (stale event or detached subscription)"
            );
        } else {
            tracing::info!(
                subscription_id = %sub_id,
                "Subscription active after successful payment"
            );
        }

        Ok(())
    }

    /// `payment_failed`: status becomes `past_due`. The subscription is not
    /// cancelled; the provider keeps retrying.
    async fn handle_payment_failed(
        &self,
        event: &Event,
        event_ts: OffsetDateTime,
    ) -> BillingResult<()> {
        let invoice = extract_invoice(event)?;
        let Some(sub_id) = invoice_subscription_id(&invoice) else {
            tracing::debug!(event_id = %event.id, "Invoice has no subscription; nothing to do");
            return Ok(());
        };

        let lock = self.locks.acquire(&sub_id).await;
        let _guard = lock.lock().await;

        let rows = self
            .store
            .update_status(&sub_id, SubscriptionStatus::PastDue, event_ts)
            .await?;
        if rows == 0 {
            tracing::info!(
                subscription_id = %sub_id,
                "Payment failure matched no row (stale event or detached subscription)"
            );
        } else {
            tracing::warn!(subscription_id = %sub_id, "Subscription past due");
        }

        Ok(())
    }

    /// `subscription_updated`: mirror the reported status. Plan and period
    /// fields are not touched here.
    async fn handle_subscription_updated(
        &self,
        event: &Event,
        event_ts: OffsetDateTime,
    ) -> BillingResult<()> {
        let subscription = extract_subscription(event)?;
        let sub_id = subscription.id.to_string();
        let status = map_subscription_status(subscription.status);

        let lock = self.locks.acquire(&sub_id).await;
        let _guard = lock.lock().await;

        let rows = self.store.update_status(&sub_id, status, event_ts).await?;
        if rows == 0 {
            tracing::info!(
                subscription_id = %sub_id,
                status = %status,
                "Status update matched no row (stale event or detached subscription)"
            );
        } else {
            tracing::info!(
                subscription_id = %sub_id,
                status = %status,
                "Subscription status updated"
            );
        }

        Ok(())
    }

    /// `subscription_deleted`: terminal for this external id. Full downgrade
    /// to the free plan and detach the id; later events referencing it match
    /// nothing and are logged no-ops.
    async fn handle_subscription_deleted(&self, event: &Event) -> BillingResult<()> {
        let subscription = extract_subscription(event)?;
        let sub_id = subscription.id.to_string();

        let lock = self.locks.acquire(&sub_id).await;
        let _guard = lock.lock().await;

        let rows = self.store.downgrade_to_free(&sub_id).await?;
        if rows == 0 {
            tracing::info!(
                subscription_id = %sub_id,
                "Deletion matched no row (already downgraded)"
            );
        } else {
            tracing::info!(
                subscription_id = %sub_id,
                "Subscription deleted; account downgraded to free plan"
            );
        }

        Ok(())
    }
}

/// Manual signature verification for payloads the library parser rejects.
/// Header format: `t=<unix ts>,v1=<hex hmac>`; the signed payload is
/// `<ts>.<body>` keyed by the webhook secret.
fn verify_signature(
    payload: &str,
    signature: &str,
    secret: &str,
    now: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<&str> = None;

    for part in signature.split(',') {
        match part.split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => v1_signature = Some(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
    let v1_signature = v1_signature.ok_or(BillingError::WebhookSignatureInvalid)?;

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Webhook signature timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    // The secret's "whsec_" prefix is not part of the key material.
    let key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

fn extract_invoice(event: &Event) -> BillingResult<Invoice> {
    match &event.data.object {
        EventObject::Invoice(invoice) => Ok(invoice.clone()),
        _ => Err(BillingError::WebhookPayloadMismatch("invoice")),
    }
}

fn extract_subscription(event: &Event) -> BillingResult<StripeSubscription> {
    match &event.data.object {
        EventObject::Subscription(subscription) => Ok(subscription.clone()),
        _ => Err(BillingError::WebhookPayloadMismatch("subscription")),
    }
}

fn invoice_subscription_id(invoice: &Invoice) -> Option<String> {
    invoice.subscription.as_ref().map(|sub| match sub {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(sub) => sub.id.to_string(),
    })
}

fn timestamp(ts: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(ts).unwrap_or_else(|_| OffsetDateTime::now_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(payload: &str, secret: &str, at: i64) -> String {
        let key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{}.{}", at, payload).as_bytes());
        format!("t={},v1={}", at, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_accepted() {
        let payload = r#"{"id":"evt_1","type":"invoice.payment_succeeded"}"#;
        let secret = "whsec_test_secret";
        let now = 1_700_000_000;

        let header = sign(payload, secret, now);
        assert!(verify_signature(payload, &header, secret, now).is_ok());
    }

    #[test]
    fn tampered_payload_rejected() {
        let secret = "whsec_test_secret";
        let now = 1_700_000_000;

        let header = sign(r#"{"amount":100}"#, secret, now);
        let result = verify_signature(r#"{"amount":99999}"#, &header, secret, now);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn wrong_secret_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;

        let header = sign(payload, "whsec_other_secret", now);
        let result = verify_signature(payload, &header, "whsec_test_secret", now);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn stale_timestamp_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let secret = "whsec_test_secret";
        let signed_at = 1_700_000_000;

        let header = sign(payload, secret, signed_at);
        let result =
            verify_signature(payload, &header, secret, signed_at + SIGNATURE_TOLERANCE_SECS + 1);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn malformed_header_rejected() {
        let result = verify_signature("{}", "not-a-signature", "whsec_x", 0);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn status_mapping() {
        use stripe::SubscriptionStatus as Provider;

        assert_eq!(
            map_subscription_status(Provider::Active),
            SubscriptionStatus::Active
        );
        assert_eq!(
            map_subscription_status(Provider::Trialing),
            SubscriptionStatus::Trialing
        );
        assert_eq!(
            map_subscription_status(Provider::Incomplete),
            SubscriptionStatus::Trialing
        );
        assert_eq!(
            map_subscription_status(Provider::PastDue),
            SubscriptionStatus::PastDue
        );
        assert_eq!(
            map_subscription_status(Provider::Canceled),
            SubscriptionStatus::Canceled
        );
        assert_eq!(
            map_subscription_status(Provider::Unpaid),
            SubscriptionStatus::Unpaid
        );
    }

    #[tokio::test]
    async fn keyed_locks_share_by_key() {
        let locks = KeyedLocks::default();

        let a1 = locks.acquire("sub_a").await;
        let a2 = locks.acquire("sub_a").await;
        let b = locks.acquire("sub_b").await;

        assert!(Arc::ptr_eq(&a1, &a2), "same key must share a lock");
        assert!(!Arc::ptr_eq(&a1, &b), "different keys must not block each other");
    }

    #[tokio::test]
    async fn keyed_locks_serialize_same_key() {
        let locks = KeyedLocks::default();

        let lock = locks.acquire("sub_a").await;
        let guard = lock.lock().await;

        let second = locks.acquire("sub_a").await;
        assert!(second.try_lock().is_err(), "held lock must block the same key");

        drop(guard);
        assert!(second.try_lock().is_ok());
    }
}
