//! In-memory [`Store`] implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{SendTransition, Store, StoreError, STALE_CLAIM_ERROR};
use crate::types::{BookingRecord, BookingStatus, CampaignConfig, PendingSend, SendStatus, Tenant};

#[derive(Debug, Default)]
struct MemoryInner {
    /// Tenants keyed by tracking id.
    tenants: HashMap<String, Tenant>,
    bookings: HashMap<String, BookingRecord>,
    /// Campaigns keyed by owner id.
    campaigns: HashMap<String, CampaignConfig>,
    sends: HashMap<String, PendingSend>,
}

/// A [`Store`] that keeps everything in process memory.
///
/// Cloning is cheap and clones share state. Nothing survives a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_tenant(&self, tenant: Tenant) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.tenants.contains_key(&tenant.tracking_id)
            || inner.tenants.values().any(|t| t.id == tenant.id)
        {
            return Err(StoreError::Conflict(format!(
                "tenant {} / {} already exists",
                tenant.id, tenant.tracking_id
            )));
        }
        inner.tenants.insert(tenant.tracking_id.clone(), tenant);
        Ok(())
    }

    async fn tenant_by_tracking_id(
        &self,
        tracking_id: &str,
    ) -> Result<Option<Tenant>, StoreError> {
        Ok(self.inner.read().await.tenants.get(tracking_id).cloned())
    }

    async fn tenants_for_owner(&self, owner_id: &str) -> Result<Vec<Tenant>, StoreError> {
        let inner = self.inner.read().await;
        let mut tenants: Vec<Tenant> = inner
            .tenants
            .values()
            .filter(|t| t.owner_id == owner_id)
            .cloned()
            .collect();
        tenants.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tenants)
    }

    async fn record_booking(
        &self,
        booking: BookingRecord,
        send: Option<PendingSend>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.bookings.contains_key(&booking.id) {
            return Err(StoreError::Conflict(format!(
                "booking {} already exists",
                booking.id
            )));
        }
        if let Some(send) = &send {
            if inner.sends.contains_key(&send.id) {
                return Err(StoreError::Conflict(format!(
                    "send {} already exists",
                    send.id
                )));
            }
        }

        inner.bookings.insert(booking.id.clone(), booking);
        if let Some(send) = send {
            inner.sends.insert(send.id.clone(), send);
        }
        Ok(())
    }

    async fn get_booking(&self, id: &str) -> Result<Option<BookingRecord>, StoreError> {
        Ok(self.inner.read().await.bookings.get(id).cloned())
    }

    async fn set_booking_status(
        &self,
        id: &str,
        status: BookingStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<BookingRecord>, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(inner.bookings.get_mut(id).map(|booking| {
            booking.status = status;
            booking.updated_at = now;
            booking.clone()
        }))
    }

    async fn bookings_for_tracking_id(
        &self,
        tracking_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<BookingRecord>, StoreError> {
        let inner = self.inner.read().await;
        let mut bookings: Vec<BookingRecord> = inner
            .bookings
            .values()
            .filter(|b| b.tracking_id == tracking_id && b.created_at >= since)
            .cloned()
            .collect();
        bookings.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(bookings)
    }

    async fn campaign_for_owner(
        &self,
        owner_id: &str,
    ) -> Result<Option<CampaignConfig>, StoreError> {
        Ok(self.inner.read().await.campaigns.get(owner_id).cloned())
    }

    async fn put_campaign(
        &self,
        owner_id: &str,
        campaign: CampaignConfig,
    ) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .campaigns
            .insert(owner_id.to_string(), campaign);
        Ok(())
    }

    async fn get_send(&self, id: &str) -> Result<Option<PendingSend>, StoreError> {
        Ok(self.inner.read().await.sends.get(id).cloned())
    }

    async fn sends_for_booking(&self, booking_id: &str) -> Result<Vec<PendingSend>, StoreError> {
        let inner = self.inner.read().await;
        let mut sends: Vec<PendingSend> = inner
            .sends
            .values()
            .filter(|s| s.booking_id == booking_id)
            .cloned()
            .collect();
        sends.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sends)
    }

    async fn claim_due_sends(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PendingSend>, StoreError> {
        let mut inner = self.inner.write().await;

        let mut due: Vec<(DateTime<Utc>, String)> = inner
            .sends
            .values()
            .filter(|s| s.status == SendStatus::Pending && s.due_at <= now)
            .map(|s| (s.due_at, s.id.clone()))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(send) = inner.sends.get_mut(&id) {
                send.status = SendStatus::Sending;
                send.claimed_at = Some(now);
                send.attempts += 1;
                send.updated_at = now;
                claimed.push(send.clone());
            }
        }
        Ok(claimed)
    }

    async fn transition_send(
        &self,
        id: &str,
        transition: SendTransition,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .sends
            .get_mut(id)
            .is_some_and(|send| transition.apply(send, now)))
    }

    async fn expire_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<PendingSend>, StoreError> {
        let mut inner = self.inner.write().await;
        let mut expired = Vec::new();
        for send in inner.sends.values_mut() {
            let stale = send.status == SendStatus::Sending
                && send.claimed_at.is_some_and(|at| at < claimed_before);
            if stale {
                send.status = SendStatus::Failed;
                send.last_error = Some(STALE_CLAIM_ERROR.to_string());
                send.updated_at = now;
                expired.push(send.clone());
            }
        }
        Ok(expired)
    }
}
