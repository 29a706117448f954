//! In-process quote store.
//!
//! One mutex guards both the records and the in-flight index, which makes
//! admission atomic within the process. Not shared across processes.

use async_trait::async_trait;
use chrono::Utc;
use fxquote_common::{CurrencyPair, Outcome, QuoteStatus, QuoteUpdate, UpdateId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{StoreError, StoreResult};
use crate::store::{Admission, QuoteStore};

#[derive(Debug)]
struct Stored {
    update: QuoteUpdate,
    /// Insertion order, breaks ties between equal completion times.
    seq: u64,
}

#[derive(Debug, Default)]
struct State {
    records: HashMap<UpdateId, Stored>,
    in_flight: HashMap<CurrencyPair, UpdateId>,
    next_seq: u64,
}

impl State {
    /// Check `id` is in one of `allowed_from` and may take over its pair's in-flight slot.
    fn check(&self, id: UpdateId, allowed_from: &[QuoteStatus], to: QuoteStatus) -> StoreResult<()> {
        let Some(stored) = self.records.get(&id) else {
            return Err(StoreError::InvalidTransition { id, from: None, to });
        };
        let from = stored.update.status;
        let slot_taken = to.is_in_flight()
            && self
                .in_flight
                .get(&stored.update.pair)
                .is_some_and(|holder| *holder != id);
        if !allowed_from.contains(&from) || slot_taken {
            return Err(StoreError::InvalidTransition {
                id,
                from: Some(from),
                to,
            });
        }
        Ok(())
    }

    /// Keep the in-flight index in step with a record's new status.
    fn reindex(&mut self, id: UpdateId) {
        let Some(stored) = self.records.get(&id) else {
            return;
        };
        let pair = stored.update.pair.clone();
        if stored.update.status.is_in_flight() {
            self.in_flight.insert(pair, id);
        } else if self.in_flight.get(&pair) == Some(&id) {
            self.in_flight.remove(&pair);
        }
    }

    fn update_mut(&mut self, id: UpdateId) -> StoreResult<&mut QuoteUpdate> {
        self.records
            .get_mut(&id)
            .map(|s| &mut s.update)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

/// [`QuoteStore`] kept in process memory.
#[derive(Debug)]
pub struct MemoryQuoteStore {
    state: Mutex<State>,
    available: AtomicBool,
}

impl MemoryQuoteStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every operation fails while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".to_string()))
        }
    }

    /// Number of in-flight records for `pair`, counted from the records themselves.
    pub fn in_flight_count(&self, pair: &CurrencyPair) -> usize {
        self.state
            .lock()
            .records
            .values()
            .filter(|s| &s.update.pair == pair && s.update.status.is_in_flight())
            .count()
    }

    /// Total number of records.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryQuoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QuoteStore for MemoryQuoteStore {
    async fn create_or_join(&self, pair: &CurrencyPair, candidate: UpdateId) -> StoreResult<Admission> {
        self.check_available()?;
        let mut state = self.state.lock();

        if let Some(existing) = state.in_flight.get(pair).copied() {
            let status = state
                .records
                .get(&existing)
                .map(|s| s.update.status)
                .ok_or_else(|| StoreError::NotFound(existing.to_string()))?;
            return Ok(Admission::Joined {
                id: existing,
                status,
            });
        }

        if state.records.contains_key(&candidate) {
            return Err(StoreError::Database(format!("duplicate id {candidate}")));
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.records.insert(
            candidate,
            Stored {
                update: QuoteUpdate::pending(candidate, pair.clone(), Utc::now()),
                seq,
            },
        );
        state.in_flight.insert(pair.clone(), candidate);
        Ok(Admission::Created(candidate))
    }

    async fn mark_running(&self, id: UpdateId) -> StoreResult<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        state.check(
            id,
            &[QuoteStatus::Pending, QuoteStatus::Failed],
            QuoteStatus::Running,
        )?;

        let update = state.update_mut(id)?;
        update
            .transition_to(QuoteStatus::Running, Utc::now())
            .map_err(|_| StoreError::InvalidTransition {
                id,
                from: Some(update.status),
                to: QuoteStatus::Running,
            })?;
        update.error = None;
        state.reindex(id);
        Ok(())
    }

    async fn complete(&self, id: UpdateId, outcome: Outcome) -> StoreResult<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        let to = outcome.status();
        state.check(id, &[QuoteStatus::Running], to)?;

        state
            .update_mut(id)?
            .complete(outcome, Utc::now())
            .map_err(|_| StoreError::InvalidTransition {
                id,
                from: Some(QuoteStatus::Running),
                to,
            })?;
        state.reindex(id);
        Ok(())
    }

    async fn abandon(&self, id: UpdateId, reason: &str) -> StoreResult<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        state.check(id, &[QuoteStatus::Pending], QuoteStatus::Failed)?;

        let update = state.update_mut(id)?;
        update
            .transition_to(QuoteStatus::Failed, Utc::now())
            .map_err(|_| StoreError::InvalidTransition {
                id,
                from: Some(QuoteStatus::Pending),
                to: QuoteStatus::Failed,
            })?;
        update.error = Some(reason.to_string());
        state.reindex(id);
        Ok(())
    }

    async fn get_by_id(&self, id: UpdateId) -> StoreResult<QuoteUpdate> {
        self.check_available()?;
        self.state
            .lock()
            .records
            .get(&id)
            .map(|s| s.update.clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn get_latest_success(&self, pair: &CurrencyPair) -> StoreResult<QuoteUpdate> {
        self.check_available()?;
        self.state
            .lock()
            .records
            .values()
            .filter(|s| &s.update.pair == pair && s.update.status == QuoteStatus::Success)
            .max_by_key(|s| (s.update.updated_at, s.seq))
            .map(|s| s.update.clone())
            .ok_or_else(|| StoreError::NotFound(format!("no successful quote for {pair}")))
    }

    async fn list_in_flight(&self) -> StoreResult<Vec<QuoteUpdate>> {
        self.check_available()?;
        let state = self.state.lock();
        let mut in_flight: Vec<&Stored> = state
            .in_flight
            .values()
            .filter_map(|id| state.records.get(id))
            .collect();
        in_flight.sort_by_key(|s| s.seq);
        Ok(in_flight.into_iter().map(|s| s.update.clone()).collect())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fxquote_common::{Currency, Price};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn usd_eur() -> CurrencyPair {
        CurrencyPair::new(Currency::usd(), Currency::eur())
    }

    fn success(price: &str) -> Outcome {
        Outcome::Success {
            price: Price::parse(price).unwrap(),
            observed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_dedup_and_release() {
        let store = MemoryQuoteStore::new();
        let id = UpdateId::new();
        assert!(store.create_or_join(&usd_eur(), id).await.unwrap().is_created());
        assert_eq!(store.create_or_join(&usd_eur(), UpdateId::new()).await.unwrap().id(), id);

        store.mark_running(id).await.unwrap();
        store.complete(id, success("1.0850")).await.unwrap();
        assert_eq!(store.in_flight_count(&usd_eur()), 0);

        let next = UpdateId::new();
        assert_eq!(
            store.create_or_join(&usd_eur(), next).await.unwrap(),
            Admission::Created(next)
        );
    }

    #[tokio::test]
    async fn test_transition_guards_match_sqlite() {
        let store = MemoryQuoteStore::new();
        let id = UpdateId::new();
        store.create_or_join(&usd_eur(), id).await.unwrap();

        assert!(matches!(
            store.complete(id, success("1.0")).await,
            Err(StoreError::InvalidTransition { from: Some(QuoteStatus::Pending), .. })
        ));
        store.mark_running(id).await.unwrap();
        assert!(store.mark_running(id).await.is_err());
        store.complete(id, Outcome::Failed { error: "down".into() }).await.unwrap();
        store.mark_running(id).await.unwrap();
        assert_eq!(store.in_flight_count(&usd_eur()), 1);
        store.complete(id, success("1.0")).await.unwrap();
        assert!(matches!(
            store.mark_running(id).await,
            Err(StoreError::InvalidTransition { from: Some(QuoteStatus::Success), .. })
        ));
        assert!(matches!(
            store.mark_running(UpdateId::new()).await,
            Err(StoreError::InvalidTransition { from: None, .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_retry_cannot_displace_newer_attempt() {
        let store = MemoryQuoteStore::new();
        let old = UpdateId::new();
        store.create_or_join(&usd_eur(), old).await.unwrap();
        store.mark_running(old).await.unwrap();
        store.complete(old, Outcome::Failed { error: "down".into() }).await.unwrap();

        let newer = UpdateId::new();
        store.create_or_join(&usd_eur(), newer).await.unwrap();

        assert!(matches!(
            store.mark_running(old).await,
            Err(StoreError::InvalidTransition { from: Some(QuoteStatus::Failed), .. })
        ));
        assert_eq!(store.in_flight_count(&usd_eur()), 1);
    }

    #[tokio::test]
    async fn test_abandon_releases_pair() {
        let store = MemoryQuoteStore::new();
        let id = UpdateId::new();
        store.create_or_join(&usd_eur(), id).await.unwrap();
        store.abandon(id, "queue down").await.unwrap();

        let record = store.get_by_id(id).await.unwrap();
        assert_eq!(record.status, QuoteStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("queue down"));
        assert!(store.create_or_join(&usd_eur(), UpdateId::new()).await.unwrap().is_created());
    }

    #[tokio::test]
    async fn test_latest_success() {
        let store = MemoryQuoteStore::new();
        for price in ["1.1", "1.2"] {
            let id = UpdateId::new();
            store.create_or_join(&usd_eur(), id).await.unwrap();
            store.mark_running(id).await.unwrap();
            store.complete(id, success(price)).await.unwrap();
        }
        let latest = store.get_latest_success(&usd_eur()).await.unwrap();
        assert_eq!(latest.price.unwrap().as_str(), "1.2");
    }

    #[tokio::test]
    async fn test_list_in_flight_follows_transitions() {
        let store = MemoryQuoteStore::new();
        let gbp = CurrencyPair::new(Currency::usd(), Currency::gbp());

        let first = UpdateId::new();
        store.create_or_join(&usd_eur(), first).await.unwrap();
        let second = UpdateId::new();
        store.create_or_join(&gbp, second).await.unwrap();
        store.mark_running(second).await.unwrap();

        let ids: Vec<_> = store.list_in_flight().await.unwrap().iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![first, second]);

        store.complete(second, success("0.79")).await.unwrap();
        store.abandon(first, "queue down").await.unwrap();
        assert!(store.list_in_flight().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = MemoryQuoteStore::new();
        store.set_available(false);
        assert!(matches!(store.ping().await, Err(StoreError::Unavailable(_))));
        assert!(store.get_by_id(UpdateId::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_admission() {
        let store = Arc::new(MemoryQuoteStore::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.create_or_join(&usd_eur(), UpdateId::new()).await.unwrap()
            }));
        }

        let mut ids = HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap().id());
        }
        assert_eq!(ids.len(), 1);
        assert_eq!(store.len(), 1);
    }
}
