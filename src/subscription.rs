//! Event subscriptions (RFC 6665) layered on dialogs.

use crate::dialog::{DialogHandle, DialogId, DialogStore};
use crate::error::{Result, SipError};
use ahash::AHashMap;
use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId {
    pub dialog: DialogId,
    pub event: String,
    pub event_id: Option<String>,
}

impl SubscriptionId {
    pub fn new(dialog: DialogId, event: &str, event_id: Option<&str>) -> Self {
        Self {
            dialog,
            event: event.to_ascii_lowercase(),
            event_id: event_id.map(str::to_string),
        }
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} event={}", self.dialog, self.event)?;
        if let Some(id) = &self.event_id {
            write!(f, ";id={}", id)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Init,
    Active,
    Terminated,
}

/// Which side of the subscription this agent is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionRole {
    Subscriber,
    Notifier,
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub dialog: DialogHandle,
    pub role: SubscriptionRole,
    pub state: SubscriptionState,
    pub expires_at: Option<Instant>,
}

impl Subscription {
    pub fn new(id: SubscriptionId, dialog: DialogHandle, role: SubscriptionRole) -> Self {
        Self {
            id,
            dialog,
            role,
            state: SubscriptionState::Init,
            expires_at: None,
        }
    }

    /// Move to Active (or stay there) with a fresh expiry.
    pub fn activate(&mut self, expires: Duration) {
        if self.state != SubscriptionState::Terminated {
            self.state = SubscriptionState::Active;
            self.expires_at = Some(Instant::now() + expires);
        }
    }

    pub fn refresh(&mut self, expires: Duration) {
        if self.state != SubscriptionState::Terminated {
            self.expires_at = Some(Instant::now() + expires);
        }
    }

    pub fn terminate(&mut self) {
        self.state = SubscriptionState::Terminated;
        self.expires_at = None;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    /// Seconds left before expiry, for Subscription-State `expires`.
    pub fn remaining(&self) -> Option<u32> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()).as_secs() as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscription#{}", self.0)
    }
}

#[derive(Default)]
struct SubscriptionTable {
    next_handle: u64,
    subscriptions: AHashMap<SubscriptionHandle, Subscription>,
    index: AHashMap<SubscriptionId, SubscriptionHandle>,
}

/// Arena of subscriptions. Each live subscription holds one usage of its
/// dialog, so a dialog outlives every subscription inside it.
#[derive(Default)]
pub struct SubscriptionStore {
    table: Mutex<SubscriptionTable>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, subscription: Subscription, dialogs: &DialogStore) -> Result<SubscriptionHandle> {
        let mut table = self.table.lock();
        if table.index.contains_key(&subscription.id) {
            return Err(SipError::InvalidOperation(format!(
                "subscription {} already exists",
                subscription.id
            )));
        }
        dialogs.add_subscription_usage(subscription.dialog)?;

        table.next_handle += 1;
        let handle = SubscriptionHandle(table.next_handle);
        debug!(subscription = %subscription.id, "subscription created");
        table.index.insert(subscription.id.clone(), handle);
        table.subscriptions.insert(handle, subscription);
        Ok(handle)
    }

    pub fn find(&self, id: &SubscriptionId) -> Option<SubscriptionHandle> {
        self.table.lock().index.get(id).copied()
    }

    pub fn get(&self, handle: SubscriptionHandle) -> Option<Subscription> {
        self.table.lock().subscriptions.get(&handle).cloned()
    }

    pub fn with<R>(
        &self,
        handle: SubscriptionHandle,
        f: impl FnOnce(&mut Subscription) -> R,
    ) -> Option<R> {
        self.table.lock().subscriptions.get_mut(&handle).map(f)
    }

    /// Terminate and drop a subscription, releasing its dialog usage.
    pub fn remove(&self, handle: SubscriptionHandle, dialogs: &DialogStore) -> Option<Subscription> {
        let mut subscription = {
            let mut table = self.table.lock();
            let subscription = table.subscriptions.remove(&handle)?;
            table.index.remove(&subscription.id);
            subscription
        };
        subscription.terminate();
        dialogs.end_subscription_usage(subscription.dialog);
        debug!(subscription = %subscription.id, "subscription removed");
        Some(subscription)
    }

    /// Subscriptions whose expiry has passed.
    pub fn expired(&self, now: Instant) -> Vec<SubscriptionHandle> {
        let mut handles: Vec<SubscriptionHandle> = self
            .table
            .lock()
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.is_expired(now))
            .map(|(handle, _)| *handle)
            .collect();
        handles.sort();
        handles
    }

    pub fn for_dialog(&self, dialog: DialogHandle) -> Vec<SubscriptionHandle> {
        self.table
            .lock()
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.dialog == dialog)
            .map(|(handle, _)| *handle)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.table.lock().subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialog::Dialog;
    use crate::test_support::subscribe_request;

    fn store_with_dialog() -> (DialogStore, DialogHandle, DialogId) {
        let dialogs = DialogStore::new();
        let request = subscribe_request("sub-call", "watcher", "z9hG4bKsub", 3600);
        let dialog = Dialog::uas_from_request(&request, "notifier", None).unwrap();
        let id = dialog.id.clone();
        let handle = dialogs.insert(dialog).unwrap();
        (dialogs, handle, id)
    }

    #[test]
    fn test_identity_includes_event() {
        let (dialogs, handle, id) = store_with_dialog();
        let store = SubscriptionStore::new();
        let presence = SubscriptionId::new(id.clone(), "Presence", None);
        let dialog_event = SubscriptionId::new(id.clone(), "dialog", None);

        let first = store
            .insert(Subscription::new(presence.clone(), handle, SubscriptionRole::Notifier), &dialogs)
            .unwrap();
        let second = store
            .insert(Subscription::new(dialog_event, handle, SubscriptionRole::Notifier), &dialogs)
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(store.find(&SubscriptionId::new(id, "presence", None)), Some(first));
        assert!(store
            .insert(Subscription::new(presence, handle, SubscriptionRole::Notifier), &dialogs)
            .is_err());
        assert_eq!(dialogs.get(handle).unwrap().usage_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_and_removal_release_dialog() {
        let (dialogs, handle, id) = store_with_dialog();
        let store = SubscriptionStore::new();
        let sub = store
            .insert(
                Subscription::new(SubscriptionId::new(id, "presence", None), handle, SubscriptionRole::Notifier),
                &dialogs,
            )
            .unwrap();
        store.with(sub, |s| s.activate(Duration::from_secs(60)));
        assert_eq!(store.get(sub).unwrap().state, SubscriptionState::Active);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(store.expired(Instant::now()).is_empty());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.expired(Instant::now()), vec![sub]);

        let removed = store.remove(sub, &dialogs).unwrap();
        assert_eq!(removed.state, SubscriptionState::Terminated);
        assert!(store.is_empty());
        assert!(!dialogs.contains(handle));
    }

    #[test]
    fn test_terminated_subscription_stays_terminated() {
        let (_dialogs, handle, id) = store_with_dialog();
        let mut sub = Subscription::new(SubscriptionId::new(id, "presence", None), handle, SubscriptionRole::Subscriber);
        sub.terminate();
        sub.activate(Duration::from_secs(10));
        assert_eq!(sub.state, SubscriptionState::Terminated);
        assert!(sub.expires_at.is_none());
    }
}
