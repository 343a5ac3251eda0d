//! Scripted [`SyncClient`] for handler and worker tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use loyaltysync_core::{CardIdentity, Phone};
use serde_json::{Map, Value, json};

use super::SyncClient;
use super::errors::{SyncClientError, SyncClientResult};
use super::types::{CardRef, Profile, RemoteCard, WalletBalance};

#[derive(Debug, Default)]
pub struct FakeSyncClient {
    profiles: Mutex<HashMap<String, Profile>>,
    failures: Mutex<HashMap<&'static str, VecDeque<SyncClientError>>>,
    calls: Mutex<Vec<String>>,
    bodies: Mutex<Vec<Map<String, Value>>>,
    sequence: AtomicUsize,
}

impl FakeSyncClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(self, phone: &Phone, profile: Profile) -> Self {
        self.profiles
            .lock()
            .unwrap()
            .insert(phone.as_str().to_string(), profile);
        self
    }

    /// Make the next call of `operation` fail with `error`.
    pub fn fail_next(&self, operation: &'static str, error: SyncClientError) {
        self.failures
            .lock()
            .unwrap()
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    pub fn profile(&self, phone: &Phone) -> Option<Profile> {
        self.profiles.lock().unwrap().get(phone.as_str()).cloned()
    }

    /// `operation:argument` for every call, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Field maps passed to `create_or_update`.
    pub fn bodies(&self) -> Vec<Map<String, Value>> {
        self.bodies.lock().unwrap().clone()
    }

    fn record(&self, operation: &'static str, argument: &str) -> SyncClientResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{operation}:{argument}"));
        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(operation)
            .and_then(VecDeque::pop_front);
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn next(&self) -> usize {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl SyncClient for FakeSyncClient {
    async fn lookup(&self, phone: &Phone) -> SyncClientResult<Option<Profile>> {
        self.record("lookup", phone.as_str())?;
        Ok(self.profile(phone))
    }

    async fn create_or_update(
        &self,
        phone: &Phone,
        fields: Map<String, Value>,
    ) -> SyncClientResult<Profile> {
        self.record("create_or_update", phone.as_str())?;
        self.bodies.lock().unwrap().push(fields.clone());

        let n = self.next();
        let mut profiles = self.profiles.lock().unwrap();
        let profile = profiles
            .entry(phone.as_str().to_string())
            .or_insert_with(|| Profile {
                id: Some(format!("c-{n}")),
                wallet_balances: Some(vec![WalletBalance {
                    id: Some(format!("w-{n}")),
                    wallet_type: Some(1),
                    balance: json!(0),
                    ..Default::default()
                }]),
                ..Default::default()
            });

        if let Some(flag) = fields.get("isDeleted") {
            profile.is_deleted = flag.clone();
        }
        if let Some(Value::String(name)) = fields.get("name") {
            profile.name = Some(name.clone());
        }
        Ok(profile.clone())
    }

    async fn issue_card(&self, customer_id: &str, card: &CardIdentity) -> SyncClientResult<CardRef> {
        self.record("issue_card", customer_id)?;
        let id = format!("rc-{}", self.next());

        let mut profiles = self.profiles.lock().unwrap();
        if let Some(profile) = profiles
            .values_mut()
            .find(|p| p.id.as_deref() == Some(customer_id))
        {
            profile.cards.get_or_insert_with(Vec::new).push(RemoteCard {
                id: Some(id.clone()),
                number: Some(card.card_number.clone()),
                track: Some(card.card_track.clone()),
            });
        }
        Ok(CardRef { id: Some(id) })
    }
}
