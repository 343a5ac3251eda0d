//! In-memory customer store, used by tests and local runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{Map, Value};

use loyaltysync_core::{Customer, CustomerCard, Phone, UserId};

use super::{CustomerStore, CustomerStoreError, SyncedFields};

#[derive(Debug, Default)]
pub struct InMemoryCustomerStore {
    customers: Mutex<HashMap<UserId, Customer>>,
}

impl InMemoryCustomerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Overwrite a customer directly. Test setup only.
    pub fn insert(&self, customer: Customer) -> Result<(), CustomerStoreError> {
        self.lock()?.insert(customer.id, customer);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<UserId, Customer>>, CustomerStoreError> {
        self.customers
            .lock()
            .map_err(|_| CustomerStoreError::Storage("customer store mutex poisoned".into()))
    }
}

fn card_owner(customers: &HashMap<UserId, Customer>, card_number: &str) -> Option<UserId> {
    customers
        .values()
        .find(|c| c.cards.iter().any(|card| card.card_number == card_number))
        .map(|c| c.id)
}

#[async_trait]
impl CustomerStore for InMemoryCustomerStore {
    async fn get(&self, id: UserId) -> Result<Option<Customer>, CustomerStoreError> {
        Ok(self.lock()?.get(&id).cloned())
    }

    async fn find_by_phone(&self, phone: &Phone) -> Result<Option<Customer>, CustomerStoreError> {
        Ok(self
            .lock()?
            .values()
            .filter(|c| !c.is_deleted && &c.phone == phone)
            .min_by_key(|c| c.id)
            .cloned())
    }

    async fn apply_sync(
        &self,
        id: UserId,
        fields: &SyncedFields,
    ) -> Result<Customer, CustomerStoreError> {
        let mut customers = self.lock()?;
        if !customers.contains_key(&id) {
            return Err(CustomerStoreError::NotFound(id));
        }

        for card in &fields.cards {
            let owner = card_owner(&customers, &card.card_number).unwrap_or(id);
            if let Some(holder) = customers.get_mut(&owner) {
                holder.upsert_card(card.clone());
            }
        }

        let customer = customers
            .get_mut(&id)
            .ok_or(CustomerStoreError::NotFound(id))?;
        fields.apply_to(customer);
        Ok(customer.clone())
    }

    async fn assign_wallet(
        &self,
        id: UserId,
        wallet_id: &str,
    ) -> Result<Option<UserId>, CustomerStoreError> {
        let mut customers = self.lock()?;
        if !customers.contains_key(&id) {
            return Err(CustomerStoreError::NotFound(id));
        }

        let previous = customers
            .values_mut()
            .find(|c| c.id != id && c.remote_wallet_id.as_deref() == Some(wallet_id))
            .map(|c| {
                c.remote_wallet_id = None;
                c.id
            });

        if let Some(customer) = customers.get_mut(&id) {
            customer.remote_wallet_id = Some(wallet_id.to_string());
        }
        Ok(previous)
    }

    async fn add_card(&self, id: UserId, card: CustomerCard) -> Result<(), CustomerStoreError> {
        let mut customers = self.lock()?;
        if card_owner(&customers, &card.card_number).is_some() {
            return Err(CustomerStoreError::Conflict(format!(
                "card number already bound: {}",
                card.card_number
            )));
        }
        customers
            .get_mut(&id)
            .ok_or(CustomerStoreError::NotFound(id))?
            .cards
            .push(card);
        Ok(())
    }

    async fn card_number_taken(&self, card_number: &str) -> Result<bool, CustomerStoreError> {
        Ok(card_owner(&*self.lock()?, card_number).is_some())
    }

    async fn set_pending_profile_update(
        &self,
        id: UserId,
        pending: Option<Map<String, Value>>,
    ) -> Result<(), CustomerStoreError> {
        self.lock()?
            .get_mut(&id)
            .ok_or(CustomerStoreError::NotFound(id))?
            .pending_profile_update = pending.filter(|p| !p.is_empty());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customer(id: i64, phone: &str) -> Customer {
        Customer::new(UserId::new(id), Phone::parse(phone).unwrap())
    }

    fn card(number: &str, track: &str) -> CustomerCard {
        CustomerCard {
            card_number: number.into(),
            card_track: track.into(),
            remote_card_id: None,
        }
    }

    #[tokio::test]
    async fn wallet_moves_to_new_holder() {
        let store = InMemoryCustomerStore::new();
        let mut old = customer(1, "901111111");
        old.remote_wallet_id = Some("w-1".into());
        store.insert(old).unwrap();
        store.insert(customer(2, "902222222")).unwrap();

        let previous = store.assign_wallet(UserId::new(2), "w-1").await.unwrap();
        assert_eq!(previous, Some(UserId::new(1)));

        let old = store.get(UserId::new(1)).await.unwrap().unwrap();
        let new = store.get(UserId::new(2)).await.unwrap().unwrap();
        assert_eq!(old.remote_wallet_id, None);
        assert_eq!(new.remote_wallet_id.as_deref(), Some("w-1"));

        // Reassigning to the current holder strips nobody.
        assert_eq!(store.assign_wallet(UserId::new(2), "w-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn mirrored_card_of_another_customer_is_refreshed_in_place() {
        let store = InMemoryCustomerStore::new();
        let mut owner = customer(1, "901111111");
        owner.cards.push(card("8600000000000001", "old"));
        store.insert(owner).unwrap();
        store.insert(customer(2, "902222222")).unwrap();

        let fields = SyncedFields {
            cards: vec![card("8600000000000001", "new"), card("8600000000000002", "t")],
            ..Default::default()
        };
        let synced = store.apply_sync(UserId::new(2), &fields).await.unwrap();

        assert_eq!(synced.cards.len(), 1);
        assert_eq!(synced.cards[0].card_number, "8600000000000002");
        let owner = store.get(UserId::new(1)).await.unwrap().unwrap();
        assert_eq!(owner.cards[0].card_track, "new");
    }

    #[tokio::test]
    async fn add_card_rejects_taken_numbers() {
        let store = InMemoryCustomerStore::new();
        store.insert(customer(1, "901111111")).unwrap();
        store.insert(customer(2, "902222222")).unwrap();

        store.add_card(UserId::new(1), card("8600000000000009", "1")).await.unwrap();
        assert!(store.card_number_taken("8600000000000009").await.unwrap());
        assert!(matches!(
            store.add_card(UserId::new(2), card("8600000000000009", "2")).await,
            Err(CustomerStoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn find_by_phone_skips_deleted_customers() {
        let store = InMemoryCustomerStore::new();
        let mut deleted = customer(1, "901111111");
        deleted.is_deleted = true;
        store.insert(deleted).unwrap();
        store.insert(customer(2, "901111111")).unwrap();

        let phone = Phone::parse("901111111").unwrap();
        let found = store.find_by_phone(&phone).await.unwrap().unwrap();
        assert_eq!(found.id, UserId::new(2));

        store.set_pending_profile_update(UserId::new(2), Some(Map::new())).await.unwrap();
        assert!(store.get(UserId::new(2)).await.unwrap().unwrap().pending_profile_update.is_none());
    }
}
