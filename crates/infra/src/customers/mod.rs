//! Local customer records touched by the sync handlers.
//!
//! The job queue never reads these; only the operation handlers do, to
//! reconcile a local customer with its remote loyalty profile.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{Map, Value};
use thiserror::Error;

use loyaltysync_core::customer::fill_if_missing;
use loyaltysync_core::{Customer, CustomerCard, Gender, Phone, UserId};

pub use memory::InMemoryCustomerStore;
pub use postgres::PostgresCustomerStore;

#[derive(Debug, Clone, Error)]
pub enum CustomerStoreError {
    #[error("customer not found: {0}")]
    NotFound(UserId),

    #[error("customer conflict: {0}")]
    Conflict(String),

    #[error("customer storage error: {0}")]
    Storage(String),
}

/// Profile fields learned from the remote side.
///
/// Identifiers and the balance always overwrite local values; personal
/// fields only fill local gaps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncedFields {
    pub remote_customer_id: Option<String>,
    pub name: Option<String>,
    pub surname: Option<String>,
    pub middle_name: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub gender: Option<Gender>,
    pub email: Option<String>,
    pub cashback_balance_minor: Option<i64>,
    pub cards: Vec<CustomerCard>,
}

impl SyncedFields {
    /// Merge everything except cards into `customer`; returns whether it changed.
    pub fn apply_to(&self, customer: &mut Customer) -> bool {
        let mut changed = false;

        if let Some(remote_id) = &self.remote_customer_id {
            if customer.remote_customer_id.as_ref() != Some(remote_id) {
                customer.remote_customer_id = Some(remote_id.clone());
                changed = true;
            }
        }

        changed |= fill_if_missing(&mut customer.middle_name, self.middle_name.as_deref());
        changed |= fill_if_missing(&mut customer.surname, self.surname.as_deref());
        changed |= fill_if_missing(&mut customer.name, self.name.as_deref());
        changed |= fill_if_missing(&mut customer.email, self.email.as_deref());

        if customer.date_of_birth.is_none() && self.date_of_birth.is_some() {
            customer.date_of_birth = self.date_of_birth;
            changed = true;
        }
        if customer.gender.is_none() && self.gender.is_some() {
            customer.gender = self.gender.clone();
            changed = true;
        }

        if let Some(balance) = self.cashback_balance_minor {
            if customer.cashback_balance_minor != Some(balance) {
                customer.cashback_balance_minor = Some(balance);
                changed = true;
            }
        }

        changed
    }
}

/// Storage for local customers and their cards.
#[async_trait]
pub trait CustomerStore: Send + Sync {
    async fn get(&self, id: UserId) -> Result<Option<Customer>, CustomerStoreError>;

    /// The active (not deleted) customer with this phone.
    async fn find_by_phone(&self, phone: &Phone) -> Result<Option<Customer>, CustomerStoreError>;

    /// Write synced fields under a row lock and mirror remote cards.
    ///
    /// A mirrored card number already bound to another customer only has
    /// its track and remote id refreshed.
    async fn apply_sync(
        &self,
        id: UserId,
        fields: &SyncedFields,
    ) -> Result<Customer, CustomerStoreError>;

    /// Give `wallet_id` to `id`, stripping it from any other holder first.
    ///
    /// Returns the customer the wallet was taken from.
    async fn assign_wallet(
        &self,
        id: UserId,
        wallet_id: &str,
    ) -> Result<Option<UserId>, CustomerStoreError>;

    /// Bind a newly issued card. Fails with `Conflict` if the number is taken.
    async fn add_card(&self, id: UserId, card: CustomerCard) -> Result<(), CustomerStoreError>;

    async fn card_number_taken(&self, card_number: &str) -> Result<bool, CustomerStoreError>;

    /// Replace (or clear, with `None`) the pending profile update.
    async fn set_pending_profile_update(
        &self,
        id: UserId,
        pending: Option<Map<String, Value>>,
    ) -> Result<(), CustomerStoreError>;
}

#[async_trait]
impl<S: CustomerStore + ?Sized> CustomerStore for std::sync::Arc<S> {
    async fn get(&self, id: UserId) -> Result<Option<Customer>, CustomerStoreError> {
        (**self).get(id).await
    }

    async fn find_by_phone(&self, phone: &Phone) -> Result<Option<Customer>, CustomerStoreError> {
        (**self).find_by_phone(phone).await
    }

    async fn apply_sync(
        &self,
        id: UserId,
        fields: &SyncedFields,
    ) -> Result<Customer, CustomerStoreError> {
        (**self).apply_sync(id, fields).await
    }

    async fn assign_wallet(
        &self,
        id: UserId,
        wallet_id: &str,
    ) -> Result<Option<UserId>, CustomerStoreError> {
        (**self).assign_wallet(id, wallet_id).await
    }

    async fn add_card(&self, id: UserId, card: CustomerCard) -> Result<(), CustomerStoreError> {
        (**self).add_card(id, card).await
    }

    async fn card_number_taken(&self, card_number: &str) -> Result<bool, CustomerStoreError> {
        (**self).card_number_taken(card_number).await
    }

    async fn set_pending_profile_update(
        &self,
        id: UserId,
        pending: Option<Map<String, Value>>,
    ) -> Result<(), CustomerStoreError> {
        (**self).set_pending_profile_update(id, pending).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_overwrites_ids_and_balance_but_only_fills_profile_gaps() {
        let mut customer = Customer::new(UserId::new(1), Phone::parse("901234567").unwrap())
            .with_name("Local");
        customer.remote_customer_id = Some("old".into());

        let fields = SyncedFields {
            remote_customer_id: Some("new".into()),
            name: Some("Remote".into()),
            surname: Some("Karimov".into()),
            date_of_birth: NaiveDate::from_ymd_opt(1990, 1, 2),
            gender: Some(Gender::Female),
            cashback_balance_minor: Some(1_500),
            ..Default::default()
        };

        assert!(fields.apply_to(&mut customer));
        assert_eq!(customer.remote_customer_id.as_deref(), Some("new"));
        assert_eq!(customer.name.as_deref(), Some("Local"));
        assert_eq!(customer.surname.as_deref(), Some("Karimov"));
        assert_eq!(customer.gender, Some(Gender::Female));
        assert_eq!(customer.cashback_balance_minor, Some(1_500));

        assert!(!fields.apply_to(&mut customer));
    }
}
