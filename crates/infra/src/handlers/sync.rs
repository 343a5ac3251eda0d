use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use loyaltysync_core::{CardIdentity, Customer, CustomerCard, Phone, UserId};

use super::{HandlerError, HandlerResult};
use crate::customers::{CustomerStore, SyncedFields};
use crate::external::{Profile, RemoteCard, SyncClient, format_birthday};
use crate::jobs::{FlushProfilePayload, Job, MarkDeletedPayload, SyncOperation, SyncUserPayload};

const CARD_NUMBER_ATTEMPTS: usize = 5;

/// What a handler run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Set when the run had nothing to do, with the reason.
    pub skipped: Option<&'static str>,
    pub created_remote: bool,
    pub reactivated: bool,
    pub wallet_taken_from: Option<UserId>,
    pub card_issued: bool,
    pub profile_flushed: bool,
}

impl SyncReport {
    fn skipped(reason: &'static str) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }
}

/// Executes claimed jobs against the loyalty client and local customers.
#[derive(Clone)]
pub struct SyncHandlers {
    client: Arc<dyn SyncClient>,
    customers: Arc<dyn CustomerStore>,
}

impl std::fmt::Debug for SyncHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHandlers").finish_non_exhaustive()
    }
}

impl SyncHandlers {
    pub fn new(client: Arc<dyn SyncClient>, customers: Arc<dyn CustomerStore>) -> Self {
        Self { client, customers }
    }

    pub async fn execute(&self, job: &Job) -> HandlerResult<SyncReport> {
        let operation = job.decode_operation().map_err(|e| {
            HandlerError::InvalidJob(format!("malformed {} payload: {e}", job.operation))
        })?;

        match operation {
            SyncOperation::SyncUser(payload) => self.sync_user(job.user_id, payload).await,
            SyncOperation::FlushProfile(payload) => self.flush_profile(job.user_id, payload).await,
            SyncOperation::MarkDeleted(payload) => {
                self.mark_deleted(job.phone.as_ref(), payload).await
            }
        }
    }

    /// Reconcile a local customer with its remote profile, creating the
    /// remote side when allowed, then make sure the customer owns a card and
    /// push any pending profile changes.
    pub async fn sync_user(
        &self,
        user_id: Option<UserId>,
        payload: SyncUserPayload,
    ) -> HandlerResult<SyncReport> {
        let id = user_id.ok_or_else(|| HandlerError::InvalidJob("sync_user requires user_id".into()))?;
        let Some(customer) = self.customers.get(id).await? else {
            debug!(user_id = %id, "sync_user_skipped_missing_customer");
            return Ok(SyncReport::skipped("customer_missing"));
        };
        if customer.is_deleted {
            debug!(user_id = %id, "sync_user_skipped_deleted_customer");
            return Ok(SyncReport::skipped("customer_deleted"));
        }

        let mut report = SyncReport::default();
        let mut profile = self.client.lookup(&customer.phone).await?;

        if profile.as_ref().is_some_and(Profile::is_deleted) {
            let mut fields = Map::new();
            fields.insert("isDeleted".into(), json!(false));
            self.client.create_or_update(&customer.phone, fields).await?;
            info!(user_id = %id, "remote_customer_reactivated");
            report.reactivated = true;
            profile = self.client.lookup(&customer.phone).await?.or(profile);
        }

        let profile = match profile {
            Some(profile) => profile,
            None if payload.create_if_missing => {
                let created = self
                    .client
                    .create_or_update(&customer.phone, creation_fields(&customer))
                    .await?;
                info!(user_id = %id, "remote_customer_created");
                report.created_remote = true;
                self.client
                    .lookup(&customer.phone)
                    .await?
                    .unwrap_or(created)
            }
            None => {
                warn!(user_id = %id, phone = %customer.phone, "remote_customer_not_found");
                return Err(HandlerError::Failed("remote_customer_not_found".into()));
            }
        };

        let customer = self.apply_profile(&customer, &profile, &mut report).await?;
        self.ensure_card(&customer, &mut report).await;

        if customer.has_pending_profile_update() {
            self.push_pending_update(&customer).await?;
            report.profile_flushed = true;
        }
        Ok(report)
    }

    /// Send the customer's pending profile update, if any.
    pub async fn flush_profile(
        &self,
        user_id: Option<UserId>,
        _payload: FlushProfilePayload,
    ) -> HandlerResult<SyncReport> {
        let id = user_id
            .ok_or_else(|| HandlerError::InvalidJob("flush_profile requires user_id".into()))?;
        let Some(customer) = self.customers.get(id).await? else {
            return Ok(SyncReport::skipped("customer_missing"));
        };
        if customer.is_deleted {
            return Ok(SyncReport::skipped("customer_deleted"));
        }
        if !customer.has_pending_profile_update() {
            return Ok(SyncReport::skipped("nothing_pending"));
        }

        self.push_pending_update(&customer).await?;
        Ok(SyncReport {
            profile_flushed: true,
            ..SyncReport::default()
        })
    }

    /// Forward a prepared "deleted" body for a phone to the remote side.
    pub async fn mark_deleted(
        &self,
        phone: Option<&Phone>,
        payload: MarkDeletedPayload,
    ) -> HandlerResult<SyncReport> {
        let phone =
            phone.ok_or_else(|| HandlerError::InvalidJob("mark_deleted requires phone".into()))?;
        if payload.remote_payload.is_empty() {
            return Err(HandlerError::InvalidJob(
                "mark_deleted requires a remote payload".into(),
            ));
        }

        self.client
            .create_or_update(phone, payload.remote_payload)
            .await?;
        info!(phone = %phone, "remote_customer_marked_deleted");
        Ok(SyncReport::default())
    }

    async fn apply_profile(
        &self,
        customer: &Customer,
        profile: &Profile,
        report: &mut SyncReport,
    ) -> HandlerResult<Customer> {
        if let Some(wallet_id) = profile.wallet_id() {
            report.wallet_taken_from = self.customers.assign_wallet(customer.id, wallet_id).await?;
            if let Some(previous) = report.wallet_taken_from {
                warn!(
                    user_id = %customer.id,
                    previous_holder = %previous,
                    wallet_id,
                    "remote_wallet_reassigned"
                );
            }
        }

        let fields = synced_fields(customer, profile);
        Ok(self.customers.apply_sync(customer.id, &fields).await?)
    }

    /// Card issuing is best effort: a failure is logged and the next sync
    /// tries again.
    async fn ensure_card(&self, customer: &Customer, report: &mut SyncReport) {
        let Some(remote_id) = customer.remote_customer_id.as_deref() else {
            return;
        };
        if !customer.cards.is_empty() {
            return;
        }

        match self.issue_card(customer.id, remote_id).await {
            Ok(card) => {
                info!(user_id = %customer.id, card_number = %card.card_number, "loyalty_card_issued");
                report.card_issued = true;
            }
            Err(e) => warn!(user_id = %customer.id, error = %e, "loyalty_card_issue_failed"),
        }
    }

    async fn issue_card(&self, id: UserId, remote_id: &str) -> HandlerResult<CustomerCard> {
        let identity = self.fresh_card_identity().await?;
        let issued = self.client.issue_card(remote_id, &identity).await?;

        let card = CustomerCard {
            card_number: identity.card_number,
            card_track: identity.card_track,
            remote_card_id: issued.id,
        };
        self.customers.add_card(id, card.clone()).await?;
        Ok(card)
    }

    async fn fresh_card_identity(&self) -> HandlerResult<CardIdentity> {
        for _ in 0..CARD_NUMBER_ATTEMPTS {
            let identity = CardIdentity::generate(&mut rand::thread_rng());
            if !self.customers.card_number_taken(&identity.card_number).await? {
                return Ok(identity);
            }
        }
        Err(HandlerError::Failed("card_number_generation_exhausted".into()))
    }

    /// On failure the pending update stays stored for the next attempt.
    async fn push_pending_update(&self, customer: &Customer) -> HandlerResult<()> {
        let Some(pending) = customer.pending_profile_update.clone() else {
            return Ok(());
        };

        if let Err(e) = self.client.create_or_update(&customer.phone, pending).await {
            warn!(user_id = %customer.id, error = %e, "profile_flush_failed");
            return Err(e.into());
        }
        self.customers
            .set_pending_profile_update(customer.id, None)
            .await?;
        info!(user_id = %customer.id, "profile_flushed");
        Ok(())
    }
}

/// Remote create body built from the local record.
fn creation_fields(customer: &Customer) -> Map<String, Value> {
    let mut fields = Map::new();
    if let Some(name) = clean(customer.name.as_deref()) {
        fields.insert("fullName".into(), json!(name));
        fields.insert("name".into(), json!(name));
    }
    if let Some(birthday) = customer.date_of_birth {
        fields.insert("birthday".into(), json!(format_birthday(birthday)));
    }
    if let Some(email) = clean(customer.email.as_deref()) {
        fields.insert("email".into(), json!(email));
    }
    if let Some(gender) = &customer.gender {
        fields.insert("sex".into(), json!(gender.as_str()));
    }
    if let Some(surname) = clean(customer.surname.as_deref()) {
        fields.insert("surname".into(), json!(surname));
    }
    if let Some(middle_name) = clean(customer.middle_name.as_deref()) {
        fields.insert("middleName".into(), json!(middle_name));
    }
    fields
}

fn synced_fields(customer: &Customer, profile: &Profile) -> SyncedFields {
    let cashback_balance_minor = match profile.cashback_wallet() {
        None => {
            warn!(user_id = %customer.id, "cashback_wallets_empty");
            None
        }
        Some(wallet) => match wallet.balance_minor() {
            Ok(Some(balance)) => Some(balance),
            Ok(None) => {
                warn!(user_id = %customer.id, wallet_id = ?wallet.wallet_id(), "cashback_balance_missing");
                None
            }
            Err(e) => {
                warn!(user_id = %customer.id, error = %e, "cashback_balance_unparseable");
                None
            }
        },
    };

    SyncedFields {
        remote_customer_id: profile.customer_id().map(str::to_string),
        name: profile.composed_name(),
        surname: profile.surname().map(str::to_string),
        middle_name: profile.middle_name().map(str::to_string),
        date_of_birth: profile.birthday(),
        gender: profile.gender(),
        email: profile.email().map(str::to_string),
        cashback_balance_minor,
        cards: profile
            .remote_cards()
            .iter()
            .filter_map(RemoteCard::to_local)
            .collect(),
    }
}

fn clean(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
