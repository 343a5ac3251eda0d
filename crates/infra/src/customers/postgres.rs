//! Postgres-backed customer store.
//!
//! `apply_sync` and `assign_wallet` run in a transaction that holds the
//! customer row `FOR UPDATE`, so concurrent balance and wallet writes for
//! the same customer serialize.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{Map, Value};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use loyaltysync_core::{Customer, CustomerCard, Gender, Phone, UserId};

use super::{CustomerStore, CustomerStoreError, SyncedFields};

const CUSTOMER_COLUMNS: &str = "id, phone, name, surname, middle_name, date_of_birth, gender, \
     email, is_deleted, remote_customer_id, remote_wallet_id, cashback_balance_minor, \
     pending_profile_update";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS customers (
        id                      BIGINT PRIMARY KEY,
        phone                   VARCHAR(20) NOT NULL,
        name                    TEXT NULL,
        surname                 TEXT NULL,
        middle_name             TEXT NULL,
        date_of_birth           DATE NULL,
        gender                  VARCHAR(32) NULL,
        email                   TEXT NULL,
        is_deleted              BOOLEAN NOT NULL DEFAULT FALSE,
        remote_customer_id      VARCHAR(64) NULL,
        remote_wallet_id        VARCHAR(64) NULL UNIQUE,
        cashback_balance_minor  BIGINT NULL,
        pending_profile_update  JSONB NULL,
        updated_at              TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ix_customers_phone ON customers (phone) WHERE NOT is_deleted",
    r#"
    CREATE TABLE IF NOT EXISTS customer_cards (
        card_number     VARCHAR(32) PRIMARY KEY,
        customer_id     BIGINT NOT NULL REFERENCES customers (id) ON DELETE CASCADE,
        card_track      VARCHAR(64) NOT NULL,
        remote_card_id  VARCHAR(64) NULL,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ix_customer_cards_customer ON customer_cards (customer_id)",
];

#[derive(Debug, Clone)]
pub struct PostgresCustomerStore {
    pool: Arc<PgPool>,
}

impl PostgresCustomerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), CustomerStoreError> {
        for statement in SCHEMA {
            sqlx::query(*statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    /// Insert or fully overwrite a customer row (cards excluded).
    #[instrument(skip(self, customer), fields(customer_id = %customer.id), err)]
    pub async fn upsert(&self, customer: &Customer) -> Result<(), CustomerStoreError> {
        sqlx::query(
            "INSERT INTO customers (id, phone, name, surname, middle_name, date_of_birth, gender, \
                 email, is_deleted, remote_customer_id, remote_wallet_id, cashback_balance_minor, \
                 pending_profile_update) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             ON CONFLICT (id) DO UPDATE SET \
                 phone = EXCLUDED.phone, name = EXCLUDED.name, surname = EXCLUDED.surname, \
                 middle_name = EXCLUDED.middle_name, date_of_birth = EXCLUDED.date_of_birth, \
                 gender = EXCLUDED.gender, email = EXCLUDED.email, is_deleted = EXCLUDED.is_deleted, \
                 remote_customer_id = EXCLUDED.remote_customer_id, \
                 remote_wallet_id = EXCLUDED.remote_wallet_id, \
                 cashback_balance_minor = EXCLUDED.cashback_balance_minor, \
                 pending_profile_update = EXCLUDED.pending_profile_update, \
                 updated_at = NOW()",
        )
        .bind(customer.id.get())
        .bind(customer.phone.as_str())
        .bind(&customer.name)
        .bind(&customer.surname)
        .bind(&customer.middle_name)
        .bind(customer.date_of_birth)
        .bind(customer.gender.as_ref().map(Gender::as_str))
        .bind(&customer.email)
        .bind(customer.is_deleted)
        .bind(&customer.remote_customer_id)
        .bind(&customer.remote_wallet_id)
        .bind(customer.cashback_balance_minor)
        .bind(customer.pending_profile_update.clone().map(Value::Object))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_customer", e))?;
        Ok(())
    }

    async fn load_cards<'e, E>(executor: E, id: UserId) -> Result<Vec<CustomerCard>, CustomerStoreError>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let rows = sqlx::query(
            "SELECT card_number, card_track, remote_card_id FROM customer_cards \
             WHERE customer_id = $1 ORDER BY created_at, card_number",
        )
        .bind(id.get())
        .fetch_all(executor)
        .await
        .map_err(|e| map_sqlx_error("load_cards", e))?;

        rows.iter()
            .map(|row| {
                Ok(CustomerCard {
                    card_number: row.try_get("card_number").map_err(corrupt)?,
                    card_track: row.try_get("card_track").map_err(corrupt)?,
                    remote_card_id: row.try_get("remote_card_id").map_err(corrupt)?,
                })
            })
            .collect()
    }

    async fn lock_customer(
        tx: &mut Transaction<'_, Postgres>,
        id: UserId,
    ) -> Result<Customer, CustomerStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customers WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.get())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_customer", e))?
        .ok_or(CustomerStoreError::NotFound(id))?;

        let mut customer = customer_from_row(&row)?;
        customer.cards = Self::load_cards(&mut **tx, id).await?;
        Ok(customer)
    }
}

#[async_trait]
impl CustomerStore for PostgresCustomerStore {
    #[instrument(skip(self), err)]
    async fn get(&self, id: UserId) -> Result<Option<Customer>, CustomerStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customers WHERE id = $1"
        ))
        .bind(id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_customer", e))?;

        match row {
            Some(row) => {
                let mut customer = customer_from_row(&row)?;
                customer.cards = Self::load_cards(&*self.pool, id).await?;
                Ok(Some(customer))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(phone = %phone), err)]
    async fn find_by_phone(&self, phone: &Phone) -> Result<Option<Customer>, CustomerStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customers \
             WHERE phone = $1 AND NOT is_deleted ORDER BY id LIMIT 1"
        ))
        .bind(phone.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_customer_by_phone", e))?;

        match row {
            Some(row) => {
                let mut customer = customer_from_row(&row)?;
                customer.cards = Self::load_cards(&*self.pool, customer.id).await?;
                Ok(Some(customer))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, fields), err)]
    async fn apply_sync(
        &self,
        id: UserId,
        fields: &SyncedFields,
    ) -> Result<Customer, CustomerStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut customer = Self::lock_customer(&mut tx, id).await?;
        if fields.apply_to(&mut customer) {
            sqlx::query(
                "UPDATE customers SET remote_customer_id = $2, name = $3, surname = $4, \
                     middle_name = $5, date_of_birth = $6, gender = $7, email = $8, \
                     cashback_balance_minor = $9, updated_at = NOW() \
                 WHERE id = $1",
            )
            .bind(id.get())
            .bind(&customer.remote_customer_id)
            .bind(&customer.name)
            .bind(&customer.surname)
            .bind(&customer.middle_name)
            .bind(customer.date_of_birth)
            .bind(customer.gender.as_ref().map(Gender::as_str))
            .bind(&customer.email)
            .bind(customer.cashback_balance_minor)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("apply_sync", e))?;
        }

        for card in &fields.cards {
            sqlx::query(
                "INSERT INTO customer_cards (card_number, customer_id, card_track, remote_card_id) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (card_number) DO UPDATE SET \
                     card_track = EXCLUDED.card_track, \
                     remote_card_id = COALESCE(EXCLUDED.remote_card_id, customer_cards.remote_card_id)",
            )
            .bind(&card.card_number)
            .bind(id.get())
            .bind(&card.card_track)
            .bind(&card.remote_card_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("mirror_card", e))?;
        }
        if !fields.cards.is_empty() {
            customer.cards = Self::load_cards(&mut *tx, id).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(customer)
    }

    #[instrument(skip(self), err)]
    async fn assign_wallet(
        &self,
        id: UserId,
        wallet_id: &str,
    ) -> Result<Option<UserId>, CustomerStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Locks the target row first so two claimants serialize here.
        Self::lock_customer(&mut tx, id).await?;

        let previous: Option<i64> = sqlx::query_scalar(
            "UPDATE customers SET remote_wallet_id = NULL, updated_at = NOW() \
             WHERE remote_wallet_id = $1 AND id <> $2 RETURNING id",
        )
        .bind(wallet_id)
        .bind(id.get())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("strip_wallet", e))?;

        sqlx::query("UPDATE customers SET remote_wallet_id = $1, updated_at = NOW() WHERE id = $2")
            .bind(wallet_id)
            .bind(id.get())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("assign_wallet", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(previous.map(UserId::new))
    }

    #[instrument(skip(self, card), fields(card_number = %card.card_number), err)]
    async fn add_card(&self, id: UserId, card: CustomerCard) -> Result<(), CustomerStoreError> {
        let result = sqlx::query(
            "INSERT INTO customer_cards (card_number, customer_id, card_track, remote_card_id) \
             SELECT $1, id, $3, $4 FROM customers WHERE id = $2",
        )
        .bind(&card.card_number)
        .bind(id.get())
        .bind(&card.card_track)
        .bind(&card.remote_card_id)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("add_card", e))?;

        if result.rows_affected() == 0 {
            return Err(CustomerStoreError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn card_number_taken(&self, card_number: &str) -> Result<bool, CustomerStoreError> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM customer_cards WHERE card_number = $1)")
            .bind(card_number)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("card_number_taken", e))
    }

    #[instrument(skip(self, pending), err)]
    async fn set_pending_profile_update(
        &self,
        id: UserId,
        pending: Option<Map<String, Value>>,
    ) -> Result<(), CustomerStoreError> {
        let result = sqlx::query(
            "UPDATE customers SET pending_profile_update = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id.get())
        .bind(pending.filter(|p| !p.is_empty()).map(Value::Object))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_pending_profile_update", e))?;

        if result.rows_affected() == 0 {
            return Err(CustomerStoreError::NotFound(id));
        }
        Ok(())
    }
}

fn customer_from_row(row: &PgRow) -> Result<Customer, CustomerStoreError> {
    let id: i64 = row.try_get("id").map_err(corrupt)?;
    let phone: String = row.try_get("phone").map_err(corrupt)?;
    let phone = Phone::parse(&phone)
        .map_err(|e| CustomerStoreError::Storage(format!("corrupt phone for customer {id}: {e}")))?;
    let gender: Option<String> = row.try_get("gender").map_err(corrupt)?;
    let date_of_birth: Option<NaiveDate> = row.try_get("date_of_birth").map_err(corrupt)?;
    let pending: Option<Value> = row.try_get("pending_profile_update").map_err(corrupt)?;

    Ok(Customer {
        id: UserId::new(id),
        phone,
        name: row.try_get("name").map_err(corrupt)?,
        surname: row.try_get("surname").map_err(corrupt)?,
        middle_name: row.try_get("middle_name").map_err(corrupt)?,
        date_of_birth,
        gender: gender.as_deref().and_then(Gender::from_remote),
        email: row.try_get("email").map_err(corrupt)?,
        is_deleted: row.try_get("is_deleted").map_err(corrupt)?,
        remote_customer_id: row.try_get("remote_customer_id").map_err(corrupt)?,
        remote_wallet_id: row.try_get("remote_wallet_id").map_err(corrupt)?,
        cashback_balance_minor: row.try_get("cashback_balance_minor").map_err(corrupt)?,
        pending_profile_update: match pending {
            Some(Value::Object(map)) => Some(map),
            _ => None,
        },
        cards: Vec::new(),
    })
}

fn corrupt(err: sqlx::Error) -> CustomerStoreError {
    CustomerStoreError::Storage(format!("failed to decode customer row: {err}"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> CustomerStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => CustomerStoreError::Conflict(msg),
                _ => CustomerStoreError::Storage(msg),
            }
        }
        _ => CustomerStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> PostgresCustomerStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = PgPool::connect(&url).await.expect("connect to postgres");
        let store = PostgresCustomerStore::new(pool);
        store.ensure_schema().await.expect("schema");
        store
    }

    fn unique_id() -> i64 {
        // Keeps repeated runs against the same database apart.
        (uuid::Uuid::new_v4().as_u128() % 1_000_000_000_000) as i64
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn sync_fills_gaps_and_moves_wallet() {
        let store = store().await;
        let (a, b) = (UserId::new(unique_id()), UserId::new(unique_id()));
        let wallet = format!("w-{}", uuid::Uuid::new_v4().simple());

        let mut first = Customer::new(a, Phone::parse("901111111").unwrap()).with_name("Local");
        first.remote_wallet_id = Some(wallet.clone());
        store.upsert(&first).await.unwrap();
        store
            .upsert(&Customer::new(b, Phone::parse("902222222").unwrap()))
            .await
            .unwrap();

        assert_eq!(store.assign_wallet(b, &wallet).await.unwrap(), Some(a));

        let synced = store
            .apply_sync(
                b,
                &SyncedFields {
                    remote_customer_id: Some("c-1".into()),
                    name: Some("Remote".into()),
                    cashback_balance_minor: Some(990),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(synced.name.as_deref(), Some("Remote"));
        assert_eq!(synced.remote_wallet_id.as_deref(), Some(wallet.as_str()));
        assert_eq!(synced.cashback_balance_minor, Some(990));
        assert!(store.get(a).await.unwrap().unwrap().remote_wallet_id.is_none());
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn duplicate_card_number_is_a_conflict() {
        let store = store().await;
        let id = UserId::new(unique_id());
        store
            .upsert(&Customer::new(id, Phone::parse("903333333").unwrap()))
            .await
            .unwrap();

        let card = CustomerCard {
            card_number: format!("8600{:012}", unique_id()),
            card_track: "1".into(),
            remote_card_id: None,
        };
        store.add_card(id, card.clone()).await.unwrap();
        assert!(store.card_number_taken(&card.card_number).await.unwrap());
        assert!(matches!(
            store.add_card(id, card).await,
            Err(CustomerStoreError::Conflict(_))
        ));
    }
}
