use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use providers::ParkRef;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use campsite_watch::store::{
    AccountStore, NotificationStore, SnapshotStore, StoreError, Stores, SubscriptionStore,
};
use campsite_watch::{
    Account, AccountTier, AvailabilitySnapshot, Channel, ChannelSelection, ContactPoint,
    DatePreference, DedupKey, DeliveryStatus, NotificationRecord, OwnerId, SlotRecord,
    Subscription, SubscriptionStatus,
};

/// Store implementation backed by PostgreSQL. See `schema.sql` for the
/// table layout.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Wrap one shared pool into a [`Stores`] bundle.
    pub fn into_stores(self) -> Stores {
        let shared = std::sync::Arc::new(self);
        Stores {
            subscriptions: shared.clone(),
            snapshots: shared.clone(),
            accounts: shared.clone(),
            notifications: shared,
        }
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn subscription_from_row(row: &PgRow) -> Result<Subscription, StoreError> {
    let owner_raw: String = row.get("owner");
    let owner = OwnerId::parse(&owner_raw)
        .ok_or_else(|| StoreError::DataFormat(format!("bad owner id: {owner_raw}")))?;

    let parks: Vec<String> = row.get("parks");
    let status_raw: String = row.get("status");
    let preference_raw: String = row.get("preference");

    Ok(Subscription {
        id: row.get("id"),
        owner,
        parks: parks.iter().map(|p| ParkRef::parse(p)).collect(),
        start_date: row.get::<NaiveDate, _>("start_date"),
        end_date: row.get::<NaiveDate, _>("end_date"),
        nights: row.get::<i32, _>("nights") as u32,
        preference: DatePreference::parse(&preference_raw)
            .ok_or_else(|| StoreError::DataFormat(format!("bad preference: {preference_raw}")))?,
        channels: ChannelSelection {
            email: row.get("notify_email"),
            sms: row.get("notify_sms"),
            whatsapp: row.get("notify_whatsapp"),
        },
        status: SubscriptionStatus::parse(&status_raw)
            .ok_or_else(|| StoreError::DataFormat(format!("bad status: {status_raw}")))?,
        status_reason: row.get("status_reason"),
        check_interval_minutes: row.get::<i32, _>("check_interval_minutes") as u32,
        last_checked: row.get("last_checked"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn insert(&self, subscription: &Subscription) -> Result<(), StoreError> {
        let parks: Vec<String> = subscription.parks.iter().map(|p| p.to_string()).collect();

        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, owner, parks, start_date, end_date, nights, preference,
                notify_email, notify_sms, notify_whatsapp,
                status, status_reason, check_interval_minutes,
                last_checked, last_error, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.owner.to_string())
        .bind(&parks)
        .bind(subscription.start_date)
        .bind(subscription.end_date)
        .bind(subscription.nights as i32)
        .bind(subscription.preference.as_str())
        .bind(subscription.channels.email)
        .bind(subscription.channels.sms)
        .bind(subscription.channels.whatsapp)
        .bind(subscription.status.as_str())
        .bind(&subscription.status_reason)
        .bind(subscription.check_interval_minutes as i32)
        .bind(subscription.last_checked)
        .bind(&subscription.last_error)
        .bind(subscription.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Subscription>, StoreError> {
        let row = sqlx::query("SELECT * FROM subscriptions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(|r| subscription_from_row(&r)).transpose()
    }

    async fn update(&self, subscription: &Subscription) -> Result<(), StoreError> {
        let parks: Vec<String> = subscription.parks.iter().map(|p| p.to_string()).collect();

        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET parks = $1, start_date = $2, end_date = $3, nights = $4,
                preference = $5, notify_email = $6, notify_sms = $7,
                notify_whatsapp = $8, status = $9, status_reason = $10,
                check_interval_minutes = $11
            WHERE id = $12
            "#,
        )
        .bind(&parks)
        .bind(subscription.start_date)
        .bind(subscription.end_date)
        .bind(subscription.nights as i32)
        .bind(subscription.preference.as_str())
        .bind(subscription.channels.email)
        .bind(subscription.channels.sms)
        .bind(subscription.channels.whatsapp)
        .bind(subscription.status.as_str())
        .bind(&subscription.status_reason)
        .bind(subscription.check_interval_minutes as i32)
        .bind(subscription.id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: SubscriptionStatus,
        reason: Option<String>,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE subscriptions SET status = $1, status_reason = $2 WHERE id = $3")
                .bind(status.as_str())
                .bind(&reason)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn mark_checked(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE subscriptions SET last_checked = $1, last_error = $2 WHERE id = $3",
        )
        .bind(at)
        .bind(&error)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<Subscription>, StoreError> {
        let rows = sqlx::query("SELECT * FROM subscriptions WHERE status = 'active'")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.iter().map(subscription_from_row).collect()
    }

    async fn list_for_owner(&self, owner: &OwnerId) -> Result<Vec<Subscription>, StoreError> {
        let rows =
            sqlx::query("SELECT * FROM subscriptions WHERE owner = $1 ORDER BY created_at DESC")
                .bind(owner.to_string())
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;

        rows.iter().map(subscription_from_row).collect()
    }

    async fn count_active_for_owner(&self, owner: &OwnerId) -> Result<u32, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) as count FROM subscriptions WHERE owner = $1 AND status = 'active'",
        )
        .bind(owner.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.get::<i64, _>("count") as u32)
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for PgStore {
    async fn load(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<AvailabilitySnapshot>, StoreError> {
        let row = sqlx::query(
            "SELECT captured_at, slots FROM availability_snapshots WHERE subscription_id = $1",
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let captured_at: DateTime<Utc> = row.get("captured_at");
        let slots: serde_json::Value = row.get("slots");
        let records: Vec<SlotRecord> =
            serde_json::from_value(slots).map_err(|e| StoreError::DataFormat(e.to_string()))?;

        Ok(Some(AvailabilitySnapshot::from_records(
            subscription_id,
            captured_at,
            records,
        )))
    }

    async fn replace(&self, snapshot: &AvailabilitySnapshot) -> Result<(), StoreError> {
        let slots = serde_json::to_value(snapshot.to_records())
            .map_err(|e| StoreError::DataFormat(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO availability_snapshots (subscription_id, captured_at, slots)
            VALUES ($1, $2, $3)
            ON CONFLICT (subscription_id)
            DO UPDATE SET captured_at = EXCLUDED.captured_at, slots = EXCLUDED.slots
            "#,
        )
        .bind(snapshot.subscription_id)
        .bind(snapshot.captured_at)
        .bind(slots)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn clear(&self, subscription_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM availability_snapshots WHERE subscription_id = $1")
            .bind(subscription_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

fn contact_from_row(row: &PgRow, address_col: &str, verified_col: &str) -> Option<ContactPoint> {
    row.get::<Option<String>, _>(address_col)
        .map(|address| ContactPoint {
            address,
            verified: row.get(verified_col),
        })
}

#[async_trait]
impl AccountStore for PgStore {
    async fn get(&self, owner: &OwnerId) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query("SELECT * FROM accounts WHERE owner = $1")
            .bind(owner.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let tier_raw: String = row.get("tier");
        Ok(Some(Account {
            owner: owner.clone(),
            tier: AccountTier::parse(&tier_raw),
            email: contact_from_row(&row, "email", "email_verified"),
            phone: contact_from_row(&row, "phone", "phone_verified"),
            whatsapp: contact_from_row(&row, "whatsapp", "whatsapp_verified"),
        }))
    }

    async fn upsert(&self, account: &Account) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO accounts (
                owner, tier, email, email_verified, phone, phone_verified,
                whatsapp, whatsapp_verified, notifications_sent
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0)
            ON CONFLICT (owner) DO UPDATE SET
                tier = EXCLUDED.tier,
                email = EXCLUDED.email,
                email_verified = EXCLUDED.email_verified,
                phone = EXCLUDED.phone,
                phone_verified = EXCLUDED.phone_verified,
                whatsapp = EXCLUDED.whatsapp,
                whatsapp_verified = EXCLUDED.whatsapp_verified
            "#,
        )
        .bind(account.owner.to_string())
        .bind(account.tier.as_str())
        .bind(account.email.as_ref().map(|c| c.address.clone()))
        .bind(account.email.as_ref().is_some_and(|c| c.verified))
        .bind(account.phone.as_ref().map(|c| c.address.clone()))
        .bind(account.phone.as_ref().is_some_and(|c| c.verified))
        .bind(account.whatsapp.as_ref().map(|c| c.address.clone()))
        .bind(account.whatsapp.as_ref().is_some_and(|c| c.verified))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }
}

#[async_trait]
impl NotificationStore for PgStore {
    async fn unseen(
        &self,
        subscription_id: Uuid,
        keys: &[DedupKey],
    ) -> Result<Vec<DedupKey>, StoreError> {
        let rows = sqlx::query(
            "SELECT park, date, site_count FROM notification_dedup WHERE subscription_id = $1",
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let seen: std::collections::HashSet<DedupKey> = rows
            .iter()
            .map(|row| DedupKey {
                park: ParkRef::parse(row.get::<String, _>("park").as_str()),
                date: row.get("date"),
                count: row.get::<i32, _>("site_count") as u32,
            })
            .collect();

        Ok(keys.iter().filter(|k| !seen.contains(k)).cloned().collect())
    }

    async fn record(&self, record: &NotificationRecord) -> Result<(), StoreError> {
        let covered = serde_json::to_value(&record.covered)
            .map_err(|e| StoreError::DataFormat(e.to_string()))?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO notification_records
            (id, subscription_id, owner, channel, summary, covered, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.id)
        .bind(record.subscription_id)
        .bind(record.owner.to_string())
        .bind(record.channel.map(|c| c.as_str()))
        .bind(&record.summary)
        .bind(covered)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if record.status != DeliveryStatus::SkippedQuota {
            for key in &record.covered {
                sqlx::query(
                    r#"
                    INSERT INTO notification_dedup (subscription_id, park, date, site_count)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT DO NOTHING
                    "#,
                )
                .bind(record.subscription_id)
                .bind(key.park.to_string())
                .bind(key.date)
                .bind(key.count as i32)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn try_reserve_quota(&self, owner: &OwnerId, limit: u32) -> Result<bool, StoreError> {
        // Make sure the counter row exists, then take the unit in a single
        // conditional update so concurrent reservations cannot both pass.
        sqlx::query(
            r#"
            INSERT INTO accounts (owner, tier, notifications_sent)
            VALUES ($1, 'free', 0)
            ON CONFLICT (owner) DO NOTHING
            "#,
        )
        .bind(owner.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET notifications_sent = notifications_sent + 1
            WHERE owner = $1 AND notifications_sent < $2
            "#,
        )
        .bind(owner.to_string())
        .bind(limit as i32)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn sent_count(&self, owner: &OwnerId) -> Result<u32, StoreError> {
        let row = sqlx::query("SELECT notifications_sent FROM accounts WHERE owner = $1")
            .bind(owner.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row
            .map(|r| r.get::<i32, _>("notifications_sent") as u32)
            .unwrap_or(0))
    }

    async fn recent_for_subscription(
        &self,
        subscription_id: Uuid,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, subscription_id, owner, channel, summary, covered, status, created_at
            FROM notification_records
            WHERE subscription_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(subscription_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let owner_raw: String = row.get("owner");
                let owner = OwnerId::parse(&owner_raw)
                    .ok_or_else(|| StoreError::DataFormat(format!("bad owner id: {owner_raw}")))?;

                let status_raw: String = row.get("status");
                let status = DeliveryStatus::parse(&status_raw)
                    .ok_or_else(|| StoreError::DataFormat(format!("bad status: {status_raw}")))?;

                let covered: serde_json::Value = row.get("covered");
                let covered: Vec<DedupKey> = serde_json::from_value(covered)
                    .map_err(|e| StoreError::DataFormat(e.to_string()))?;

                Ok(NotificationRecord {
                    id: row.get("id"),
                    subscription_id: row.get("subscription_id"),
                    owner,
                    channel: row
                        .get::<Option<String>, _>("channel")
                        .as_deref()
                        .and_then(Channel::parse),
                    summary: row.get("summary"),
                    covered,
                    status,
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }
}
