//! PostgreSQL implementation of the store traits.
//!
//! Table shapes are created by [`crate::schema::create_schema`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use uuid::Uuid;

use super::{ReconcileTx, StoreError, StoreResult, TelemetryStore};
use crate::models::{
    AlarmAssignment, AlarmEventStatus, Device, Gateway, HistoryEntry, LocatedDeviceState,
    LocationGroup, NewReading, NewSnapshot, Reading, ReadingUpdate, Snapshot, SnapshotUpdate,
};

// ---

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub struct PgReconcileTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl TelemetryStore for PgStore {
    async fn record_message(&self, topic: &str, payload: &Value) -> StoreResult<()> {
        // ---
        sqlx::query("INSERT INTO mqtt_messages (topic, payload) VALUES ($1, $2)")
            .bind(topic)
            .bind(Json(payload))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_active_gateway(&self, mac: &str) -> StoreResult<Option<Gateway>> {
        // ---
        let gateway = sqlx::query_as::<_, Gateway>(
            r#"
            SELECT g.id, g.mac, g.name, g.is_active,
                   COALESCE(
                       g.location_id,
                       (SELECT gl.location_id
                          FROM gateway_locations gl
                         WHERE gl.gateway_id = g.id
                         ORDER BY gl.assigned_at DESC
                         LIMIT 1)
                   ) AS effective_location_id
              FROM gateways g
             WHERE g.mac = $1 AND g.is_active = TRUE
             LIMIT 1
            "#,
        )
        .bind(mac)
        .fetch_optional(&self.pool)
        .await?;

        Ok(gateway)
    }

    async fn find_device(&self, ble_mac: &str) -> StoreResult<Option<Device>> {
        // ---
        let device =
            sqlx::query_as::<_, Device>("SELECT id, ble_mac, name FROM devices WHERE ble_mac = $1")
                .bind(ble_mac)
                .fetch_optional(&self.pool)
                .await?;

        Ok(device)
    }

    async fn begin(&self) -> StoreResult<Box<dyn ReconcileTx>> {
        // ---
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgReconcileTx { tx }))
    }

    async fn alarm_assignments(&self) -> StoreResult<Vec<AlarmAssignment>> {
        // ---
        let rows = sqlx::query_as::<_, AlarmAssignment>(
            r#"
            SELECT a.id AS alarm_id, a.name AS alarm_name, a.threshold_seconds, ad.device_id
              FROM alarms a
              JOIN alarm_devices ad ON ad.alarm_id = a.id
             WHERE a.is_active = TRUE
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn latest_last_seen(&self, device_id: Uuid) -> StoreResult<Option<DateTime<Utc>>> {
        // ---
        let last_seen = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MAX(last_seen) FROM device_state_snapshots WHERE device_id = $1",
        )
        .bind(device_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(last_seen)
    }

    async fn open_alarm_event(
        &self,
        alarm_id: Uuid,
        device_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        // ---
        // The partial unique index on open events turns a duplicate into a no-op
        let result = sqlx::query(
            r#"
            INSERT INTO alarm_events (alarm_id, device_id, status, triggered_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(alarm_id)
        .bind(device_id)
        .bind(AlarmEventStatus::Triggered.as_str())
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn devices_by_location(&self) -> StoreResult<Vec<LocationGroup>> {
        // ---
        let rows = sqlx::query_as::<_, LocatedDeviceState>(
            r#"
            SELECT s.location_id, l.name AS location_name,
                   d.id, d.name, d.ble_mac, s.last_seen,
                   s.battery_voltage, s.temperature, s.humidity, s.status
              FROM device_state_snapshots s
              JOIN devices d ON d.id = s.device_id
              LEFT JOIN locations l ON l.id = s.location_id
             ORDER BY l.name ASC NULLS LAST, s.location_id ASC NULLS LAST, s.last_seen DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(LocationGroup::group(rows))
    }

    async fn device_history(&self, device_id: Uuid, limit: i64) -> StoreResult<Vec<HistoryEntry>> {
        // ---
        let entries = sqlx::query_as::<_, HistoryEntry>(
            r#"
            SELECT r.id, r.device_id, r.gateway_id, r.location_id, r.rssi, r.adv_type,
                   r.raw_data, r.battery_voltage, r.temperature, r.humidity, r.status,
                   r.seen_at, g.name AS gateway_name, l.name AS location_name
              FROM device_readings r
              LEFT JOIN gateways g ON g.id = r.gateway_id
              LEFT JOIN locations l ON l.id = r.location_id
             WHERE r.device_id = $1
             ORDER BY r.seen_at DESC
             LIMIT $2
            "#,
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }
}

#[async_trait]
impl ReconcileTx for PgReconcileTx {
    async fn lock_pair(&mut self, device_id: Uuid, location_id: Option<Uuid>) -> StoreResult<()> {
        // ---
        let key = format!("{}:{}", device_id, location_id.unwrap_or_default());
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(key)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn latest_reading(
        &mut self,
        device_id: Uuid,
        location_id: Option<Uuid>,
    ) -> StoreResult<Option<Reading>> {
        // ---
        let reading = sqlx::query_as::<_, Reading>(
            r#"
            SELECT id, device_id, gateway_id, location_id, rssi, adv_type, raw_data,
                   battery_voltage, temperature, humidity, status, seen_at
              FROM device_readings
             WHERE device_id = $1 AND location_id IS NOT DISTINCT FROM $2
             ORDER BY seen_at DESC
             LIMIT 1
            "#,
        )
        .bind(device_id)
        .bind(location_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(reading)
    }

    async fn snapshot(
        &mut self,
        device_id: Uuid,
        location_id: Option<Uuid>,
    ) -> StoreResult<Option<Snapshot>> {
        // ---
        let snapshot = sqlx::query_as::<_, Snapshot>(
            r#"
            SELECT id, device_id, location_id, gateway_id, last_seen, status,
                   battery_voltage, temperature, humidity
              FROM device_state_snapshots
             WHERE device_id = $1 AND location_id IS NOT DISTINCT FROM $2
             LIMIT 1
            "#,
        )
        .bind(device_id)
        .bind(location_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(snapshot)
    }

    async fn insert_reading(&mut self, reading: &NewReading) -> StoreResult<Uuid> {
        // ---
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO device_readings (
                device_id, gateway_id, location_id, rssi, adv_type, raw_data,
                battery_voltage, temperature, humidity, status, seen_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id
            "#,
        )
        .bind(reading.device_id)
        .bind(reading.gateway_id)
        .bind(reading.location_id)
        .bind(reading.rssi)
        .bind(&reading.adv_type)
        .bind(&reading.raw_data)
        .bind(reading.battery_voltage)
        .bind(reading.temperature)
        .bind(reading.humidity)
        .bind(&reading.status)
        .bind(reading.seen_at)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(id)
    }

    async fn update_reading(&mut self, id: Uuid, update: &ReadingUpdate) -> StoreResult<()> {
        // ---
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE device_readings SET ");
        {
            let mut set = qb.separated(", ");
            if let Some(v) = update.gateway_id {
                set.push("gateway_id = ").push_bind_unseparated(v);
            }
            if let Some(v) = update.location_id {
                set.push("location_id = ").push_bind_unseparated(v);
            }
            if let Some(v) = update.rssi {
                set.push("rssi = ").push_bind_unseparated(v);
            }
            if let Some(v) = &update.adv_type {
                set.push("adv_type = ").push_bind_unseparated(v.clone());
            }
            if let Some(v) = &update.raw_data {
                set.push("raw_data = ").push_bind_unseparated(v.clone());
            }
            if let Some(v) = update.battery_voltage {
                set.push("battery_voltage = ").push_bind_unseparated(v);
            }
            if let Some(v) = update.temperature {
                set.push("temperature = ").push_bind_unseparated(v);
            }
            if let Some(v) = update.humidity {
                set.push("humidity = ").push_bind_unseparated(v);
            }
            if let Some(v) = &update.status {
                set.push("status = ").push_bind_unseparated(v.clone());
            }
            if let Some(v) = update.seen_at {
                set.push("seen_at = ").push_bind_unseparated(v);
            }
            set.push("updated_at = NOW()");
        }
        qb.push(" WHERE id = ").push_bind(id);

        let result = qb.build().execute(&mut *self.tx).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "reading",
                id,
            });
        }
        Ok(())
    }

    async fn insert_snapshot(&mut self, snapshot: &NewSnapshot) -> StoreResult<Uuid> {
        // ---
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO device_state_snapshots (
                device_id, location_id, gateway_id, last_seen, status,
                battery_voltage, temperature, humidity
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(snapshot.device_id)
        .bind(snapshot.location_id)
        .bind(snapshot.gateway_id)
        .bind(snapshot.last_seen)
        .bind(&snapshot.status)
        .bind(snapshot.battery_voltage)
        .bind(snapshot.temperature)
        .bind(snapshot.humidity)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(id)
    }

    async fn update_snapshot(&mut self, id: Uuid, update: &SnapshotUpdate) -> StoreResult<()> {
        // ---
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE device_state_snapshots SET ");
        {
            let mut set = qb.separated(", ");
            if let Some(v) = update.gateway_id {
                set.push("gateway_id = ").push_bind_unseparated(v);
            }
            if let Some(v) = update.last_seen {
                set.push("last_seen = ").push_bind_unseparated(v);
            }
            if let Some(v) = &update.status {
                set.push("status = ").push_bind_unseparated(v.clone());
            }
            if let Some(v) = update.battery_voltage {
                set.push("battery_voltage = ").push_bind_unseparated(v);
            }
            if let Some(v) = update.temperature {
                set.push("temperature = ").push_bind_unseparated(v);
            }
            if let Some(v) = update.humidity {
                set.push("humidity = ").push_bind_unseparated(v);
            }
            set.push("updated_at = NOW()");
        }
        qb.push(" WHERE id = ").push_bind(id);

        let result = qb.build().execute(&mut *self.tx).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "snapshot",
                id,
            });
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        // ---
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        // ---
        self.tx.rollback().await?;
        Ok(())
    }
}
