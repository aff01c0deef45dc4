//! Database schema management for `beaconflow`.
//!
//! Ensures the registry, telemetry, alarm and audit tables exist before the
//! pipeline starts. Applied once on startup from `main.rs` (EMBP: single
//! gateway call).

use anyhow::Result;
use sqlx::PgPool;
use tracing::debug;

// ---

/// Registry of sites, gateways and known beacons.
const REGISTRY: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS locations (
        id          UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        name        TEXT        NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS gateways (
        id          UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        mac         TEXT        NOT NULL UNIQUE,
        name        TEXT,
        location_id UUID        REFERENCES locations (id),
        is_active   BOOLEAN     NOT NULL DEFAULT TRUE,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS gateway_locations (
        id          UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        gateway_id  UUID        NOT NULL REFERENCES gateways (id) ON DELETE CASCADE,
        location_id UUID        NOT NULL REFERENCES locations (id),
        assigned_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS devices (
        id          UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        ble_mac     TEXT        NOT NULL UNIQUE,
        name        TEXT,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );
    "#,
];

/// Readings history and the per-(device, location) snapshot.
const TELEMETRY: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS device_readings (
        id              UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        device_id       UUID        NOT NULL REFERENCES devices (id) ON DELETE CASCADE,
        gateway_id      UUID        NOT NULL REFERENCES gateways (id),
        location_id     UUID        REFERENCES locations (id),
        rssi            INTEGER,
        adv_type        TEXT,
        raw_data        TEXT,
        battery_voltage DOUBLE PRECISION,
        temperature     DOUBLE PRECISION,
        humidity        DOUBLE PRECISION,
        status          TEXT,
        seen_at         TIMESTAMPTZ NOT NULL,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS device_state_snapshots (
        id              UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        device_id       UUID        NOT NULL REFERENCES devices (id) ON DELETE CASCADE,
        location_id     UUID        REFERENCES locations (id),
        gateway_id      UUID        REFERENCES gateways (id),
        last_seen       TIMESTAMPTZ NOT NULL,
        status          TEXT,
        battery_voltage DOUBLE PRECISION,
        temperature     DOUBLE PRECISION,
        humidity        DOUBLE PRECISION,
        updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );
    "#,
    // One snapshot per pair, with a NULL location treated as a value
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS uq_snapshots_device_location
        ON device_state_snapshots (
            device_id,
            COALESCE(location_id, '00000000-0000-0000-0000-000000000000'::uuid)
        );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_readings_device_location_seen
        ON device_readings (device_id, location_id, seen_at DESC);
    "#,
];

/// Alarm definitions, assignments and the event log.
const ALARMS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS alarms (
        id                UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        name              TEXT        NOT NULL,
        threshold_seconds BIGINT      NOT NULL CHECK (threshold_seconds >= 0),
        is_active         BOOLEAN     NOT NULL DEFAULT TRUE,
        created_at        TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS alarm_devices (
        alarm_id  UUID NOT NULL REFERENCES alarms (id) ON DELETE CASCADE,
        device_id UUID NOT NULL REFERENCES devices (id) ON DELETE CASCADE,
        PRIMARY KEY (alarm_id, device_id)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS alarm_events (
        id           UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        alarm_id     UUID        NOT NULL REFERENCES alarms (id) ON DELETE CASCADE,
        device_id    UUID        NOT NULL REFERENCES devices (id) ON DELETE CASCADE,
        status       TEXT        NOT NULL CHECK (status IN ('triggered', 'resolved')),
        triggered_at TIMESTAMPTZ NOT NULL,
        resolved_at  TIMESTAMPTZ
    );
    "#,
    // At most one open event per (alarm, device)
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS uq_alarm_events_open
        ON alarm_events (alarm_id, device_id)
        WHERE status = 'triggered';
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_snapshots_device_last_seen
        ON device_state_snapshots (device_id, last_seen DESC);
    "#,
];

/// Raw inbound MQTT messages.
const AUDIT: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS mqtt_messages (
        id          BIGSERIAL PRIMARY KEY,
        topic       TEXT        NOT NULL,
        payload     JSONB       NOT NULL,
        received_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_mqtt_messages_topic_received
        ON mqtt_messages (topic, received_at DESC);
    "#,
];

/// Create or update the database schema (idempotent).
///
/// All statements run in one transaction, so a failure leaves the database
/// untouched. Safe to call on every startup.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    for statement in REGISTRY.iter().chain(TELEMETRY).chain(ALARMS).chain(AUDIT) {
        sqlx::query(*statement).execute(&mut *tx).await?;
    }

    tx.commit().await?;
    debug!("schema is up to date");
    Ok(())
}
