use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, OptionalExtension};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::{Result, StoreError};
use crate::migrations::{apply_migrations, current_schema_version};
use crate::types::{Device, TransactionRecord};

/// Connection options recognized at open time.
///
/// None of these change the store's observable contract; the default is
/// the empty configuration.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// How long the engine waits on a locked database before failing.
    pub busy_timeout: Option<Duration>,
}

/// The registry store. Owns one connection to the backing SQLite file and
/// exposes every entity operation on it.
pub struct RegistryStore {
    connection: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl RegistryStore {
    /// Open (creating if necessary) the registry database at `path`.
    pub async fn open(path: PathBuf) -> Result<Self> {
        Self::open_with_options(path, StoreOptions::default()).await
    }

    /// Open the registry database at `path` with explicit options.
    pub async fn open_with_options(path: PathBuf, options: StoreOptions) -> Result<Self> {
        // Ensure the directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        log::info!("Opening registry store at: {:?}", path);

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(|e| {
            StoreError::Unavailable(format!("could not open database file {:?}: {}", path, e))
        })?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::apply_options(&conn, &options)?;

        Ok(RegistryStore {
            connection: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Open an in-memory registry store. The data does not outlive the
    /// connection; mainly useful for tests.
    pub async fn open_in_memory() -> Result<Self> {
        log::info!("Opening in-memory registry store");

        let conn = Connection::open_in_memory().map_err(|e| {
            StoreError::Unavailable(format!("could not open in-memory database: {}", e))
        })?;

        Ok(RegistryStore {
            connection: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    fn apply_options(conn: &Connection, options: &StoreOptions) -> Result<()> {
        if let Some(timeout) = options.busy_timeout {
            conn.busy_timeout(timeout)?;
        }
        Ok(())
    }

    /// Get the backing database path
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Initialize the schema if this database has never been set up.
    ///
    /// Safe to call on every process start: an uninitialized database gets
    /// the full schema atomically, an initialized one is left untouched.
    pub async fn setup(&self) -> Result<()> {
        self.with_connection(|conn| {
            if let Err(e) = apply_migrations(conn) {
                log::error!("Failed to apply migrations: {}", e);
                return Err(e);
            }
            Ok(())
        })
        .await
    }

    /// Read the schema version recorded in the database (0 = never set up).
    pub async fn schema_version(&self) -> Result<i32> {
        self.with_connection(current_schema_version).await
    }

    /// Health check - ensure the connection is usable
    pub async fn health_check(&self) -> Result<()> {
        let conn = self.connection.lock().await;
        match conn.query_row("SELECT 1", [], |_| Ok(())) {
            Ok(()) => Ok(()),
            Err(e) => {
                log::error!("Health check failed: {}", e);
                Err(StoreError::Unavailable(format!(
                    "health check failed: {}",
                    e
                )))
            }
        }
    }

    /// Close the store, releasing the connection.
    ///
    /// Takes the store by value, so every in-flight operation has completed
    /// (or failed) before the connection goes away.
    pub async fn close(self) -> Result<()> {
        let RegistryStore { connection, path } = self;
        let mutex = Arc::try_unwrap(connection).map_err(|_| {
            StoreError::Unavailable("connection is still shared, cannot close".to_string())
        })?;
        mutex
            .into_inner()
            .close()
            .map_err(|(_conn, e)| StoreError::Sqlite(e))?;

        log::info!("Closed registry store at: {:?}", path);
        Ok(())
    }

    /// Execute a closure with the owned connection
    async fn with_connection<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send,
        R: Send,
    {
        let conn = self.connection.lock().await;
        f(&*conn)
    }

    // ========== Device Methods ==========

    /// Register a device, inserting it on first sight and overwriting its
    /// transport identifier and delivery key on re-registration. The device
    /// id itself is never rewritten.
    ///
    /// The existence check and the write are two separate statements. Two
    /// stores sharing one database file can both observe "absent" and race
    /// their inserts, with the primary key failing the loser; callers must
    /// not assume the upsert is atomic across store instances.
    pub async fn register_device(
        &self,
        device_id: &str,
        transport_identifier: &str,
        delivery_key: Option<&str>,
    ) -> Result<()> {
        self.with_connection(|conn| {
            let exists = conn
                .query_row(
                    "SELECT 1 FROM Device WHERE device_id = ?1",
                    [device_id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();

            if exists {
                conn.execute(
                    "UPDATE Device SET transport_identifier = ?1, delivery_key = ?2
                     WHERE device_id = ?3",
                    rusqlite::params![transport_identifier, delivery_key, device_id],
                )?;
                log::info!("Updated device: {}", device_id);
            } else {
                conn.execute(
                    "INSERT INTO Device (device_id, transport_identifier, delivery_key)
                     VALUES (?1, ?2, ?3)",
                    rusqlite::params![device_id, transport_identifier, delivery_key],
                )?;
                log::info!("Registered device: {}", device_id);
            }

            Ok(())
        })
        .await
    }

    /// Fetch a single device by id.
    ///
    /// A missing row is `StoreError::DeviceNotFound`, a distinct error kind
    /// callers branch on; engine failures pass through unchanged.
    pub async fn fetch_device(&self, device_id: &str) -> Result<Device> {
        self.with_connection(|conn| {
            let device = conn
                .query_row(
                    "SELECT device_id, transport_identifier, delivery_key
                     FROM Device WHERE device_id = ?1",
                    [device_id],
                    Device::from_row,
                )
                .optional()?;

            device.ok_or_else(|| StoreError::DeviceNotFound(device_id.to_string()))
        })
        .await
    }

    // ========== User-Device Association Methods ==========

    /// Associate a device with a user.
    ///
    /// Returns `true` when the pair was inserted and `false` when it was
    /// already present (no write). After a successful return the pair
    /// exists exactly once. Subject to the same cross-instance insert race
    /// as `register_device`.
    pub async fn associate_device(&self, device_id: &str, user_id: &str) -> Result<bool> {
        self.with_connection(|conn| {
            let pair_exists: bool = conn.query_row(
                "SELECT COUNT(*) > 0 FROM UserDevice WHERE device_id = ?1 AND user_id = ?2",
                rusqlite::params![device_id, user_id],
                |row| row.get(0),
            )?;

            if pair_exists {
                log::debug!(
                    "Device {} already associated with user {}",
                    device_id,
                    user_id
                );
                return Ok(false);
            }

            conn.execute(
                "INSERT INTO UserDevice (device_id, user_id) VALUES (?1, ?2)",
                rusqlite::params![device_id, user_id],
            )?;

            log::info!("Associated device {} with user {}", device_id, user_id);
            Ok(true)
        })
        .await
    }

    /// Remove the association between a device and a user.
    ///
    /// Returns `true` when a pair was deleted; removing an absent pair is a
    /// successful no-op returning `false`.
    pub async fn dissociate_device(&self, device_id: &str, user_id: &str) -> Result<bool> {
        self.with_connection(|conn| {
            let deleted = conn.execute(
                "DELETE FROM UserDevice WHERE device_id = ?1 AND user_id = ?2",
                rusqlite::params![device_id, user_id],
            )?;

            if deleted > 0 {
                log::info!("Dissociated device {} from user {}", device_id, user_id);
            } else {
                log::debug!(
                    "No association between device {} and user {} to remove",
                    device_id,
                    user_id
                );
            }

            Ok(deleted > 0)
        })
        .await
    }

    /// Fetch the set of devices associated with a user.
    ///
    /// Duplicate association rows collapse to one entry per device id. The
    /// result carries no ordering guarantee; a user with no associations
    /// yields an empty vec.
    pub async fn fetch_devices_for_user(&self, user_id: &str) -> Result<Vec<Device>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT Device.device_id, Device.transport_identifier, Device.delivery_key
                 FROM Device
                 INNER JOIN UserDevice ON Device.device_id = UserDevice.device_id
                 WHERE UserDevice.user_id = ?1",
            )?;

            let rows = stmt
                .query_map([user_id], Device::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut seen = HashSet::new();
            let devices: Vec<Device> = rows
                .into_iter()
                .filter(|device| seen.insert(device.device_id.clone()))
                .collect();

            log::debug!("Found {} device(s) for user {}", devices.len(), user_id);
            Ok(devices)
        })
        .await
    }

    // ========== Push Transaction Methods ==========

    /// Create a push transaction for an event/device pair and return the
    /// generated transaction id.
    ///
    /// Every call inserts a new row; the same pair may accumulate any
    /// number of transactions. On insert failure the generated id is
    /// discarded along with the error.
    pub async fn create_transaction(&self, event_id: &str, device_id: &str) -> Result<String> {
        let transaction_id = Uuid::new_v4().to_string();

        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO PushTransaction (transaction_id, event_id, device_id)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![transaction_id, event_id, device_id],
            )?;

            log::info!(
                "Created transaction {} for event {} and device {}",
                transaction_id,
                event_id,
                device_id
            );
            Ok(())
        })
        .await?;

        Ok(transaction_id)
    }

    /// Fetch every transaction recorded for an event, each joined to its
    /// target device.
    ///
    /// The join is inner: a transaction whose device row is missing (never
    /// registered, or removed out of band) is dropped from the result. No
    /// ordering guarantee.
    pub async fn fetch_transactions_for_event(
        &self,
        event_id: &str,
    ) -> Result<Vec<TransactionRecord>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT PushTransaction.event_id, PushTransaction.transaction_id,
                        Device.device_id, Device.transport_identifier, Device.delivery_key
                 FROM PushTransaction
                 INNER JOIN Device ON PushTransaction.device_id = Device.device_id
                 WHERE PushTransaction.event_id = ?1",
            )?;

            let records = stmt
                .query_map([event_id], TransactionRecord::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            log::debug!(
                "Found {} transaction(s) for event {}",
                records.len(),
                event_id
            );
            Ok(records)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_store_creation() {
        let _ = env_logger::try_init();
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("registry.db");

        let store = RegistryStore::open(db_path).await.unwrap();
        assert!(store.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_open_with_busy_timeout() {
        let _ = env_logger::try_init();
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("registry.db");

        let options = StoreOptions {
            busy_timeout: Some(Duration::from_millis(250)),
        };
        let store = RegistryStore::open_with_options(db_path, options)
            .await
            .unwrap();
        assert!(store.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_releases_connection() {
        let _ = env_logger::try_init();
        let store = RegistryStore::open_in_memory().await.unwrap();
        store.setup().await.unwrap();
        store.close().await.unwrap();
    }

    #[test]
    fn in_memory_store_reports_memory_path() {
        let store = tokio_test::block_on(RegistryStore::open_in_memory()).unwrap();
        assert_eq!(store.path(), &PathBuf::from(":memory:"));
    }
}
