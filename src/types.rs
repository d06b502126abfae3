use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// A registered push-notification target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub transport_identifier: String,
    pub delivery_key: Option<String>,
}

impl Device {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Device {
            device_id: row.get("device_id")?,
            transport_identifier: row.get("transport_identifier")?,
            delivery_key: row.get("delivery_key")?,
        })
    }
}

/// One push-delivery attempt, joined to the device it targeted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub event_id: String,
    pub transaction_id: String,
    pub device: Device,
}

impl TransactionRecord {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(TransactionRecord {
            event_id: row.get("event_id")?,
            transaction_id: row.get("transaction_id")?,
            device: Device::from_row(row)?,
        })
    }
}
