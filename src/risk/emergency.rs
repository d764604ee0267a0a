//! Emergency stop flag files.
//!
//! A hidden JSON sentinel at `data/.{id:03}_emergency_stop` marks an
//! account that halted on a critical condition. Its presence alone blocks
//! startup; the operator removes it manually after resolving the cause.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::error;

use crate::config::ACCOUNT_ID_PADDING;
use crate::utils::time::now_helsinki_iso;

/// On-disk flag content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyFlag {
    pub timestamp: String,
    pub account_id: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_data: Option<Value>,
}

/// Filesystem-backed sentinel store, single writer per account.
#[derive(Debug, Clone)]
pub struct EmergencyFlagStore {
    data_dir: PathBuf,
}

impl EmergencyFlagStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    /// Flag path for an account, e.g. `data/.001_emergency_stop`.
    pub fn file_path(&self, account_id: u16) -> PathBuf {
        self.data_dir.join(format!(
            ".{:0width$}_emergency_stop",
            account_id,
            width = ACCOUNT_ID_PADDING
        ))
    }

    pub fn exists(&self, account_id: u16) -> bool {
        self.file_path(account_id).exists()
    }

    /// Read the flag; `None` when absent or unreadable.
    pub fn read(&self, account_id: u16) -> Option<EmergencyFlag> {
        let raw = fs::read_to_string(self.file_path(account_id)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Write the flag. The account must not restart until the operator
    /// removes the file.
    pub fn create(
        &self,
        account_id: u16,
        symbol: Option<&str>,
        reason: &str,
        additional_data: Option<Value>,
    ) -> Result<()> {
        fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("creating {}", self.data_dir.display()))?;

        let flag = EmergencyFlag {
            timestamp: now_helsinki_iso(),
            account_id,
            symbol: symbol.map(str::to_string),
            reason: reason.to_string(),
            additional_data,
        };

        let path = self.file_path(account_id);
        let json = serde_json::to_string_pretty(&flag)?;
        fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;

        error!(
            "🚨 [{}] EMERGENCY STOP FLAG CREATED: {}\n   Reason: {}\n   The account will not restart automatically. Fix issues and remove the file: rm {}",
            symbol.unwrap_or("account"),
            path.display(),
            reason,
            path.display()
        );
        Ok(())
    }

    /// Refuse startup while a flag exists (including a corrupted one).
    pub fn ensure_clear(&self, account_id: u16, account_name: &str) -> Result<()> {
        let path = self.file_path(account_id);
        if !path.exists() {
            return Ok(());
        }

        match self.read(account_id) {
            Some(flag) => anyhow::bail!(
                "account {:0width$} ({}) has an emergency stop flag\n   File: {}\n   Timestamp: {}\n   Reason: {}\n   Symbol: {}\n   Fix issues and remove the file: rm {}",
                account_id,
                account_name,
                path.display(),
                flag.timestamp,
                flag.reason,
                flag.symbol.as_deref().unwrap_or("N/A"),
                path.display(),
                width = ACCOUNT_ID_PADDING
            ),
            None => anyhow::bail!(
                "account {:0width$} has a corrupted emergency stop file: {}\n   Remove it manually: rm {}",
                account_id,
                path.display(),
                path.display(),
                width = ACCOUNT_ID_PADDING
            ),
        }
    }

    /// Manual/test cleanup; the bot never removes its own flag.
    pub fn remove(&self, account_id: u16) -> Result<()> {
        let path = self.file_path(account_id);
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flag_path_is_hidden_and_padded() {
        let store = EmergencyFlagStore::new("data");
        assert_eq!(
            store.file_path(1),
            PathBuf::from("data/.001_emergency_stop")
        );
        assert_eq!(
            store.file_path(42),
            PathBuf::from("data/.042_emergency_stop")
        );
    }

    #[test]
    fn test_create_read_blocks_startup() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmergencyFlagStore::new(dir.path());

        assert!(store.ensure_clear(7, "test").is_ok());
        store
            .create(7, Some("SOLUSDT"), "Position liquidated", Some(json!({"pnl": "-5.0"})))
            .unwrap();

        assert!(store.exists(7));
        let flag = store.read(7).unwrap();
        assert_eq!(flag.account_id, 7);
        assert_eq!(flag.symbol.as_deref(), Some("SOLUSDT"));
        assert_eq!(flag.reason, "Position liquidated");

        let err = store.ensure_clear(7, "test").unwrap_err();
        assert!(err.to_string().contains("emergency stop flag"));

        store.remove(7).unwrap();
        assert!(store.ensure_clear(7, "test").is_ok());
    }

    #[test]
    fn test_corrupted_flag_still_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmergencyFlagStore::new(dir.path());
        fs::write(store.file_path(3), "{not json").unwrap();
        let err = store.ensure_clear(3, "test").unwrap_err();
        assert!(err.to_string().contains("corrupted"));
    }
}
