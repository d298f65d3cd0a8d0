/// File-backed side channel shared with the watcher process.
///
/// Two kinds of content live under the store root:
/// - data records (`data/<name>.json`): flat JSON objects of key/value
///   pairs, rewritten atomically on every update;
/// - message inboxes (`msg/<recipient>/<process>`): append-only JSON lines,
///   read incrementally by their owner.
use crate::errors::{StoreError, StoreResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Keys written by the agent into its status record.
pub mod keys {
    pub const HEARTBEAT: &str = "heartbeat";
    pub const VERSION: &str = "version";
    pub const IS_NEW: &str = "is_new";
    pub const DELEGATE_ID: &str = "delegate_id";
    pub const RESTART_NEEDED: &str = "restart_needed";
    pub const UPGRADE_PENDING: &str = "upgrade_pending";
    pub const UPGRADE_NEEDED: &str = "upgrade_needed";
    pub const SHUTDOWN_PENDING: &str = "shutdown_pending";
    pub const SHUTDOWN_STARTED: &str = "shutdown_started";
    pub const SELF_DESTRUCT: &str = "self_destruct";
    pub const MIGRATE: &str = "migrate";
    /// Watcher record keys
    pub const WATCHER_HEARTBEAT: &str = "heartbeat";
    pub const WATCHER_VERSION: &str = "version";
    pub const WATCHER_PROCESS: &str = "process";
}

/// Messages exchanged with the watcher.
pub mod messages {
    pub const STOP_ACQUIRING: &str = "STOP_ACQUIRING";
    pub const RESUME: &str = "RESUME";
    pub const GO_AHEAD: &str = "GO_AHEAD";
    pub const DELEGATE_STARTED: &str = "DELEGATE_STARTED";
}

/// Record name under which the watcher publishes its own status.
pub const WATCHER_DATA: &str = "watcher-data";

/// Value written for the delegate id before registration completes.
pub const UNREGISTERED: &str = "Unregistered";

/// Which side of the channel a process is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessengerType {
    Delegate,
    Watcher,
}

impl MessengerType {
    fn dir_name(self) -> &'static str {
        match self {
            MessengerType::Delegate => "delegate",
            MessengerType::Watcher => "watcher",
        }
    }
}

/// One line of an inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub from: MessengerType,
    pub from_process: String,
    pub message: String,
    #[serde(default)]
    pub params: Vec<String>,
    pub timestamp: i64,
}

pub struct MessageStore {
    root: PathBuf,
    owner: MessengerType,
    process_id: String,
    /// Byte offset already consumed in our inbox
    read_offset: Mutex<u64>,
    /// Serializes read-modify-write of data records within this process
    data_lock: Mutex<()>,
}

impl MessageStore {
    /// Opens (creating if needed) a store rooted at `root` for `owner`.
    pub fn open(root: impl Into<PathBuf>, owner: MessengerType, process_id: impl Into<String>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("data"))?;
        fs::create_dir_all(root.join("msg").join(owner.dir_name()))?;
        Ok(MessageStore {
            root,
            owner,
            process_id: process_id.into(),
            read_offset: Mutex::new(0),
            data_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    fn data_path(&self, name: &str) -> PathBuf {
        self.root.join("data").join(format!("{}.json", name))
    }

    fn inbox_path(&self, recipient: MessengerType, process_id: &str) -> PathBuf {
        self.root
            .join("msg")
            .join(recipient.dir_name())
            .join(process_id)
    }

    // ============================================================================
    // DATA RECORDS
    // ============================================================================

    /// Reads a record. A missing record reads as empty.
    pub fn get_data(&self, name: &str) -> StoreResult<Map<String, Value>> {
        let path = self.data_path(name);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&content)? {
            Value::Object(map) => Ok(map),
            other => Err(StoreError::Corrupt {
                name: name.to_string(),
                reason: format!("expected object, found {}", other),
            }),
        }
    }

    pub fn get_value(&self, name: &str, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.get_data(name)?.remove(key))
    }

    /// Merges `entries` into a record.
    pub fn put_all_data(&self, name: &str, entries: Map<String, Value>) -> StoreResult<()> {
        let _guard = self.data_lock.lock();
        let mut data = self.get_data(name)?;
        data.extend(entries);
        self.write_record(name, &data)
    }

    pub fn put_data(&self, name: &str, key: &str, value: impl Into<Value>) -> StoreResult<()> {
        let mut entries = Map::new();
        entries.insert(key.to_string(), value.into());
        self.put_all_data(name, entries)
    }

    /// Replaces the whole record with `entries`.
    pub fn replace_data(&self, name: &str, entries: Map<String, Value>) -> StoreResult<()> {
        let _guard = self.data_lock.lock();
        self.write_record(name, &entries)
    }

    pub fn remove_data(&self, name: &str, key: &str) -> StoreResult<()> {
        let _guard = self.data_lock.lock();
        let mut data = self.get_data(name)?;
        if data.remove(key).is_some() {
            self.write_record(name, &data)?;
        }
        Ok(())
    }

    /// Deletes a record.
    pub fn close_data(&self, name: &str) -> StoreResult<()> {
        match fs::remove_file(self.data_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_record(&self, name: &str, data: &Map<String, Value>) -> StoreResult<()> {
        let path = self.data_path(name);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(data)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    // ============================================================================
    // MESSAGES
    // ============================================================================

    /// Appends a message to another process's inbox.
    pub fn write_message(
        &self,
        recipient: MessengerType,
        process_id: &str,
        message: &str,
        params: &[&str],
    ) -> StoreResult<()> {
        let path = self.inbox_path(recipient, process_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let line = Message {
            from: self.owner,
            from_process: self.process_id.clone(),
            message: message.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        let mut encoded = serde_json::to_string(&line)?;
        encoded.push('\n');

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(encoded.as_bytes())?;
        debug!("Wrote message {} to {}", message, path.display());
        Ok(())
    }

    /// Returns messages appended to our inbox since the previous call.
    pub fn read_messages(&self) -> StoreResult<Vec<Message>> {
        let path = self.inbox_path(self.owner, &self.process_id);
        let mut file = match OpenOptions::new().read(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut offset = self.read_offset.lock();
        let len = file.metadata()?.len();
        if len < *offset {
            // Inbox was truncated or recreated
            *offset = 0;
        }
        file.seek(SeekFrom::Start(*offset))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        // Only consume complete lines; a partial tail is read next time
        let consumed = buf.iter().rposition(|&b| b == b'\n').map(|i| i + 1).unwrap_or(0);
        let mut messages = Vec::new();
        for raw in buf[..consumed].split(|&b| b == b'\n') {
            let line = String::from_utf8_lossy(raw);
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(&line) {
                Ok(message) => messages.push(message),
                Err(e) => warn!("Skipping malformed message line: {}", e),
            }
        }
        *offset += consumed as u64;
        Ok(messages)
    }

    /// Removes our inbox.
    pub fn close_channel(&self) -> StoreResult<()> {
        let path = self.inbox_path(self.owner, &self.process_id);
        *self.read_offset.lock() = 0;
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
