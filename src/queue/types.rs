use std::fmt;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::QueueError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    #[serde(rename = "setImage")]
    SetImage,
    #[serde(rename = "clearImage")]
    ClearImage,
    #[serde(rename = "flash")]
    Flash,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::SetImage => "setImage",
            CommandKind::ClearImage => "clearImage",
            CommandKind::Flash => "flash",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "setImage" => Ok(CommandKind::SetImage),
            "clearImage" => Ok(CommandKind::ClearImage),
            "flash" => Ok(CommandKind::Flash),
            other => Err(QueueError::UnsupportedCommand { kind: other.to_string() }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandStatus::Completed | CommandStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(pub u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg_{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub id: CommandId,
    pub device_id: String,
    pub kind: CommandKind,
    pub status: CommandStatus,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub timed_out: bool,

    // monotonic completion time, drives retention
    #[serde(skip)]
    pub(crate) finished: Option<Instant>,
}

impl CommandRecord {
    pub(crate) fn pending(id: CommandId, device_id: &str, kind: CommandKind) -> Self {
        CommandRecord {
            id,
            device_id: device_id.to_string(),
            kind,
            status: CommandStatus::Pending,
            enqueued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            timed_out: false,
            finished: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        for kind in [CommandKind::SetImage, CommandKind::ClearImage, CommandKind::Flash] {
            assert_eq!(kind.as_str().parse::<CommandKind>().unwrap(), kind);
            assert_eq!(serde_json::to_string(&kind).unwrap(), format!("\"{}\"", kind));
        }
    }

    #[test]
    fn test_unsupported_kind() {
        let err = "reboot".parse::<CommandKind>().unwrap_err();
        assert!(matches!(err, QueueError::UnsupportedCommand { ref kind } if kind == "reboot"));
    }

    #[test]
    fn test_record_json() {
        let record = CommandRecord::pending(CommandId(3), "kitchen", CommandKind::Flash);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"], 3);
        assert_eq!(json["deviceId"], "kitchen");
        assert_eq!(json["kind"], "flash");
        assert_eq!(json["status"], "pending");
        assert!(json.get("finished").is_none());
    }
}
