use serde::{Deserialize, Serialize};

/// A process-status object serialized over the comms channel, used by the
/// sandboxee to report structured setup failures to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStatus {
    pub code: i32,
    pub message: String,
}

impl RemoteStatus {
    pub fn ok() -> Self {
        Self {
            code: 0,
            message: String::new(),
        }
    }

    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}
