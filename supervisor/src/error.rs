use cordon_comms::CommsError;
use core::fmt::{Display, Formatter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    /// await_result_with_timeout() gave up before the monitor finished.
    DeadlineExceeded,
    Comms(CommsError),
    OsOperationFailed {
        description: &'static str,
        os_code: i64,
    },
    KernelFeatureUnavailable {
        description: &'static str,
    },
}

impl Display for SupervisorError {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            SupervisorError::DeadlineExceeded => {
                write!(f, "timed out waiting for the monitor to finish")
            }
            SupervisorError::Comms(e) => write!(f, "comms failure: {}", e),
            SupervisorError::OsOperationFailed {
                description,
                os_code,
            } => write!(f, "{} failed with error {}", description, os_code),
            SupervisorError::KernelFeatureUnavailable { description } => {
                write!(f, "kernel feature unavailable: {}", description)
            }
        }
    }
}

impl From<CommsError> for SupervisorError {
    fn from(err: CommsError) -> Self {
        Self::Comms(err)
    }
}
