use core::fmt::{Display, Formatter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    InvalidHandleValue {
        raw_value: u64,
    },
    OsOperationFailed {
        description: &'static str,
        os_code: i64,
    },
    EmptyFilter,
    FilterTooLong {
        instructions: usize,
    },
}

impl Display for PolicyError {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            PolicyError::InvalidHandleValue { raw_value } => {
                write!(f, "invalid file descriptor value {}", raw_value)
            }
            PolicyError::OsOperationFailed {
                description,
                os_code,
            } => write!(f, "{} failed with error {}", description, os_code),
            PolicyError::EmptyFilter => write!(f, "compiled seccomp filter is empty"),
            PolicyError::FilterTooLong { instructions } => {
                write!(
                    f,
                    "compiled seccomp filter has {} instructions, kernel limit is {}",
                    instructions,
                    crate::BPF_MAXINSNS
                )
            }
        }
    }
}
