#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl KernelError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_input_display_carries_message() {
        let err = KernelError::invalid("permission MUST be non-empty");
        assert_eq!(err.to_string(), "invalid input: permission MUST be non-empty");
    }
}
