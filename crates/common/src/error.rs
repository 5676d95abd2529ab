//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::Channel("worker gone".into()).to_string(),
            "Channel error: worker gone"
        );
        assert_eq!(
            Error::Config("bad filter".into()).to_string(),
            "Configuration error: bad filter"
        );
    }
}
