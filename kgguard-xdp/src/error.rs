use thiserror::Error;

/// Header parse failure. The pipeline resolves every variant to PASS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("truncated frame: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("not IPv4 (ether type {ether_type:#06x})")]
    NotIpv4 { ether_type: u16 },

    #[error("IPv4 header length {ihl} below minimum of 5 words")]
    BadHeaderLength { ihl: u8 },
}

/// Errors from control-plane writes to the shared tables.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("table {table} is full ({capacity} entries)")]
    TableFull { table: &'static str, capacity: usize },

    #[error("invalid IPv4 prefix: {0}")]
    InvalidPrefix(String),
}

impl TableError {
    pub fn invalid_prefix(input: impl Into<String>) -> Self {
        Self::InvalidPrefix(input.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown config key {0}")]
    UnknownKey(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failure() {
        let e = ParseError::NotIpv4 { ether_type: 0x86DD };
        assert_eq!(e.to_string(), "not IPv4 (ether type 0x86dd)");

        let e = TableError::TableFull { table: "white_list", capacity: 2 };
        assert!(e.to_string().contains("white_list"));

        assert_eq!(
            TableError::invalid_prefix("nope").to_string(),
            "invalid IPv4 prefix: nope"
        );
        assert_eq!(ConfigError::UnknownKey(9).to_string(), "unknown config key 9");
    }
}
