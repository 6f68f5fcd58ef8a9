use serde::{Deserialize, Serialize};

use crate::TicketId;

/// Human-visible ticket identifier.
///
/// Local protocols are `LOC` plus the six-digit zero-padded ticket id;
/// upstream protocols are carried through exactly as HubSoft returned them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Local(TicketId),
    Hubsoft(String),
}

impl Protocol {
    pub fn local(id: TicketId) -> Self {
        Protocol::Local(id)
    }

    pub fn hubsoft(raw: impl Into<String>) -> Self {
        Protocol::Hubsoft(raw.into())
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Local(id) => write!(f, "LOC{:06}", id.0),
            Protocol::Hubsoft(raw) => f.write_str(raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_protocol_is_zero_padded() {
        assert_eq!(Protocol::local(TicketId(1)).to_string(), "LOC000001");
        assert_eq!(Protocol::local(TicketId(123)).to_string(), "LOC000123");
        assert_eq!(Protocol::local(TicketId(1_000_000)).to_string(), "LOC1000000");
    }

    #[test]
    fn hubsoft_protocol_passes_through() {
        assert_eq!(Protocol::hubsoft("2024010112345").to_string(), "2024010112345");
    }
}
