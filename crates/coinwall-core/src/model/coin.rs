// ── Coin channel identity types ──

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::mac::MacAddress;

const SUBVENDO_PREFIX: &str = "subvendo:";

/// Identifier of a coin-accepting path.
///
/// Renders as `"hardware"` for the main unit, `"subvendo:<id>"` for a
/// networked satellite coin device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ChannelKey {
    Hardware,
    SubVendo(String),
}

impl ChannelKey {
    pub fn subvendo(device_id: impl Into<String>) -> Self {
        Self::SubVendo(device_id.into())
    }

    /// The source label pulses from this channel are booked under.
    pub fn source(&self) -> PulseSource {
        match self {
            Self::Hardware => PulseSource::Hardware,
            Self::SubVendo(id) => PulseSource::SubVendo(id.clone()),
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hardware => f.write_str("hardware"),
            Self::SubVendo(id) => write!(f, "{SUBVENDO_PREFIX}{id}"),
        }
    }
}

/// Returned when a channel key string is neither `hardware` nor `subvendo:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid channel key '{0}': expected 'hardware' or 'subvendo:<id>'")]
pub struct InvalidChannelKey(pub String);

impl FromStr for ChannelKey {
    type Err = InvalidChannelKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "hardware" {
            return Ok(Self::Hardware);
        }
        match s.strip_prefix(SUBVENDO_PREFIX) {
            Some(id) if !id.is_empty() => Ok(Self::SubVendo(id.to_owned())),
            _ => Err(InvalidChannelKey(s.to_owned())),
        }
    }
}

impl TryFrom<String> for ChannelKey {
    type Error = InvalidChannelKey;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ChannelKey> for String {
    fn from(key: ChannelKey) -> Self {
        key.to_string()
    }
}

/// Which physical device a pulse came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum PulseSource {
    Hardware,
    SubVendo(String),
}

impl PulseSource {
    /// Device id used for manual target matching and sale records.
    pub fn device_id(&self) -> &str {
        match self {
            Self::Hardware => "hardware",
            Self::SubVendo(id) => id,
        }
    }
}

impl fmt::Display for PulseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.device_id())
    }
}

impl From<String> for PulseSource {
    fn from(s: String) -> Self {
        if s == "hardware" {
            Self::Hardware
        } else {
            Self::SubVendo(s)
        }
    }
}

impl From<PulseSource> for String {
    fn from(source: PulseSource) -> Self {
        source.device_id().to_owned()
    }
}

/// How a coin session picks the devices whose pulses it accepts.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SelectionMode {
    /// Any source feeding the channel counts.
    #[default]
    Auto,
    /// Only the session's `target_device_id` counts.
    Manual,
}

/// Why a coin session was finalized.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FinalizeReason {
    /// No pulses arrived within the inactivity window.
    Timeout,
    /// The payer pressed "done".
    Done,
    /// The engine is stopping and pending money is flushed.
    Shutdown,
}

/// Read-only view of an in-flight coin session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCoin {
    pub channel: ChannelKey,
    pub mac: MacAddress,
    pub amount: u32,
    /// Greedy preview of the minutes this amount buys.
    pub preview_minutes: u64,
    pub source_amounts: IndexMap<String, u32>,
    pub selection_mode: SelectionMode,
    pub target_device_id: Option<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn channel_key_round_trips_through_display() {
        for raw in ["hardware", "subvendo:esp-01"] {
            let key: ChannelKey = raw.parse().unwrap();
            assert_eq!(key.to_string(), raw);
        }
    }

    #[test]
    fn channel_key_rejects_unknown() {
        assert!("coinslot".parse::<ChannelKey>().is_err());
        assert!("subvendo:".parse::<ChannelKey>().is_err());
    }

    #[test]
    fn subvendo_source_uses_device_id() {
        let key = ChannelKey::subvendo("esp-07");
        assert_eq!(key.source().device_id(), "esp-07");
        assert_eq!(ChannelKey::Hardware.source(), PulseSource::Hardware);
    }

    #[test]
    fn selection_mode_parses() {
        assert_eq!("manual".parse::<SelectionMode>().unwrap(), SelectionMode::Manual);
        assert_eq!(SelectionMode::default(), SelectionMode::Auto);
    }
}
