//! Per-nest event bus vocabulary.
//!
//! Every state change is announced on the nest's pub/sub channel as one of
//! the plaintext, pipe-delimited messages below. WebSocket sessions and the
//! SSE adapter parse these back into typed events for clients; anything that
//! does not parse is ignored by consumers.

use std::fmt;

/// Returns the pub/sub channel name for a nest.
pub fn channel(nest_id: &str) -> String {
    format!("NEST:{nest_id}|MISC|update-pubsub")
}

/// The closed set of messages carried on a nest's update channel.
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    /// Queue membership changed; subscribers should re-fetch.
    PlaylistUpdate,
    /// Playhead changed track, pause state, or jam count.
    NowPlayingUpdate,
    /// Per-second position tick.
    Position {
        src: String,
        trackid: String,
        elapsed: u32,
    },
    /// Volume changed (0-100).
    Volume(u8),
    /// Airhorn fire event. Volume is carried verbatim (e.g. "0.4").
    Airhorn { volume: String, name: String },
    /// One participant's free-airhorn count changed.
    FreeHornUpdate,
    /// Membership count changed.
    MemberUpdate(u64),
}

impl BusMessage {
    /// Parses a raw channel payload. Returns `None` for unknown messages.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "playlist_update" => return Some(Self::PlaylistUpdate),
            "now_playing_update" => return Some(Self::NowPlayingUpdate),
            "update_freehorn" => return Some(Self::FreeHornUpdate),
            _ => {}
        }
        if let Some(rest) = raw.strip_prefix("pp|") {
            let mut parts = rest.splitn(3, '|');
            let src = parts.next()?.to_string();
            let trackid = parts.next()?.to_string();
            let elapsed = parts.next()?.parse().ok()?;
            return Some(Self::Position {
                src,
                trackid,
                elapsed,
            });
        }
        if let Some(rest) = raw.strip_prefix("v|") {
            return rest.parse().ok().map(Self::Volume);
        }
        if let Some(rest) = raw.strip_prefix("do_airhorn|") {
            let (volume, name) = rest.split_once('|')?;
            return Some(Self::Airhorn {
                volume: volume.to_string(),
                name: name.to_string(),
            });
        }
        if let Some(rest) = raw.strip_prefix("member_update|") {
            return rest.parse().ok().map(Self::MemberUpdate);
        }
        None
    }

    /// Encodes the message for publishing.
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for BusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PlaylistUpdate => write!(f, "playlist_update"),
            Self::NowPlayingUpdate => write!(f, "now_playing_update"),
            Self::Position {
                src,
                trackid,
                elapsed,
            } => write!(f, "pp|{src}|{trackid}|{elapsed}"),
            Self::Volume(vol) => write!(f, "v|{vol}"),
            Self::Airhorn { volume, name } => write!(f, "do_airhorn|{volume}|{name}"),
            Self::FreeHornUpdate => write!(f, "update_freehorn"),
            Self::MemberUpdate(count) => write!(f, "member_update|{count}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_name_carries_nest_prefix() {
        assert_eq!(channel("main"), "NEST:main|MISC|update-pubsub");
        assert_eq!(channel("XK42P"), "NEST:XK42P|MISC|update-pubsub");
    }

    #[test]
    fn every_message_round_trips() {
        let messages = vec![
            BusMessage::PlaylistUpdate,
            BusMessage::NowPlayingUpdate,
            BusMessage::Position {
                src: "spotify".into(),
                trackid: "spotify:track:abc".into(),
                elapsed: 42,
            },
            BusMessage::Volume(95),
            BusMessage::Airhorn {
                volume: "0.4".into(),
                name: "classic".into(),
            },
            BusMessage::FreeHornUpdate,
            BusMessage::MemberUpdate(7),
        ];
        for msg in messages {
            let encoded = msg.encode();
            assert_eq!(BusMessage::parse(&encoded), Some(msg), "{encoded}");
        }
    }

    #[test]
    fn position_tick_matches_wire_grammar() {
        let msg = BusMessage::Position {
            src: "spotify".into(),
            trackid: "abc".into(),
            elapsed: 10,
        };
        assert_eq!(msg.encode(), "pp|spotify|abc|10");
    }

    #[test]
    fn track_ids_with_colons_survive_parsing() {
        let parsed = BusMessage::parse("pp|spotify|spotify:track:xyz|3").unwrap();
        match parsed {
            BusMessage::Position { trackid, .. } => assert_eq!(trackid, "spotify:track:xyz"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_messages_are_rejected() {
        assert_eq!(BusMessage::parse("reboot_the_universe"), None);
        assert_eq!(BusMessage::parse("pp|onlyonefield"), None);
        assert_eq!(BusMessage::parse("v|loud"), None);
        assert_eq!(BusMessage::parse(""), None);
    }
}
