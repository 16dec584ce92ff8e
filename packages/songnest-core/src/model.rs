//! Typed records for queue entries, now-playing state, and play history.
//!
//! The legacy system passed open string-keyed maps around; here every shape
//! is a closed struct serialized to/from store hash fields (flat strings) or
//! JSON at the boundary.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Catalog family identifier for regular tracks and podcast episodes.
pub const SRC_SPOTIFY: &str = "spotify";

/// Colors assigned to freshly queued entries, before any votes land.
pub const DEFAULT_BACKGROUND: &str = "222222";
pub const DEFAULT_FOREGROUND: &str = "F0F0FF";

/// One record in a nest's queue, identified by a per-nest monotonic integer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: u64,
    /// Catalog URI (`spotify:track:...` or `spotify:episode:...`).
    pub trackid: String,
    /// Catalog family (`spotify`).
    pub src: String,
    pub title: String,
    pub artist: String,
    /// Playback length in seconds.
    pub duration: u32,
    pub img: String,
    pub big_img: String,
    /// Contributing identity, lowercased at the boundary.
    pub user: String,
    /// Cumulative vote total.
    pub vote: i64,
    /// True when synthesized by the recommendation engine.
    pub auto: bool,
    pub background_color: String,
    pub foreground_color: String,
}

impl QueueEntry {
    /// Flattens the entry into store hash fields.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("id".into(), self.id.to_string()),
            ("trackid".into(), self.trackid.clone()),
            ("src".into(), self.src.clone()),
            ("title".into(), self.title.clone()),
            ("artist".into(), self.artist.clone()),
            ("duration".into(), self.duration.to_string()),
            ("img".into(), self.img.clone()),
            ("big_img".into(), self.big_img.clone()),
            ("user".into(), self.user.clone()),
            ("vote".into(), self.vote.to_string()),
            ("auto".into(), self.auto.to_string()),
            ("background_color".into(), self.background_color.clone()),
            ("foreground_color".into(), self.foreground_color.clone()),
        ]
    }

    /// Rebuilds an entry from store hash fields.
    ///
    /// Returns `None` when the hash is empty or lacks a track id, which is
    /// how an expired detail hash looks to a late reader.
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let trackid = fields.get("trackid").filter(|t| !t.is_empty())?.clone();
        let grab = |key: &str| fields.get(key).cloned().unwrap_or_default();
        Some(Self {
            id: fields.get("id").and_then(|v| v.parse().ok()).unwrap_or(0),
            trackid,
            src: grab("src"),
            title: grab("title"),
            artist: grab("artist"),
            duration: fields
                .get("duration")
                .and_then(|v| v.parse::<f64>().ok())
                .map(|d| d.max(0.0) as u32)
                .unwrap_or(0),
            img: grab("img"),
            big_img: grab("big_img"),
            user: grab("user"),
            vote: fields.get("vote").and_then(|v| v.parse().ok()).unwrap_or(0),
            auto: fields.get("auto").map(|v| v == "true").unwrap_or(false),
            background_color: grab("background_color"),
            foreground_color: grab("foreground_color"),
        })
    }
}

/// A participant's positive endorsement of an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Jam {
    pub user: String,
    /// ISO-8601 timestamp of the endorsement.
    pub time: String,
}

/// A text comment attached to an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub user: String,
    pub body: String,
    /// Unix seconds when the comment was posted.
    pub time: u64,
}

/// A queue entry hydrated with its score, jams, and comments.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedEntry {
    #[serde(flatten)]
    pub entry: QueueEntry,
    pub score: f64,
    pub jam: Vec<Jam>,
    pub comments: Vec<Comment>,
}

/// The synthetic tail card showing the recommendation engine's next pick.
#[derive(Debug, Clone, Serialize)]
pub struct PreviewCard {
    /// Marks the card as engine-sourced for the UI.
    pub playlist_src: bool,
    /// Display attribution ("bob (throwback)" or the bot's display name).
    pub name: String,
    pub user: String,
    pub title: String,
    pub trackid: String,
    pub img: String,
    pub big_img: String,
    pub jam: Vec<Jam>,
}

impl PreviewCard {
    /// Placeholder card shown when no fill candidate is available.
    pub fn unavailable(display_name: &str, user: &str) -> Self {
        Self {
            playlist_src: true,
            name: display_name.to_string(),
            user: user.to_string(),
            title: "No songs available".into(),
            trackid: String::new(),
            img: String::new(),
            big_img: String::new(),
            jam: Vec::new(),
        }
    }
}

/// One element of the queue view: a real entry or the preview tail card.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum QueueCard {
    Entry(QueuedEntry),
    Preview(PreviewCard),
}

/// Snapshot of the playhead for clients.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NowPlaying {
    #[serde(flatten)]
    pub entry: Option<QueueEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starttime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endtime: Option<String>,
    /// Elapsed seconds within the current entry.
    pub pos: u32,
    pub paused: bool,
    pub jam: Vec<Jam>,
    pub comments: Vec<Comment>,
}

/// An airhorn event as captured into a play record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HornEvent {
    pub user: String,
    /// ISO-8601 timestamp of the blast.
    pub when: String,
    pub free: bool,
}

/// A fired airhorn as stored in the per-nest airhorn log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredHorn {
    pub img: String,
    pub songid: u64,
    pub when: String,
    pub free: bool,
    pub user: String,
    pub artist: String,
    pub title: String,
}

/// A finished play as appended to the history log.
///
/// Presentation-only fields (colors, artwork) are dropped deliberately so
/// log lines stay compact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayRecord {
    pub id: u64,
    pub trackid: String,
    pub src: String,
    pub title: String,
    pub artist: String,
    pub duration: u32,
    pub user: String,
    pub vote: i64,
    pub auto: bool,
    /// ISO-8601 timestamp of when the play actually ended.
    pub endtime: String,
    pub jam: Vec<Jam>,
    pub airhorn: Vec<HornEvent>,
}

impl PlayRecord {
    /// Builds a record from a finished entry plus its resolved side data.
    pub fn from_entry(
        entry: &QueueEntry,
        endtime: String,
        jam: Vec<Jam>,
        airhorn: Vec<HornEvent>,
    ) -> Self {
        Self {
            id: entry.id,
            trackid: entry.trackid.clone(),
            src: entry.src.clone(),
            title: entry.title.clone(),
            artist: entry.artist.clone(),
            duration: entry.duration,
            user: entry.user.clone(),
            vote: entry.vote,
            auto: entry.auto,
            endtime,
            jam,
            airhorn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> QueueEntry {
        QueueEntry {
            id: 42,
            trackid: "spotify:track:abc123".into(),
            src: SRC_SPOTIFY.into(),
            title: "Night Drive".into(),
            artist: "The Streetlights".into(),
            duration: 245,
            img: "https://img.example/small.jpg".into(),
            big_img: "https://img.example/big.jpg".into(),
            user: "alice@x".into(),
            vote: 3,
            auto: false,
            background_color: DEFAULT_BACKGROUND.into(),
            foreground_color: DEFAULT_FOREGROUND.into(),
        }
    }

    #[test]
    fn entry_fields_round_trip() {
        let entry = sample_entry();
        let fields: HashMap<String, String> = entry.to_fields().into_iter().collect();
        let restored = QueueEntry::from_fields(&fields).unwrap();
        assert_eq!(restored, entry);
    }

    #[test]
    fn auto_flag_round_trips() {
        let mut entry = sample_entry();
        entry.auto = true;
        let fields: HashMap<String, String> = entry.to_fields().into_iter().collect();
        assert!(QueueEntry::from_fields(&fields).unwrap().auto);
    }

    #[test]
    fn empty_hash_reads_as_absent_entry() {
        assert!(QueueEntry::from_fields(&HashMap::new()).is_none());
    }

    #[test]
    fn missing_trackid_reads_as_absent_entry() {
        let mut fields = HashMap::new();
        fields.insert("title".to_string(), "orphan".to_string());
        assert!(QueueEntry::from_fields(&fields).is_none());
    }

    #[test]
    fn fractional_duration_is_truncated() {
        let mut fields: HashMap<String, String> = sample_entry().to_fields().into_iter().collect();
        fields.insert("duration".into(), "199.6".into());
        assert_eq!(QueueEntry::from_fields(&fields).unwrap().duration, 199);
    }

    #[test]
    fn now_playing_serializes_flat() {
        let np = NowPlaying {
            entry: Some(sample_entry()),
            starttime: Some("2026-08-01T12:00:00Z".into()),
            endtime: Some("2026-08-01T12:04:05Z".into()),
            pos: 10,
            paused: false,
            jam: vec![],
            comments: vec![],
        };
        let json = serde_json::to_value(&np).unwrap();
        assert_eq!(json["trackid"], "spotify:track:abc123");
        assert_eq!(json["pos"], 10);
        assert_eq!(json["paused"], false);
    }

    #[test]
    fn empty_now_playing_still_reports_paused() {
        let json = serde_json::to_value(NowPlaying::default()).unwrap();
        assert!(json.get("trackid").is_none());
        assert_eq!(json["paused"], false);
    }

    #[test]
    fn play_record_drops_presentation_fields() {
        let record = PlayRecord::from_entry(&sample_entry(), "2026-08-01T12:04:05Z".into(), vec![], vec![]);
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("background_color").is_none());
        assert!(json.get("img").is_none());
        assert_eq!(json["endtime"], "2026-08-01T12:04:05Z");
    }
}
