//! Sequence files: TOML timelines played by the `sequence` command.
//!
//! ```toml
//! [[tracks]]
//! name = "valves"
//! events = [ { at = "0s", label = "open" }, { at = "1s 500ms", label = "close" } ]
//! ```

use anyhow::{Context, Result};
use ecrt_common::time::Timestamp;
use ecrt_runtime::sequencer::{Event, Track};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// A parsed sequence file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SequenceFile {
    /// Tracks in file order.
    #[serde(default)]
    pub tracks: Vec<TrackSpec>,
}

/// One `[[tracks]]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackSpec {
    /// Track name, used in log output.
    pub name: String,
    /// Events, in any order.
    #[serde(default)]
    pub events: Vec<EventSpec>,
}

/// One event of a track.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventSpec {
    /// Offset from the sequence origin.
    #[serde(with = "ecrt_common::config::humantime_serde")]
    pub at: Duration,
    /// Label passed to the handler.
    #[serde(default)]
    pub label: String,
}

impl SequenceFile {
    /// Parse from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns the parse error for malformed TOML or durations.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load from a file.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read sequence file {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse sequence file {}", path.display()))
    }

    /// Total number of events.
    pub fn event_count(&self) -> usize {
        self.tracks.iter().map(|t| t.events.len()).sum()
    }

    /// Build sequencer tracks; events are logged as they fire.
    pub fn into_tracks(self) -> Vec<Track<String>> {
        self.tracks
            .into_iter()
            .map(|spec| {
                let events = spec
                    .events
                    .into_iter()
                    .map(|e| Event::new(Timestamp::from(e.at), e.label))
                    .collect();
                let name = spec.name.clone();
                Track::new(spec.name, events, move |index, event: &Event<String>| {
                    info!(track = %name, index, at = %event.time, label = %event.payload, "Event");
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[[tracks]]
name = "valves"
events = [ { at = "1s 500ms", label = "close" }, { at = "0s", label = "open" } ]

[[tracks]]
name = "pumps"
events = [ { at = "250ms", label = "start" } ]
"#;

    #[test]
    fn test_parse_and_sort() {
        let file = SequenceFile::from_toml(SAMPLE).unwrap();
        assert_eq!(file.tracks.len(), 2);
        assert_eq!(file.event_count(), 3);
        assert_eq!(file.tracks[0].events[0].at, Duration::from_millis(1500));

        let tracks = file.into_tracks();
        let valves: Vec<&str> = tracks[0].events().iter().map(|e| e.payload.as_str()).collect();
        assert_eq!(valves, vec!["open", "close"]);
        assert_eq!(tracks[1].name(), "pumps");
        assert_eq!(tracks[1].events()[0].time, Timestamp::new(0, 250_000_000));
    }

    #[test]
    fn test_shipped_sample_parses() {
        let file = SequenceFile::from_toml(include_str!("../../../config/sequence.toml")).unwrap();
        assert_eq!(file.tracks.len(), 2);
        assert_eq!(file.event_count(), 5);
    }

    #[test]
    fn test_rejects_bad_duration() {
        let bad = r#"
[[tracks]]
name = "x"
events = [ { at = "soon" } ]
"#;
        assert!(SequenceFile::from_toml(bad).is_err());
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let bad = r#"
[[tracks]]
name = "x"
colour = "red"
"#;
        assert!(SequenceFile::from_toml(bad).is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let parsed = SequenceFile::from_file(file.path()).unwrap();
        assert_eq!(parsed.event_count(), 3);

        let missing = SequenceFile::from_file(Path::new("/nonexistent/seq.toml"));
        assert!(missing.is_err());
    }
}
