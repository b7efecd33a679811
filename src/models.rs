use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verb {
    Get,
    Put,
    Post,
}

/// Static request shape for one command.
#[derive(Debug, Clone, Copy)]
pub struct CommandDescriptor {
    /// Path under `/me/player`, empty for the player root.
    pub endpoint: &'static str,
    pub verb: Verb,
    /// Source identifier handed to the host on data-ready.
    pub source: &'static str,
    pub required: Option<&'static str>,
    /// Argument keys moved into the query string, after `device_id`.
    pub query_keys: &'static [&'static str],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    PlaybackState,
    CurrentlyPlaying,
    Devices,
    RecentlyPlayed,
    Play,
    Pause,
    Next,
    Previous,
    Seek,
    Repeat,
    Shuffle,
    Volume,
}

impl Command {
    pub const ALL: [Command; 12] = [
        Command::PlaybackState,
        Command::CurrentlyPlaying,
        Command::Devices,
        Command::RecentlyPlayed,
        Command::Play,
        Command::Pause,
        Command::Next,
        Command::Previous,
        Command::Seek,
        Command::Repeat,
        Command::Shuffle,
        Command::Volume,
    ];

    pub const fn descriptor(self) -> CommandDescriptor {
        use Verb::*;
        match self {
            Command::PlaybackState => {
                desc("", Get, "playback_state", None, &["market", "additional_types"])
            }
            Command::CurrentlyPlaying => desc(
                "/currently-playing",
                Get,
                "currently_playing",
                None,
                &["market", "additional_types"],
            ),
            Command::Devices => desc("/devices", Get, "devices", None, &[]),
            Command::RecentlyPlayed => desc(
                "/recently-played",
                Get,
                "recently_played",
                None,
                &["limit", "after", "before"],
            ),
            Command::Play => desc("/play", Put, "play", None, &[]),
            Command::Pause => desc("/pause", Put, "pause", None, &[]),
            Command::Next => desc("/next", Post, "next", None, &[]),
            Command::Previous => desc("/previous", Post, "previous", None, &[]),
            Command::Seek => desc("/seek", Put, "seek", Some("position_ms"), &["position_ms"]),
            Command::Repeat => desc("/repeat", Put, "repeat", Some("state"), &["state"]),
            Command::Shuffle => desc("/shuffle", Put, "shuffle", Some("state"), &["state"]),
            Command::Volume => {
                desc("/volume", Put, "volume", Some("volume_percent"), &["volume_percent"])
            }
        }
    }

    pub fn source(self) -> &'static str {
        self.descriptor().source
    }
}

const fn desc(
    endpoint: &'static str,
    verb: Verb,
    source: &'static str,
    required: Option<&'static str>,
    query_keys: &'static [&'static str],
) -> CommandDescriptor {
    CommandDescriptor { endpoint, verb, source, required, query_keys }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.source())
    }
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Command::ALL
            .into_iter()
            .find(|c| c.source() == wanted)
            .ok_or_else(|| anyhow!("unknown command '{}'", s))
    }
}
