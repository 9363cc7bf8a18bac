//! Stem vocabulary: which tracks a separation produces and how they are named on disk.
//!
//! [`StemCount`] is the configuration key of the engine cache. Each count maps to a
//! fixed set of [`Stem`]s, and each stem is written as `<stem>.<ext>` where the
//! extension comes from the engine's [`AudioFormat`].

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Supported separation variants. Anything other than 2, 4 or 5 is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum StemCount {
    Two,
    Four,
    Five,
}

impl StemCount {
    pub const ALL: [StemCount; 3] = [StemCount::Two, StemCount::Four, StemCount::Five];

    pub fn get(self) -> u8 {
        match self {
            StemCount::Two => 2,
            StemCount::Four => 4,
            StemCount::Five => 5,
        }
    }

    /// The stems an engine configured with this count must produce.
    pub fn stems(self) -> &'static [Stem] {
        match self {
            StemCount::Two => &[Stem::Vocals, Stem::Accompaniment],
            StemCount::Four => &[Stem::Vocals, Stem::Drums, Stem::Bass, Stem::Other],
            StemCount::Five => &[
                Stem::Vocals,
                Stem::Drums,
                Stem::Bass,
                Stem::Piano,
                Stem::Other,
            ],
        }
    }

    /// Model identifier understood by Spleeter-style engines.
    pub fn model_name(self) -> String {
        format!("spleeter:{}stems", self.get())
    }
}

impl TryFrom<u8> for StemCount {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(StemCount::Two),
            4 => Ok(StemCount::Four),
            5 => Ok(StemCount::Five),
            other => Err(format!("Invalid stems value: {other}. Must be 2, 4, or 5.")),
        }
    }
}

impl From<StemCount> for u8 {
    fn from(count: StemCount) -> Self {
        count.get()
    }
}

impl fmt::Display for StemCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}stems", self.get())
    }
}

/// A logical output track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stem {
    Vocals,
    Drums,
    Bass,
    Piano,
    Other,
    Accompaniment,
}

impl Stem {
    pub fn name(self) -> &'static str {
        match self {
            Stem::Vocals => "vocals",
            Stem::Drums => "drums",
            Stem::Bass => "bass",
            Stem::Piano => "piano",
            Stem::Other => "other",
            Stem::Accompaniment => "accompaniment",
        }
    }

    pub fn file_name(self, format: AudioFormat) -> String {
        format!("{}.{}", self.name(), format.extension())
    }

    /// Matches `path` against this stem in any supported format.
    pub fn matches(self, path: &Path) -> bool {
        let stem_ok = path.file_stem().and_then(|s| s.to_str()) == Some(self.name());
        let ext_ok = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(AudioFormat::from_extension)
            .is_some();
        stem_ok && ext_ok
    }
}

impl fmt::Display for Stem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Audio container an engine writes its stems in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Wav,
    Mp3,
    Ogg,
    Flac,
    M4a,
}

impl AudioFormat {
    pub fn extension(self) -> &'static str {
        match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Ogg => "ogg",
            AudioFormat::Flac => "flac",
            AudioFormat::M4a => "m4a",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "wav" => Some(AudioFormat::Wav),
            "mp3" => Some(AudioFormat::Mp3),
            "ogg" => Some(AudioFormat::Ogg),
            "flac" => Some(AudioFormat::Flac),
            "m4a" => Some(AudioFormat::M4a),
            _ => None,
        }
    }
}
