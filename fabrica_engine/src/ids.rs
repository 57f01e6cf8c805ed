// Identifiers for content and segment entities.
//
// Two families:
// - Content identifiers (`ProgramId`, `InstrumentAudioId`, ...) wrap a
//   128-bit `ContentUuid`. Content is authored elsewhere and arrives with its
//   ids; fixtures mint new ones from a `FabRng`, never from OS entropy.
// - Segment records (`SegmentId`, `ChoiceId`, `PickId`, ...) are small
//   integers. `SegmentId` is the chain's ordering key; every other record id
//   is handed out by the owning `SegmentStore`'s allocator.
//
// All ids are `Copy`, ordered and hashable so they can key `BTreeMap`s and
// memo tables directly.

use fabrica_prng::FabRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// ContentUuid
// ---------------------------------------------------------------------------

/// RFC 4122 version-4 layout: version nibble `0100`, variant bits `10`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentUuid([u8; 16]);

impl ContentUuid {
    pub fn new_v4(rng: &mut FabRng) -> Self {
        let mut bytes = rng.next_128_bits();
        bytes[6] = (bytes[6] & 0x0F) | 0x40;
        bytes[8] = (bytes[8] & 0x3F) | 0x80;
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl FromStr for ContentUuid {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: Vec<u8> = s.bytes().filter(|c| *c != b'-').collect();
        if hex.len() != 32 {
            return Err(format!("not a uuid: {s}"));
        }
        let mut bytes = [0u8; 16];
        for (i, pair) in hex.chunks(2).enumerate() {
            let text = std::str::from_utf8(pair).map_err(|e| e.to_string())?;
            bytes[i] = u8::from_str_radix(text, 16).map_err(|e| format!("not a uuid: {s} ({e})"))?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for ContentUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                f.write_str("-")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ContentUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentUuid({self})")
    }
}

// Serialized as the hyphenated string so ids work as JSON map keys.
impl Serialize for ContentUuid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContentUuid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

macro_rules! content_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub ContentUuid);

        impl $name {
            pub fn new(rng: &mut FabRng) -> Self {
                Self(ContentUuid::new_v4(rng))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

content_id!(LibraryId);
content_id!(TemplateId);
content_id!(TemplateBindingId);
content_id!(ProgramId);
content_id!(ProgramMemeId);
content_id!(ProgramSequenceId);
content_id!(ProgramSequenceBindingId);
content_id!(ProgramSequenceBindingMemeId);
content_id!(ProgramSequenceChordId);
content_id!(ProgramSequenceChordVoicingId);
content_id!(ProgramVoiceId);
content_id!(ProgramVoiceTrackId);
content_id!(ProgramSequencePatternId);
content_id!(ProgramSequencePatternEventId);
content_id!(InstrumentId);
content_id!(InstrumentMemeId);
content_id!(InstrumentAudioId);

// ---------------------------------------------------------------------------
// Segment-side ids
// ---------------------------------------------------------------------------

/// Position of a segment within its chain; also the partition key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(pub u32);

impl SegmentId {
    pub fn next(self) -> Self {
        SegmentId(self.0 + 1)
    }

    pub fn is_first(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

record_id!(ChoiceId);
record_id!(ArrangementId);
record_id!(PickId);
record_id!(SegmentChordId);
record_id!(VoicingId);
record_id!(MemeId);
record_id!(MessageId);
record_id!(MetaId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_has_v4_layout() {
        let mut rng = FabRng::new(42);
        let id = ContentUuid::new_v4(&mut rng);
        assert_eq!(id.as_bytes()[6] >> 4, 4);
        assert_eq!(id.as_bytes()[8] >> 6, 0b10);
    }

    #[test]
    fn uuid_display_parse_round_trip() {
        let mut rng = FabRng::new(42);
        let id = ContentUuid::new_v4(&mut rng);
        let text = id.to_string();
        assert_eq!(text.len(), 36);
        assert_eq!(text.matches('-').count(), 4);
        assert_eq!(text.parse::<ContentUuid>(), Ok(id));
        assert!("not-a-uuid".parse::<ContentUuid>().is_err());
    }

    #[test]
    fn content_id_serializes_as_string_key() {
        let mut rng = FabRng::new(1);
        let id = ProgramId::new(&mut rng);
        let mut map = std::collections::BTreeMap::new();
        map.insert(id, 3);
        let json = serde_json::to_string(&map).unwrap();
        let back: std::collections::BTreeMap<ProgramId, i32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get(&id), Some(&3));
    }

    #[test]
    fn segment_id_ordering() {
        assert!(SegmentId(0).is_first());
        assert_eq!(SegmentId(4).next(), SegmentId(5));
        assert!(SegmentId(2) < SegmentId(10));
    }
}
