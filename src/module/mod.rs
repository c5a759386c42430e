mod blob;
pub mod types;

pub use blob::{BlobModule, BlobResult};
pub use types::{Module, ModuleInstance};

/// Identifier of a processing module, or of an explicitly requested raw
/// stream group (`stream_group(n)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(pub u32);

/// Pack a four-character code, first character in the low byte.
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[3] as u32) << 24 | (code[2] as u32) << 16 | (code[1] as u32) << 8 | code[0] as u32
}

impl ModuleId {
    /// Sentinel for the merged sample of all requested streams
    pub const DEFAULT_SAMPLE: ModuleId = ModuleId(0);

    /// Base identifier of the capture component; raw stream groups are
    /// numbered from here.
    pub const CAPTURE: ModuleId = ModuleId(fourcc(b"CAPT"));

    pub const fn stream_group(index: u32) -> ModuleId {
        ModuleId(Self::CAPTURE.0.wrapping_add(index))
    }

    /// Index of the raw stream group this id names, if it names one
    pub fn group_index(self, groups: usize) -> Option<usize> {
        let offset = self.0.wrapping_sub(Self::CAPTURE.0) as usize;
        (offset < groups).then_some(offset)
    }

    pub fn kind(self) -> Option<ModuleKind> {
        ModuleKind::ALL.into_iter().find(|kind| kind.id() == self)
    }
}

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind() {
            Some(kind) => write!(f, "{}", kind.name()),
            None => write!(f, "{:#010x}", self.0),
        }
    }
}

impl From<ModuleKind> for ModuleId {
    fn from(kind: ModuleKind) -> Self {
        kind.id()
    }
}

/// Known module kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    Face,
    Hand,
    HandCursor,
    Blob,
    PersonTracking,
    TouchlessController,
    Segmentation3D,
    Scan3D,
    ScenePerception,
    EnhancedVideo,
    ObjectRecognition,
    Tracker,
}

struct KindEntry {
    kind: ModuleKind,
    code: &'static [u8; 4],
    name: &'static str,
}

const KIND_TABLE: [KindEntry; 12] = [
    KindEntry { kind: ModuleKind::Face, code: b"FA3D", name: "face" },
    KindEntry { kind: ModuleKind::Hand, code: b"HANN", name: "hand" },
    KindEntry { kind: ModuleKind::HandCursor, code: b"HCMN", name: "hand-cursor" },
    KindEntry { kind: ModuleKind::Blob, code: b"BMMD", name: "blob" },
    KindEntry { kind: ModuleKind::PersonTracking, code: b"POTM", name: "person-tracking" },
    KindEntry { kind: ModuleKind::TouchlessController, code: b"FLKS", name: "touchless-controller" },
    KindEntry { kind: ModuleKind::Segmentation3D, code: b"SGI1", name: "3d-segmentation" },
    KindEntry { kind: ModuleKind::Scan3D, code: b"SCI1", name: "3d-scan" },
    KindEntry { kind: ModuleKind::ScenePerception, code: b"SCNP", name: "scene-perception" },
    KindEntry { kind: ModuleKind::EnhancedVideo, code: b"EVIN", name: "enhanced-video" },
    KindEntry { kind: ModuleKind::ObjectRecognition, code: b"OBJM", name: "object-recognition" },
    KindEntry { kind: ModuleKind::Tracker, code: b"TRKR", name: "tracker" },
];

impl ModuleKind {
    pub const ALL: [ModuleKind; 12] = [
        ModuleKind::Face,
        ModuleKind::Hand,
        ModuleKind::HandCursor,
        ModuleKind::Blob,
        ModuleKind::PersonTracking,
        ModuleKind::TouchlessController,
        ModuleKind::Segmentation3D,
        ModuleKind::Scan3D,
        ModuleKind::ScenePerception,
        ModuleKind::EnhancedVideo,
        ModuleKind::ObjectRecognition,
        ModuleKind::Tracker,
    ];

    fn entry(self) -> &'static KindEntry {
        // KIND_TABLE is ordered like the enum
        &KIND_TABLE[self as usize]
    }

    pub fn id(self) -> ModuleId {
        ModuleId(fourcc(self.entry().code))
    }

    pub fn name(self) -> &'static str {
        self.entry().name
    }

    pub fn from_name(name: &str) -> Option<ModuleKind> {
        KIND_TABLE
            .iter()
            .find(|entry| entry.name.eq_ignore_ascii_case(name))
            .map(|entry| entry.kind)
    }
}

/// Request to enable a module, optionally naming the implementation to pick
/// when several providers exist for the same identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDesc {
    pub id: ModuleId,
    pub friendly_name: Option<String>,
}

impl ModuleDesc {
    pub fn new(id: impl Into<ModuleId>) -> Self {
        Self {
            id: id.into(),
            friendly_name: None,
        }
    }

    pub fn named(id: impl Into<ModuleId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            friendly_name: Some(name.into()),
        }
    }
}
