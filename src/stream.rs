use crate::error::{Error, Result};

/// Kind of raw capture stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamType {
    Color,
    Depth,
    Ir,
    LeftIr,
    RightIr,
}

impl StreamType {
    pub const ALL: [StreamType; 5] = [
        StreamType::Color,
        StreamType::Depth,
        StreamType::Ir,
        StreamType::LeftIr,
        StreamType::RightIr,
    ];

    pub fn label(self) -> &'static str {
        match self {
            StreamType::Color => "color",
            StreamType::Depth => "depth",
            StreamType::Ir => "ir",
            StreamType::LeftIr => "left-ir",
            StreamType::RightIr => "right-ir",
        }
    }
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamOption {
    #[default]
    Any,
    /// Deliver unrectified frames
    Unrectified,
    /// Device depth confidence channel attached
    DepthConfidence,
    /// Strong stream synchronization across the group
    StrongSync,
}

/// A requested raw stream. Zero width, height or fps means "any".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamDesc {
    pub stream: StreamType,
    pub width: u32,
    pub height: u32,
    pub fps: f32,
    pub options: StreamOption,
}

impl StreamDesc {
    pub fn new(stream: StreamType) -> Self {
        Self {
            stream,
            width: 0,
            height: 0,
            fps: 0.0,
            options: StreamOption::Any,
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_fps(mut self, fps: f32) -> Self {
        self.fps = fps;
        self
    }

    pub fn with_options(mut self, options: StreamOption) -> Self {
        self.options = options;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if (self.width == 0) != (self.height == 0) {
            return Err(Error::InvalidStream(format!(
                "{} requested {}x{}; give both dimensions or neither",
                self.stream, self.width, self.height
            )));
        }
        if !self.fps.is_finite() || self.fps < 0.0 {
            return Err(Error::InvalidStream(format!(
                "{} requested fps {}",
                self.stream, self.fps
            )));
        }
        Ok(())
    }
}

/// Streams requested together; the pipeline delivers them as one aligned unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamGroup {
    streams: Vec<StreamDesc>,
}

impl StreamGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(desc: StreamDesc) -> Self {
        Self {
            streams: vec![desc],
        }
    }

    pub fn with(mut self, desc: StreamDesc) -> Self {
        self.streams.push(desc);
        self
    }

    pub fn streams(&self) -> &[StreamDesc] {
        &self.streams
    }

    pub fn stream_types(&self) -> impl Iterator<Item = StreamType> + '_ {
        self.streams.iter().map(|desc| desc.stream)
    }

    pub fn contains(&self, stream: StreamType) -> bool {
        self.streams.iter().any(|desc| desc.stream == stream)
    }

    pub fn validate(&self) -> Result<()> {
        if self.streams.is_empty() {
            return Err(Error::InvalidStream("empty stream group".into()));
        }
        for (i, desc) in self.streams.iter().enumerate() {
            desc.validate()?;
            if self.streams[..i].iter().any(|other| other.stream == desc.stream) {
                return Err(Error::InvalidStream(format!(
                    "{} listed twice in one group",
                    desc.stream
                )));
            }
        }
        Ok(())
    }
}

/// Everything the capture backend must open, merged across stream groups and
/// module requirements.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamRequest {
    pub streams: Vec<StreamDesc>,
}

impl StreamRequest {
    /// Add a stream, keeping the first explicit size/fps seen for each type.
    pub fn merge(&mut self, desc: StreamDesc) -> Result<()> {
        match self.streams.iter_mut().find(|s| s.stream == desc.stream) {
            Some(existing) => {
                if existing.width == 0 {
                    existing.width = desc.width;
                    existing.height = desc.height;
                } else if desc.width != 0
                    && (desc.width, desc.height) != (existing.width, existing.height)
                {
                    return Err(Error::InvalidStream(format!(
                        "{} requested at both {}x{} and {}x{}",
                        desc.stream, existing.width, existing.height, desc.width, desc.height
                    )));
                }
                if existing.fps == 0.0 {
                    existing.fps = desc.fps;
                }
            }
            None => self.streams.push(desc),
        }
        Ok(())
    }

    pub fn get(&self, stream: StreamType) -> Option<&StreamDesc> {
        self.streams.iter().find(|s| s.stream == stream)
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
