use crate::module::ModuleId;
use thiserror::Error;

/// Integer result domain shared with capture/processing collaborators.
///
/// Zero means success, negative values are errors and positive values are
/// warnings that never stop the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    NoError,

    FeatureUnsupported,
    ParamUnsupported,
    ItemUnavailable,
    HandleInvalid,
    DeviceFailed,
    DeviceLost,
    DeviceBusy,
    ExecAborted,
    ExecInProgress,
    ExecTimeout,
    DataUnavailable,
    DataNotInitialized,
    InitFailed,

    TimeGap,
    ProcessFailed,
    DataPending,
}

impl Status {
    pub fn code(self) -> i32 {
        match self {
            Status::NoError => 0,
            Status::FeatureUnsupported => -1,
            Status::ParamUnsupported => -2,
            Status::ItemUnavailable => -3,
            Status::HandleInvalid => -101,
            Status::DeviceFailed => -201,
            Status::DeviceLost => -202,
            Status::DeviceBusy => -203,
            Status::ExecAborted => -301,
            Status::ExecInProgress => -302,
            Status::ExecTimeout => -303,
            Status::DataUnavailable => -501,
            Status::DataNotInitialized => -502,
            Status::InitFailed => -503,
            Status::TimeGap => 101,
            Status::ProcessFailed => 104,
            Status::DataPending => 106,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        const ALL: [Status; 17] = [
            Status::NoError,
            Status::FeatureUnsupported,
            Status::ParamUnsupported,
            Status::ItemUnavailable,
            Status::HandleInvalid,
            Status::DeviceFailed,
            Status::DeviceLost,
            Status::DeviceBusy,
            Status::ExecAborted,
            Status::ExecInProgress,
            Status::ExecTimeout,
            Status::DataUnavailable,
            Status::DataNotInitialized,
            Status::InitFailed,
            Status::TimeGap,
            Status::ProcessFailed,
            Status::DataPending,
        ];
        ALL.into_iter().find(|status| status.code() == code)
    }

    pub fn is_error(self) -> bool {
        self.code() < 0
    }

    pub fn is_warning(self) -> bool {
        self.code() > 0
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// Errors returned by the pipeline controller
#[derive(Debug, Error)]
pub enum Error {
    #[error("no stream or module was enabled before init")]
    NothingEnabled,

    #[error("pipeline is already initialized; configure streams and modules before init")]
    AlreadyInitialized,

    #[error("pipeline is not initialized")]
    NotInitialized,

    #[error("invalid stream request: {0}")]
    InvalidStream(String),

    #[error("module {0} is already enabled")]
    DuplicateModule(ModuleId),

    #[error("module {0} is not enabled")]
    UnknownModule(ModuleId),

    #[error("no provider for module {id} (name hint: {name:?})")]
    ModuleUnavailable { id: ModuleId, name: Option<String> },

    #[error("pipeline is already driven in {active} mode")]
    ModeConflict { active: &'static str },

    #[error("a frame is already acquired; call release_frame first")]
    FrameAlreadyAcquired,

    #[error("no frame is acquired")]
    NoFrameAcquired,

    #[error("timed out waiting for a frame")]
    Timeout,

    #[error("capture device failed")]
    Device(#[source] anyhow::Error),

    #[error("capture device lost")]
    DeviceLost,

    #[error("module {id} rejected its stream profile")]
    ModuleProfile {
        id: ModuleId,
        #[source]
        source: anyhow::Error,
    },

    #[error("handler aborted the pipeline at {stage}")]
    HandlerAbort {
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("pipeline was closed")]
    Closed,
}

impl Error {
    pub fn status(&self) -> Status {
        match self {
            Error::NothingEnabled | Error::NotInitialized => Status::DataNotInitialized,
            Error::AlreadyInitialized | Error::ModeConflict { .. } => Status::ExecInProgress,
            Error::InvalidStream(_) => Status::ParamUnsupported,
            Error::DuplicateModule(_) | Error::UnknownModule(_) => Status::ItemUnavailable,
            Error::ModuleUnavailable { .. } => Status::FeatureUnsupported,
            Error::FrameAlreadyAcquired | Error::NoFrameAcquired => Status::HandleInvalid,
            Error::Timeout => Status::ExecTimeout,
            Error::Device(_) => Status::DeviceFailed,
            Error::DeviceLost => Status::DeviceLost,
            Error::ModuleProfile { .. } => Status::InitFailed,
            Error::HandlerAbort { .. } | Error::Closed => Status::ExecAborted,
        }
    }

    /// Recoverable errors leave the pipeline running; the call may be retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
