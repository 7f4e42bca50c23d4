use serde::{Deserialize, Serialize};

use crate::shaders::reflection::ResourceClass;

/// every failure the pipeline can report; Display is the user-facing diagnostic
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    ToolchainUnavailable(String),

    /// carries the native compiler diagnostic verbatim
    #[error("{0}")]
    Compile(String),

    #[error("{0}")]
    Reflection(String),

    #[error("{0}")]
    Fixup(String),

    #[error("Binding holes not allowed in {0}s")]
    BindingHole(ResourceClass),

    #[error("Invalid {class} slot {slot} for {name}")]
    InvalidSlot {
        class: ResourceClass,
        slot: u32,
        name: String,
    },

    #[error("Expected {expected} {class}s got {actual}")]
    BindingCountMismatch {
        class: ResourceClass,
        expected: u32,
        actual: usize,
    },

    #[error("{class} {index} ({name}) cannot be null")]
    NullBinding {
        class: ResourceClass,
        index: usize,
        name: String,
    },

    #[error("Resource \"{0}\" not found in supplied map")]
    MissingNamedResource(String),

    #[error("Expected \"{name}\" to be {} {expected}", .expected.article())]
    WrongResourceKind {
        name: String,
        expected: ResourceClass,
    },

    #[error("{0}")]
    AlreadyRunning(&'static str),

    #[error("Invalid ThreadGroupCount X={0} Y={1} Z={2}")]
    InvalidDispatchDimension(i32, i32, i32),

    #[error("{0}")]
    InvalidIndirectBuffer(&'static str),

    #[error("Invalid Thread Group Size X={0} Y={1} Z={2}")]
    InvalidThreadGroupSize(i32, i32, i32),

    #[error("Invalid number of vertices {0}")]
    InvalidVertexCount(i32),

    #[error("Invalid number of RTVs {0}")]
    InvalidRenderTargetCount(usize),

    #[error("RTV {0} is not a texture")]
    InvalidRenderTarget(usize),

    /// `stage` is "vertex" or "mesh"
    #[error("Unsupported input semantic in {stage} shader: {name}/{index}")]
    UnsupportedInputSemantic {
        stage: &'static str,
        name: String,
        index: u32,
    },

    #[error(
        "Unknown/Unaligned input semantic in pixel shader: {name}/{index} (register: {register} mask: {mask:#x})"
    )]
    UnmatchedSemantic {
        name: String,
        index: u32,
        register: u32,
        mask: u8,
    },

    #[error("{0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, Error>;

pub const COMPUTE_ALREADY_RUNNING: &str = "The Compute Shader is already running";
pub const RASTERIZER_ALREADY_RUNNING: &str = "The Rasterizer is already running";
pub const RAY_TRACER_ALREADY_RUNNING: &str = "The RayTracer is already running";
pub const RESOURCE_ALREADY_RUNNING: &str =
    "The Resource is already being processed by another task";

impl Error {
    pub fn to_signal(&self) -> Signal {
        Signal::failure(self.to_string())
    }
}

/// the (success, message) pair handed to completion callbacks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub success: bool,
    pub message: String,
}

impl Signal {
    pub fn success() -> Self {
        Self {
            success: true,
            message: String::new(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

impl From<Result<()>> for Signal {
    fn from(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self::success(),
            Err(err) => err.to_signal(),
        }
    }
}
