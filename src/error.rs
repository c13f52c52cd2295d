use crate::patch::PatchEdge;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TerrainError {
    #[error("the {0} edge of the patch is already stitched")]
    EdgeAlreadyStitched(PatchEdge),
    #[error("chunk ({row}, {column}) is outside of the {size}x{size} grid")]
    ChunkOutOfRange { row: u32, column: u32, size: u32 },
    #[error("no mesh variant for lod {lod} with edge {edge:?}")]
    MissingVariant { lod: u32, edge: Option<PatchEdge> },
    #[error("invalid terrain config: {0}")]
    InvalidConfig(String),
    #[error("failed to build the height kernel: {0}")]
    KernelBuild(String),
}

pub type TerrainResult<T> = Result<T, TerrainError>;
