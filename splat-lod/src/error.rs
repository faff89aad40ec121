use thiserror::Error;

#[derive(Debug, Error)]
pub enum LodError {
    #[error("hierarchy invariant violated: {0}")]
    InvariantViolation(String),

    #[error("splat {splat} at {position:?} maps to cell {cell:?} outside grid {subdivisions:?}")]
    CellOutOfBounds {
        splat: usize,
        position: [f32; 3],
        cell: [i64; 3],
        subdivisions: [u32; 3],
    },

    #[error("splat {splat} has non-finite position {position:?}")]
    NonFinitePosition { splat: usize, position: [f32; 3] },

    #[error("invalid parameters: {0}")]
    InvalidParams(String),
}

pub type Result<T> = std::result::Result<T, LodError>;
