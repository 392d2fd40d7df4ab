/// Error taxonomy for the shared-memory map.
///
/// Validation errors and [`Error::DbSize`] are fatal to [`crate::Map::create`]
/// and close the region; the remaining variants are reported to the caller
/// without modifying map state.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// `mapCap` is non-positive or exceeds `MAX_CAP` before rounding.
    #[error("mapCap must be in (0, {max}] before rounding to a power of two, got {got}")]
    MapCap { got: i64, max: i64 },

    /// `keyLen` falls outside `[MIN_KEY-1, MAX_KEY-1]`.
    #[error("keyLen must be in [{min}, {max}], got {got}")]
    KeyLen { got: i64, min: i64, max: i64 },

    /// `valueLen` is negative, or the resulting bucket stride exceeds `MAX_BUCKET`.
    #[error("valueLen {val_len} makes bucketSize exceed MAX_BUCKET ({max})")]
    ValLen { val_len: i64, max: i64 },

    /// An existing region's header does not match the parameters this
    /// opener was constructed with.
    #[error("existing region layout does not match requested parameters")]
    DbSize,

    /// The allocator is exhausted and no concurrent chain mutation was
    /// observed that might free up room.
    #[error("map is full")]
    DbFull,

    /// `Get` with `add = false` found no matching key.
    #[error("key not found")]
    KeyNot,

    /// A top-level operation exhausted its `maxTry` contention budget.
    #[error("exceeded maxTry retry budget")]
    TryEnd,

    /// Failure from the underlying file / mmap / boot-lock collaborator.
    #[error("region I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
