mod worker;
pub use worker::{SerialWorker, WorkerError};

/// Converts a byte count into whole KiB, saturating at [`i32::MAX`].
#[inline]
pub fn kib_saturating(bytes: u64) -> i32 {
    i32::try_from(bytes / constants::KiB as u64).unwrap_or(i32::MAX)
}

#[allow(non_upper_case_globals)]
pub mod constants {
    pub const KiB: u32 = 1024;
}
