//! The sequencing pipeline: admission, dependency ordering, block
//! generation, and DA re-submission.

pub mod admission;
pub mod dag;
pub mod generator;
pub mod poster;

pub use admission::{Admission, AdmissionError, AdmissionResult, PendingStats};
pub use generator::BlockGenerator;
pub use poster::BlobPoster;
