//! `coursegen-core`: shared building blocks.
//!
//! Identifiers, the domain error model and the clock abstraction used by every
//! other crate in the workspace. No infrastructure concerns live here.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::DomainError;
pub use id::{
    AudienceId, ComponentId, CourseId, JobId, LessonId, OutlineLessonId, SectionId, SmeTaskId,
    SubmissionId, TenantId, UserId,
};
