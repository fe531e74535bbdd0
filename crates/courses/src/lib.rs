//! Course authoring domain records.
//!
//! These are the records the generation processors read (inputs, audiences,
//! SME knowledge) and write (outline sections and lessons, lesson
//! components, knowledge chunks). Pure data plus validation; storage lives in
//! `coursegen-infra`.

pub mod component;
pub mod input;
pub mod outline;
pub mod sme;

pub use component::{ComponentKind, LessonComponent, NewComponent};
pub use input::{GenerationInput, TargetAudience};
pub use outline::{Lesson, NewOutlineLesson, NewSection, OutlineLesson, OutlineSection};
pub use sme::{KnowledgeChunk, SmeSubmission, SubmissionStatus};
