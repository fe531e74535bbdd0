use serde::{Deserialize, Serialize};

use coursegen_core::{CourseId, LessonId, OutlineLessonId, SectionId, TenantId};

/// A section of a generated course outline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlineSection {
    pub id: SectionId,
    pub tenant_id: TenantId,
    pub course_id: CourseId,
    pub title: String,
    pub description: String,
    pub position: u32,
}

/// Section as produced by a generator, before it has an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSection {
    pub course_id: CourseId,
    pub title: String,
    pub description: String,
    pub position: u32,
}

/// A lesson entry inside an outline section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlineLesson {
    pub id: OutlineLessonId,
    pub tenant_id: TenantId,
    pub section_id: SectionId,
    pub title: String,
    pub summary: String,
    pub objectives: Vec<String>,
    pub position: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutlineLesson {
    pub section_id: SectionId,
    pub title: String,
    pub summary: String,
    pub objectives: Vec<String>,
    pub position: u32,
}

/// A course lesson that receives generated components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    pub id: LessonId,
    pub tenant_id: TenantId,
    pub course_id: CourseId,
    pub outline_lesson_id: Option<OutlineLessonId>,
    pub title: String,
    pub summary: String,
    /// Transition text leading into the next lesson, written by the generator.
    pub segue_text: Option<String>,
}
