use serde::{Deserialize, Serialize};

use coursegen_core::{AudienceId, CourseId, DomainError, SmeTaskId, TenantId};

/// Author-supplied parameters for generating a course.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationInput {
    pub tenant_id: TenantId,
    pub course_id: CourseId,
    pub course_title: String,
    pub description: String,
    pub learning_objectives: Vec<String>,
    pub audience_id: Option<AudienceId>,
    /// SME tasks whose ingested knowledge should ground the generation.
    pub sme_task_ids: Vec<SmeTaskId>,
    /// Requested number of lessons; the provider treats it as a hint.
    pub desired_lesson_count: Option<u32>,
}

impl GenerationInput {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.course_title.trim().is_empty() {
            return Err(DomainError::validation("course title is required"));
        }
        if let Some(0) = self.desired_lesson_count {
            return Err(DomainError::validation(
                "desired lesson count must be positive",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetAudience {
    pub id: AudienceId,
    pub tenant_id: TenantId,
    pub name: String,
    pub description: String,
    /// Free-form level label ("beginner", "practitioner", ...).
    pub expertise_level: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> GenerationInput {
        GenerationInput {
            tenant_id: TenantId::new(),
            course_id: CourseId::new(),
            course_title: "Forklift safety".to_string(),
            description: String::new(),
            learning_objectives: vec![],
            audience_id: None,
            sme_task_ids: vec![],
            desired_lesson_count: None,
        }
    }

    #[test]
    fn blank_title_is_rejected() {
        let mut i = input();
        i.course_title = "   ".to_string();
        assert!(matches!(i.validate(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn zero_lessons_is_rejected() {
        let mut i = input();
        i.desired_lesson_count = Some(0);
        assert!(i.validate().is_err());
        i.desired_lesson_count = Some(6);
        assert!(i.validate().is_ok());
    }
}
