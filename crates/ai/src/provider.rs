use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::AiError;

/// Generation capability bound to a single tenant's credentials.
///
/// Any error is a job failure for the caller, never a process fault.
pub trait AiProvider: Send + Sync {
    fn generate_outline(&self, request: &OutlineRequest) -> Result<OutlineResponse, AiError>;

    fn generate_lesson_content(
        &self,
        request: &LessonContentRequest,
    ) -> Result<LessonContentResponse, AiError>;

    /// Summarize and chunk raw SME material.
    fn process_content(
        &self,
        request: &ProcessContentRequest,
    ) -> Result<ProcessContentResponse, AiError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudienceProfile {
    pub name: String,
    pub description: String,
    pub expertise_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlineRequest {
    pub course_title: String,
    pub description: String,
    pub learning_objectives: Vec<String>,
    pub audience: Option<AudienceProfile>,
    /// SME knowledge excerpts used as grounding.
    pub knowledge: Vec<String>,
    pub desired_lesson_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlineResponse {
    pub sections: Vec<GeneratedSection>,
    #[serde(default)]
    pub tokens_used: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedSection {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub lessons: Vec<GeneratedLesson>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedLesson {
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub objectives: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonContentRequest {
    pub course_title: String,
    pub lesson_title: String,
    pub lesson_summary: String,
    pub objectives: Vec<String>,
    pub audience: Option<AudienceProfile>,
    pub knowledge: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonContentResponse {
    pub components: Vec<GeneratedComponent>,
    #[serde(default)]
    pub segue_text: Option<String>,
    #[serde(default)]
    pub tokens_used: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedComponent {
    /// Kind label as emitted by the model; validated by the caller.
    pub kind: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessContentRequest {
    pub source_name: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessContentResponse {
    pub summary: String,
    pub chunks: Vec<String>,
    #[serde(default)]
    pub tokens_used: u64,
}
