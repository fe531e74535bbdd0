use core::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use coursegen_core::{ComponentId, DomainError, LessonId, TenantId};

/// Kind of a lesson building block.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Heading,
    Text,
    Example,
    Callout,
    Quiz,
    Exercise,
    Summary,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Heading => "heading",
            ComponentKind::Text => "text",
            ComponentKind::Example => "example",
            ComponentKind::Callout => "callout",
            ComponentKind::Quiz => "quiz",
            ComponentKind::Exercise => "exercise",
            ComponentKind::Summary => "summary",
        }
    }
}

impl FromStr for ComponentKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "heading" => Ok(ComponentKind::Heading),
            "text" | "paragraph" => Ok(ComponentKind::Text),
            "example" => Ok(ComponentKind::Example),
            "callout" | "tip" | "note" => Ok(ComponentKind::Callout),
            "quiz" => Ok(ComponentKind::Quiz),
            "exercise" | "activity" => Ok(ComponentKind::Exercise),
            "summary" => Ok(ComponentKind::Summary),
            other => Err(DomainError::validation(format!(
                "unknown component kind: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonComponent {
    pub id: ComponentId,
    pub tenant_id: TenantId,
    pub lesson_id: LessonId,
    pub kind: ComponentKind,
    pub title: Option<String>,
    /// Kind-specific content (markdown text, quiz questions, ...).
    pub body: JsonValue,
    pub position: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewComponent {
    pub lesson_id: LessonId,
    pub kind: ComponentKind,
    pub title: Option<String>,
    pub body: JsonValue,
    pub position: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aliases_case_insensitively() {
        assert_eq!("Paragraph".parse::<ComponentKind>().unwrap(), ComponentKind::Text);
        assert_eq!(" TIP ".parse::<ComponentKind>().unwrap(), ComponentKind::Callout);
        assert_eq!("quiz".parse::<ComponentKind>().unwrap(), ComponentKind::Quiz);
    }

    #[test]
    fn unknown_kind_is_a_validation_error() {
        assert!(matches!(
            "hologram".parse::<ComponentKind>(),
            Err(DomainError::Validation(_))
        ));
    }
}
