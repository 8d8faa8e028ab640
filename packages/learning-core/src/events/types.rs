use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

// ========== Target references ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Quiz,
    Question,
    Lesson,
    Course,
    Enrollment,
    User,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Quiz => "quiz",
            TargetKind::Question => "question",
            TargetKind::Lesson => "lesson",
            TargetKind::Course => "course",
            TargetKind::Enrollment => "enrollment",
            TargetKind::User => "user",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "quiz" => Some(TargetKind::Quiz),
            "question" => Some(TargetKind::Question),
            "lesson" => Some(TargetKind::Lesson),
            "course" => Some(TargetKind::Course),
            "enrollment" => Some(TargetKind::Enrollment),
            "user" => Some(TargetKind::User),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetRef {
    pub kind: TargetKind,
    pub id: i64,
}

impl TargetRef {
    pub fn quiz(id: i64) -> Self {
        Self { kind: TargetKind::Quiz, id }
    }

    pub fn question(id: i64) -> Self {
        Self { kind: TargetKind::Question, id }
    }

    pub fn lesson(id: i64) -> Self {
        Self { kind: TargetKind::Lesson, id }
    }

    pub fn course(id: i64) -> Self {
        Self { kind: TargetKind::Course, id }
    }

    pub fn enrollment(id: i64) -> Self {
        Self { kind: TargetKind::Enrollment, id }
    }
}

/// Learnable item kinds (memory stats, difficulty profiles, match scores)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Quiz,
    Question,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Quiz => "quiz",
            ItemType::Question => "question",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "quiz" => Some(ItemType::Quiz),
            "question" => Some(ItemType::Question),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemRef {
    pub item_type: ItemType,
    pub item_id: i64,
}

impl ItemRef {
    pub fn quiz(id: i64) -> Self {
        Self { item_type: ItemType::Quiz, item_id: id }
    }

    pub fn question(id: i64) -> Self {
        Self { item_type: ItemType::Question, item_id: id }
    }
}

impl From<ItemRef> for TargetRef {
    fn from(item: ItemRef) -> Self {
        match item.item_type {
            ItemType::Quiz => TargetRef::quiz(item.item_id),
            ItemType::Question => TargetRef::question(item.item_id),
        }
    }
}

// ========== Event kinds ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    QuizStarted,
    QuizAnswerSubmitted,
    QuizCompleted,
    QuizSubmitted,
    LessonCompleted,
    CourseCompleted,
    EnrollmentCreated,
    ContentInteractionTime,
    ContentChanged,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::QuizStarted,
        EventKind::QuizAnswerSubmitted,
        EventKind::QuizCompleted,
        EventKind::QuizSubmitted,
        EventKind::LessonCompleted,
        EventKind::CourseCompleted,
        EventKind::EnrollmentCreated,
        EventKind::ContentInteractionTime,
        EventKind::ContentChanged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::QuizStarted => "quiz_started",
            EventKind::QuizAnswerSubmitted => "quiz_answer_submitted",
            EventKind::QuizCompleted => "quiz_completed",
            EventKind::QuizSubmitted => "quiz_submitted",
            EventKind::LessonCompleted => "lesson_completed",
            EventKind::CourseCompleted => "course_completed",
            EventKind::EnrollmentCreated => "enrollment_created",
            EventKind::ContentInteractionTime => "content_interaction_time",
            EventKind::ContentChanged => "content_changed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        EventKind::ALL.into_iter().find(|k| k.as_str() == value)
    }
}

// ========== Payloads ==========

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizStartedPayload {
    pub quiz_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerSubmittedPayload {
    pub quiz_id: i64,
    pub question_id: i64,
    pub is_correct: bool,
    pub attempt_index: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_spent_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_of_recall_used: Option<u8>,
    /// Question count of the quiz when the answer was counted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_questions: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizCompletedPayload {
    pub quiz_id: i64,
    pub answered_count: i64,
    pub correct_count: i64,
    pub total_questions: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizSubmittedPayload {
    pub quiz_id: i64,
    pub correct_count: i64,
    pub total_answers: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonCompletedPayload {
    pub lesson_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseCompletedPayload {
    pub course_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentCreatedPayload {
    pub enrollment_id: i64,
    pub course_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionTimePayload {
    pub seconds: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentChange {
    Published,
    Updated,
    Unpublished,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentChangedPayload {
    pub change: ContentChange,
}

/// Typed view over an event's metadata
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    QuizStarted(QuizStartedPayload),
    AnswerSubmitted(AnswerSubmittedPayload),
    QuizCompleted(QuizCompletedPayload),
    QuizSubmitted(QuizSubmittedPayload),
    LessonCompleted(LessonCompletedPayload),
    CourseCompleted(CourseCompletedPayload),
    EnrollmentCreated(EnrollmentCreatedPayload),
    InteractionTime(InteractionTimePayload),
    ContentChanged(ContentChangedPayload),
}

fn parse_payload<T: DeserializeOwned>(kind: EventKind, metadata: &Map<String, Value>) -> CoreResult<T> {
    serde_json::from_value(Value::Object(metadata.clone()))
        .map_err(|e| CoreError::InvalidMetadata(format!("{}: {e}", kind.as_str())))
}

impl EventPayload {
    pub fn parse(kind: EventKind, metadata: &Map<String, Value>) -> CoreResult<Self> {
        Ok(match kind {
            EventKind::QuizStarted => EventPayload::QuizStarted(parse_payload(kind, metadata)?),
            EventKind::QuizAnswerSubmitted => {
                let payload: AnswerSubmittedPayload = parse_payload(kind, metadata)?;
                if payload.quality_of_recall_used.is_some_and(|q| q > 5) {
                    return Err(CoreError::InvalidMetadata(
                        "quiz_answer_submitted: quality_of_recall_used must be 0..5".to_string(),
                    ));
                }
                EventPayload::AnswerSubmitted(payload)
            }
            EventKind::QuizCompleted => EventPayload::QuizCompleted(parse_payload(kind, metadata)?),
            EventKind::QuizSubmitted => EventPayload::QuizSubmitted(parse_payload(kind, metadata)?),
            EventKind::LessonCompleted => EventPayload::LessonCompleted(parse_payload(kind, metadata)?),
            EventKind::CourseCompleted => EventPayload::CourseCompleted(parse_payload(kind, metadata)?),
            EventKind::EnrollmentCreated => EventPayload::EnrollmentCreated(parse_payload(kind, metadata)?),
            EventKind::ContentInteractionTime => EventPayload::InteractionTime(parse_payload(kind, metadata)?),
            EventKind::ContentChanged => EventPayload::ContentChanged(parse_payload(kind, metadata)?),
        })
    }

    /// Values copied into the indexed columns of the log
    pub fn indexed(&self) -> IndexedFields {
        let mut fields = IndexedFields::default();
        match self {
            EventPayload::QuizStarted(p) => fields.quiz_id = Some(p.quiz_id),
            EventPayload::AnswerSubmitted(p) => {
                fields.quiz_id = Some(p.quiz_id);
                fields.question_id = Some(p.question_id);
                fields.is_correct = Some(p.is_correct);
            }
            EventPayload::QuizCompleted(p) => fields.quiz_id = Some(p.quiz_id),
            EventPayload::QuizSubmitted(p) => fields.quiz_id = Some(p.quiz_id),
            EventPayload::LessonCompleted(p) => {
                fields.lesson_id = Some(p.lesson_id);
                fields.course_id = p.course_id;
            }
            EventPayload::CourseCompleted(p) => fields.course_id = Some(p.course_id),
            EventPayload::EnrollmentCreated(p) => fields.course_id = Some(p.course_id),
            EventPayload::InteractionTime(_) | EventPayload::ContentChanged(_) => {}
        }
        fields
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexedFields {
    pub quiz_id: Option<i64>,
    pub question_id: Option<i64>,
    pub is_correct: Option<bool>,
    pub lesson_id: Option<i64>,
    pub course_id: Option<i64>,
}

/// Serialize a typed payload into event metadata
pub fn to_metadata<T: Serialize>(payload: &T) -> CoreResult<Map<String, Value>> {
    match serde_json::to_value(payload)? {
        Value::Object(map) => Ok(map),
        other => Err(CoreError::InvalidMetadata(format!(
            "metadata must be an object, got {other}"
        ))),
    }
}

// ========== Events ==========

/// Event as submitted for appending
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub user_id: Option<i64>,
    pub kind: EventKind,
    pub target: TargetRef,
    pub session_id: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
    /// Must be a JSON object matching the payload of `kind`
    pub metadata: Value,
}

impl NewEvent {
    pub fn new<T: Serialize>(
        user_id: Option<i64>,
        kind: EventKind,
        target: TargetRef,
        occurred_at: DateTime<Utc>,
        payload: &T,
    ) -> CoreResult<Self> {
        Ok(Self {
            user_id,
            kind,
            target,
            session_id: None,
            occurred_at,
            metadata: Value::Object(to_metadata(payload)?),
        })
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

/// Immutable, stored event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub event_id: i64,
    pub user_id: Option<i64>,
    pub kind: EventKind,
    pub target: TargetRef,
    pub session_id: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
    pub metadata: Map<String, Value>,
}

impl Event {
    pub fn payload(&self) -> CoreResult<EventPayload> {
        EventPayload::parse(self.kind, &self.metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_answer_payload_requires_fields() {
        let ok = map(json!({"quiz_id": 1, "question_id": 2, "is_correct": true, "attempt_index": 1}));
        assert!(EventPayload::parse(EventKind::QuizAnswerSubmitted, &ok).is_ok());

        let missing = map(json!({"quiz_id": 1, "is_correct": true, "attempt_index": 1}));
        let err = EventPayload::parse(EventKind::QuizAnswerSubmitted, &missing).unwrap_err();
        assert!(matches!(err, CoreError::InvalidMetadata(_)));

        let wrong_type = map(json!({"quiz_id": "x", "question_id": 2, "is_correct": true, "attempt_index": 1}));
        assert!(EventPayload::parse(EventKind::QuizAnswerSubmitted, &wrong_type).is_err());
    }

    #[test]
    fn test_quality_out_of_range_rejected() {
        let bad = map(json!({
            "quiz_id": 1, "question_id": 2, "is_correct": true,
            "attempt_index": 1, "quality_of_recall_used": 9
        }));
        assert!(EventPayload::parse(EventKind::QuizAnswerSubmitted, &bad).is_err());
    }

    #[test]
    fn test_indexed_fields_for_answers() {
        let payload = EventPayload::AnswerSubmitted(AnswerSubmittedPayload {
            quiz_id: 3,
            question_id: 9,
            is_correct: false,
            attempt_index: 2,
            time_spent_ms: None,
            quality_of_recall_used: Some(1),
            total_questions: None,
        });
        let fields = payload.indexed();
        assert_eq!(fields.quiz_id, Some(3));
        assert_eq!(fields.question_id, Some(9));
        assert_eq!(fields.is_correct, Some(false));
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("bogus"), None);
    }

    #[test]
    fn test_content_change_payload() {
        let m = map(json!({"change": "published"}));
        let parsed = EventPayload::parse(EventKind::ContentChanged, &m).unwrap();
        assert_eq!(
            parsed,
            EventPayload::ContentChanged(ContentChangedPayload {
                change: ContentChange::Published
            })
        );
    }
}
