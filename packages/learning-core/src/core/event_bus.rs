use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 1024;

/// Notifications published after the transaction that produced them commits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    #[serde(rename = "ANSWER_RECORDED")]
    AnswerRecorded(AnswerRecordedPayload),

    #[serde(rename = "QUIZ_COMPLETED")]
    QuizCompleted(QuizCompletedPayload),

    #[serde(rename = "LESSON_COMPLETED")]
    LessonCompleted(LessonCompletedPayload),

    #[serde(rename = "COURSE_COMPLETED")]
    CourseCompleted(CourseCompletedPayload),

    #[serde(rename = "ABILITY_SHIFTED")]
    AbilityShifted(AbilityShiftedPayload),

    #[serde(rename = "CONTENT_PUBLISHED")]
    ContentPublished(ContentPublishedPayload),
}

impl CoreEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            CoreEvent::AnswerRecorded(_) => "ANSWER_RECORDED",
            CoreEvent::QuizCompleted(_) => "QUIZ_COMPLETED",
            CoreEvent::LessonCompleted(_) => "LESSON_COMPLETED",
            CoreEvent::CourseCompleted(_) => "COURSE_COMPLETED",
            CoreEvent::AbilityShifted(_) => "ABILITY_SHIFTED",
            CoreEvent::ContentPublished(_) => "CONTENT_PUBLISHED",
        }
    }

    /// None for system notifications
    pub fn user_id(&self) -> Option<i64> {
        match self {
            CoreEvent::AnswerRecorded(p) => Some(p.user_id),
            CoreEvent::QuizCompleted(p) => Some(p.user_id),
            CoreEvent::LessonCompleted(p) => Some(p.user_id),
            CoreEvent::CourseCompleted(p) => Some(p.user_id),
            CoreEvent::AbilityShifted(p) => Some(p.user_id),
            CoreEvent::ContentPublished(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerRecordedPayload {
    pub user_id: i64,
    pub quiz_id: i64,
    pub question_id: i64,
    pub is_correct: bool,
    pub event_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizCompletedPayload {
    pub user_id: i64,
    pub quiz_id: i64,
    pub session_id: String,
    pub event_id: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LessonCompletedPayload {
    pub user_id: i64,
    pub lesson_id: i64,
    pub course_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseCompletedPayload {
    pub user_id: i64,
    pub course_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbilityShiftedPayload {
    pub user_id: i64,
    pub previous: f64,
    pub current: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPublishedPayload {
    pub quiz_id: i64,
    pub subject_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub id: String,
    pub event: CoreEvent,
    pub created_at: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(event: CoreEvent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event,
            created_at: Utc::now(),
        }
    }
}

/// In-process fan-out of committed core notifications
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub async fn publish(&self, event: CoreEvent) {
        let envelope = EventEnvelope::new(event);
        let event_type = envelope.event.event_type();
        let user_id = envelope.event.user_id();

        match self.sender.send(envelope) {
            Ok(receivers) => debug!(event_type, user_id = ?user_id, sent_to = receivers, "Event published"),
            Err(_) => debug!(event_type, "No subscribers for event"),
        }
    }

    pub fn subscribe_global(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(user_id: i64) -> CoreEvent {
        CoreEvent::QuizCompleted(QuizCompletedPayload {
            user_id,
            quiz_id: 7,
            session_id: "s-1".to_string(),
            event_id: 42,
            occurred_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_each_event() {
        let bus = EventBus::new();
        let mut first = bus.subscribe_global();
        let mut second = bus.subscribe_global();

        bus.publish(completed(1)).await;
        bus.publish(CoreEvent::ContentPublished(ContentPublishedPayload {
            quiz_id: 3,
            subject_id: Some(1),
        }))
        .await;

        for receiver in [&mut first, &mut second] {
            let envelope = receiver.recv().await.unwrap();
            assert_eq!(envelope.event.event_type(), "QUIZ_COMPLETED");
            assert_eq!(envelope.event.user_id(), Some(1));
            let envelope = receiver.recv().await.unwrap();
            assert_eq!(envelope.event.user_id(), None);
            assert!(receiver.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let bus = EventBus::new();
        bus.publish(completed(2)).await;

        let mut late = bus.subscribe_global();
        assert!(late.try_recv().is_err());
    }
}
