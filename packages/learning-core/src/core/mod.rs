mod event_bus;

pub use event_bus::{
    AbilityShiftedPayload, AnswerRecordedPayload, ContentPublishedPayload, CoreEvent,
    CourseCompletedPayload, EventBus, EventEnvelope, LessonCompletedPayload,
    QuizCompletedPayload,
};
