//! Append-only event log: the source of truth for every derived table.

pub mod store;
pub mod types;

pub use store::{append, append_in, by_session, get, range, EventCursor, EventQuery};
pub use types::{
    AnswerSubmittedPayload, ContentChange, ContentChangedPayload, CourseCompletedPayload,
    EnrollmentCreatedPayload, Event, EventKind, EventPayload, InteractionTimePayload, ItemRef,
    ItemType, LessonCompletedPayload, NewEvent, QuizCompletedPayload, QuizStartedPayload,
    QuizSubmittedPayload, TargetKind, TargetRef,
};
