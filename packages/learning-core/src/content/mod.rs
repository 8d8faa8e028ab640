//! Content read model: the narrow view of quizzes, questions, lessons, courses and
//! user preferences the learning core depends on. The host owns these rows and keeps
//! them current through [`sync`].

pub mod answers;
pub mod sync;

use std::collections::HashSet;

use async_trait::async_trait;
use lumen_algo::{Interests, ItemFacets};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::CoreResult;
use crate::events::ItemRef;

pub use answers::{AnswerChecker, AnswerCheckers};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizInfo {
    pub id: i64,
    pub creator_id: i64,
    pub subject_id: Option<i64>,
    pub language: Option<String>,
    pub tags: Vec<String>,
    pub course_id: Option<i64>,
    pub published: bool,
    pub question_count: i64,
    /// First question by (position, id)
    pub first_question_id: Option<i64>,
}

impl QuizInfo {
    pub fn facets(&self) -> ItemFacets {
        ItemFacets {
            subject_id: self.subject_id,
            language: self.language.clone(),
            tags: self.tags.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionInfo {
    pub id: i64,
    pub quiz_id: i64,
    pub question_type: String,
    pub correct_answer: Value,
    pub position: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonInfo {
    pub id: i64,
    pub course_id: Option<i64>,
    pub creator_id: i64,
    pub published: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseInfo {
    pub id: i64,
    pub creator_id: i64,
    pub is_premium: bool,
    pub published: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserPreferences {
    pub user_id: i64,
    pub interested_subjects: Vec<i64>,
    pub interested_tags: Vec<String>,
    pub languages: Vec<String>,
}

impl UserPreferences {
    pub fn interests(&self) -> Interests {
        Interests {
            subjects: self.interested_subjects.iter().copied().collect(),
            tags: self.interested_tags.iter().cloned().collect(),
            languages: self.languages.iter().cloned().collect::<HashSet<_>>(),
        }
    }
}

/// Everything the core reads about content. Implemented over SQL by
/// [`SqlContentModel`]; hosts with their own catalogue can supply another.
#[async_trait]
pub trait ContentReadModel: Send + Sync {
    async fn quiz(&self, quiz_id: i64) -> CoreResult<Option<QuizInfo>>;

    async fn question(&self, question_id: i64) -> CoreResult<Option<QuestionInfo>>;

    /// Question ids of a quiz ordered by (position, id)
    async fn quiz_question_ids(&self, quiz_id: i64) -> CoreResult<Vec<i64>>;

    async fn lesson(&self, lesson_id: i64) -> CoreResult<Option<LessonInfo>>;

    async fn course(&self, course_id: i64) -> CoreResult<Option<CourseInfo>>;

    async fn published_lesson_ids(&self, course_id: i64) -> CoreResult<Vec<i64>>;

    /// Empty preferences when the user never declared any
    async fn preferences(&self, user_id: i64) -> CoreResult<UserPreferences>;

    async fn published_quizzes(&self) -> CoreResult<Vec<QuizInfo>>;

    async fn embedding(&self, item: ItemRef) -> CoreResult<Option<Vec<f64>>>;

    /// Quizzes (any publication state) filed under a subject
    async fn quiz_ids_in_subject(&self, subject_id: i64) -> CoreResult<Vec<i64>>;

    /// Users whose declared interests include the subject
    async fn users_interested_in(&self, subject_id: i64) -> CoreResult<Vec<i64>>;
}

const QUIZ_SELECT: &str = r#"
    SELECT q."id", q."creator_id", q."subject_id", q."language", q."tags", q."course_id", q."published",
           (SELECT COUNT(*) FROM "questions" qs WHERE qs."quiz_id" = q."id") AS "question_count",
           (SELECT qs."id" FROM "questions" qs WHERE qs."quiz_id" = q."id"
             ORDER BY qs."position", qs."id" LIMIT 1) AS "first_question_id"
    FROM "quizzes" q
"#;

#[derive(Clone)]
pub struct SqlContentModel {
    pool: SqlitePool,
}

impl SqlContentModel {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn json_list<T: serde::de::DeserializeOwned>(raw: &str) -> CoreResult<Vec<T>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(raw)?)
}

fn quiz_from_row(row: &SqliteRow) -> CoreResult<QuizInfo> {
    let tags: String = row.try_get("tags")?;
    Ok(QuizInfo {
        id: row.try_get("id")?,
        creator_id: row.try_get("creator_id")?,
        subject_id: row.try_get("subject_id")?,
        language: row.try_get("language")?,
        tags: json_list(&tags)?,
        course_id: row.try_get("course_id")?,
        published: row.try_get("published")?,
        question_count: row.try_get("question_count")?,
        first_question_id: row.try_get("first_question_id")?,
    })
}

#[async_trait]
impl ContentReadModel for SqlContentModel {
    async fn quiz(&self, quiz_id: i64) -> CoreResult<Option<QuizInfo>> {
        let sql = format!(r#"{QUIZ_SELECT} WHERE q."id" = ?"#);
        let row = sqlx::query(&sql).bind(quiz_id).fetch_optional(&self.pool).await?;
        row.as_ref().map(quiz_from_row).transpose()
    }

    async fn question(&self, question_id: i64) -> CoreResult<Option<QuestionInfo>> {
        let row = sqlx::query(
            r#"SELECT "id", "quiz_id", "question_type", "correct_answer", "position"
               FROM "questions" WHERE "id" = ?"#,
        )
        .bind(question_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let raw: String = row.try_get("correct_answer")?;
        Ok(Some(QuestionInfo {
            id: row.try_get("id")?,
            quiz_id: row.try_get("quiz_id")?,
            question_type: row.try_get("question_type")?,
            correct_answer: serde_json::from_str(&raw)?,
            position: row.try_get("position")?,
        }))
    }

    async fn quiz_question_ids(&self, quiz_id: i64) -> CoreResult<Vec<i64>> {
        let ids = sqlx::query_scalar(
            r#"SELECT "id" FROM "questions" WHERE "quiz_id" = ? ORDER BY "position", "id""#,
        )
        .bind(quiz_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn lesson(&self, lesson_id: i64) -> CoreResult<Option<LessonInfo>> {
        let row = sqlx::query(
            r#"SELECT "id", "course_id", "creator_id", "published" FROM "lessons" WHERE "id" = ?"#,
        )
        .bind(lesson_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(LessonInfo {
            id: row.try_get("id")?,
            course_id: row.try_get("course_id")?,
            creator_id: row.try_get("creator_id")?,
            published: row.try_get("published")?,
        }))
    }

    async fn course(&self, course_id: i64) -> CoreResult<Option<CourseInfo>> {
        let row = sqlx::query(
            r#"SELECT "id", "creator_id", "is_premium", "published" FROM "courses" WHERE "id" = ?"#,
        )
        .bind(course_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(CourseInfo {
            id: row.try_get("id")?,
            creator_id: row.try_get("creator_id")?,
            is_premium: row.try_get("is_premium")?,
            published: row.try_get("published")?,
        }))
    }

    async fn published_lesson_ids(&self, course_id: i64) -> CoreResult<Vec<i64>> {
        let ids = sqlx::query_scalar(
            r#"SELECT "id" FROM "lessons" WHERE "course_id" = ? AND "published" = 1 ORDER BY "position", "id""#,
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn preferences(&self, user_id: i64) -> CoreResult<UserPreferences> {
        let row = sqlx::query(
            r#"SELECT "interested_subjects", "interested_tags", "languages"
               FROM "user_preferences" WHERE "user_id" = ?"#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(UserPreferences {
                user_id,
                ..Default::default()
            });
        };
        let subjects: String = row.try_get("interested_subjects")?;
        let tags: String = row.try_get("interested_tags")?;
        let languages: String = row.try_get("languages")?;
        Ok(UserPreferences {
            user_id,
            interested_subjects: json_list(&subjects)?,
            interested_tags: json_list(&tags)?,
            languages: json_list(&languages)?,
        })
    }

    async fn published_quizzes(&self) -> CoreResult<Vec<QuizInfo>> {
        let sql = format!(r#"{QUIZ_SELECT} WHERE q."published" = 1 ORDER BY q."id""#);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(quiz_from_row).collect()
    }

    async fn embedding(&self, item: ItemRef) -> CoreResult<Option<Vec<f64>>> {
        let raw: Option<String> = sqlx::query_scalar(
            r#"SELECT "vector" FROM "item_embeddings" WHERE "item_type" = ? AND "item_id" = ?"#,
        )
        .bind(item.item_type.as_str())
        .bind(item.item_id)
        .fetch_optional(&self.pool)
        .await?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn quiz_ids_in_subject(&self, subject_id: i64) -> CoreResult<Vec<i64>> {
        let ids = sqlx::query_scalar(r#"SELECT "id" FROM "quizzes" WHERE "subject_id" = ? ORDER BY "id""#)
            .bind(subject_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn users_interested_in(&self, subject_id: i64) -> CoreResult<Vec<i64>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT DISTINCT p."user_id" FROM "user_preferences" p, json_each(p."interested_subjects") s
            WHERE s."value" = ?
            ORDER BY p."user_id"
            "#,
        )
        .bind(subject_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::sync::{self, QuestionRecord, QuizRecord};
    use super::*;
    use crate::db::Database;
    use serde_json::json;

    #[tokio::test]
    async fn test_quiz_read_model_orders_questions() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect(&dir.path().join("c.db")).await.unwrap();
        let pool = db.pool().clone();

        sync::upsert_quiz(
            &pool,
            &QuizRecord {
                id: 1,
                creator_id: 9,
                title: "Fractions".to_string(),
                subject_id: Some(3),
                language: Some("en".to_string()),
                tags: vec!["math".to_string()],
                course_id: None,
                published: true,
            },
        )
        .await
        .unwrap();
        for (id, position) in [(12, 1), (11, 1), (10, 2)] {
            sync::upsert_question(
                &pool,
                &QuestionRecord {
                    id,
                    quiz_id: 1,
                    question_type: "mcq".to_string(),
                    correct_answer: json!(0),
                    position,
                },
            )
            .await
            .unwrap();
        }

        let model = SqlContentModel::new(pool);
        let quiz = model.quiz(1).await.unwrap().unwrap();
        assert_eq!(quiz.question_count, 3);
        assert_eq!(quiz.first_question_id, Some(11));
        assert_eq!(quiz.tags, vec!["math".to_string()]);
        assert_eq!(model.quiz_question_ids(1).await.unwrap(), vec![11, 12, 10]);
        assert!(model.quiz(2).await.unwrap().is_none());

        let prefs = model.preferences(5).await.unwrap();
        assert!(prefs.interested_subjects.is_empty());
    }
}
