//! `/smart-quad/*`: group sessions and seat enrolment.

use std::sync::Arc;

use axum::Extension;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::config::Config;
use crate::extract::{Json, Path, Query};
use crate::google::calendar::{publish_best_effort, remove_best_effort};
use crate::google::{tokens, EventDraft, Integrations};
use crate::models::{Role, Session, SessionStatus, SessionType, UserData};
use crate::{breaks, proceeds, Error, Payload};

/// Checks a new session and returns the seat limit it will have.
pub fn validate_new_session(
    body: &CreateSession,
    now: DateTime<Utc>,
    max_minutes: i64,
) -> Result<i32, Error> {
    if body.title.trim().is_empty() {
        return Err(Error::invalid("`title` parameter was empty"));
    }
    if body.course_type.trim().is_empty() {
        return Err(Error::invalid("`courseType` parameter was empty"));
    }
    if body.start_time <= now {
        return Err(Error::invalid("`startTime` must be in the future"));
    }
    if body.end_time <= body.start_time {
        return Err(Error::invalid("`endTime` must be after `startTime`"));
    }
    if body.end_time - body.start_time > Duration::minutes(max_minutes) {
        return Err(Error::invalid(format!(
            "Sessions cannot be longer than {} minutes",
            max_minutes
        )));
    }
    let capacity = body.session_type.capacity();
    let max = body.max_participants.unwrap_or(capacity);
    if max < 1 || max > capacity {
        return Err(Error::invalid(format!(
            "`maxParticipants` must be between 1 and {} for {:?}",
            capacity, body.session_type
        )));
    }
    Ok(max)
}

pub fn session_draft(session: &Session, tutor: Option<&UserData>) -> EventDraft {
    EventDraft {
        summary: session.title.clone(),
        description: session.description.clone().unwrap_or_else(|| {
            format!("{:?} {} session", session.session_type, session.course_type)
        }),
        start: session.start_time,
        end: session.end_time,
        attendees: tutor.iter().map(|t| t.email.clone()).collect(),
    }
}

/// The session's event and the user whose calendar holds it. Rows written
/// before the owner was recorded fall back to the tutor.
pub fn calendar_event(session: &Session) -> Option<(Uuid, &str)> {
    let event_id = session.event_id.as_deref()?;
    Some((session.calendar_owner_id.unwrap_or(session.tutor_id), event_id))
}

async fn load_session(pg: &PgPool, id: Uuid) -> Result<Session, Error> {
    sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = $1")
        .bind(id)
        .fetch_optional(pg)
        .await?
        .ok_or_else(|| Error::not_found(format!("Session `{}` does not exist", id)))
}

pub async fn list_sessions(
    _user: AuthUser,
    Query(filter): Query<SessionFilter>,
    Extension(pg): Extension<PgPool>,
) -> Payload<SessionList> {
    let sessions = sqlx::query_as::<_, Session>(
        "SELECT * FROM sessions WHERE status = $1 AND start_time > now() \
         AND current_participants < max_participants \
         AND ($2::session_type IS NULL OR session_type = $2) \
         AND ($3::text IS NULL OR course_type = $3) \
         ORDER BY start_time ASC",
    )
    .bind(SessionStatus::Scheduled)
    .bind(filter.session_type)
    .bind(filter.course_type)
    .fetch_all(&pg)
    .await?;
    proceeds(SessionList { sessions })
}

pub async fn get_session(
    _user: AuthUser,
    Path(id): Path<Uuid>,
    Extension(pg): Extension<PgPool>,
) -> Payload<SessionResponse> {
    let session = load_session(&pg, id).await?;
    proceeds(SessionResponse { session })
}

pub async fn create_session(
    user: AuthUser,
    Extension(pg): Extension<PgPool>,
    Extension(config): Extension<Arc<Config>>,
    Extension(google): Extension<Integrations>,
    Json(body): Json<CreateSession>,
) -> Payload<SessionResponse> {
    user.require(&[Role::Tutor, Role::Admin])?;
    let max_participants = validate_new_session(&body, Utc::now(), config.max_session_minutes)?;

    let tutor_id = match (user.role, body.tutor_id) {
        (Role::Admin, Some(tutor_id)) => tutor_id,
        (Role::Admin, None) => return breaks(Error::invalid("`tutorId` is required for admins")),
        _ => user.id,
    };
    let tutor = sqlx::query_as::<_, UserData>("SELECT * FROM users WHERE id = $1")
        .bind(tutor_id)
        .fetch_optional(&pg)
        .await?;
    match tutor {
        Some(ref tutor) if tutor.role == Role::Tutor => {}
        _ => {
            return breaks(Error::invalid(format!(
                "User `{}` is not a tutor",
                tutor_id
            )))
        }
    }

    let session = sqlx::query_as::<_, Session>(
        "INSERT INTO sessions (id, title, description, tutor_id, start_time, end_time, \
         session_type, course_type, max_participants, current_participants, status) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, $10) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(body.title.trim())
    .bind(&body.description)
    .bind(tutor_id)
    .bind(body.start_time)
    .bind(body.end_time)
    .bind(body.session_type)
    .bind(body.course_type.trim())
    .bind(max_participants)
    .bind(SessionStatus::Scheduled)
    .fetch_one(&pg)
    .await?;

    let draft = session_draft(&session, tutor.as_ref());
    let token = tokens::try_access_token(&pg, &google.oauth, user.id).await;
    let session = match publish_best_effort(google.calendar.as_ref(), token.as_deref(), None, &draft)
        .await
    {
        Some(event) => {
            let recorded = sqlx::query_as::<_, Session>(
                "UPDATE sessions SET event_id = $2, meet_link = $3, calendar_owner_id = $4 \
                 WHERE id = $1 AND status = $5 RETURNING *",
            )
            .bind(session.id)
            .bind(&event.event_id)
            .bind(&event.meet_link)
            .bind(user.id)
            .bind(SessionStatus::Scheduled)
            .fetch_optional(&pg)
            .await;
            match recorded {
                Ok(Some(recorded)) => recorded,
                outcome => {
                    log::warn!(
                        "session {} changed before event {} was recorded: {:?}",
                        session.id,
                        event.event_id,
                        outcome.err()
                    );
                    remove_best_effort(google.calendar.as_ref(), token.as_deref(), &event.event_id)
                        .await;
                    session
                }
            }
        }
        None => session,
    };

    log::info!(
        "{:?} session {} created by {} ({} seats)",
        session.session_type,
        session.id,
        user.id,
        session.max_participants
    );
    proceeds(SessionResponse { session })
}

/// Claims a seat. The enrolment row and the counter move together in one
/// transaction, and the counter update only succeeds while seats remain.
pub async fn enroll(
    user: AuthUser,
    Path(id): Path<Uuid>,
    Extension(pg): Extension<PgPool>,
) -> Payload<SessionResponse> {
    user.require(&[Role::Student])?;
    load_session(&pg, id).await?;
    let mut tx = pg.begin().await?;

    let inserted = sqlx::query(
        "INSERT INTO session_enrollments (session_id, student_id) VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
    )
    .bind(id)
    .bind(user.id)
    .execute(&mut tx)
    .await?;
    if inserted.rows_affected() == 0 {
        return breaks(Error::Conflict {
            message: "Already enrolled in this session".to_string(),
        });
    }

    let session = sqlx::query_as::<_, Session>(
        "UPDATE sessions SET current_participants = current_participants + 1 \
         WHERE id = $1 AND status = $2 AND start_time > now() \
         AND current_participants < max_participants RETURNING *",
    )
    .bind(id)
    .bind(SessionStatus::Scheduled)
    .fetch_optional(&mut tx)
    .await?;

    let session = match session {
        Some(session) => session,
        None => {
            tx.rollback().await?;
            return breaks(Error::SessionFull {
                message: "This session is full, closed or already started".to_string(),
            });
        }
    };
    tx.commit().await?;

    log::info!("student {} enrolled in session {}", user.id, id);
    proceeds(SessionResponse { session })
}

pub async fn unenroll(
    user: AuthUser,
    Path(id): Path<Uuid>,
    Extension(pg): Extension<PgPool>,
) -> Payload<SessionResponse> {
    user.require(&[Role::Student])?;
    let mut tx = pg.begin().await?;

    let removed =
        sqlx::query("DELETE FROM session_enrollments WHERE session_id = $1 AND student_id = $2")
            .bind(id)
            .bind(user.id)
            .execute(&mut tx)
            .await?;
    if removed.rows_affected() == 0 {
        return breaks(Error::not_found("Not enrolled in this session"));
    }

    let session = sqlx::query_as::<_, Session>(
        "UPDATE sessions SET current_participants = current_participants - 1 \
         WHERE id = $1 AND current_participants > 0 RETURNING *",
    )
    .bind(id)
    .fetch_one(&mut tx)
    .await?;
    tx.commit().await?;

    proceeds(SessionResponse { session })
}

pub async fn my_sessions(
    user: AuthUser,
    Extension(pg): Extension<PgPool>,
) -> Payload<SessionList> {
    let sessions = sqlx::query_as::<_, Session>(
        "SELECT s.* FROM sessions s WHERE s.tutor_id = $1 \
         OR EXISTS (SELECT 1 FROM session_enrollments e \
                    WHERE e.session_id = s.id AND e.student_id = $1) \
         ORDER BY s.start_time ASC",
    )
    .bind(user.id)
    .fetch_all(&pg)
    .await?;
    proceeds(SessionList { sessions })
}

pub async fn cancel_session(
    user: AuthUser,
    Path(id): Path<Uuid>,
    Extension(pg): Extension<PgPool>,
    Extension(google): Extension<Integrations>,
) -> Payload<SessionResponse> {
    user.require(&[Role::Tutor, Role::Admin])?;
    let session = load_session(&pg, id).await?;
    if !user.is_admin() && session.tutor_id != user.id {
        return breaks(Error::forbidden("Only the session's tutor can cancel it"));
    }

    let cancelled = sqlx::query_as::<_, Session>(
        "UPDATE sessions SET status = $2, event_id = NULL, meet_link = NULL, \
         calendar_owner_id = NULL WHERE id = $1 AND status = $3 RETURNING *",
    )
    .bind(id)
    .bind(SessionStatus::Cancelled)
    .bind(SessionStatus::Scheduled)
    .fetch_optional(&pg)
    .await?
    .ok_or_else(|| Error::Conflict {
        message: format!("Session is {:?} and cannot be cancelled", session.status),
    })?;

    if let Some((owner, event_id)) = calendar_event(&session) {
        let token = tokens::try_access_token(&pg, &google.oauth, owner).await;
        remove_best_effort(google.calendar.as_ref(), token.as_deref(), event_id).await;
    }

    proceeds(SessionResponse { session: cancelled })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSession {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tutor_id: Option<Uuid>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub session_type: SessionType,
    pub course_type: String,
    #[serde(default)]
    pub max_participants: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFilter {
    #[serde(rename = "type")]
    pub session_type: Option<SessionType>,
    pub course_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionResponse {
    pub session: Session,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionList {
    pub sessions: Vec<Session>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(start_in: Duration, length: Duration, kind: SessionType) -> CreateSession {
        let start = Utc::now() + start_in;
        CreateSession {
            title: "Smart Quad: SAT Reading".to_string(),
            description: None,
            tutor_id: None,
            start_time: start,
            end_time: start + length,
            session_type: kind,
            course_type: "SAT".to_string(),
            max_participants: None,
        }
    }

    #[test]
    fn defaults_to_type_capacity() {
        let new = body(Duration::days(1), Duration::minutes(60), SessionType::SmartQuad);
        assert_eq!(validate_new_session(&new, Utc::now(), 180).unwrap(), 4);
        let new = body(Duration::days(1), Duration::minutes(60), SessionType::Masterclass);
        assert_eq!(validate_new_session(&new, Utc::now(), 180).unwrap(), 15);
    }

    #[test]
    fn rejects_past_start_times() {
        let new = body(-Duration::hours(1), Duration::minutes(60), SessionType::OneToOne);
        assert!(matches!(
            validate_new_session(&new, Utc::now(), 180),
            Err(Error::InvalidPayload { .. })
        ));
    }

    #[test]
    fn rejects_overlong_and_inverted_sessions() {
        let long = body(Duration::days(1), Duration::minutes(181), SessionType::SmartQuad);
        assert!(validate_new_session(&long, Utc::now(), 180).is_err());
        let exact = body(Duration::days(1), Duration::minutes(180), SessionType::SmartQuad);
        assert!(validate_new_session(&exact, Utc::now(), 180).is_ok());
        let inverted = body(Duration::days(1), -Duration::minutes(30), SessionType::SmartQuad);
        assert!(validate_new_session(&inverted, Utc::now(), 180).is_err());
    }

    #[test]
    fn seat_override_bounded_by_type() {
        let mut new = body(Duration::days(1), Duration::minutes(60), SessionType::SmartQuad);
        new.max_participants = Some(3);
        assert_eq!(validate_new_session(&new, Utc::now(), 180).unwrap(), 3);
        new.max_participants = Some(5);
        assert!(validate_new_session(&new, Utc::now(), 180).is_err());
        new.max_participants = Some(0);
        assert!(validate_new_session(&new, Utc::now(), 180).is_err());
    }

    #[test]
    fn filter_reads_type_from_query() {
        let filter: SessionFilter =
            serde_json::from_str(r#"{"type":"SMART_QUAD","courseType":"ACT"}"#).unwrap();
        assert_eq!(filter.session_type, Some(SessionType::SmartQuad));
        assert_eq!(filter.course_type.as_deref(), Some("ACT"));
    }

    fn session() -> Session {
        let start = Utc::now() + Duration::days(2);
        Session {
            id: Uuid::new_v4(),
            title: "ACT Reading Quad".to_string(),
            description: None,
            tutor_id: Uuid::new_v4(),
            start_time: start,
            end_time: start + Duration::minutes(90),
            session_type: SessionType::SmartQuad,
            course_type: "ACT".to_string(),
            max_participants: 4,
            current_participants: 1,
            event_id: None,
            meet_link: None,
            calendar_owner_id: None,
            status: SessionStatus::Scheduled,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn cancelled_event_is_removed_from_its_owners_calendar() {
        let admin = Uuid::new_v4();
        let mut quad = session();
        assert_eq!(calendar_event(&quad), None);

        quad.event_id = Some("evt-9".to_string());
        quad.calendar_owner_id = Some(admin);
        assert_eq!(calendar_event(&quad), Some((admin, "evt-9")));

        quad.calendar_owner_id = None;
        assert_eq!(calendar_event(&quad), Some((quad.tutor_id, "evt-9")));
    }

    #[test]
    fn draft_describes_the_session() {
        let quad = session();
        let draft = session_draft(&quad, None);
        assert_eq!(draft.summary, "ACT Reading Quad");
        assert_eq!(draft.description, "SmartQuad ACT session");
        assert_eq!(draft.end - draft.start, Duration::minutes(90));
        assert!(draft.attendees.is_empty());
    }

    #[test]
    fn calendar_owner_stays_off_the_wire() {
        let mut quad = session();
        quad.calendar_owner_id = Some(Uuid::new_v4());
        let json = serde_json::to_value(&quad).unwrap();
        assert!(json.get("calendarOwnerId").is_none());
        assert_eq!(json["sessionType"], "SMART_QUAD");
    }
}
