//! Session requests: students ask for a slot, admins move the request
//! through its lifecycle and the calendar follows along.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Extension;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::config::Config;
use crate::extract::{Json, OptionalJson, Path, Query};
use crate::google::calendar::{publish_best_effort, remove_best_effort};
use crate::google::{tokens, CalendarProvider, EventDraft, GoogleOAuth, Integrations, PublishedEvent};
use crate::lifecycle::RequestAction;
use crate::models::{RequestStatus, Role, SessionRequest, UserData};
use crate::{breaks, proceeds, Error, Payload};

pub fn validate_new_request(
    body: &CreateSessionRequest,
    today: NaiveDate,
    max_minutes: i64,
) -> Result<(), Error> {
    if body.subject.trim().is_empty() {
        return Err(Error::invalid("`subject` parameter was empty"));
    }
    if body.duration <= 0 || i64::from(body.duration) > max_minutes {
        return Err(Error::invalid(format!(
            "`duration` must be between 1 and {} minutes",
            max_minutes
        )));
    }
    if body.preferred_date < today {
        return Err(Error::invalid("`preferredDate` is in the past"));
    }
    Ok(())
}

/// Explicit schedule wins; otherwise the student's preferred slot, read as UTC.
pub fn resolve_schedule(
    request: &SessionRequest,
    explicit: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    explicit
        .or(request.scheduled_date_time)
        .unwrap_or_else(|| {
            Utc.from_utc_datetime(&request.preferred_date.and_time(request.preferred_time))
        })
}

pub fn event_draft(
    request: &SessionRequest,
    start: DateTime<Utc>,
    student: &UserData,
    tutor: Option<&UserData>,
) -> EventDraft {
    let summary = match tutor {
        Some(tutor) => format!("{} session: {} with {}", request.subject, student.name, tutor.name),
        None => format!("{} session: {}", request.subject, student.name),
    };
    let mut attendees = vec![student.email.clone()];
    if let Some(tutor) = tutor {
        attendees.push(tutor.email.clone());
    }
    EventDraft {
        summary,
        description: request
            .admin_notes
            .clone()
            .unwrap_or_else(|| "ScoreSmart tutoring session".to_string()),
        start,
        end: start + Duration::minutes(i64::from(request.duration)),
        attendees,
    }
}

async fn load_request(pg: &PgPool, id: Uuid) -> Result<SessionRequest, Error> {
    sqlx::query_as::<_, SessionRequest>("SELECT * FROM session_requests WHERE id = $1")
        .bind(id)
        .fetch_optional(pg)
        .await?
        .ok_or_else(|| Error::not_found(format!("Session request `{}` does not exist", id)))
}

async fn load_user(pg: &PgPool, id: Uuid) -> Result<UserData, Error> {
    sqlx::query_as::<_, UserData>("SELECT * FROM users WHERE id = $1")
        .bind(id)
        .fetch_optional(pg)
        .await?
        .ok_or_else(|| Error::UserDoesNotExist {
            message: format!("User with id `{}` does not exist!", id),
        })
}

pub async fn create_request(
    user: AuthUser,
    Extension(pg): Extension<PgPool>,
    Extension(config): Extension<Arc<Config>>,
    Json(body): Json<CreateSessionRequest>,
) -> Payload<SessionRequestResponse> {
    user.require(&[Role::Student])?;
    validate_new_request(&body, Utc::now().date_naive(), config.max_session_minutes)?;

    let request = sqlx::query_as::<_, SessionRequest>(
        "INSERT INTO session_requests \
         (id, student_id, subject, preferred_date, preferred_time, duration, status) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(user.id)
    .bind(body.subject.trim())
    .bind(body.preferred_date)
    .bind(body.preferred_time)
    .bind(body.duration)
    .bind(RequestStatus::Pending)
    .fetch_one(&pg)
    .await?;

    log::info!("student {} requested session {}", user.id, request.id);
    proceeds(SessionRequestResponse { request })
}

pub async fn my_requests(
    user: AuthUser,
    Extension(pg): Extension<PgPool>,
) -> Payload<SessionRequestList> {
    let column = match user.role {
        Role::Student => "student_id",
        Role::Tutor => "tutor_id",
        Role::Admin => return breaks(Error::forbidden("Admins use /admin/session-requests")),
    };
    let requests = sqlx::query_as::<_, SessionRequest>(&format!(
        "SELECT * FROM session_requests WHERE {} = $1 ORDER BY created_at DESC",
        column
    ))
    .bind(user.id)
    .fetch_all(&pg)
    .await?;
    proceeds(SessionRequestList { requests })
}

/// Students may withdraw their own request while it is still pending.
pub async fn cancel_own_request(
    user: AuthUser,
    Path(id): Path<Uuid>,
    Extension(pg): Extension<PgPool>,
    Extension(google): Extension<Integrations>,
) -> Payload<SessionRequestResponse> {
    user.require(&[Role::Student])?;
    let request = load_request(&pg, id).await?;
    if request.student_id != user.id {
        return breaks(Error::forbidden("This session request belongs to another student"));
    }
    if request.status != RequestStatus::Pending {
        return breaks(Error::InvalidTransition {
            message: format!(
                "Only pending requests can be withdrawn, this one is {:?}",
                request.status
            ),
        });
    }
    let store = PgRequests::new(pg, &google);
    let request = run_transition(
        &store,
        google.calendar.as_ref(),
        user.id,
        request,
        RequestAction::Cancel,
        None,
    )
    .await?;
    proceeds(SessionRequestResponse { request })
}

pub async fn list_requests(
    user: AuthUser,
    Query(filter): Query<RequestFilter>,
    Extension(pg): Extension<PgPool>,
) -> Payload<SessionRequestList> {
    user.require(&[Role::Admin])?;
    let requests = sqlx::query_as::<_, SessionRequest>(
        "SELECT * FROM session_requests WHERE ($1::request_status IS NULL OR status = $1) \
         ORDER BY created_at DESC",
    )
    .bind(filter.status)
    .fetch_all(&pg)
    .await?;
    proceeds(SessionRequestList { requests })
}

pub async fn assign_request(
    user: AuthUser,
    Path(id): Path<Uuid>,
    Extension(pg): Extension<PgPool>,
    Extension(google): Extension<Integrations>,
    Json(body): Json<AssignTutor>,
) -> Payload<SessionRequestResponse> {
    user.require(&[Role::Admin])?;
    let tutor = load_user(&pg, body.tutor_id).await?;
    if tutor.role != Role::Tutor {
        return breaks(Error::invalid(format!(
            "User `{}` is not a tutor",
            body.tutor_id
        )));
    }
    let mut request = load_request(&pg, id).await?;
    if let Some(notes) = body.admin_notes {
        request.admin_notes = Some(notes);
    }
    request.tutor_id = Some(tutor.id);
    let scheduled = resolve_schedule(&request, body.scheduled_date_time);

    let store = PgRequests::new(pg, &google);
    let request = run_transition(
        &store,
        google.calendar.as_ref(),
        user.id,
        request,
        RequestAction::Assign,
        Some(scheduled),
    )
    .await?;
    proceeds(SessionRequestResponse { request })
}

pub async fn approve_request(
    user: AuthUser,
    Path(id): Path<Uuid>,
    Extension(pg): Extension<PgPool>,
    Extension(google): Extension<Integrations>,
    OptionalJson(body): OptionalJson<AdminNote>,
) -> Payload<SessionRequestResponse> {
    admin_action(user, id, pg, google, body, RequestAction::Approve).await
}

pub async fn reject_request(
    user: AuthUser,
    Path(id): Path<Uuid>,
    Extension(pg): Extension<PgPool>,
    Extension(google): Extension<Integrations>,
    OptionalJson(body): OptionalJson<AdminNote>,
) -> Payload<SessionRequestResponse> {
    admin_action(user, id, pg, google, body, RequestAction::Reject).await
}

pub async fn admin_cancel_request(
    user: AuthUser,
    Path(id): Path<Uuid>,
    Extension(pg): Extension<PgPool>,
    Extension(google): Extension<Integrations>,
    OptionalJson(body): OptionalJson<AdminNote>,
) -> Payload<SessionRequestResponse> {
    admin_action(user, id, pg, google, body, RequestAction::Cancel).await
}

pub async fn complete_request(
    user: AuthUser,
    Path(id): Path<Uuid>,
    Extension(pg): Extension<PgPool>,
    Extension(google): Extension<Integrations>,
    OptionalJson(body): OptionalJson<AdminNote>,
) -> Payload<SessionRequestResponse> {
    admin_action(user, id, pg, google, body, RequestAction::Complete).await
}

async fn admin_action(
    user: AuthUser,
    id: Uuid,
    pg: PgPool,
    google: Integrations,
    body: Option<AdminNote>,
    action: RequestAction,
) -> Payload<SessionRequestResponse> {
    user.require(&[Role::Admin])?;
    let mut request = load_request(&pg, id).await?;
    if let Some(AdminNote {
        admin_notes: Some(notes),
    }) = body
    {
        request.admin_notes = Some(notes);
    }
    let store = PgRequests::new(pg, &google);
    let request =
        run_transition(&store, google.calendar.as_ref(), user.id, request, action, None).await?;
    proceeds(SessionRequestResponse { request })
}

/// Calendar work that follows a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalendarStep {
    Nothing,
    Publish {
        owner: Uuid,
        existing: Option<String>,
    },
    Remove {
        owner: Uuid,
        event_id: String,
    },
}

pub fn calendar_step(action: RequestAction, request: &SessionRequest, actor: Uuid) -> CalendarStep {
    if action.publishes_event() {
        // events stay on the calendar that created them
        return CalendarStep::Publish {
            owner: request.calendar_owner_id.unwrap_or(actor),
            existing: request.calendar_event_id.clone(),
        };
    }
    match (action, &request.calendar_event_id, request.calendar_owner_id) {
        (RequestAction::Cancel, Some(event_id), Some(owner)) => CalendarStep::Remove {
            owner,
            event_id: event_id.clone(),
        },
        _ => CalendarStep::Nothing,
    }
}

/// Persistence used by [`run_transition`].
#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn load_user(&self, id: Uuid) -> Result<UserData, Error>;

    /// Writes `next` only if the row still has `request.status`. Cancelling
    /// also clears the stored event.
    async fn write_status(
        &self,
        request: &SessionRequest,
        next: RequestStatus,
        scheduled: Option<DateTime<Utc>>,
    ) -> Result<SessionRequest, Error>;

    /// Records a published event while the row is still in `status`.
    async fn attach_event(
        &self,
        id: Uuid,
        status: RequestStatus,
        event: &PublishedEvent,
        owner: Uuid,
    ) -> Result<Option<SessionRequest>, Error>;

    async fn access_token(&self, user_id: Uuid) -> Option<String>;
}

pub struct PgRequests {
    pg: PgPool,
    oauth: Arc<GoogleOAuth>,
}

impl PgRequests {
    pub fn new(pg: PgPool, google: &Integrations) -> Self {
        Self {
            pg,
            oauth: google.oauth.clone(),
        }
    }
}

#[async_trait]
impl RequestStore for PgRequests {
    async fn load_user(&self, id: Uuid) -> Result<UserData, Error> {
        load_user(&self.pg, id).await
    }

    async fn write_status(
        &self,
        request: &SessionRequest,
        next: RequestStatus,
        scheduled: Option<DateTime<Utc>>,
    ) -> Result<SessionRequest, Error> {
        let updated = sqlx::query_as::<_, SessionRequest>(
            "UPDATE session_requests SET status = $3, tutor_id = $4, scheduled_date_time = $5, \
             admin_notes = $6, \
             calendar_event_id = CASE WHEN $7::boolean THEN NULL ELSE calendar_event_id END, \
             calendar_event_link = CASE WHEN $7::boolean THEN NULL ELSE calendar_event_link END, \
             meet_link = CASE WHEN $7::boolean THEN NULL ELSE meet_link END, \
             calendar_owner_id = CASE WHEN $7::boolean THEN NULL ELSE calendar_owner_id END, \
             updated_at = now() \
             WHERE id = $1 AND status = $2 RETURNING *",
        )
        .bind(request.id)
        .bind(request.status)
        .bind(next)
        .bind(request.tutor_id)
        .bind(scheduled)
        .bind(&request.admin_notes)
        .bind(next == RequestStatus::Cancelled)
        .fetch_optional(&self.pg)
        .await?;

        updated.ok_or_else(|| changed_underneath(request.id))
    }

    async fn attach_event(
        &self,
        id: Uuid,
        status: RequestStatus,
        event: &PublishedEvent,
        owner: Uuid,
    ) -> Result<Option<SessionRequest>, Error> {
        let updated = sqlx::query_as::<_, SessionRequest>(
            "UPDATE session_requests SET calendar_event_id = $3, \
             calendar_event_link = COALESCE($4, calendar_event_link), \
             meet_link = COALESCE($5, meet_link), calendar_owner_id = $6, updated_at = now() \
             WHERE id = $1 AND status = $2 RETURNING *",
        )
        .bind(id)
        .bind(status)
        .bind(&event.event_id)
        .bind(&event.html_link)
        .bind(&event.meet_link)
        .bind(owner)
        .fetch_optional(&self.pg)
        .await?;
        Ok(updated)
    }

    async fn access_token(&self, user_id: Uuid) -> Option<String> {
        tokens::try_access_token(&self.pg, &self.oauth, user_id).await
    }
}

fn changed_underneath(id: Uuid) -> Error {
    Error::InvalidTransition {
        message: format!("Session request `{}` changed while it was being updated", id),
    }
}

/// Applies `action`: writes the new state guarded by the status we started
/// from, then runs the calendar side effect best-effort.
pub async fn run_transition(
    store: &dyn RequestStore,
    calendar: &dyn CalendarProvider,
    actor: Uuid,
    request: SessionRequest,
    action: RequestAction,
    scheduled: Option<DateTime<Utc>>,
) -> Result<SessionRequest, Error> {
    let next = request.status.apply(action)?;
    let scheduled = scheduled.or(request.scheduled_date_time);
    let step = calendar_step(action, &request, actor);

    let draft = match step {
        CalendarStep::Publish { .. } => {
            let student = store.load_user(request.student_id).await?;
            let tutor = match request.tutor_id {
                Some(tutor_id) => Some(store.load_user(tutor_id).await?),
                None => None,
            };
            let start = resolve_schedule(&request, scheduled);
            Some(event_draft(&request, start, &student, tutor.as_ref()))
        }
        _ => None,
    };

    let updated = store.write_status(&request, next, scheduled).await?;
    log::info!(
        "session request {} {:?} -> {:?} by {}",
        updated.id,
        request.status,
        updated.status,
        actor
    );

    match (step, draft) {
        (CalendarStep::Publish { owner, existing }, Some(draft)) => {
            let token = store.access_token(owner).await;
            let event =
                publish_best_effort(calendar, token.as_deref(), existing.as_deref(), &draft).await;
            let Some(event) = event else {
                return Ok(updated);
            };
            match store.attach_event(updated.id, updated.status, &event, owner).await {
                Ok(Some(with_event)) => Ok(with_event),
                outcome => {
                    log::warn!(
                        "session request {} moved on before event {} was recorded: {:?}",
                        updated.id,
                        event.event_id,
                        outcome.err()
                    );
                    if existing.is_none() {
                        remove_best_effort(calendar, token.as_deref(), &event.event_id).await;
                    }
                    Ok(updated)
                }
            }
        }
        (CalendarStep::Remove { owner, event_id }, _) => {
            let token = store.access_token(owner).await;
            remove_best_effort(calendar, token.as_deref(), &event_id).await;
            Ok(updated)
        }
        _ => Ok(updated),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub subject: String,
    pub preferred_date: NaiveDate,
    pub preferred_time: NaiveTime,
    pub duration: i32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignTutor {
    pub tutor_id: Uuid,
    #[serde(default)]
    pub scheduled_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub admin_notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminNote {
    #[serde(default)]
    pub admin_notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestFilter {
    pub status: Option<RequestStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionRequestResponse {
    pub request: SessionRequest,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionRequestList {
    pub requests: Vec<SessionRequest>,
}
