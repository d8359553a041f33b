use axum::Extension;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::extract::{Json, Path, Query};
use crate::models::{PublicUser, RequestStatus, Role, SessionStatus, TicketStatus, UserData};
use crate::{proceeds, Error, Payload};

/// Admins may change anyone's role except their own admin seat.
pub fn validate_role_change(actor: Uuid, target: Uuid, role: Role) -> Result<(), Error> {
    if actor == target && role != Role::Admin {
        return Err(Error::Conflict {
            message: "Admins cannot demote themselves".to_string(),
        });
    }
    Ok(())
}

pub async fn list_users(
    user: AuthUser,
    Query(filter): Query<UserFilter>,
    Extension(pg): Extension<PgPool>,
) -> Payload<UserList> {
    user.require(&[Role::Admin])?;
    let users = sqlx::query_as::<_, UserData>(
        "SELECT * FROM users WHERE ($1::user_role IS NULL OR role = $1) ORDER BY created_at DESC",
    )
    .bind(filter.role)
    .fetch_all(&pg)
    .await?;
    proceeds(UserList {
        users: users.into_iter().map(PublicUser::from).collect(),
    })
}

pub async fn change_role(
    user: AuthUser,
    Path(id): Path<Uuid>,
    Extension(pg): Extension<PgPool>,
    Json(body): Json<ChangeRole>,
) -> Payload<ChangedUser> {
    user.require(&[Role::Admin])?;
    validate_role_change(user.id, id, body.role)?;
    let updated = sqlx::query_as::<_, UserData>("UPDATE users SET role = $2 WHERE id = $1 RETURNING *")
        .bind(id)
        .bind(body.role)
        .fetch_optional(&pg)
        .await?
        .ok_or_else(|| Error::UserDoesNotExist {
            message: format!("User with id `{}` does not exist!", id),
        })?;
    log::info!("user {} is now {:?} (changed by {})", id, body.role, user.id);
    proceeds(ChangedUser {
        user: updated.into(),
    })
}

async fn count_users(pg: &PgPool, role: Role) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE role = $1")
        .bind(role)
        .fetch_one(pg)
        .await
}

pub async fn stats(user: AuthUser, Extension(pg): Extension<PgPool>) -> Payload<PlatformStats> {
    user.require(&[Role::Admin])?;

    let students = count_users(&pg, Role::Student).await?;
    let tutors = count_users(&pg, Role::Tutor).await?;
    let admins = count_users(&pg, Role::Admin).await?;

    let pending_requests =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM session_requests WHERE status = $1")
            .bind(RequestStatus::Pending)
            .fetch_one(&pg)
            .await?;
    let upcoming_sessions = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM sessions WHERE status = $1 AND start_time > now()",
    )
    .bind(SessionStatus::Scheduled)
    .fetch_one(&pg)
    .await?;
    let open_tickets = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM support_tickets WHERE status IN ($1, $2)",
    )
    .bind(TicketStatus::Open)
    .bind(TicketStatus::InProgress)
    .fetch_one(&pg)
    .await?;

    proceeds(PlatformStats {
        students,
        tutors,
        admins,
        pending_requests,
        upcoming_sessions,
        open_tickets,
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserFilter {
    pub role: Option<Role>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeRole {
    pub role: Role,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserList {
    pub users: Vec<PublicUser>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangedUser {
    pub user: PublicUser,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformStats {
    pub students: i64,
    pub tutors: i64,
    pub admins: i64,
    pub pending_requests: i64,
    pub upcoming_sessions: i64,
    pub open_tickets: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::{FromRequest, RequestParts};
    use axum::http::Request;

    #[test]
    fn admins_cannot_demote_themselves() {
        let me = Uuid::new_v4();
        assert!(matches!(
            validate_role_change(me, me, Role::Tutor),
            Err(Error::Conflict { .. })
        ));
        assert!(validate_role_change(me, me, Role::Admin).is_ok());
        assert!(validate_role_change(me, Uuid::new_v4(), Role::Student).is_ok());
    }

    #[test]
    fn role_change_body_uses_wire_names() {
        let body: ChangeRole = serde_json::from_str(r#"{"role":"TUTOR"}"#).unwrap();
        assert_eq!(body.role, Role::Tutor);
        assert!(serde_json::from_str::<ChangeRole>(r#"{"role":"tutor"}"#).is_err());
    }

    async fn filter(uri: &str) -> Result<UserFilter, Error> {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let mut parts = RequestParts::new(request);
        let Query(filter) = Query::<UserFilter>::from_request(&mut parts).await?;
        Ok(filter)
    }

    #[tokio::test]
    async fn role_filter_reads_the_query() {
        assert_eq!(
            filter("/admin/users?role=STUDENT").await.unwrap().role,
            Some(Role::Student)
        );
        assert_eq!(filter("/admin/users").await.unwrap().role, None);
        assert!(filter("/admin/users?role=OWNER").await.is_err());
    }

    #[test]
    fn stats_are_camel_case() {
        let json = serde_json::to_value(PlatformStats {
            students: 10,
            tutors: 3,
            admins: 1,
            pending_requests: 2,
            upcoming_sessions: 4,
            open_tickets: 0,
        })
        .unwrap();
        assert_eq!(json["pendingRequests"], 2);
        assert_eq!(json["upcomingSessions"], 4);
        assert_eq!(json["openTickets"], 0);
    }
}
