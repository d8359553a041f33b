use axum::Extension;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::extract::{Json, Path, Query};
use crate::models::{Role, SupportTicket, TicketStatus};
use crate::{proceeds, Error, Payload};

pub fn validate_ticket(body: &OpenTicket) -> Result<(), Error> {
    if body.subject.trim().is_empty() || body.message.trim().is_empty() {
        return Err(Error::invalid("`subject` and `message` are required"));
    }
    Ok(())
}

pub fn validate_update(body: &UpdateTicket) -> Result<(), Error> {
    let response_given = body
        .admin_response
        .as_deref()
        .map_or(false, |text| !text.trim().is_empty());
    if body.status.is_none() && !response_given {
        return Err(Error::invalid("Nothing to update"));
    }
    Ok(())
}

pub async fn open_ticket(
    user: AuthUser,
    Extension(pg): Extension<PgPool>,
    Json(body): Json<OpenTicket>,
) -> Payload<TicketResponse> {
    validate_ticket(&body)?;
    let ticket = sqlx::query_as::<_, SupportTicket>(
        "INSERT INTO support_tickets (id, user_id, subject, message, status) \
         VALUES ($1, $2, $3, $4, $5) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(user.id)
    .bind(body.subject.trim())
    .bind(body.message.trim())
    .bind(TicketStatus::Open)
    .fetch_one(&pg)
    .await?;
    log::info!("support ticket {} opened by {}", ticket.id, user.id);
    proceeds(TicketResponse { ticket })
}

pub async fn my_tickets(user: AuthUser, Extension(pg): Extension<PgPool>) -> Payload<TicketList> {
    let tickets = sqlx::query_as::<_, SupportTicket>(
        "SELECT * FROM support_tickets WHERE user_id = $1 ORDER BY created_at DESC",
    )
    .bind(user.id)
    .fetch_all(&pg)
    .await?;
    proceeds(TicketList { tickets })
}

pub async fn all_tickets(
    user: AuthUser,
    Query(filter): Query<TicketFilter>,
    Extension(pg): Extension<PgPool>,
) -> Payload<TicketList> {
    user.require(&[Role::Admin])?;
    let tickets = sqlx::query_as::<_, SupportTicket>(
        "SELECT * FROM support_tickets WHERE ($1::ticket_status IS NULL OR status = $1) \
         ORDER BY created_at DESC",
    )
    .bind(filter.status)
    .fetch_all(&pg)
    .await?;
    proceeds(TicketList { tickets })
}

pub async fn update_ticket(
    user: AuthUser,
    Path(id): Path<Uuid>,
    Extension(pg): Extension<PgPool>,
    Json(body): Json<UpdateTicket>,
) -> Payload<TicketResponse> {
    user.require(&[Role::Admin])?;
    validate_update(&body)?;
    let ticket = sqlx::query_as::<_, SupportTicket>(
        "UPDATE support_tickets SET status = COALESCE($2, status), \
         admin_response = COALESCE($3, admin_response), updated_at = now() \
         WHERE id = $1 RETURNING *",
    )
    .bind(id)
    .bind(body.status)
    .bind(body.admin_response)
    .fetch_optional(&pg)
    .await?
    .ok_or_else(|| Error::not_found(format!("Ticket `{}` does not exist", id)))?;
    proceeds(TicketResponse { ticket })
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenTicket {
    pub subject: String,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTicket {
    #[serde(default)]
    pub status: Option<TicketStatus>,
    #[serde(default)]
    pub admin_response: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TicketFilter {
    pub status: Option<TicketStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TicketResponse {
    pub ticket: SupportTicket,
}

#[derive(Debug, Clone, Serialize)]
pub struct TicketList {
    pub tickets: Vec<SupportTicket>,
}
