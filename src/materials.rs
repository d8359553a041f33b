use axum::Extension;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use url::Url;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::extract::{Json, Path, Query};
use crate::models::{Material, Role};
use crate::{breaks, proceeds, Error, Payload};

pub fn validate_material(body: &CreateMaterial) -> Result<(), Error> {
    if body.title.trim().is_empty() {
        return Err(Error::invalid("`title` parameter was empty"));
    }
    if body.subject.trim().is_empty() {
        return Err(Error::invalid("`subject` parameter was empty"));
    }
    match Url::parse(&body.file_url) {
        Ok(url) if url.scheme() == "https" || url.scheme() == "http" => Ok(()),
        _ => Err(Error::invalid("`fileUrl` must be an http(s) URL")),
    }
}

pub async fn list_materials(
    _user: AuthUser,
    Query(filter): Query<MaterialFilter>,
    Extension(pg): Extension<PgPool>,
) -> Payload<MaterialList> {
    let materials = sqlx::query_as::<_, Material>(
        "SELECT * FROM materials WHERE ($1::text IS NULL OR subject = $1) \
         ORDER BY created_at DESC",
    )
    .bind(filter.subject)
    .fetch_all(&pg)
    .await?;
    proceeds(MaterialList { materials })
}

pub async fn create_material(
    user: AuthUser,
    Extension(pg): Extension<PgPool>,
    Json(body): Json<CreateMaterial>,
) -> Payload<MaterialResponse> {
    user.require(&[Role::Tutor, Role::Admin])?;
    validate_material(&body)?;

    let material = sqlx::query_as::<_, Material>(
        "INSERT INTO materials (id, title, description, subject, file_url, uploaded_by) \
         VALUES ($1, $2, $3, $4, $5, $6) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(body.title.trim())
    .bind(&body.description)
    .bind(body.subject.trim())
    .bind(&body.file_url)
    .bind(user.id)
    .fetch_one(&pg)
    .await?;
    proceeds(MaterialResponse { material })
}

pub async fn delete_material(
    user: AuthUser,
    Path(id): Path<Uuid>,
    Extension(pg): Extension<PgPool>,
) -> Payload<Deleted> {
    let material = sqlx::query_as::<_, Material>("SELECT * FROM materials WHERE id = $1")
        .bind(id)
        .fetch_optional(&pg)
        .await?
        .ok_or_else(|| Error::not_found(format!("Material `{}` does not exist", id)))?;
    if !user.is_admin() && material.uploaded_by != user.id {
        return breaks(Error::forbidden("Only the uploader can delete this material"));
    }

    sqlx::query("DELETE FROM materials WHERE id = $1")
        .bind(id)
        .execute(&pg)
        .await?;
    proceeds(Deleted { id })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMaterial {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub subject: String,
    pub file_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaterialFilter {
    pub subject: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaterialResponse {
    pub material: Material,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaterialList {
    pub materials: Vec<Material>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Deleted {
    pub id: Uuid,
}
