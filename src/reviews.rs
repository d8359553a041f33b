use axum::Extension;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::extract::{Json, Path};
use crate::materials::Deleted;
use crate::models::{Review, Role, UserData};
use crate::{breaks, proceeds, Error, Payload};

pub const MAX_COMMENT_LEN: usize = 2000;

pub fn validate_review(body: &CreateReview) -> Result<(), Error> {
    if !(1..=5).contains(&body.rating) {
        return Err(Error::invalid("`rating` must be between 1 and 5"));
    }
    if let Some(comment) = &body.comment {
        if comment.chars().count() > MAX_COMMENT_LEN {
            return Err(Error::invalid(format!(
                "`comment` cannot exceed {} characters",
                MAX_COMMENT_LEN
            )));
        }
    }
    Ok(())
}

pub fn average_rating(reviews: &[Review]) -> Option<f64> {
    if reviews.is_empty() {
        return None;
    }
    let total: i64 = reviews.iter().map(|r| i64::from(r.rating)).sum();
    Some(total as f64 / reviews.len() as f64)
}

pub async fn create_review(
    user: AuthUser,
    Extension(pg): Extension<PgPool>,
    Json(body): Json<CreateReview>,
) -> Payload<ReviewResponse> {
    user.require(&[Role::Student])?;
    validate_review(&body)?;

    let tutor = sqlx::query_as::<_, UserData>("SELECT * FROM users WHERE id = $1")
        .bind(body.tutor_id)
        .fetch_optional(&pg)
        .await?;
    match tutor {
        Some(tutor) if tutor.role == Role::Tutor => {}
        _ => return breaks(Error::invalid("Reviews can only be left for tutors")),
    }

    let review = sqlx::query_as::<_, Review>(
        "INSERT INTO reviews (id, student_id, tutor_id, rating, comment) \
         VALUES ($1, $2, $3, $4, $5) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(user.id)
    .bind(body.tutor_id)
    .bind(body.rating)
    .bind(body.comment.as_deref().map(str::trim))
    .fetch_one(&pg)
    .await?;
    proceeds(ReviewResponse { review })
}

pub async fn tutor_reviews(
    _user: AuthUser,
    Path(tutor_id): Path<Uuid>,
    Extension(pg): Extension<PgPool>,
) -> Payload<TutorReviews> {
    let reviews = sqlx::query_as::<_, Review>(
        "SELECT * FROM reviews WHERE tutor_id = $1 ORDER BY created_at DESC",
    )
    .bind(tutor_id)
    .fetch_all(&pg)
    .await?;
    proceeds(TutorReviews {
        tutor_id,
        average_rating: average_rating(&reviews),
        count: reviews.len(),
        reviews,
    })
}

pub async fn delete_review(
    user: AuthUser,
    Path(id): Path<Uuid>,
    Extension(pg): Extension<PgPool>,
) -> Payload<Deleted> {
    let review = sqlx::query_as::<_, Review>("SELECT * FROM reviews WHERE id = $1")
        .bind(id)
        .fetch_optional(&pg)
        .await?
        .ok_or_else(|| Error::not_found(format!("Review `{}` does not exist", id)))?;
    if !user.is_admin() && review.student_id != user.id {
        return breaks(Error::forbidden("Only the author can delete this review"));
    }
    sqlx::query("DELETE FROM reviews WHERE id = $1")
        .bind(id)
        .execute(&pg)
        .await?;
    proceeds(Deleted { id })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReview {
    pub tutor_id: Uuid,
    pub rating: i16,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewResponse {
    pub review: Review,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TutorReviews {
    pub tutor_id: Uuid,
    pub average_rating: Option<f64>,
    pub count: usize,
    pub reviews: Vec<Review>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn review(rating: i16) -> Review {
        Review {
            id: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
            tutor_id: Uuid::new_v4(),
            rating,
            comment: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn rating_must_be_one_to_five() {
        for (rating, ok) in [(0, false), (1, true), (5, true), (6, false)] {
            let body = CreateReview {
                tutor_id: Uuid::new_v4(),
                rating,
                comment: None,
            };
            assert_eq!(validate_review(&body).is_ok(), ok, "rating {}", rating);
        }
    }

    #[test]
    fn long_comments_rejected() {
        let body = CreateReview {
            tutor_id: Uuid::new_v4(),
            rating: 4,
            comment: Some("x".repeat(MAX_COMMENT_LEN + 1)),
        };
        assert!(validate_review(&body).is_err());
    }

    #[test]
    fn average_of_ratings() {
        assert_eq!(average_rating(&[]), None);
        assert_eq!(average_rating(&[review(4), review(5)]), Some(4.5));
    }
}
