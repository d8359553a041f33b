//! Google Calendar API v3: events with an attached Meet conference.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::GoogleApiError;

const EVENTS_URL: &str = "https://www.googleapis.com/calendar/v3/calendars/primary/events";

/// What we ask the calendar to hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDraft {
    pub summary: String,
    pub description: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub attendees: Vec<String>,
}

/// What the calendar gave back.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PublishedEvent {
    pub event_id: String,
    pub html_link: Option<String>,
    pub meet_link: Option<String>,
}

#[async_trait]
pub trait CalendarProvider: Send + Sync {
    async fn create_event(
        &self,
        access_token: &str,
        draft: &EventDraft,
    ) -> Result<PublishedEvent, GoogleApiError>;

    async fn update_event(
        &self,
        access_token: &str,
        event_id: &str,
        draft: &EventDraft,
    ) -> Result<PublishedEvent, GoogleApiError>;

    async fn delete_event(&self, access_token: &str, event_id: &str)
        -> Result<(), GoogleApiError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventResponse {
    id: String,
    #[serde(default)]
    html_link: Option<String>,
    #[serde(default)]
    hangout_link: Option<String>,
    #[serde(default)]
    conference_data: Option<ConferenceData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConferenceData {
    #[serde(default)]
    entry_points: Vec<EntryPoint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryPoint {
    entry_point_type: String,
    uri: String,
}

impl From<EventResponse> for PublishedEvent {
    fn from(resp: EventResponse) -> Self {
        let meet_link = resp.hangout_link.or_else(|| {
            resp.conference_data.and_then(|data| {
                data.entry_points
                    .into_iter()
                    .find(|e| e.entry_point_type == "video")
                    .map(|e| e.uri)
            })
        });
        PublishedEvent {
            event_id: resp.id,
            html_link: resp.html_link,
            meet_link,
        }
    }
}

/// Request body for an event; `request_id` makes Google attach a fresh Meet.
fn event_body(draft: &EventDraft, request_id: Option<Uuid>) -> Value {
    let attendees: Vec<Value> = draft
        .attendees
        .iter()
        .filter(|email| !email.is_empty())
        .map(|email| json!({ "email": email }))
        .collect();
    let mut body = json!({
        "summary": draft.summary,
        "description": draft.description,
        "start": { "dateTime": draft.start.to_rfc3339(), "timeZone": "UTC" },
        "end": { "dateTime": draft.end.to_rfc3339(), "timeZone": "UTC" },
        "attendees": attendees,
    });
    if let Some(request_id) = request_id {
        body["conferenceData"] = json!({
            "createRequest": {
                "requestId": request_id.to_string(),
                "conferenceSolutionKey": { "type": "hangoutsMeet" }
            }
        });
    }
    body
}

pub struct GoogleCalendar {
    http: reqwest::Client,
}

impl Default for GoogleCalendar {
    fn default() -> Self {
        Self::new()
    }
}

impl GoogleCalendar {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    async fn read_event(resp: reqwest::Response) -> Result<PublishedEvent, GoogleApiError> {
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(GoogleApiError::AuthExpired);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GoogleApiError::ApiError {
                status: status.as_u16(),
                message: body,
            });
        }
        let body: EventResponse = resp.json().await?;
        Ok(body.into())
    }
}

#[async_trait]
impl CalendarProvider for GoogleCalendar {
    async fn create_event(
        &self,
        access_token: &str,
        draft: &EventDraft,
    ) -> Result<PublishedEvent, GoogleApiError> {
        let resp = self
            .http
            .post(EVENTS_URL)
            .bearer_auth(access_token)
            .query(&[("conferenceDataVersion", "1"), ("sendUpdates", "all")])
            .json(&event_body(draft, Some(Uuid::new_v4())))
            .send()
            .await?;
        Self::read_event(resp).await
    }

    async fn update_event(
        &self,
        access_token: &str,
        event_id: &str,
        draft: &EventDraft,
    ) -> Result<PublishedEvent, GoogleApiError> {
        let resp = self
            .http
            .patch(format!("{}/{}", EVENTS_URL, event_id))
            .bearer_auth(access_token)
            .query(&[("conferenceDataVersion", "1"), ("sendUpdates", "all")])
            .json(&event_body(draft, None))
            .send()
            .await?;
        Self::read_event(resp).await
    }

    async fn delete_event(
        &self,
        access_token: &str,
        event_id: &str,
    ) -> Result<(), GoogleApiError> {
        let resp = self
            .http
            .delete(format!("{}/{}", EVENTS_URL, event_id))
            .bearer_auth(access_token)
            .query(&[("sendUpdates", "all")])
            .send()
            .await?;

        let status = resp.status();
        // 410 Gone: already deleted on Google's side
        if status.is_success() || status == reqwest::StatusCode::GONE {
            return Ok(());
        }
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(GoogleApiError::AuthExpired);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(GoogleApiError::ApiError {
            status: status.as_u16(),
            message: body,
        })
    }
}

/// Creates the event, or updates it when `existing` names one. Never fails:
/// calendar problems are logged and the caller carries on without links.
pub async fn publish_best_effort(
    calendar: &dyn CalendarProvider,
    access_token: Option<&str>,
    existing: Option<&str>,
    draft: &EventDraft,
) -> Option<PublishedEvent> {
    let token = match access_token {
        Some(token) => token,
        None => {
            log::info!(
                "no Google access token, continuing without calendar event for `{}`",
                draft.summary
            );
            return None;
        }
    };
    let result = match existing {
        Some(event_id) => calendar.update_event(token, event_id, draft).await,
        None => calendar.create_event(token, draft).await,
    };
    match result {
        Ok(event) => Some(event),
        Err(err) => {
            log::warn!(
                "calendar event for `{}` failed, continuing without calendar integration: {}",
                draft.summary,
                err
            );
            None
        }
    }
}

/// Deletes the event; failures are logged and swallowed.
pub async fn remove_best_effort(
    calendar: &dyn CalendarProvider,
    access_token: Option<&str>,
    event_id: &str,
) {
    let Some(token) = access_token else {
        log::info!("no Google access token, leaving calendar event {} in place", event_id);
        return;
    };
    if let Err(err) = calendar.delete_event(token, event_id).await {
        log::warn!("could not delete calendar event {}: {}", event_id, err);
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeCalendar;
    use super::*;
    use chrono::Duration;
    use std::sync::atomic::Ordering;

    fn draft() -> EventDraft {
        let start = Utc::now() + Duration::days(1);
        EventDraft {
            summary: "SAT Math with Ada".to_string(),
            description: "Tutoring session".to_string(),
            start,
            end: start + Duration::minutes(60),
            attendees: vec!["student@example.com".to_string(), String::new()],
        }
    }

    #[test]
    fn new_events_request_a_meet_conference() {
        let request_id = Uuid::new_v4();
        let body = event_body(&draft(), Some(request_id));
        assert_eq!(
            body["conferenceData"]["createRequest"]["conferenceSolutionKey"]["type"],
            "hangoutsMeet"
        );
        assert_eq!(
            body["conferenceData"]["createRequest"]["requestId"],
            request_id.to_string()
        );
        assert_eq!(body["attendees"].as_array().unwrap().len(), 1);
        assert_eq!(body["start"]["timeZone"], "UTC");
    }

    #[test]
    fn updates_keep_the_existing_conference() {
        let body = event_body(&draft(), None);
        assert!(body.get("conferenceData").is_none());
    }

    #[test]
    fn meet_link_falls_back_to_video_entry_point() {
        let resp: EventResponse = serde_json::from_value(json!({
            "id": "evt1",
            "htmlLink": "https://calendar.google.com/event?eid=evt1",
            "conferenceData": {
                "entryPoints": [
                    { "entryPointType": "phone", "uri": "tel:+1-555" },
                    { "entryPointType": "video", "uri": "https://meet.google.com/xyz" }
                ]
            }
        }))
        .unwrap();
        let event = PublishedEvent::from(resp);
        assert_eq!(event.event_id, "evt1");
        assert_eq!(event.meet_link.as_deref(), Some("https://meet.google.com/xyz"));
    }

    #[test]
    fn hangout_link_wins_when_present() {
        let resp: EventResponse = serde_json::from_value(json!({
            "id": "evt2",
            "hangoutLink": "https://meet.google.com/direct"
        }))
        .unwrap();
        let event = PublishedEvent::from(resp);
        assert_eq!(event.meet_link.as_deref(), Some("https://meet.google.com/direct"));
        assert_eq!(event.html_link, None);
    }

    #[tokio::test]
    async fn publish_creates_then_updates() {
        let calendar = FakeCalendar::default();
        let created = publish_best_effort(&calendar, Some("tok"), None, &draft())
            .await
            .unwrap();
        assert_eq!(created.event_id, "evt-new");

        let updated = publish_best_effort(&calendar, Some("tok"), Some("evt-new"), &draft())
            .await
            .unwrap();
        assert_eq!(updated.event_id, "evt-new");
        assert_eq!(calendar.created.load(Ordering::SeqCst), 1);
        assert_eq!(calendar.updated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publish_swallows_calendar_failures() {
        let calendar = FakeCalendar::failing();
        assert_eq!(
            publish_best_effort(&calendar, Some("tok"), None, &draft()).await,
            None
        );
        remove_best_effort(&calendar, Some("tok"), "evt").await;
        assert_eq!(calendar.deleted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publish_without_token_skips_the_calendar() {
        let calendar = FakeCalendar::default();
        assert_eq!(publish_best_effort(&calendar, None, None, &draft()).await, None);
        assert_eq!(calendar.created.load(Ordering::SeqCst), 0);
    }
}
