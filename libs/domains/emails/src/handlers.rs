use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use email::MailTransport;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::cache::EmailCache;
use crate::error::{EmailError, EmailResult};
use crate::models::{CreateEmail, SearchQuery};
use crate::publisher::EventPublisher;
use crate::service::EmailService;
use crate::store::EmailStore;

type SharedService<S, C, P, T> = State<Arc<EmailService<S, C, P, T>>>;

fn parse_id(id: &str) -> EmailResult<Uuid> {
    Uuid::parse_str(id).map_err(|_| EmailError::InvalidInput(format!("invalid email id '{id}'")))
}

/// Create an email and publish its creation event.
///
/// A failed publish leaves the record `pending` and still answers 201; the
/// client retries with `POST /{id}/publish`.
pub async fn create_email<S, C, P, T>(
    State(service): SharedService<S, C, P, T>,
    Json(input): Json<CreateEmail>,
) -> EmailResult<impl IntoResponse>
where
    S: EmailStore,
    C: EmailCache,
    P: EventPublisher,
    T: MailTransport,
{
    let record = service.create(input).await?;

    let record = match service.publish_create(record.id).await {
        Ok(published) => published,
        Err(e) => {
            tracing::warn!(email_id = %record.id, error = %e, "Created email left pending");
            record
        }
    };

    Ok((StatusCode::CREATED, Json(record)))
}

/// Publish (or republish) the creation event of a stored email
pub async fn publish_email<S, C, P, T>(
    State(service): SharedService<S, C, P, T>,
    Path(id): Path<String>,
) -> EmailResult<impl IntoResponse>
where
    S: EmailStore,
    C: EmailCache,
    P: EventPublisher,
    T: MailTransport,
{
    let record = service.publish_create(parse_id(&id)?).await?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

pub async fn get_email<S, C, P, T>(
    State(service): SharedService<S, C, P, T>,
    Path(id): Path<String>,
) -> EmailResult<impl IntoResponse>
where
    S: EmailStore,
    C: EmailCache,
    P: EventPublisher,
    T: MailTransport,
{
    let record = service.get_by_id(parse_id(&id)?).await?;
    Ok(Json(record))
}

pub async fn search_emails<S, C, P, T>(
    State(service): SharedService<S, C, P, T>,
    Query(query): Query<SearchQuery>,
) -> EmailResult<impl IntoResponse>
where
    S: EmailStore,
    C: EmailCache,
    P: EventPublisher,
    T: MailTransport,
{
    let page = service.search(query).await?;
    Ok(Json(page))
}

#[derive(Debug, Serialize)]
struct SendResponse {
    email_id: Uuid,
    message_id: String,
}

/// Send a stored email right away, outside the event stream
pub async fn send_email<S, C, P, T>(
    State(service): SharedService<S, C, P, T>,
    Path(id): Path<String>,
) -> EmailResult<impl IntoResponse>
where
    S: EmailStore,
    C: EmailCache,
    P: EventPublisher,
    T: MailTransport,
{
    let record = service.get_by_id(parse_id(&id)?).await?;
    let receipt = service.send_email(&record).await?;

    Ok(Json(SendResponse {
        email_id: record.id,
        message_id: receipt.message_id,
    }))
}

/// Routes for `/api/v1/emails`.
pub fn router<S, C, P, T>(service: EmailService<S, C, P, T>) -> Router
where
    S: EmailStore + 'static,
    C: EmailCache + 'static,
    P: EventPublisher + 'static,
    T: MailTransport + 'static,
{
    Router::new()
        .route(
            "/",
            get(search_emails::<S, C, P, T>).post(create_email::<S, C, P, T>),
        )
        .route("/{id}", get(get_email::<S, C, P, T>))
        .route("/{id}/publish", post(publish_email::<S, C, P, T>))
        .route("/{id}/send", post(send_email::<S, C, P, T>))
        .with_state(Arc::new(service))
}
