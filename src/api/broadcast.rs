use actix_web::{get, post, web, Responder, Scope};
use serde::{Deserialize, Serialize};

use crate::{
    db::{message::Message, recipient::Recipient},
    error::Error,
    service::{BroadcastOutcome, BroadcastRequest, Service, UnsendReport},
};

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<i64>,
}

#[derive(Serialize)]
struct ListMessagesResponse {
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct MessageDetailResponse {
    message: Message,
    recipients: Vec<Recipient>,
}

#[post("/send")]
async fn send(
    service: web::Data<Service>,
    request: web::Json<BroadcastRequest>,
) -> Result<impl Responder, Error> {
    let mut request = request.into_inner();
    // Immediate delivery regardless of any timestamp the client sent.
    request.scheduled_at = None;

    let outcome = service.send_broadcast(request).await?;

    Ok(web::Json(outcome))
}

#[post("/schedule")]
async fn schedule(
    service: web::Data<Service>,
    request: web::Json<BroadcastRequest>,
) -> Result<impl Responder, Error> {
    let request = request.into_inner();

    if request.scheduled_at.is_none() {
        return Err(Error::validation("scheduled_at is required"));
    }

    let outcome = service.send_broadcast(request).await?;

    debug_assert!(matches!(outcome, BroadcastOutcome::Scheduled { .. }));

    Ok(web::Json(outcome))
}

#[post("/{id}/unsend")]
async fn unsend(
    service: web::Data<Service>,
    path: web::Path<i64>,
) -> Result<web::Json<UnsendReport>, Error> {
    let report = service.unsend_message(*path).await?;

    Ok(web::Json(report))
}

#[get("")]
async fn list(
    service: web::Data<Service>,
    params: web::Query<ListParams>,
) -> Result<impl Responder, Error> {
    let messages = service.list_messages(params.limit.unwrap_or(50)).await?;

    Ok(web::Json(ListMessagesResponse { messages }))
}

#[get("/{id}/recipients")]
async fn list_recipients(
    service: web::Data<Service>,
    path: web::Path<i64>,
) -> Result<impl Responder, Error> {
    // 404 for unknown messages rather than an empty list.
    service.get_message(*path).await?;
    let recipients = service.message_recipients(*path).await?;

    Ok(web::Json(recipients))
}

#[get("/{id}")]
async fn detail(
    service: web::Data<Service>,
    path: web::Path<i64>,
) -> Result<impl Responder, Error> {
    let message = service.get_message(*path).await?;
    let recipients = service.message_recipients(*path).await?;

    Ok(web::Json(MessageDetailResponse {
        message,
        recipients,
    }))
}

pub fn service() -> Scope {
    web::scope("/broadcast")
        .service(send)
        .service(schedule)
        .service(list)
        .service(unsend)
        .service(list_recipients)
        .service(detail)
}
