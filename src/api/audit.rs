use actix_web::{get, web, Responder, Scope};
use serde::{Deserialize, Serialize};

use crate::{db::audit::AuditEntry, error::Error, service::Service};

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<i64>,
}

#[derive(Serialize)]
struct AuditResponse {
    entries: Vec<AuditEntry>,
}

#[get("")]
async fn recent(
    service: web::Data<Service>,
    params: web::Query<ListParams>,
) -> Result<impl Responder, Error> {
    let entries = service.recent_audit(params.limit.unwrap_or(100)).await?;

    Ok(web::Json(AuditResponse { entries }))
}

pub fn service() -> Scope {
    web::scope("/audit").service(recent)
}
