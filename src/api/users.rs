use actix_web::{get, put, web, Responder, Scope};
use serde::{Deserialize, Serialize};

use crate::{
    db::user::User,
    error::Error,
    resolver::Segment,
    service::Service,
};

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: String,
}

#[derive(Serialize)]
struct UsersResponse {
    users: Vec<User>,
}

#[get("/search")]
async fn search(
    service: web::Data<Service>,
    params: web::Query<SearchParams>,
) -> Result<impl Responder, Error> {
    let users = service.search_users(&params.q).await?;

    Ok(web::Json(UsersResponse { users }))
}

#[get("/segments/{segment}")]
async fn segment(
    service: web::Data<Service>,
    path: web::Path<String>,
) -> Result<impl Responder, Error> {
    let segment: Segment = path.parse()?;
    let users = service.segment_users(&segment).await?;

    Ok(web::Json(UsersResponse { users }))
}

#[put("")]
async fn upsert(
    service: web::Data<Service>,
    user: web::Json<User>,
) -> Result<impl Responder, Error> {
    service.upsert_user(&user).await?;

    Ok("OK")
}

pub fn service() -> Scope {
    web::scope("/users")
        .service(search)
        .service(segment)
        .service(upsert)
}
