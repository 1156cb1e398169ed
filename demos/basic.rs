//! Minimal relay example: a pre-chain, a global middleware and a few JSON
//! endpoints, with probes logged through tracing.
//!
//! Run with:
//!   RUST_LOG=info,relay::probe=trace cargo run --example basic
//!
//! Try:
//!   curl http://localhost:3000/users/42
//!   curl -H 'accept: text/plain' http://localhost:3000/users/42
//!   curl -X POST http://localhost:3000/users \
//!        -H 'content-type: application/json' -d '{"name":"alice"}'
//!   curl -X DELETE http://localhost:3000/users/42
//!   curl -X PUT http://localhost:3000/users/42        # 405, allow: DELETE, GET
//!   curl http://localhost:3000/boom                   # 500, server keeps running

use http::StatusCode;
use relay::{HttpError, Next, Outcome, Request, Response, RouteSpec, Server, chain};
use serde_json::json;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), relay::Error> {
    tracing_subscriber::fmt::init();

    let mut server = Server::bind("0.0.0.0:3000")
        .pre(stamp)
        .middleware(audit)
        .param("id", check_id)
        .get("/users/:id", get_user)
        .delete("/users/:id", delete_user)
        .get("/boom", boom);

    server.mount(RouteSpec::new("POST", "/users").content_type("json"), chain![parse_user, create_user])?;

    server.events().on_outcome(Outcome::NotFound, |req: Request, res: Response, _err: HttpError, next: Next| async move {
        res.send_with(StatusCode::NOT_FOUND, json!({ "missing": req.path() }));
        next.proceed();
    });
    server.events().on_after(|c| {
        info!(
            status = %c.response.status_code(),
            route = c.route.as_ref().map_or("-", |r| r.name()),
            elapsed_ms = c.request.elapsed().as_millis() as u64,
            "after"
        );
    });

    server.serve().await
}

// Runs before routing, for every request.
async fn stamp(req: Request, res: Response, next: Next) {
    let _ = res.header("x-request-id", &req.id().to_string());
    next.proceed();
}

async fn audit(req: Request, _res: Response, next: Next) {
    info!(method = %req.method(), path = req.path(), "audit");
    next.proceed();
}

// Called for every route with an `:id` param mounted after it.
async fn check_id(_req: Request, _res: Response, next: Next, value: String, _name: String) {
    match value.parse::<u64>() {
        Ok(_) => next.proceed(),
        Err(_) => next.fail(HttpError::new(StatusCode::BAD_REQUEST, format!("`{value}` is not an id"))),
    }
}

// GET /users/:id
async fn get_user(req: Request, res: Response, next: Next) {
    let id = req.param("id").unwrap_or("unknown");
    res.send(json!({ "id": id, "name": "alice" }));
    next.proceed();
}

// POST /users, first handler: reject bodies that are not JSON objects.
async fn parse_user(req: Request, _res: Response, next: Next) {
    let parsed = serde_json::from_slice::<serde_json::Value>(req.body());
    let Some(value) = next.if_error(parsed) else { return };
    if value.is_object() {
        next.proceed();
    } else {
        next.fail(HttpError::new(StatusCode::UNPROCESSABLE_ENTITY, "expected an object"));
    }
}

async fn create_user(_req: Request, res: Response, next: Next) {
    let _ = res.header("location", "/users/99");
    res.send_with(StatusCode::CREATED, json!({ "id": "99" }));
    next.proceed();
}

// DELETE /users/:id → 204 No Content
async fn delete_user(_req: Request, res: Response, next: Next) {
    res.send_status(StatusCode::NO_CONTENT);
    next.proceed();
}

// The fault stays inside this request.
async fn boom(_req: Request, _res: Response, _next: Next) {
    panic!("handler blew up");
}
