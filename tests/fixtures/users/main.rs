use axum::{extract::Path, routing::get, Json, Router};
use serde::Serialize;

#[derive(Serialize)]
pub struct User {
    pub id: u64,
    pub name: String,
}

pub fn app() -> Router {
    Router::new().route("/users/:id", get(get_user))
}

async fn get_user(Path(id): Path<u64>) -> Json<User> {
    Json(User {
        id,
        name: String::new(),
    })
}
