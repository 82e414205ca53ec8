pub mod api;
pub mod app_state;
pub mod config;
pub mod cors;
pub mod engine;
pub mod generation;
pub mod types;

use rocket::figment::Figment;
use rocket::{catchers, routes, Build, Rocket};

use crate::app_state::AppState;

/// 组装 Rocket 实例；模型已在外部加载好并放进 `state`
pub fn build_rocket(figment: Figment, state: AppState) -> Rocket<Build> {
    rocket::custom(figment)
        .manage(state)
        .attach(cors::Cors)
        .mount(
            "/",
            routes![
                api::health,
                api::chat,
                api::download_template,
                cors::preflight,
            ],
        )
        .register("/", catchers![api::not_found, api::internal_error])
}
