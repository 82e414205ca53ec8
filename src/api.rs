use std::io::ErrorKind;

use rocket::fs::NamedFile;
use rocket::http::{Header, Status};
use rocket::serde::json::{self, Json};
use rocket::{catch, get, post, Request, Responder, State};
use tracing::{error, warn};

use crate::app_state::AppState;
use crate::types::{ChatRequest, ChatResponse, HealthResponse, NO_MESSAGE};

#[get("/health")]
pub async fn health(state: &State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        model: state.model_id().to_string(),
    })
}

/// 缺 message / body 不是合法 JSON => 400；body 超限 => 413；生成失败 => 500（body 形状不变）
#[post("/api/chat", data = "<req>")]
pub async fn chat(
    state: &State<AppState>,
    req: Result<Json<ChatRequest>, json::Error<'_>>,
) -> (Status, Json<ChatResponse>) {
    let message = match req {
        Ok(Json(req)) => req.into_message(),
        Err(json::Error::Parse(_, e)) => {
            warn!("Rejected chat body: {e}");
            None
        }
        Err(json::Error::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
            warn!("Chat body exceeds the json limit: {e}");
            return (
                Status::PayloadTooLarge,
                Json(ChatResponse::new(format!("Request body too large: {e}"))),
            );
        }
        Err(json::Error::Io(e)) => {
            error!("Failed to read chat body: {e}");
            return (
                Status::BadRequest,
                Json(ChatResponse::new(format!("Error reading request body: {e}"))),
            );
        }
    };

    let Some(message) = message else {
        return (Status::BadRequest, Json(ChatResponse::new(NO_MESSAGE)));
    };

    match state.respond(&message).await {
        Ok(text) => (Status::Ok, Json(ChatResponse::new(text))),
        Err(e) => (
            Status::InternalServerError,
            Json(ChatResponse::new(format!("An error occurred: {e}"))),
        ),
    }
}

/// 以附件形式下载的文件
#[derive(Responder)]
pub struct Attachment {
    inner: NamedFile,
    disposition: Header<'static>,
}

#[get("/download/template")]
pub async fn download_template(state: &State<AppState>) -> Result<Attachment, (Status, String)> {
    let path = &state.template_path;
    let file = match NamedFile::open(path).await {
        Ok(file) => file,
        Err(e) => {
            error!("Error downloading template: {e}");
            return Err((
                Status::InternalServerError,
                format!("Error downloading template: {e}"),
            ));
        }
    };

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "template".to_string());

    Ok(Attachment {
        inner: file,
        disposition: Header::new(
            "Content-Disposition",
            format!("attachment; filename=\"{filename}\""),
        ),
    })
}

#[catch(404)]
pub fn not_found(req: &Request<'_>) -> Json<ChatResponse> {
    Json(ChatResponse::new(format!(
        "No route for {} {}",
        req.method(),
        req.uri()
    )))
}

#[catch(500)]
pub fn internal_error() -> Json<ChatResponse> {
    Json(ChatResponse::new("Internal server error"))
}
