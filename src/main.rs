use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nexus_chat::app_state::AppState;
use nexus_chat::config::{self, ChatConfig};
use nexus_chat::engine::CandleEngine;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let json = std::env::var("NEXUS_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("Starting nexus-chat...");

    let figment = config::figment();
    let cfg = ChatConfig::from_figment(&figment).context("invalid `chat` configuration")?;

    // 模型加载失败直接退出，不监听端口
    let engine = match CandleEngine::load(&cfg.model, cfg.generation.clone()) {
        Ok(engine) => engine,
        Err(e) => {
            error!("Error loading model or tokenizer: {e:#}");
            std::process::exit(1);
        }
    };

    let state = AppState::new(engine, cfg.template_path);
    let server = nexus_chat::build_rocket(figment, state);

    if let Err(e) = rocket::execute(server.launch()) {
        error!("Server error: {e}");
        std::process::exit(1);
    }
    Ok(())
}
