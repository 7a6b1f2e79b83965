mod call;
mod config;
mod pipeline;
mod transcript;
mod twilio;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::response::Html;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use config::Config;
use pipeline::brain::{self, Brain};
use pipeline::tts::TtsClient;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared application state accessible from all handlers. The LLM and TTS
/// clients are built once at startup and handed to every session.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub brain: Arc<Brain>,
    pub tts: Arc<TtsClient>,
    pub system_prompt: String,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("--version") => println!("phone-agent {VERSION}"),
        Some("--help") | Some("-h") => print_usage(),
        Some(other) => {
            eprintln!("Unknown option: {other}");
            print_usage();
            std::process::exit(1);
        }
        None => {
            let rt = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");
            rt.block_on(server());
        }
    }
}

fn print_usage() {
    println!("phone-agent {VERSION}");
    println!("AI phone agent bridging Twilio media streams to Deepgram and OpenAI");
    println!();
    println!("Usage: phone-agent [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --version   Print version");
    println!("  --help, -h  Print this help message");
    println!();
    println!("Without options, starts the voice server.");
}

async fn server() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "phone_agent=info,tower_http=info".into()),
        )
        .init();

    // Load config
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        host = %config.host,
        port = config.port,
        agent = %config.agent_name,
        "Starting phone-agent"
    );

    let system_prompt = brain::load_system_prompt(&config.system_prompt_path);

    // Build shared state
    let state = AppState {
        brain: Arc::new(Brain::new(
            config.openai_api_key.clone(),
            config.openai_model.clone(),
            config.max_tokens,
        )),
        tts: Arc::new(TtsClient::new(
            config.deepgram_api_key.clone(),
            config.tts_url(),
        )),
        system_prompt,
        config,
    };

    let addr: SocketAddr = format!("{}:{}", state.config.host, state.config.port)
        .parse()
        .expect("Invalid server address");

    // Build router
    let app = Router::new()
        .route("/", get(home))
        // Twilio webhook for incoming calls
        .route(
            "/incoming-call",
            get(twilio::webhook::handle_incoming_call).post(twilio::webhook::handle_incoming_call),
        )
        // Twilio media stream (WebSocket)
        .route("/media-stream", get(twilio::media::handle_media_upgrade))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    tracing::info!(%addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind");

    axum::serve(listener, app).await.expect("Server error");
}

async fn home() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head><title>Phone Agent</title></head>
<body>
    <h1>Phone Agent</h1>
    <p>Server is running.</p>
    <ul>
        <li><code>GET|POST /incoming-call</code> - Twilio webhook</li>
        <li><code>WS /media-stream</code> - Audio WebSocket</li>
        <li><code>GET /health</code> - Health check</li>
    </ul>
</body>
</html>"#,
    )
}

async fn health() -> &'static str {
    "ok"
}
