//! Quiz Duel Server
//!
//! Binary entrypoint: wires configuration, external services, and the
//! WebSocket server together.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use quiz_duel::services::{FixedQuestions, HttpGrader, MemoryProfiles, NullGrader, Services};
use quiz_duel::{DuelServer, ServerConfig, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env();
    info!("Quiz Duel Server v{VERSION}");
    info!("bind address: {}", config.bind_addr);
    info!(
        "auth: {}",
        if config.auth.is_configured() {
            "token verification enabled"
        } else {
            "open (no token verification)"
        }
    );

    let question_file: PathBuf = std::env::var("QUESTION_FILE")
        .unwrap_or_else(|_| "questions.json".to_string())
        .into();
    let questions = FixedQuestions::from_json_file(&question_file)
        .with_context(|| format!("loading question set from {}", question_file.display()))?;
    info!("question set loaded from {}", question_file.display());

    let grader: Arc<dyn quiz_duel::services::Grader> = match std::env::var("GRADING_URL") {
        Ok(url) => {
            info!("free-text grading via {url}");
            Arc::new(HttpGrader::new(url))
        }
        Err(_) => {
            info!("no GRADING_URL set; free-text answers score zero");
            Arc::new(NullGrader)
        }
    };

    let services = Services {
        profiles: Arc::new(MemoryProfiles::new()),
        questions: Arc::new(questions),
        grader,
    };

    let server = Arc::new(DuelServer::new(config, services));
    server.run().await.context("server terminated")?;
    Ok(())
}
