use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use mail_triage::api::{self, AppState};
use mail_triage::compose::ResponseComposer;
use mail_triage::compose::templates::TemplateDataset;
use mail_triage::config::AppConfig;
use mail_triage::llm::create_provider;
use mail_triage::mail::MailProvider;
use mail_triage::mail::graph::GraphMailClient;
use mail_triage::pipeline::categorizer::Categorizer;
use mail_triage::pipeline::delivery::DeliverySequencer;
use mail_triage::pipeline::ingest::IngestPipeline;
use mail_triage::pipeline::lifecycle::Lifecycle;
use mail_triage::pipeline::responder::{self, BatchResponder};
use mail_triage::store::{Database, LibSqlBackend, RecordStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("Failed to load configuration")?;

    // Held for the life of the process so buffered log lines are flushed.
    let _log_guard = init_tracing(&config);

    eprintln!("📬 Mail Triage v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.llm.model);
    eprintln!("   API: http://0.0.0.0:{}/api/emails", config.port);

    // ── Database ─────────────────────────────────────────────────────────
    let backend = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    let db: Arc<dyn Database> = backend.clone();
    let records: Arc<dyn RecordStore> = backend;
    eprintln!("   Database: {}", config.db_path.display());

    // ── External services ────────────────────────────────────────────────
    let llm = create_provider(&config.llm).context("Failed to create LLM provider")?;
    let mail: Arc<dyn MailProvider> =
        Arc::new(GraphMailClient::new(&config.mail).context("Failed to create mail client")?);

    let dataset = match TemplateDataset::load(&config.template_dataset_path) {
        Ok(dataset) => dataset,
        Err(e) => {
            tracing::warn!(
                path = %config.template_dataset_path.display(),
                error = %e,
                "Template dataset unavailable, replies will report no template"
            );
            TemplateDataset::default()
        }
    };

    // ── Pipeline ─────────────────────────────────────────────────────────
    let categorizer = Arc::new(Categorizer::new(llm.clone()));
    let composer = Arc::new(ResponseComposer::new(
        llm,
        records,
        Arc::new(dataset),
        config.delivery.admin_email.clone(),
    ));
    let responder = Arc::new(BatchResponder::new(Arc::clone(&db), composer.clone()));
    let _schedule_handle = responder::spawn_schedule_ticker(responder.clone());

    let state = AppState {
        ingest: Arc::new(IngestPipeline::new(
            Arc::clone(&db),
            Arc::clone(&mail),
            categorizer,
        )),
        lifecycle: Arc::new(Lifecycle::new(Arc::clone(&db))),
        delivery: Arc::new(DeliverySequencer::new(
            Arc::clone(&db),
            Arc::clone(&mail),
            config.delivery.clone(),
        )),
        responder,
        composer,
        db,
        mail,
        report_email: config.report_email.clone(),
    };

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "HTTP server started");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutting down");
        })
        .await
        .context("HTTP server failed")?;

    Ok(())
}

/// Log to stderr, or to a daily rolling file when a log directory is configured.
fn init_tracing(config: &AppConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mail-triage.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}
