use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser as CliParser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use emitt::config::Config;
use emitt::llm::openai::OpenAiClient;
use emitt::llm::ChatModel;
use emitt::mcp::McpClient;
use emitt::processor::Processor;
use emitt::router::Router;
use emitt::smtp::SmtpServer;
use emitt::store::{Database, EmailStore};
use emitt::tools::{
    DatabaseSchemaTool, DatabaseTool, EmailSender, EmailTool, HttpTool, NoopSender, ResendSender,
    SmtpSender, ToolRegistry,
};

/// Inbound email ingestion and automation server.
#[derive(CliParser)]
#[command(name = "emitt", version)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "emitt.yaml")]
    config: PathBuf,

    /// Raise log verbosity to debug.
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = Config::load(&cli.config)?;

    let db = Arc::new(Database::open(&cfg.database.path)?);
    let store = Arc::new(EmailStore::new(Arc::clone(&db)));

    let sender: Arc<dyn EmailSender> = match cfg.smtp.provider.as_str() {
        "resend" => Arc::new(ResendSender::new(cfg.smtp.resend_key.clone())),
        "smtp" => Arc::new(SmtpSender::new(
            cfg.smtp.host.clone(),
            cfg.smtp.port,
            cfg.smtp.username.clone(),
            cfg.smtp.password.clone(),
        )),
        "" => {
            warn!("No outbound email provider configured; outbound email disabled");
            Arc::new(NoopSender)
        }
        other => {
            warn!(provider = %other, "Unknown outbound provider; outbound email disabled");
            Arc::new(NoopSender)
        }
    };

    let registry = Arc::new(ToolRegistry::new());
    registry
        .register(Arc::new(EmailTool::new(
            Arc::clone(&sender),
            cfg.smtp.from_address.clone(),
            cfg.smtp.from_name.clone(),
        )))
        .await;
    registry.register(Arc::new(HttpTool::new())).await;
    let db_tool = Arc::new(DatabaseTool::new(Arc::clone(&db), Vec::new(), false));
    registry
        .register(Arc::clone(&db_tool) as Arc<dyn emitt::tools::Tool>)
        .await;
    registry
        .register(Arc::new(DatabaseSchemaTool::new(db_tool)))
        .await;

    let mcp = Arc::new(McpClient::new());
    mcp.connect_all(&cfg.mcp.servers, &registry).await;

    let model: Arc<dyn ChatModel> = Arc::new(OpenAiClient::new(&cfg.llm)?);
    let router = Arc::new(Router::new(&cfg.mailboxes)?);
    info!(mailboxes = ?router.mailbox_names(), "Routing rules compiled");

    let processor = Arc::new(Processor::new(
        Arc::clone(&store),
        router,
        Arc::clone(&registry),
        model,
    ));

    // Recover anything that crashed between intake and completion.
    if let Err(e) = processor.process_pending(100).await {
        error!(error = %e, "Failed to process pending emails");
    }

    let server = Arc::new(SmtpServer::new(&cfg.server, processor));
    tokio::select! {
        result = SmtpServer::run(server) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    mcp.close_all().await;
    info!("Shutdown complete");
    Ok(())
}
