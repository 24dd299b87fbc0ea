use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use tenant_guard::actor::{Actor, ActorResolver, JwtVerifier, Role};
use tenant_guard::audit::AuditRecorder;
use tenant_guard::config::{config, AppConfig};
use tenant_guard::handlers::{cors_layer, router, AppState};
use tenant_guard::policy::PolicyRegistry;
use tenant_guard::service::ResourceService;
use tenant_guard::store::{MemoryStore, PgStore};

#[derive(Parser)]
#[command(name = "tenant-guard")]
#[command(about = "Guarded resource API for multi-tenant record stores")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the HTTP server")]
    Serve {
        #[arg(long, env = "PORT", help = "Port to listen on")]
        port: Option<u16>,

        #[arg(long, env = "POLICY_FILE", help = "YAML policy table")]
        policy_file: Option<String>,

        #[arg(long, help = "Use the in-memory store instead of PostgreSQL")]
        memory: bool,

        #[arg(
            long = "account",
            value_name = "ROLE:UUID",
            requires = "memory",
            help = "Seed a live account into the in-memory store (repeatable)"
        )]
        accounts: Vec<Actor>,
    },

    #[command(about = "Load and validate a policy table")]
    CheckPolicies {
        #[arg(help = "YAML policy table")]
        file: String,
    },

    #[command(about = "Sign a token for local testing")]
    IssueToken {
        #[arg(help = "Account id")]
        subject: Uuid,

        #[arg(help = "Role wire name, e.g. patient or hrRecruiter")]
        role: String,

        #[arg(long, help = "Lifetime in hours (defaults to configured expiry)")]
        hours: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present so DATABASE_URL, JWT_SECRET etc. are picked up
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = config();
    tracing::info!("Starting tenant-guard in {:?} mode", config.environment);

    match cli.command {
        Commands::Serve { port, policy_file, memory, accounts } => {
            serve(config, port, policy_file, memory, accounts).await
        }
        Commands::CheckPolicies { file } => {
            let registry = PolicyRegistry::from_file(&file).with_context(|| format!("loading {}", file))?;
            println!("{}: {} resource types OK", file, registry.len());
            Ok(())
        }
        Commands::IssueToken { subject, role, hours } => {
            let role: Role = role.parse()?;
            let verifier = JwtVerifier::new(config.security.jwt_secret.clone())?;
            let hours = hours.unwrap_or(config.security.jwt_expiry_hours as i64);
            println!("{}", verifier.issue_for(subject, role, chrono::Duration::hours(hours))?);
            Ok(())
        }
    }
}

async fn serve(
    config: &'static AppConfig,
    port: Option<u16>,
    policy_file: Option<String>,
    memory: bool,
    accounts: Vec<Actor>,
) -> anyhow::Result<()> {
    let policy_file = policy_file.unwrap_or_else(|| config.server.policy_file.clone());
    let registry = Arc::new(
        PolicyRegistry::from_file(&policy_file).with_context(|| format!("loading {}", policy_file))?,
    );
    tracing::info!("Loaded {} resource policies from {}", registry.len(), policy_file);

    let verifier = Arc::new(JwtVerifier::new(config.security.jwt_secret.clone())?);

    let state = if memory {
        if tenant_guard::is_production!() {
            tracing::warn!("In-memory store selected in production; data will not persist");
        }
        let store = Arc::new(MemoryStore::new());
        for account in &accounts {
            store.add_account(account.id, account.role).await;
        }
        if accounts.is_empty() {
            tracing::warn!("In-memory store has no accounts; pass --account ROLE:UUID to seed some");
        } else {
            tracing::info!("Seeded {} accounts into the in-memory store", accounts.len());
        }
        build_state(config, registry, verifier, store.clone(), store.clone(), store)
    } else {
        let url = config
            .database
            .url
            .clone()
            .context("DATABASE_URL must be set unless --memory is used")?;
        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .acquire_timeout(Duration::from_secs(config.database.connection_timeout))
            .connect(&url)
            .await
            .context("connecting to database")?;
        let store = Arc::new(PgStore::new(pool));
        store.health_check().await?;
        build_state(config, registry, verifier, store.clone(), store.clone(), store)
    };

    let app = router(state)
        .layer(cors_layer(&config.security))
        .layer(TraceLayer::new_for_http());

    let port = port.unwrap_or(config.server.port);
    let bind_addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;

    tracing::info!("tenant-guard listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_state(
    config: &AppConfig,
    registry: Arc<PolicyRegistry>,
    verifier: Arc<JwtVerifier>,
    accounts: Arc<dyn tenant_guard::store::AccountStore>,
    resources: Arc<dyn tenant_guard::store::ResourceStore>,
    audit: Arc<dyn tenant_guard::store::AuditSink>,
) -> AppState {
    AppState {
        resolver: ActorResolver::new(verifier, accounts),
        service: ResourceService::new(
            registry,
            resources,
            AuditRecorder::new(audit, config.security.enable_audit_logging),
            config.query,
        ),
    }
}
