use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use capctl::auth::broker::LoopbackBroker;
use capctl::auth::{Credential, SessionContext};
use capctl::clock::SystemClock;
use capctl::controller::Controller;
use capctl::models::{Capacity, Sku};
use capctl::mutation::{Approved, Confirmation};
use capctl::store::{file::FileStore, memory::MemoryStore, KeyValueStore};
use capctl::{api, config, jobs, AppState};

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "capctl=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let kv: Arc<dyn KeyValueStore> = if args.ephemeral {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(FileStore::new(cfg.store_path.clone()))
    };
    let broker = Arc::new(
        LoopbackBroker::new(&cfg.redirect_uri, cfg.silent_browser)
            .context("invalid redirect uri")?,
    );
    let controller = Controller::build(cfg, kv, broker, Arc::new(SystemClock)).await?;

    let result = match args.command {
        Some(cli::Commands::Login) => login(&controller).await,
        Some(cli::Commands::Logout) => {
            controller.logout().await?;
            println!("Signed out.");
            Ok(())
        }
        Some(cli::Commands::Whoami) => whoami(&controller).await,
        Some(cli::Commands::List) => list(&controller).await,
        Some(cli::Commands::Start { id }) => {
            let id = resolve(&controller, &id).await?;
            let refresh = controller.start(&id).await?;
            settle(&controller, &id, refresh).await
        }
        Some(cli::Commands::Stop { id }) => {
            let id = resolve(&controller, &id).await?;
            let refresh = controller.stop(&id).await?;
            settle(&controller, &id, refresh).await
        }
        Some(cli::Commands::Resize { id, sku, yes }) => {
            let id = resolve(&controller, &id).await?;
            let sku: Sku = sku.parse().unwrap_or(Sku::Other(sku));
            let confirm: &dyn Confirmation = if yes { &Approved } else { &StdinConfirmation };
            let refresh = controller.change_sku(&id, sku, confirm).await?;
            settle(&controller, &id, refresh).await
        }
        Some(cli::Commands::Debug { state }) => {
            controller.set_debug(state.enabled()).await?;
            println!(
                "Debug logging {}.",
                if state.enabled() { "enabled" } else { "disabled" }
            );
            Ok(())
        }
        Some(cli::Commands::Serve { port }) => run_server(controller, port).await,
        None => run_server(controller, 8401).await,
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

async fn login(controller: &Controller) -> anyhow::Result<()> {
    let context = controller.authenticate().await?;
    let expires = controller
        .tokens()
        .peek()
        .await
        .map(|c| c.expires_at.to_rfc3339())
        .unwrap_or_else(|| "unknown".into());
    match context {
        Some(ctx) => println!(
            "Signed in as {} ({}), expires {}",
            ctx.principal_name
                .or(ctx.display_name)
                .unwrap_or_else(|| "unknown user".into()),
            ctx.tenant_label.unwrap_or_else(|| "unknown tenant".into()),
            expires,
        ),
        None => println!("Signed in, expires {}", expires),
    }
    Ok(())
}

async fn whoami(controller: &Controller) -> anyhow::Result<()> {
    let tokens = controller.tokens();
    let Some(cred) = tokens.restore().await? else {
        println!("Not signed in.");
        return Ok(());
    };
    let remaining = cred.remaining(tokens.clock().now());
    let ctx = controller.session().await;
    println!(
        "User:    {}",
        ctx.as_ref()
            .and_then(|c| c.principal_name.clone().or_else(|| c.display_name.clone()))
            .unwrap_or_else(|| "unknown".into())
    );
    println!("Tenant:  {}", tenant_of(ctx.as_ref(), &cred));
    println!("Expires: {} ({} min left)", cred.expires_at.to_rfc3339(), remaining.num_minutes());
    Ok(())
}

/// Verified domain from the token if known, else the tenant it was issued for.
fn tenant_of(ctx: Option<&SessionContext>, cred: &Credential) -> String {
    ctx.and_then(|c| c.tenant_label.clone())
        .or_else(|| cred.issued_tenant.clone())
        .unwrap_or_else(|| "unknown".into())
}

async fn list(controller: &Controller) -> anyhow::Result<()> {
    controller.authenticate().await?;
    let snapshot = controller.load().await?;
    if snapshot.capacities.is_empty() {
        println!("No capacities found.");
    }
    for cap in &snapshot.capacities {
        print_capacity(cap);
    }
    Ok(())
}

fn print_capacity(cap: &Capacity) {
    println!("{}\n    {}", cap.label, cap.id);
}

/// Load the inventory, then accept either a full resource id or a bare name.
async fn resolve(controller: &Controller, needle: &str) -> anyhow::Result<String> {
    controller.authenticate().await?;
    let snapshot = controller.load().await?;
    let mut matches = snapshot
        .capacities
        .iter()
        .filter(|c| c.id.eq_ignore_ascii_case(needle) || c.name.eq_ignore_ascii_case(needle));
    let found = matches
        .next()
        .with_context(|| format!("no capacity named '{}'", needle))?;
    if matches.next().is_some() {
        anyhow::bail!("'{}' matches several capacities; pass the full resource id", needle);
    }
    Ok(found.id.clone())
}

/// Wait for the post-mutation refresh and show where the capacity landed.
async fn settle(
    controller: &Controller,
    id: &str,
    refresh: tokio::task::JoinHandle<()>,
) -> anyhow::Result<()> {
    refresh.await.context("refresh task failed")?;
    match controller.capacity(id) {
        Some(cap) => print_capacity(&cap),
        None => println!("{} is no longer listed.", id),
    }
    Ok(())
}

/// Asks on the terminal; anything but y/yes declines.
struct StdinConfirmation;

#[async_trait]
impl Confirmation for StdinConfirmation {
    async fn confirm(&self, prompt: &str) -> bool {
        let prompt = prompt.to_string();
        tokio::task::spawn_blocking(move || {
            eprint!("{} [y/N] ", prompt);
            let _ = std::io::stderr().flush();
            let mut line = String::new();
            if std::io::stdin().read_line(&mut line).is_err() {
                return false;
            }
            matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
        })
        .await
        .unwrap_or(false)
    }
}

async fn run_server(controller: Arc<Controller>, port: u16) -> anyhow::Result<()> {
    let tokens = controller.tokens().clone();
    if tokens.restore().await?.is_some() {
        tracing::info!("Restored cached session");
    }

    let dashboard_key = hex::encode(rand::random::<[u8; 24]>());
    let every = Duration::from_secs(controller.config().renewal_interval_secs);
    let state = Arc::new(AppState {
        controller,
        dashboard_key: dashboard_key.clone(),
    });

    let app = axum::Router::new()
        .route("/healthz", axum::routing::get(|| async { "ok" }))
        .nest("/api/v1", api::api_router(state.clone()))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer({
            use axum::http::{HeaderName, Method};
            use tower_http::cors::AllowOrigin;
            CorsLayer::new()
                .allow_origin(AllowOrigin::predicate(|origin, _| {
                    let origin = origin.to_str().unwrap_or("");
                    origin.starts_with("http://localhost:") || origin.starts_with("http://127.0.0.1:")
                }))
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
                .allow_headers([
                    HeaderName::from_static("content-type"),
                    HeaderName::from_static(api::DASHBOARD_KEY_HEADER),
                ])
        })
        .layer(axum::middleware::from_fn(security_headers_middleware));

    jobs::renewal::spawn(tokens, every);
    tracing::info!("Background renewal job started (every {}s)", every.as_secs());

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("capctl dashboard API listening on {}", addr);
    println!("Dashboard key: {}", dashboard_key);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Middleware: responses carry session data, so keep them out of caches and frames.
async fn security_headers_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    use axum::http::HeaderValue;

    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert("Cache-Control", HeaderValue::from_static("no-store"));
    headers.insert("Referrer-Policy", HeaderValue::from_static("no-referrer"));
    resp
}
