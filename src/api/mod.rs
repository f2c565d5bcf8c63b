use anyhow::{Context, Result, anyhow};
use axum::{
    Extension, Router,
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Method, Request, header::CONTENT_TYPE},
};
use std::{path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{Span, info, info_span, warn};
use ulid::Ulid;
use url::Url;

pub mod handlers;
// OpenAPI router wiring and route registration live in openapi.rs.
mod openapi;

pub use handlers::{AppState, PortalConfig};
pub use openapi::openapi;

use crate::authorization::{AccessControl, AccessControlConfig};
use crate::mfa::duo::{DuoConfig, DuoVerifier};
use crate::mfa::totp::{TotpConfig, TotpVerifier};
use crate::mfa::webauthn::{WebauthnConfig, WebauthnVerifier};
use crate::notification::LogNotifier;
use crate::regulation::{RegulationConfig, Regulator};
use crate::session::{SessionConfig, SessionStore};
use crate::storage::{Repository, memory::MemoryRepository, postgres::PostgresRepository};
use crate::users::file::FileUserBackend;
use crate::verification::IdentityTokenService;

/// Everything `serve` needs, assembled by the CLI dispatcher.
#[derive(Debug)]
pub struct ServerOptions {
    pub port: u16,
    /// Postgres DSN; the in-memory repository is used when absent.
    pub dsn: Option<String>,
    pub access_control_path: PathBuf,
    pub users_path: PathBuf,
    pub portal: PortalConfig,
    pub session: SessionConfig,
    pub regulation: RegulationConfig,
    pub totp: TotpConfig,
    pub webauthn: WebauthnConfig,
    pub duo: Option<DuoConfig>,
    pub identity_token_ttl_seconds: i64,
}

/// Build the application state from configuration files and backends.
///
/// # Errors
/// Returns an error when a configuration file does not parse, a rule does
/// not compile, or the database is unreachable.
pub async fn build_state(options: ServerOptions) -> Result<Arc<AppState>> {
    let repository: Arc<dyn Repository> = match &options.dsn {
        Some(dsn) => Arc::new(
            PostgresRepository::connect(dsn)
                .await
                .context("Failed to connect to database")?,
        ),
        None => {
            warn!("no --dsn given; using the in-memory repository (state is lost on restart)");
            Arc::new(MemoryRepository::new())
        }
    };

    let raw = std::fs::read_to_string(&options.access_control_path).with_context(|| {
        format!(
            "Failed to read access control file: {}",
            options.access_control_path.display()
        )
    })?;
    let access_config: AccessControlConfig =
        serde_yaml::from_str(&raw).context("Failed to parse access control file")?;
    let access = Arc::new(
        AccessControl::compile(&access_config).context("Failed to compile access control rules")?,
    );
    info!(
        rules = access_config.rules.len(),
        default_policy = ?access_config.default_policy,
        "access control compiled"
    );

    let users = Arc::new(
        FileUserBackend::load(&options.users_path)
            .map_err(|err| anyhow!("Failed to load users file: {err}"))?,
    );

    let sessions = SessionStore::new(repository.clone(), options.session);
    let regulator = Regulator::new(repository.clone(), options.regulation);
    let totp = TotpVerifier::new(repository.clone(), options.totp);
    let webauthn = WebauthnVerifier::new(repository.clone(), &options.webauthn)
        .map_err(|err| anyhow!("Failed to build WebAuthn verifier: {err}"))?;
    let duo = match options.duo {
        Some(config) => Some(
            DuoVerifier::new(config).map_err(|err| anyhow!("Failed to build Duo client: {err}"))?,
        ),
        None => None,
    };
    let tokens = IdentityTokenService::new(repository, options.identity_token_ttl_seconds);

    Ok(Arc::new(AppState::new(
        sessions,
        access,
        users,
        regulator,
        totp,
        webauthn,
        duo,
        tokens,
        Arc::new(LogNotifier),
        options.portal,
    )))
}

/// Assemble the router with the middleware stack.
///
/// # Errors
/// Returns an error when the portal origin cannot be turned into a CORS
/// origin header.
pub fn router(state: Arc<AppState>) -> Result<Router> {
    let origin = portal_origin(state.portal().portal_url())?;
    let cors = CorsLayer::new()
        .allow_headers([CONTENT_TYPE, HeaderName::from_static("x-csrf-token")])
        .allow_methods([Method::GET, Method::POST])
        .allow_origin(AllowOrigin::exact(origin))
        .allow_credentials(true);

    let (router, _openapi) = openapi::api_router().split_for_parts();
    Ok(router.layer(
        ServiceBuilder::new()
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static("x-request-id"),
                |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                "x-request-id",
            )))
            .layer(TraceLayer::new_for_http().make_span_with(make_span))
            .layer(cors)
            .layer(Extension(state)),
    ))
}

/// Start the server.
///
/// # Errors
/// Returns an error if configuration does not load or the listener cannot
/// bind.
pub async fn serve(options: ServerOptions) -> Result<()> {
    let port = options.port;
    let state = build_state(options).await?;
    let app = router(state)?;

    let listener = TcpListener::bind(format!("::0:{port}")).await?;
    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => warn!("failed to install SIGTERM handler: {err}"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("Gracefully shutting down");
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

fn portal_origin(portal_url: &str) -> Result<HeaderValue> {
    let parsed = Url::parse(portal_url)
        .with_context(|| format!("Invalid portal URL: {portal_url}"))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow!("Portal URL must include a valid host: {portal_url}"))?;
    let port = parsed
        .port()
        .map_or_else(String::new, |port| format!(":{port}"));
    let origin = format!("{}://{}{}", parsed.scheme(), host, port);
    HeaderValue::from_str(&origin).context("Failed to build portal origin header")
}
