use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use tokio::runtime::Handle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::app::browse;
use crate::app::controller::VolumeJobController;
use crate::app::model::DumpStatus;
use crate::app::upload;
use crate::chapter::ChapterMarker;
use crate::cli::ServeArgs;
use crate::debounce::MergeScheduler;
use crate::deobfuscate::Deobfuscator;
use crate::error::{PipelineError, classify};
use crate::fetch::{ChapterFetcher, FetcherConfig};
use crate::merge::{VolumeMergeAction, VolumeMerger};
use crate::model::DumpRequest;

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<VolumeJobController>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/",
            get(browse::browse_root)
                .head(browse::browse_root)
                .post(upload::build_from_upload),
        )
        .route(
            "/*path",
            get(browse::browse_path)
                .head(browse::browse_path)
                .post(dump_volume),
        )
        .layer(TraceLayer::new_for_http())
        // Dumps are posted cross-origin from pages on the source site.
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Wires the pipeline from command line settings.
pub fn build_state(args: &ServeArgs) -> anyhow::Result<AppState> {
    let mut fetcher_config = FetcherConfig::new(args.upstream_url.clone());
    fetcher_config.user_agent = args.user_agent.clone();
    fetcher_config.cookie = args.upstream_cookie.clone();
    fetcher_config.timeout = std::time::Duration::from_secs(args.request_timeout_secs);
    fetcher_config.max_redirects = args.max_redirects;
    fetcher_config.stylesheet_marker = args.stylesheet_marker.clone();
    fetcher_config.title_selector = args.title_selector.clone();

    let upstream = Arc::new(ChapterFetcher::new(fetcher_config)?);
    let deobfuscator = Deobfuscator::new(&args.content_selector)?;
    let numbering = Arc::new(ChapterMarker::new(&args.chapter_pattern)?);
    let scheduler = MergeScheduler::new(
        Arc::new(VolumeMergeAction::new(VolumeMerger)),
        std::time::Duration::from_secs(args.merge_delay_secs),
        Handle::current(),
    );

    let controller = VolumeJobController::new(
        args.root.clone(),
        upstream,
        deobfuscator,
        numbering,
        scheduler,
        Handle::current(),
    );
    Ok(AppState { controller })
}

pub async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&args.root)
        .await
        .map_err(|err| anyhow::anyhow!("create root {}: {err}", args.root.display()))?;
    let state = build_state(&args)?;
    let app = router(state);

    let addr: SocketAddr = args.addr;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| anyhow::anyhow!("bind {addr}: {err}"))?;
    tracing::info!(addr = %addr, root = %args.root.display(), "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(?err, "ctrl-c handler failed");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

/// `POST /<novel>/<volume>`: admits a volume dump.
async fn dump_volume(
    State(state): State<AppState>,
    Path(path): Path<String>,
    body: Bytes,
) -> Response {
    let segments = path
        .split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();
    let [novel, volume] = segments.as_slice() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let request: DumpRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, format!("invalid dump request: {err}"))
                .into_response();
        }
    };

    match state.controller.request_dump(novel, volume, request) {
        Ok(outcome) => match outcome.status {
            DumpStatus::AlreadyRunning => StatusCode::LOCKED.into_response(),
            DumpStatus::AlreadyComplete => {
                (StatusCode::ALREADY_REPORTED, Json(outcome.accepted)).into_response()
            }
            DumpStatus::AllAccepted => {
                (StatusCode::ACCEPTED, Json(outcome.accepted)).into_response()
            }
            DumpStatus::PartialAccepted => {
                (StatusCode::PARTIAL_CONTENT, Json(outcome.accepted)).into_response()
            }
        },
        Err(err) => error_response(&err),
    }
}

pub(crate) fn error_response(err: &anyhow::Error) -> Response {
    match classify(err) {
        Some(PipelineError::Validation(message)) => {
            (StatusCode::BAD_REQUEST, message.clone()).into_response()
        }
        _ => {
            tracing::error!(?err, "request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")).into_response()
        }
    }
}
