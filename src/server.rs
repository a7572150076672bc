//! HTTP API surface
//!
//! Axum router under `/api`: address allocation, inbox listing, message
//! fetch, SSE streaming, status/domains, and bearer-guarded admin
//! operations. Handlers validate input before any I/O; validation
//! failures are 4xx and never logged at error level. A service-expiry
//! gate turns everything except health/ready/status into 503 once the
//! configured sunset date has passed.

use std::convert::Infallible;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use futures::stream::{Stream, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::allowlist::AllowList;
use crate::config::GatewayConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{
    Address, AdminDomainInput, CustomAddressInput, DomainsResponse, ListInboxQuery,
    RandomAddressInput, StatusResponse, StoredMessage,
};
use crate::ratelimit::{Action, RateLimiter};
use crate::store::Store;

/// Ceiling on the graceful-shutdown drain window
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// SSE keep-alive comment period; defeats intermediary idle timeouts
const KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(20);

/// Hard ceiling on inbox page size
const MAX_LIST_LIMIT: usize = 100;

/// Attempts before a random allocation reports pool exhaustion
const RANDOM_ATTEMPTS: usize = 5;

/// Short names combined with a 5-digit suffix for random local-parts
const LOCAL_DICTIONARY: [&str; 24] = [
    "alfie", "bella", "coco", "daisy", "echo", "felix", "ginger", "hazel", "iris", "jasper",
    "kiki", "luna", "milo", "nala", "oreo", "pepper", "quinn", "rocky", "sunny", "toby",
    "umber", "violet", "willow", "ziggy",
];

/// Local-parts that can never be claimed
const RESERVED_LOCALS: [&str; 7] = [
    "admin",
    "root",
    "postmaster",
    "support",
    "noreply",
    "abuse",
    "mailer-daemon",
];

/// 3–31 chars, leading alphanumeric, then alphanumeric/dot/underscore/dash
static LOCAL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9._-]{2,30}$").unwrap_or_else(|e| panic!("local pattern: {e}"))
});

/// Shared state for all handlers
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub store: Store,
    pub limiter: RateLimiter,
    /// Process-seeded RNG for random local-parts
    rng: Mutex<StdRng>,
}

impl AppState {
    pub fn new(config: Arc<GatewayConfig>, store: Store) -> Self {
        let limiter = RateLimiter::new(
            store.clone(),
            config.rate_limit_create_per_min,
            config.rate_limit_fetch_per_min,
        );
        Self {
            config,
            store,
            limiter,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Merged allow-list: static layer plus a fresh dynamic read
    async fn allow_list(&self) -> AppResult<AllowList> {
        let mut allow = AllowList::from_static(&self.config.allowed_domains);
        allow.set_dynamic(self.store.dynamic_domains().await?);
        Ok(allow)
    }

    fn expires_at(&self) -> chrono::DateTime<Utc> {
        Utc::now() + ChronoDuration::seconds(self.config.retention_seconds as i64)
    }
}

/// Build the full router, CORS and expiry gate included
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    let api = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/status", get(status))
        .route("/domains", get(domains))
        .route("/address/random", post(address_random))
        .route("/address/custom", post(address_custom))
        .route("/inbox/{domain}/{local}", get(list_inbox))
        .route("/message/{id}", get(get_message).delete(delete_message))
        .route("/stream/{domain}/{local}", get(stream_inbox))
        .route("/admin/domains", post(admin_add_domain))
        .route("/admin/domains/{domain}", delete(admin_remove_domain));

    Router::new()
        .nest("/api", api)
        .layer(middleware::from_fn_with_state(state.clone(), expiry_gate))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until shutdown
///
/// Binds the configured address and drains gracefully on cancellation;
/// connections still open after [`SHUTDOWN_TIMEOUT`] (SSE streams,
/// typically) are dropped.
pub async fn serve(state: Arc<AppState>, shutdown: CancellationToken) -> AppResult<()> {
    let listen_addr = state.config.listen_addr.clone();
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .map_err(|e| AppError::Internal(format!("cannot bind {listen_addr}: {e}")))?;
    info!(%listen_addr, "api server started");

    let app = router(state);
    let drain = shutdown.clone();
    let mut server = pin!(
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { drain.cancelled().await })
        .into_future()
    );

    tokio::select! {
        result = &mut server => {
            result.map_err(|e| AppError::Internal(format!("api server failed: {e}")))
        }
        () = async {
            shutdown.cancelled().await;
            tokio::time::sleep(SHUTDOWN_TIMEOUT).await;
        } => {
            info!("shutdown drain window elapsed, closing remaining connections");
            Ok(())
        }
    }
}

// ----- middleware -----

/// Service-expiry gate
///
/// Past end-of-day of the configured expiry date, every route except
/// health, readiness, and status answers 503.
async fn expiry_gate(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if state.config.is_expired(Utc::now()) && !exempt_from_expiry(request.uri().path()) {
        return AppError::Unavailable("service has reached its end date".to_owned())
            .into_response();
    }
    next.run(request).await
}

/// Paths that keep answering after service expiry
fn exempt_from_expiry(path: &str) -> bool {
    matches!(path, "/api/healthz" | "/api/readyz" | "/api/status")
}

// ----- health and status -----

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(state): State<Arc<AppState>>) -> StatusCode {
    match state.store.ping().await {
        Ok(()) => StatusCode::OK,
        Err(error) => {
            warn!(%error, "readiness probe failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let expired = state.config.is_expired(Utc::now());
    Json(StatusResponse {
        expired,
        expiration_date: state
            .config
            .expiry_date
            .map(|d| d.format("%d/%m/%Y").to_string()),
        message: expired.then(|| "service has reached its end date".to_owned()),
    })
}

async fn domains(State(state): State<Arc<AppState>>) -> AppResult<Json<DomainsResponse>> {
    let allow = state.allow_list().await?;
    Ok(Json(DomainsResponse {
        domains: allow.merged(),
    }))
}

// ----- address allocation -----

async fn address_random(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(input): Json<RandomAddressInput>,
) -> AppResult<Json<Address>> {
    state.limiter.check(Action::Create, &headers, peer).await?;

    let allow = state.allow_list().await?;
    let domain = allow.require(&input.domain)?;

    for _ in 0..RANDOM_ATTEMPTS {
        let local = random_local(&state.rng);
        if state.store.reserve_address(&domain, &local).await? {
            return Ok(Json(Address::new(&domain, &local, state.expires_at())));
        }
    }
    Err(AppError::Conflict("address pool exhausted".to_owned()))
}

async fn address_custom(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(input): Json<CustomAddressInput>,
) -> AppResult<Json<Address>> {
    state.limiter.check(Action::Create, &headers, peer).await?;

    let allow = state.allow_list().await?;
    let domain = allow.require(&input.domain)?;
    let local = validate_local(&input.local)?;

    // Unconditional set: creates the reservation or refreshes its TTL.
    state.store.refresh_address(&domain, &local).await?;
    Ok(Json(Address::new(&domain, &local, state.expires_at())))
}

/// Synthesize one candidate local-part from the dictionary
fn random_local(rng: &Mutex<StdRng>) -> String {
    let (name_idx, suffix) = {
        let mut rng = match rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        (
            rng.gen_range(0..LOCAL_DICTIONARY.len()),
            rng.gen_range(0..100_000u32),
        )
    };
    format!("{}{suffix:05}", LOCAL_DICTIONARY[name_idx])
}

/// Normalize and validate a requested local-part
///
/// Lowercase and trim, then require the 3–31 char pattern with a
/// leading alphanumeric, and reject reserved names.
fn validate_local(raw: &str) -> AppResult<String> {
    let local = raw.trim().to_ascii_lowercase();
    if !LOCAL_PATTERN.is_match(&local) {
        return Err(AppError::InvalidInput(
            "local must be 3-31 chars of a-z 0-9 . _ - and start alphanumeric".to_owned(),
        ));
    }
    if RESERVED_LOCALS.contains(&local.as_str()) {
        return Err(AppError::InvalidInput(format!(
            "local '{local}' is reserved"
        )));
    }
    Ok(local)
}

// ----- inbox and messages -----

async fn list_inbox(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path((domain, local)): Path<(String, String)>,
    Query(query): Query<ListInboxQuery>,
) -> AppResult<Json<Vec<StoredMessage>>> {
    state.limiter.check(Action::Fetch, &headers, peer).await?;

    let limit = validate_limit(query.limit)?;
    let before = validate_before(query.before)?;
    let domain = domain.trim().to_ascii_lowercase();
    let local = local.trim().to_ascii_lowercase();

    let messages = state.store.list_inbox(&domain, &local, limit, before).await?;
    Ok(Json(messages))
}

async fn get_message(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> AppResult<Json<StoredMessage>> {
    state.limiter.check(Action::Fetch, &headers, peer).await?;

    let message = state
        .store
        .get_message(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("message '{id}' does not exist")))?;
    Ok(Json(message))
}

async fn delete_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    require_admin(&state.config, &headers)?;
    state.store.delete_message(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ----- streaming -----

/// SSE stream of new-message notifications for one inbox
///
/// Each pub/sub payload becomes an `event: new_message` with the id as
/// data. The id is a hint: clients reconcile by re-listing and must not
/// rely on receiving every id.
async fn stream_inbox(
    State(state): State<Arc<AppState>>,
    Path((domain, local)): Path<(String, String)>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let domain = domain.trim().to_ascii_lowercase();
    let local = local.trim().to_ascii_lowercase();

    let pubsub = state.store.subscribe(&domain, &local).await?;
    let stream = pubsub.into_on_message().map(|msg| {
        let id: String = msg.get_payload().unwrap_or_default();
        Ok(Event::default().event("new_message").data(id))
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_PERIOD)
            .text("keep-alive"),
    ))
}

// ----- admin -----

async fn admin_add_domain(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(input): Json<AdminDomainInput>,
) -> AppResult<StatusCode> {
    require_admin(&state.config, &headers)?;

    let domain = input.domain.trim().to_ascii_lowercase();
    if domain.is_empty() || !domain.contains('.') {
        return Err(AppError::InvalidInput(format!(
            "'{domain}' is not a domain"
        )));
    }
    state.store.add_dynamic_domain(&domain).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn admin_remove_domain(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(domain): Path<String>,
) -> AppResult<StatusCode> {
    require_admin(&state.config, &headers)?;

    let allow = AllowList::from_static(&state.config.allowed_domains);
    if allow.is_static(&domain) {
        return Err(AppError::InvalidInput(format!(
            "domain '{domain}' is static and cannot be removed"
        )));
    }
    state.store.remove_dynamic_domain(&domain).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Require a matching admin bearer token
///
/// With no token configured, admin operations are disabled outright.
fn require_admin(config: &GatewayConfig, headers: &HeaderMap) -> AppResult<()> {
    let expected = config
        .admin_token
        .as_deref()
        .ok_or_else(|| AppError::Unauthorized("admin operations are disabled".to_owned()))?;
    match bearer_token(headers) {
        Some(token) if token == expected => Ok(()),
        _ => Err(AppError::Unauthorized("admin token required".to_owned())),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

// ----- validation helpers -----

/// Validate the inbox page size; out-of-range values are rejected, not
/// clamped
fn validate_limit(limit: usize) -> AppResult<usize> {
    if (1..=MAX_LIST_LIMIT).contains(&limit) {
        Ok(limit)
    } else {
        Err(AppError::InvalidInput(format!(
            "limit must be between 1 and {MAX_LIST_LIMIT}"
        )))
    }
}

/// Validate the `before` cursor; zero means no upper bound
fn validate_before(before: i64) -> AppResult<i64> {
    if before < 0 {
        return Err(AppError::InvalidInput(
            "before must be a non-negative epoch timestamp".to_owned(),
        ));
    }
    Ok(before)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::http::{HeaderMap, header};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::{
        LOCAL_PATTERN, bearer_token, exempt_from_expiry, random_local, validate_before,
        validate_limit, validate_local,
    };

    #[test]
    fn local_length_boundaries() {
        assert!(validate_local("ab").is_err());
        assert!(validate_local("abc").is_ok());
        assert!(validate_local(&"a".repeat(31)).is_ok());
        assert!(validate_local(&"a".repeat(32)).is_err());
    }

    #[test]
    fn local_must_start_alphanumeric() {
        for bad in [".alice", "_alice", "-alice"] {
            assert!(validate_local(bad).is_err(), "{bad} must be rejected");
        }
        assert!(validate_local("alice.test").is_ok());
        assert!(validate_local("0alice").is_ok());
    }

    #[test]
    fn local_is_normalized_before_validation() {
        assert_eq!(validate_local(" ALICE.Test ").unwrap(), "alice.test");
    }

    #[test]
    fn reserved_locals_are_rejected() {
        for reserved in [
            "admin",
            "ADMIN",
            "root",
            "postmaster",
            "support",
            "noreply",
            "abuse",
            "mailer-daemon",
        ] {
            assert!(validate_local(reserved).is_err(), "{reserved} must be rejected");
        }
    }

    #[test]
    fn limit_bounds_are_enforced_not_clamped() {
        assert!(validate_limit(0).is_err());
        assert_eq!(validate_limit(1).unwrap(), 1);
        assert_eq!(validate_limit(100).unwrap(), 100);
        assert!(validate_limit(101).is_err());
    }

    #[test]
    fn before_zero_means_unbounded() {
        assert_eq!(validate_before(0).unwrap(), 0);
        assert_eq!(validate_before(1_700_000_000).unwrap(), 1_700_000_000);
        assert!(validate_before(-1).is_err());
    }

    #[test]
    fn random_candidates_match_the_local_pattern() {
        let rng = Mutex::new(StdRng::seed_from_u64(7));
        for _ in 0..50 {
            let candidate = random_local(&rng);
            assert!(
                LOCAL_PATTERN.is_match(&candidate),
                "candidate '{candidate}' must satisfy the local pattern"
            );
        }
    }

    #[test]
    fn expiry_exemptions_cover_health_and_status_only() {
        assert!(exempt_from_expiry("/api/healthz"));
        assert!(exempt_from_expiry("/api/readyz"));
        assert!(exempt_from_expiry("/api/status"));
        assert!(!exempt_from_expiry("/api/domains"));
        assert!(!exempt_from_expiry("/api/inbox/catty.my.id/alice"));
    }

    #[test]
    fn bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer sekrit".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("sekrit"));

        let mut basic = HeaderMap::new();
        basic.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&basic), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }
}
