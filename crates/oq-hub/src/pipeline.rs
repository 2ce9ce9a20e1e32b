//! # Query Pipeline
//!
//! Runs one data query end to end:
//! authenticate → parse → resolve subject → authorize → translate → execute.
//!
//! Each step needs the previous step's output, so the collaborators are
//! called strictly in sequence, once each. Any failure ends the request and
//! maps to exactly one [`QueryError`]; nothing is retried.

use std::time::Instant;

use axum::body::Bytes;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use oq_core::{ParseError, Query, TranslateError};
use serde::Serialize;

use crate::auth::{self, ResolveError, ResolvedSubject, TokenData};
use crate::store::{StoreError, EMPTY_RESULT};
use crate::AppState;

/// Every way a request can fail, each mapped to one status.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("failed authorization")]
    Unauthorized,
    #[error("There was an issue trying to build the query to run")]
    EmptyBody,
    #[error("Errors building query: [{}]", join_errors(.0))]
    Parse(Vec<ParseError>),
    #[error("userid not found")]
    IdentityNotFound,
    #[error("storage partition not found")]
    NoStorageKey,
    #[error("Errors building query: [{0}]")]
    Translate(#[from] TranslateError),
    #[error("caller may not view this data")]
    Forbidden,
    #[error("There was an issue running the query")]
    Storage,
}

impl QueryError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::EmptyBody
            | Self::Parse(_)
            | Self::IdentityNotFound
            | Self::NoStorageKey
            | Self::Translate(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Storage => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable code clients can branch on; several codes share a status.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::EmptyBody => "build_query",
            Self::Parse(_) => "parse_query",
            Self::IdentityNotFound => "identity_not_found",
            Self::NoStorageKey => "storage_key_not_found",
            Self::Translate(_) => "translate_query",
            Self::Forbidden => "forbidden",
            Self::Storage => "storage",
        }
    }
}

impl From<ResolveError> for QueryError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::UnknownUser(_) => Self::IdentityNotFound,
            ResolveError::NoStorageKey(_) => Self::NoStorageKey,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

fn join_errors(errors: &[ParseError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A successful query: the store's serialized records, or nothing matched.
#[derive(Debug, PartialEq)]
pub enum QueryOutcome {
    Records(Bytes),
    Empty,
}

impl IntoResponse for QueryOutcome {
    fn into_response(self) -> Response {
        let body = match self {
            Self::Records(bytes) => bytes,
            Self::Empty => Bytes::from_static(EMPTY_RESULT),
        };
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response()
    }
}

/// Check the caller's token.
pub async fn authenticate(state: &AppState, token: Option<&str>) -> Result<TokenData, QueryError> {
    let token = token.filter(|t| !t.is_empty()).ok_or_else(|| {
        tracing::warn!("Missing session token");
        QueryError::Unauthorized
    })?;
    state.tokens.check(token).await.ok_or_else(|| {
        tracing::warn!("Invalid session token");
        QueryError::Unauthorized
    })
}

/// Resolve `raw` to a storage partition and check `caller` may view it.
pub async fn resolve_subject(
    state: &AppState,
    caller: &TokenData,
    raw: &str,
) -> Result<ResolvedSubject, QueryError> {
    let subject = state.identities.resolve(raw).await.map_err(|e| {
        tracing::warn!("Resolving subject failed: {}", e);
        QueryError::from(e)
    })?;

    let access = auth::authorize(caller, &subject.user_id, state.permissions.as_ref()).await;
    if !access.allowed() {
        tracing::warn!("{} denied view of {}", caller.user_id, subject.user_id);
        return Err(QueryError::Forbidden);
    }
    tracing::debug!("{} may view {} ({:?})", caller.user_id, subject.user_id, access);
    Ok(subject)
}

/// Run a raw query body on behalf of the holder of `token`.
pub async fn run(
    state: &AppState,
    token: Option<&str>,
    body: &[u8],
) -> Result<QueryOutcome, QueryError> {
    let start = Instant::now();
    let caller = authenticate(state, token).await?;

    let raw = std::str::from_utf8(body)
        .ok()
        .filter(|raw| !raw.trim().is_empty())
        .ok_or_else(|| {
            tracing::warn!("Query body empty or not UTF-8");
            QueryError::EmptyBody
        })?;
    tracing::info!("Query raw [{}]", raw);

    let query = Query::parse(raw).map_err(|errors| {
        tracing::warn!(
            "Query errors [{}] after [{:?}]",
            join_errors(&errors),
            start.elapsed()
        );
        QueryError::Parse(errors)
    })?;
    let given = query
        .subject_value()
        .ok_or(QueryError::Parse(vec![ParseError::SubjectMissing]))?;

    let subject = resolve_subject(state, &caller, given).await?;

    let translation = oq_core::translate(&query, &subject.storage_key, state.gate())?;
    tracing::debug!(
        "Store filter {} sort {}",
        translation.filter.to_document(),
        translation.sort
    );

    let outcome = match state
        .store
        .execute(&translation.filter, &translation.sort)
        .await
    {
        Ok(bytes) => QueryOutcome::Records(bytes),
        Err(StoreError::NotFound) => QueryOutcome::Empty,
        Err(e) => {
            tracing::error!("Query failed after [{:?}]: {}", start.elapsed(), e);
            return Err(QueryError::Storage);
        }
    };

    tracing::info!("Query completed in [{:?}]", start.elapsed());
    Ok(outcome)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::{
        IdentityResolver, LookupError, PermissionLookup, Permissions, TokenChecker,
    };
    use crate::store::StorageExecutor;
    use crate::Config;
    use oq_core::{Filter, SortDirection, SortSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Fakes for all four collaborators, counting calls.
    #[derive(Default)]
    pub(crate) struct Fakes {
        pub calls: Calls,
        pub grants: Vec<&'static str>,
        pub ping_fails: bool,
        pub store_result: Mutex<Option<Result<Bytes, StoreError>>>,
        pub last_sort: Mutex<Option<SortSpec>>,
        pub last_filter: Mutex<Option<Filter>>,
    }

    #[derive(Default)]
    pub(crate) struct Calls {
        pub tokens: AtomicUsize,
        pub resolve: AtomicUsize,
        pub permissions: AtomicUsize,
        pub store: AtomicUsize,
    }

    impl Calls {
        pub fn get(&self) -> [usize; 4] {
            [
                self.tokens.load(Ordering::SeqCst),
                self.resolve.load(Ordering::SeqCst),
                self.permissions.load(Ordering::SeqCst),
                self.store.load(Ordering::SeqCst),
            ]
        }
    }

    #[async_trait::async_trait]
    impl TokenChecker for Fakes {
        async fn check(&self, token: &str) -> Option<TokenData> {
            self.calls.tokens.fetch_add(1, Ordering::SeqCst);
            match token {
                "owner" => Some(TokenData {
                    user_id: "u1".into(),
                    is_server: false,
                }),
                "care" => Some(TokenData {
                    user_id: "care".into(),
                    is_server: false,
                }),
                "server" => Some(TokenData {
                    user_id: "svc".into(),
                    is_server: true,
                }),
                _ => None,
            }
        }
    }

    #[async_trait::async_trait]
    impl IdentityResolver for Fakes {
        async fn resolve(&self, raw: &str) -> Result<ResolvedSubject, ResolveError> {
            self.calls.resolve.fetch_add(1, Ordering::SeqCst);
            match raw {
                "u1" | "foo@bar.org" => Ok(ResolvedSubject {
                    user_id: "u1".into(),
                    storage_key: "pair-u1".into(),
                }),
                "nokey" => Err(ResolveError::NoStorageKey(raw.into())),
                _ => Err(ResolveError::UnknownUser(raw.into())),
            }
        }
    }

    #[async_trait::async_trait]
    impl PermissionLookup for Fakes {
        async fn permissions_of(&self, _: &str, _: &str) -> Result<Permissions, LookupError> {
            self.calls.permissions.fetch_add(1, Ordering::SeqCst);
            Ok(self.grants.iter().map(|g| g.to_string()).collect())
        }
    }

    #[async_trait::async_trait]
    impl StorageExecutor for Fakes {
        async fn execute(&self, filter: &Filter, sort: &SortSpec) -> Result<Bytes, StoreError> {
            self.calls.store.fetch_add(1, Ordering::SeqCst);
            *self.last_filter.lock().unwrap() = Some(filter.clone());
            *self.last_sort.lock().unwrap() = Some(sort.clone());
            self.store_result
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Ok(Bytes::from_static(b"[{\"type\":\"cbg\"}]")))
        }

        async fn last_entry_time(&self, filter: &Filter) -> Result<Bytes, StoreError> {
            self.calls.store.fetch_add(1, Ordering::SeqCst);
            *self.last_filter.lock().unwrap() = Some(filter.clone());
            self.store_result
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Ok(Bytes::from_static(b"\"2015-01-01T00:00:00Z\"")))
        }

        async fn ping(&self) -> Result<(), StoreError> {
            if self.ping_fails {
                return Err(StoreError::Backend("connection refused".into()));
            }
            Ok(())
        }
    }

    pub(crate) fn state_with(fakes: Arc<Fakes>) -> AppState {
        AppState {
            config: Config::default(),
            tokens: fakes.clone(),
            identities: fakes.clone(),
            permissions: fakes.clone(),
            store: fakes,
        }
    }

    const VALID: &str =
        "METAQUERY WHERE userid IS u1 QUERY TYPE IN cbg, smbg SORT BY time AS Timestamp REVERSED";

    #[tokio::test]
    async fn test_owner_gets_records() {
        let fakes = Arc::new(Fakes::default());
        let state = state_with(fakes.clone());
        let outcome = run(&state, Some("owner"), VALID.as_bytes()).await.unwrap();
        assert_eq!(
            outcome,
            QueryOutcome::Records(Bytes::from_static(b"[{\"type\":\"cbg\"}]"))
        );
        // Same user, so no permission lookup.
        assert_eq!(fakes.calls.get(), [1, 1, 0, 1]);

        let filter = fakes.last_filter.lock().unwrap().clone().unwrap();
        assert_eq!(filter.group_id, "pair-u1");
        assert_eq!(filter.types, vec!["cbg", "smbg"]);
        let sort = fakes.last_sort.lock().unwrap().clone().unwrap();
        assert_eq!(sort.direction, SortDirection::Descending);
    }

    #[tokio::test]
    async fn test_missing_or_bad_token_is_unauthorized() {
        let fakes = Arc::new(Fakes::default());
        let state = state_with(fakes.clone());
        let err = run(&state, None, VALID.as_bytes()).await.unwrap_err();
        assert!(matches!(err, QueryError::Unauthorized));
        let err = run(&state, Some("bogus"), VALID.as_bytes()).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(fakes.calls.get(), [1, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_empty_body_is_bad_request() {
        let fakes = Arc::new(Fakes::default());
        let state = state_with(fakes.clone());
        let err = run(&state, Some("owner"), b"").await.unwrap_err();
        assert!(matches!(err, QueryError::EmptyBody));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "build_query");
    }

    #[tokio::test]
    async fn test_parse_errors_stop_after_authentication() {
        let fakes = Arc::new(Fakes::default());
        let state = state_with(fakes.clone());
        let err = run(&state, Some("owner"), b"blah blah").await.unwrap_err();
        match &err {
            QueryError::Parse(errors) => assert_eq!(errors.len(), 3),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        let message = err.to_string();
        assert!(message.contains("METAQUERY"));
        assert!(message.contains("TYPE IN"));
        assert!(message.contains("SORT BY"));
        assert_eq!(fakes.calls.get(), [1, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_unknown_subject_is_bad_request() {
        let fakes = Arc::new(Fakes::default());
        let state = state_with(fakes.clone());
        let raw = VALID.replace("u1", "ghost");
        let err = run(&state, Some("owner"), raw.as_bytes()).await.unwrap_err();
        assert!(matches!(err, QueryError::IdentityNotFound));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "identity_not_found");

        let raw = VALID.replace("u1", "nokey");
        let err = run(&state, Some("owner"), raw.as_bytes()).await.unwrap_err();
        assert!(matches!(err, QueryError::NoStorageKey));
        assert_eq!(fakes.calls.get()[3], 0);
    }

    #[tokio::test]
    async fn test_caller_without_grant_is_forbidden() {
        let fakes = Arc::new(Fakes {
            grants: vec!["upload"],
            ..Default::default()
        });
        let state = state_with(fakes.clone());
        let err = run(&state, Some("care"), VALID.as_bytes()).await.unwrap_err();
        assert!(matches!(err, QueryError::Forbidden));
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(fakes.calls.get(), [1, 1, 1, 0]);
    }

    #[tokio::test]
    async fn test_caller_with_view_grant_reads() {
        let fakes = Arc::new(Fakes {
            grants: vec!["view"],
            ..Default::default()
        });
        let state = state_with(fakes.clone());
        assert!(run(&state, Some("care"), VALID.as_bytes()).await.is_ok());
        assert_eq!(fakes.calls.get(), [1, 1, 1, 1]);
    }

    #[tokio::test]
    async fn test_server_token_skips_lookup() {
        let fakes = Arc::new(Fakes::default());
        let state = state_with(fakes.clone());
        let raw = VALID.replace("userid IS u1", "emails CONTAINS foo@bar.org");
        assert!(run(&state, Some("server"), raw.as_bytes()).await.is_ok());
        assert_eq!(fakes.calls.get(), [1, 1, 0, 1]);
    }

    #[tokio::test]
    async fn test_own_email_counts_as_self_access() {
        let fakes = Arc::new(Fakes::default());
        let state = state_with(fakes.clone());
        let raw = VALID.replace("userid IS u1", "emails CONTAINS foo@bar.org");
        assert!(run(&state, Some("owner"), raw.as_bytes()).await.is_ok());
        // Resolved to the caller's own id, so no permission lookup.
        assert_eq!(fakes.calls.get(), [1, 1, 0, 1]);
    }

    #[tokio::test]
    async fn test_no_match_is_empty_success() {
        let fakes = Arc::new(Fakes {
            store_result: Mutex::new(Some(Err(StoreError::NotFound))),
            ..Default::default()
        });
        let state = state_with(fakes);
        let outcome = run(&state, Some("owner"), VALID.as_bytes()).await.unwrap();
        assert_eq!(outcome, QueryOutcome::Empty);
    }

    #[tokio::test]
    async fn test_store_failure_hides_backend_text() {
        let fakes = Arc::new(Fakes {
            store_result: Mutex::new(Some(Err(StoreError::Backend(
                "socket reset by peer".into(),
            )))),
            ..Default::default()
        });
        let state = state_with(fakes);
        let err = run(&state, Some("owner"), VALID.as_bytes()).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.to_string().contains("socket"));
    }

    #[tokio::test]
    async fn test_membership_reaches_store() {
        let fakes = Arc::new(Fakes::default());
        let state = state_with(fakes.clone());
        let raw = "METAQUERY WHERE userid IS u1 QUERY TYPE IN cbg WHERE updateId NOT IN a,b,c SORT BY time AS X";
        run(&state, Some("owner"), raw.as_bytes()).await.unwrap();
        let filter = fakes.last_filter.lock().unwrap().clone().unwrap();
        assert_eq!(
            filter.to_document()["updateId"],
            serde_json::json!({ "$nin": ["a", "b", "c"] })
        );
        let sort = fakes.last_sort.lock().unwrap().clone().unwrap();
        assert_eq!(sort.direction, SortDirection::Ascending);
    }
}
