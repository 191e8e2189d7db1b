//! Request handler: per-verb dispatch against the store and authorizer
//! (spec §4.E).

use std::sync::{Arc, RwLock};

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::info;

use crate::auth::{AuthError, Operation, TokenTable};
use crate::codec::{Request, Response, Verb};
use crate::hashing::sha256_hex;
use crate::status::Status;
use crate::store::{StoreError, VersionedStore};

/// Shared, reloadable handler state (spec §4.E, §4.G). The token table is an
/// atomic pointer to an immutable snapshot, per §5/§9: reload swaps the
/// pointer under a write lock, requests read it under a read lock — no
/// field-by-field mutation, no in-flight request ever observes a half-loaded
/// table.
pub struct Handler {
    store: VersionedStore,
    tokens: RwLock<Arc<TokenTable>>,
}

impl Handler {
    pub fn new(store: VersionedStore, tokens: TokenTable) -> Self {
        Self {
            store,
            tokens: RwLock::new(Arc::new(tokens)),
        }
    }

    /// Atomically replaces the token table, for hot-reload (spec §4.G).
    pub fn reload_tokens(&self, tokens: TokenTable) {
        *self.tokens.write().expect("token lock poisoned") = Arc::new(tokens);
    }

    /// The configured maximum stored/served file size, so the connection
    /// loop can cap how much of a PUBLISH body it ever buffers instead of
    /// reading past what the store would accept anyway (spec §4.C.1, §4.I).
    pub fn max_body_bytes(&self) -> usize {
        self.store.max_size().min(usize::MAX as u64) as usize
    }

    fn tokens_snapshot(&self) -> Arc<TokenTable> {
        self.tokens.read().expect("token lock poisoned").clone()
    }

    pub async fn dispatch(&self, req: Request) -> Response {
        let sanitized_path = sanitize_for_log(&req.path);
        info!(verb = req.verb.as_str(), path = %sanitized_path, "dispatch");

        match req.verb {
            Verb::Fetch => self.fetch(&req),
            Verb::List => self.list(&req),
            Verb::Versions => self.versions(&req),
            Verb::Publish => self.publish(&req).await,
            Verb::Archive => self.archive(&req).await,
        }
    }

    fn fetch(&self, req: &Request) -> Response {
        if req.path == "/health" {
            return Response::new(Status::Ok).with_body(b"# ok".to_vec());
        }

        let (base_path, version) = parse_version_path(&req.path);
        let stored = match self.store.get(&base_path, version) {
            Ok(s) => s,
            Err(StoreError::NotFound) => return Response::new(Status::NotFound),
            Err(_) => return Response::new(Status::ServerError),
        };

        if version == 0 && stored.archived {
            return Response::new(Status::Archived);
        }

        let etag = sha256_hex(&stored.raw);
        if let Some(inm) = req.metadata.get("if-none-match") {
            if inm == &etag {
                return Response::new(Status::NotModified);
            }
        }
        if let Some(ims) = req.metadata.get("if-modified-since") {
            if let Ok(since) = DateTime::parse_from_rfc3339(ims) {
                let modified = system_time_to_utc(stored.modified);
                if modified.timestamp() <= since.timestamp() {
                    return Response::new(Status::NotModified);
                }
            }
        }

        Response::new(Status::Ok)
            .with_meta("version", stored.version.to_string())
            .with_meta("etag", etag)
            .with_meta("modified", format_time(stored.modified))
            .with_body(stored.body)
    }

    fn list(&self, req: &Request) -> Response {
        match self.store.list(&req.path) {
            Ok(entries) => {
                let mut body = String::new();
                for entry in &entries {
                    if entry.is_dir {
                        body.push_str(&format!("[{name}/]({name}/)\n", name = entry.name));
                    } else {
                        let escaped = urlencoding::encode(&entry.name);
                        body.push_str(&format!("[{}]({})\n", entry.name, escaped));
                    }
                }
                Response::new(Status::Ok)
                    .with_meta("entries", entries.len().to_string())
                    .with_body(body.into_bytes())
            }
            Err(StoreError::NotFound) | Err(StoreError::NotADirectory) => {
                Response::new(Status::NotFound)
            }
            Err(_) => Response::new(Status::ServerError),
        }
    }

    fn versions(&self, req: &Request) -> Response {
        let versions = match self.store.versions(&req.path) {
            Ok(v) => v,
            Err(StoreError::NotFound) => return Response::new(Status::NotFound),
            Err(_) => return Response::new(Status::ServerError),
        };

        let current = versions.first().map(|v| v.version).unwrap_or(0);
        let mut body = String::new();
        for v in &versions {
            body.push_str(&format!("v{} — {}\n", v.version, format_time(v.modified)));
        }

        let mut resp = Response::new(Status::Ok)
            .with_meta("total", versions.len().to_string())
            .with_meta("current", current.to_string())
            .with_body(body.into_bytes());

        match self.store.verify_chain(&req.path) {
            Ok(()) => resp = resp.with_meta("chain-valid", "true"),
            Err(e) => {
                resp = resp
                    .with_meta("chain-valid", "false")
                    .with_meta("chain-error", e.to_string());
            }
        }
        resp
    }

    async fn publish(&self, req: &Request) -> Response {
        let auth_token = req.metadata.get("auth").map(String::as_str).unwrap_or("");
        if let Err(e) = self
            .tokens_snapshot()
            .authorize(auth_token, &req.path, Operation::Publish)
        {
            return auth_error_response(e);
        }

        let current = match self.store.get(&req.path, 0) {
            Ok(s) => Some(s),
            Err(StoreError::NotFound) => None,
            Err(_) => return Response::new(Status::ServerError),
        };
        let current_version = current.as_ref().map(|s| s.version).unwrap_or(0);
        let is_archived = current.as_ref().map(|s| s.archived).unwrap_or(false);

        if is_archived && !req.body.is_empty() {
            return Response::new(Status::Archived);
        }

        if let Some(expected) = req.metadata.get("expected-version") {
            match expected.parse::<u64>() {
                Ok(expected_version) if expected_version == current_version => {}
                Ok(_) => {
                    return Response::new(Status::Conflict)
                        .with_meta("server-version", current_version.to_string())
                }
                Err(_) => return Response::new(Status::ServerError),
            }
        }

        if req.body.is_empty() && !is_archived {
            // A version is only ever created by a non-empty body (spec
            // §3's lifecycle rule). An empty-body PUBLISH to a path with
            // no existing document is a no-op against nothing, not an
            // implicit "create an empty v1".
            let Some(stored) = &current else {
                return Response::new(Status::NotFound);
            };
            let (version, modified) = (stored.version, stored.modified);
            return Response::new(Status::Ok)
                .with_meta("version", version.to_string())
                .with_meta("modified", format_time(modified));
        }

        match self.store.write(&req.path, &req.body, false).await {
            Ok(outcome) => {
                let stored = match self.store.get(&req.path, outcome.version) {
                    Ok(s) => s,
                    Err(_) => return Response::new(Status::ServerError),
                };
                Response::new(Status::Created)
                    .with_meta("version", outcome.version.to_string())
                    .with_meta("modified", format_time(outcome.modified))
                    .with_meta("etag", sha256_hex(&stored.raw))
            }
            Err(StoreError::Conflict) => Response::new(Status::Conflict),
            Err(StoreError::TooLarge) => Response::new(Status::ServerError),
            Err(_) => Response::new(Status::ServerError),
        }
    }

    async fn archive(&self, req: &Request) -> Response {
        let auth_token = req.metadata.get("auth").map(String::as_str).unwrap_or("");
        if let Err(e) = self
            .tokens_snapshot()
            .authorize(auth_token, &req.path, Operation::Publish)
        {
            return auth_error_response(e);
        }

        match self.store.archive(&req.path).await {
            Ok(outcome) => Response::new(Status::Ok)
                .with_meta("archived", "true")
                .with_meta("version", outcome.version.to_string()),
            Err(StoreError::Conflict) => Response::new(Status::Conflict),
            Err(_) => Response::new(Status::ServerError),
        }
    }
}

fn auth_error_response(e: AuthError) -> Response {
    match e {
        AuthError::NoToken | AuthError::Invalid | AuthError::Expired => {
            Response::new(Status::Unauthorized)
        }
        AuthError::NotPermitted => Response::new(Status::NotPermitted),
    }
}

/// `parseVersionPath("/doc.md/v3") = ("/doc.md", 3)`; any suffix that isn't
/// a bare positive integer after `/v` is treated as no suffix at all (spec
/// §4.E, §8 boundary behaviors).
fn parse_version_path(path: &str) -> (String, u64) {
    if let Some(idx) = path.rfind("/v") {
        let (base, suffix) = path.split_at(idx);
        let digits = &suffix[2..];
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(n) = digits.parse::<u64>() {
                if n > 0 {
                    return (base.to_string(), n);
                }
            }
        }
    }
    (path.to_string(), 0)
}

fn sanitize_for_log(s: &str) -> String {
    s.chars().map(|c| if c.is_control() { '?' } else { c }).collect()
}

fn format_time(t: std::time::SystemTime) -> String {
    system_time_to_utc(t).to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn system_time_to_utc(t: std::time::SystemTime) -> DateTime<Utc> {
    let dur = t.duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    DateTime::<Utc>::from_timestamp(dur.as_secs() as i64, dur.subsec_nanos())
        .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap())
}
