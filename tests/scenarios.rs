//! End-to-end scenarios S1–S8 (spec §8), driven directly against the
//! `Handler` rather than over real QUIC sockets — the wire layer itself is
//! covered by `tests/codec.rs`.

use std::collections::BTreeMap;

use demarkus::auth::TokenTable;
use demarkus::codec::{Request, Verb};
use demarkus::handler::Handler;
use demarkus::hashing::sha256_prefixed;
use demarkus::resolver::Resolver;
use demarkus::status::Status;
use demarkus::store::VersionedStore;
use tempfile::tempdir;

const RAW_TOKEN: &str = "s1-test-token";

fn handler_with_full_access(root: &std::path::Path) -> Handler {
    let hash = sha256_prefixed(RAW_TOKEN.as_bytes());
    let toml_src = format!(
        "[tokens.full]\nhash = \"{hash}\"\npaths = [\"/**\"]\noperations = [\"read\", \"publish\"]\n"
    );
    let tokens_path = root.join("tokens.toml");
    // Token file lives alongside, not inside, the content root so it never
    // shows up in a LIST of the content root.
    std::fs::write(&tokens_path, toml_src).unwrap();
    let tokens = TokenTable::load(&tokens_path).unwrap();

    let content_root = root.join("content");
    std::fs::create_dir_all(&content_root).unwrap();
    let store = VersionedStore::new(
        Resolver::new(&content_root).unwrap(),
        demarkus::store::DEFAULT_MAX_SIZE,
    );
    Handler::new(store, tokens)
}

fn req(verb: Verb, path: &str, meta: &[(&str, &str)], body: &[u8]) -> Request {
    let mut metadata = BTreeMap::new();
    for (k, v) in meta {
        metadata.insert(k.to_string(), v.to_string());
    }
    Request {
        verb,
        path: path.to_string(),
        metadata,
        body: body.to_vec(),
    }
}

fn auth_meta() -> Vec<(&'static str, &'static str)> {
    vec![("auth", RAW_TOKEN)]
}

#[tokio::test]
async fn s1_first_publish_then_fetch() {
    let dir = tempdir().unwrap();
    let h = handler_with_full_access(dir.path());

    let resp = h
        .dispatch(req(Verb::Publish, "/a.md", &auth_meta(), b"# Hi"))
        .await;
    assert_eq!(resp.status, Status::Created);
    assert_eq!(resp.metadata.get("version").unwrap(), "1");

    let resp = h.dispatch(req(Verb::Fetch, "/a.md", &[], b"")).await;
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(resp.body, b"# Hi");
    assert_eq!(resp.metadata.get("version").unwrap(), "1");
    assert_eq!(resp.metadata.get("etag").unwrap().len(), 64);
}

#[tokio::test]
async fn s2_chain_formation() {
    let dir = tempdir().unwrap();
    let h = handler_with_full_access(dir.path());

    for body in [b"# V1".as_slice(), b"# V2", b"# V3"] {
        h.dispatch(req(Verb::Publish, "/c.md", &auth_meta(), body)).await;
    }

    let resp = h.dispatch(req(Verb::Versions, "/c.md", &[], b"")).await;
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(resp.metadata.get("total").unwrap(), "3");
    assert_eq!(resp.metadata.get("current").unwrap(), "3");
    assert_eq!(resp.metadata.get("chain-valid").unwrap(), "true");
    let body = String::from_utf8(resp.body).unwrap();
    let v3_pos = body.find("v3").unwrap();
    let v2_pos = body.find("v2").unwrap();
    let v1_pos = body.find("v1").unwrap();
    assert!(v3_pos < v2_pos && v2_pos < v1_pos);
}

#[tokio::test]
async fn s3_chain_tampering_detected() {
    let dir = tempdir().unwrap();
    let h = handler_with_full_access(dir.path());
    for body in [b"# V1".as_slice(), b"# V2", b"# V3"] {
        h.dispatch(req(Verb::Publish, "/c.md", &auth_meta(), body)).await;
    }

    let v1_path = dir.path().join("content/versions/c.md.v1");
    std::fs::write(&v1_path, b"---\nversion: 1\n---\ntampered").unwrap();

    let resp = h.dispatch(req(Verb::Versions, "/c.md", &[], b"")).await;
    assert_eq!(resp.metadata.get("chain-valid").unwrap(), "false");
    assert!(resp.metadata.contains_key("chain-error"));
}

#[tokio::test]
async fn s4_conditional_fetch() {
    let dir = tempdir().unwrap();
    let h = handler_with_full_access(dir.path());
    h.dispatch(req(Verb::Publish, "/a.md", &auth_meta(), b"# Hi")).await;
    let fetched = h.dispatch(req(Verb::Fetch, "/a.md", &[], b"")).await;
    let etag = fetched.metadata.get("etag").unwrap().clone();

    let resp = h
        .dispatch(req(Verb::Fetch, "/a.md", &[("if-none-match", &etag)], b""))
        .await;
    assert_eq!(resp.status, Status::NotModified);
    assert!(resp.body.is_empty());
}

#[tokio::test]
async fn s5_archive_then_fetch_current_then_historical() {
    let dir = tempdir().unwrap();
    let h = handler_with_full_access(dir.path());
    h.dispatch(req(Verb::Publish, "/a.md", &auth_meta(), b"# Hi")).await;
    h.dispatch(req(Verb::Archive, "/a.md", &auth_meta(), b"")).await;

    let current = h.dispatch(req(Verb::Fetch, "/a.md", &[], b"")).await;
    assert_eq!(current.status, Status::Archived);
    assert!(current.body.is_empty());

    let historical = h.dispatch(req(Verb::Fetch, "/a.md/v1", &[], b"")).await;
    assert_eq!(historical.status, Status::Ok);
    assert_eq!(historical.body, b"# Hi");
}

#[tokio::test]
async fn s6_unarchive_by_empty_publish() {
    let dir = tempdir().unwrap();
    let h = handler_with_full_access(dir.path());
    h.dispatch(req(Verb::Publish, "/a.md", &auth_meta(), b"# Hi")).await;
    h.dispatch(req(Verb::Archive, "/a.md", &auth_meta(), b"")).await;

    let resp = h.dispatch(req(Verb::Publish, "/a.md", &auth_meta(), b"")).await;
    assert!(matches!(resp.status, Status::Created | Status::Ok));
    assert_eq!(resp.metadata.get("version").unwrap(), "3");

    let current = h.dispatch(req(Verb::Fetch, "/a.md", &[], b"")).await;
    assert_eq!(current.status, Status::Ok);
}

#[tokio::test]
async fn s7_optimistic_concurrency_conflict() {
    let dir = tempdir().unwrap();
    let h = handler_with_full_access(dir.path());
    h.dispatch(req(Verb::Publish, "/a.md", &auth_meta(), b"# Hi")).await;

    let mut meta = auth_meta();
    meta.push(("expected-version", "0"));
    let resp = h.dispatch(req(Verb::Publish, "/a.md", &meta, b"# V2")).await;
    assert_eq!(resp.status, Status::Conflict);
    assert_eq!(resp.metadata.get("server-version").unwrap(), "1");

    let mut meta = auth_meta();
    meta.push(("expected-version", "1"));
    let resp = h.dispatch(req(Verb::Publish, "/a.md", &meta, b"# V2")).await;
    assert_eq!(resp.status, Status::Created);
    assert_eq!(resp.metadata.get("version").unwrap(), "2");
}

#[tokio::test]
async fn s8_symlink_escape_blocked() {
    let dir = tempdir().unwrap();
    let h = handler_with_full_access(dir.path());
    let outside = tempdir().unwrap();
    std::fs::write(outside.path().join("etc-secret"), b"TOP SECRET").unwrap();
    std::os::unix::fs::symlink(
        outside.path().join("etc-secret"),
        dir.path().join("content/evil.md"),
    )
    .unwrap();

    let resp = h.dispatch(req(Verb::Fetch, "/evil.md", &[], b"")).await;
    assert_eq!(resp.status, Status::NotFound);
    assert!(!String::from_utf8_lossy(&resp.body).contains("TOP SECRET"));
}

#[tokio::test]
async fn empty_publish_on_a_never_seen_path_creates_no_version() {
    let dir = tempdir().unwrap();
    let h = handler_with_full_access(dir.path());

    let resp = h.dispatch(req(Verb::Publish, "/never-seen.md", &auth_meta(), b"")).await;
    assert_eq!(resp.status, Status::NotFound);

    let versions = h.dispatch(req(Verb::Versions, "/never-seen.md", &[], b"")).await;
    assert_eq!(versions.status, Status::NotFound);
}

#[tokio::test]
async fn publish_without_token_is_unauthorized() {
    let dir = tempdir().unwrap();
    let h = handler_with_full_access(dir.path());
    let resp = h.dispatch(req(Verb::Publish, "/a.md", &[], b"# Hi")).await;
    assert_eq!(resp.status, Status::Unauthorized);
}
