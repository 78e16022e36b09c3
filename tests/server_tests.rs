//! HTTP API tests: an ephemeral server instance driven over real sockets.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::Router;
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};

use coalesce::consolidate::Consolidator;
use coalesce::server::{app, AppState};
use coalesce::store::SqliteStore;

fn temp_db_path() -> PathBuf {
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    std::env::temp_dir().join(format!("coalesce-server-test-{pid}-{ts}.db"))
}

async fn start_server(db_path: &PathBuf) -> (String, oneshot::Sender<()>) {
    let store = SqliteStore::open(db_path).expect("open store");
    let state = Arc::new(Mutex::new(AppState {
        consolidator: Consolidator::new(store),
        open_signup: true,
    }));
    let router: Router = app(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind server");
    let addr = listener.local_addr().expect("server addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let server = axum::serve(listener, router).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    (format!("http://{}", addr), shutdown_tx)
}

/// POST a JSON body, returning (status, parsed body) whether or not the
/// status was an error.
fn post_json(url: &str, token: Option<&str>, body: &Value) -> (u16, Value) {
    let mut request = ureq::post(url).set("Content-Type", "application/json");
    if let Some(token) = token {
        request = request.set("Authorization", &format!("Bearer {token}"));
    }
    match request.send_string(&body.to_string()) {
        Ok(response) => {
            let status = response.status();
            let body: Value = response.into_json().unwrap_or(Value::Null);
            (status, body)
        }
        Err(ureq::Error::Status(status, response)) => {
            let body: Value = response.into_json().unwrap_or(Value::Null);
            (status, body)
        }
        Err(e) => panic!("transport error: {e}"),
    }
}

fn signup_and_signin(base_url: &str) -> String {
    let (status, _) = post_json(
        &format!("{base_url}/auth/signup"),
        None,
        &json!({ "username": "doc", "password": "hunter22hunter22" }),
    );
    assert_eq!(status, 201);
    let (status, body) = post_json(
        &format!("{base_url}/auth/signin"),
        None,
        &json!({ "username": "doc", "password": "hunter22hunter22" }),
    );
    assert_eq!(status, 200);
    body["token"].as_str().expect("token").to_string()
}

#[tokio::test(flavor = "multi_thread")]
async fn health_is_open() {
    let db = temp_db_path();
    let (base_url, shutdown) = start_server(&db).await;

    let status = tokio::task::spawn_blocking(move || {
        ureq::get(&format!("{base_url}/health"))
            .call()
            .expect("health")
            .status()
    })
    .await
    .unwrap();
    assert_eq!(status, 200);

    let _ = shutdown.send(());
    let _ = std::fs::remove_file(&db);
}

#[tokio::test(flavor = "multi_thread")]
async fn identify_requires_a_token() {
    let db = temp_db_path();
    let (base_url, shutdown) = start_server(&db).await;

    let (status, _) = tokio::task::spawn_blocking(move || {
        post_json(
            &format!("{base_url}/identify"),
            None,
            &json!({ "email": "a@x.com" }),
        )
    })
    .await
    .unwrap();
    assert_eq!(status, 401);

    let _ = shutdown.send(());
    let _ = std::fs::remove_file(&db);
}

#[tokio::test(flavor = "multi_thread")]
async fn identify_consolidates_and_merges() {
    let db = temp_db_path();
    let (base_url, shutdown) = start_server(&db).await;

    let results = tokio::task::spawn_blocking(move || {
        let token = signup_and_signin(&base_url);
        let identify = |body: &Value| {
            post_json(&format!("{base_url}/identify"), Some(&token), body)
        };

        let (status, first) = identify(&json!({ "email": "a@x.com", "phoneNumber": "111" }));
        assert_eq!(status, 200);

        // phoneNumber as a JSON number must behave like its string form.
        let (status, second) = identify(&json!({ "email": "a@x.com", "phoneNumber": 222 }));
        assert_eq!(status, 200);

        let (status, third) = identify(&json!({ "email": "b@x.com", "phoneNumber": "333" }));
        assert_eq!(status, 200);

        // Bridge the two identities.
        let (status, merged) = identify(&json!({ "email": "b@x.com", "phoneNumber": "111" }));
        assert_eq!(status, 200);

        (first, second, third, merged)
    })
    .await
    .unwrap();
    let (first, second, third, merged) = results;

    let primary_id = first["contact"]["primaryContactId"].as_i64().unwrap();
    assert_eq!(second["contact"]["primaryContactId"].as_i64(), Some(primary_id));
    assert_eq!(
        second["contact"]["phoneNumbers"],
        json!(["111", "222"])
    );
    let other_primary = third["contact"]["primaryContactId"].as_i64().unwrap();
    assert_ne!(other_primary, primary_id);

    assert_eq!(merged["contact"]["primaryContactId"].as_i64(), Some(primary_id));
    let merged_secondaries = merged["contact"]["secondaryContactIds"]
        .as_array()
        .unwrap();
    assert!(merged_secondaries.contains(&json!(other_primary)));

    let _ = shutdown.send(());
    let _ = std::fs::remove_file(&db);
}

#[tokio::test(flavor = "multi_thread")]
async fn identify_rejects_empty_submission() {
    let db = temp_db_path();
    let (base_url, shutdown) = start_server(&db).await;

    let (status, body) = tokio::task::spawn_blocking(move || {
        let token = signup_and_signin(&base_url);
        post_json(
            &format!("{base_url}/identify"),
            Some(&token),
            &json!({ "email": "", "phoneNumber": null }),
        )
    })
    .await
    .unwrap();
    assert_eq!(status, 400);
    assert!(body["error"].as_str().unwrap().contains("email or phoneNumber"));

    let _ = shutdown.send(());
    let _ = std::fs::remove_file(&db);
}

#[tokio::test(flavor = "multi_thread")]
async fn auth_flow_signup_conflicts_and_logout() {
    let db = temp_db_path();
    let (base_url, shutdown) = start_server(&db).await;

    tokio::task::spawn_blocking(move || {
        let token = signup_and_signin(&base_url);

        // Same username again conflicts.
        let (status, _) = post_json(
            &format!("{base_url}/auth/signup"),
            None,
            &json!({ "username": "doc", "password": "hunter22hunter22" }),
        );
        assert_eq!(status, 409);

        // Weak password is rejected up front.
        let (status, _) = post_json(
            &format!("{base_url}/auth/signup"),
            None,
            &json!({ "username": "marty", "password": "short" }),
        );
        assert_eq!(status, 400);

        // Wrong password is unauthorized.
        let (status, _) = post_json(
            &format!("{base_url}/auth/signin"),
            None,
            &json!({ "username": "doc", "password": "wrong-password" }),
        );
        assert_eq!(status, 401);

        // Logout revokes the token for identify.
        let (status, _) = post_json(&format!("{base_url}/auth/logout"), Some(&token), &json!({}));
        assert_eq!(status, 200);
        let (status, _) = post_json(
            &format!("{base_url}/identify"),
            Some(&token),
            &json!({ "email": "a@x.com" }),
        );
        assert_eq!(status, 401);
    })
    .await
    .unwrap();

    let _ = shutdown.send(());
    let _ = std::fs::remove_file(&db);
}
