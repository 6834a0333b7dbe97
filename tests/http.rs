use once_cell::sync::Lazy;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcceptResponse {
    status: String,
    post_count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveResponse {
    success: bool,
    status: String,
    hash: Option<String>,
    rows: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    post_count: u64,
    processed_ids: usize,
    save_every_n: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsResponse {
    enabled: bool,
    path: Option<String>,
    save_every_n: Option<u64>,
    filter_threshold: Option<f64>,
}

struct TestServer {
    base_url: String,
    export_dir: PathBuf,
    child: Child,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

static TEST_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));
static SERVER: Lazy<Mutex<Option<Arc<TestServer>>>> = Lazy::new(|| Mutex::new(None));

#[cfg(unix)]
mod cleanup {
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Once;

    static REGISTER: Once = Once::new();
    static PID: AtomicI32 = AtomicI32::new(0);

    pub fn register(pid: u32) {
        REGISTER.call_once(|| {
            PID.store(pid as i32, Ordering::SeqCst);
            unsafe {
                libc::atexit(on_exit);
            }
        });
    }

    extern "C" fn on_exit() {
        let pid = PID.load(Ordering::SeqCst);
        if pid > 0 {
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
    }
}

fn pick_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind random port");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn unique_temp_path(suffix: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let mut path = std::env::temp_dir();
    path.push(format!("engagement_stats_http_{}_{}_{suffix}", std::process::id(), nanos));
    path
}

async fn wait_until_ready(base_url: &str) {
    let client = Client::new();
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if let Ok(resp) = client.get(format!("{base_url}/api/stats")).send().await {
            if resp.status().is_success() {
                return;
            }
        }
        if Instant::now() > deadline {
            panic!("server did not become ready");
        }
        sleep(Duration::from_millis(100)).await;
    }
}

async fn spawn_server() -> TestServer {
    let port = pick_free_port();
    let data_path = unique_temp_path("state.json");
    let export_dir = unique_temp_path("exports");
    let child = Command::new(env!("CARGO_BIN_EXE_engagement_stats"))
        .env("PORT", port.to_string())
        .env("APP_DATA_PATH", &data_path)
        .env("APP_EXPORT_DIR", &export_dir)
        .env("RUST_LOG", "info")
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .expect("failed to spawn server");

    #[cfg(unix)]
    cleanup::register(child.id());

    let base_url = format!("http://127.0.0.1:{port}");
    wait_until_ready(&base_url).await;

    TestServer {
        base_url,
        export_dir,
        child,
    }
}

async fn shared_server() -> Arc<TestServer> {
    let mut guard = SERVER.lock().await;
    if let Some(server) = guard.as_ref() {
        return Arc::clone(server);
    }
    let server = Arc::new(spawn_server().await);
    *guard = Some(Arc::clone(&server));
    server
}

async fn enable_collection(client: &Client, server: &TestServer) {
    let response = client
        .put(format!("{}/api/settings", server.base_url))
        .json(&serde_json::json!({ "enabled": true, "saveEveryN": 1000 }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
}

#[tokio::test]
async fn http_settings_validate_and_update() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();

    let response = client
        .put(format!("{}/api/settings", server.base_url))
        .json(&serde_json::json!({ "filterThreshold": 500 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let settings: SettingsResponse = client
        .put(format!("{}/api/settings", server.base_url))
        .json(&serde_json::json!({ "enabled": true, "saveEveryN": 1000, "filterThreshold": 2.5 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(settings.enabled);
    assert_eq!(settings.path.as_deref(), Some("XData/xd.csv"));
    assert_eq!(settings.save_every_n, Some(1000));
    assert_eq!(settings.filter_threshold, Some(2.5));

    let cleared: SettingsResponse = client
        .put(format!("{}/api/settings", server.base_url))
        .json(&serde_json::json!({ "filterThreshold": null }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cleared.filter_threshold, None);

    let stats: StatsResponse = client
        .get(format!("{}/api/stats", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats.save_every_n, 1000);
}

#[tokio::test]
async fn http_observations_are_saved_to_csv() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();
    enable_collection(&client, &server).await;

    let before: StatsResponse = client
        .get(format!("{}/api/stats", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let observation = serde_json::json!({
        "postId": format!("http-{}", before.post_count),
        "authorKey": "alice",
        "engagementScore": 0.75,
        "likes": "1.2K",
        "views": "12,345",
        "comments": 7,
        "textLength": 90,
        "hasImage": true
    });

    let accepted: AcceptResponse = client
        .post(format!("{}/api/observations", server.base_url))
        .json(&observation)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(accepted.status, "accepted");
    assert_eq!(accepted.post_count, before.post_count + 1);

    let duplicate: AcceptResponse = client
        .post(format!("{}/api/observations", server.base_url))
        .json(&observation)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(duplicate.status, "duplicate");
    assert_eq!(duplicate.post_count, before.post_count + 1);

    let anonymous = client
        .post(format!("{}/api/observations", server.base_url))
        .json(&serde_json::json!({ "authorKey": "" }))
        .send()
        .await
        .unwrap();
    assert_eq!(anonymous.status(), StatusCode::BAD_REQUEST);

    let saved: SaveResponse = client
        .post(format!("{}/api/save", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(saved.success, "save failed: {saved:?}");
    assert_eq!(saved.status, "saved");
    assert!(saved.rows.unwrap_or_default() > 0);
    assert_eq!(saved.hash.as_deref().map(str::len), Some(64));

    let response = client
        .get(format!("{}/api/csv", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/csv; charset=utf-8"
    );
    let csv = response.text().await.unwrap();
    assert!(csv.starts_with("Type,Name,Count,Average Score,Total Views"));
    assert!(csv.contains("\nUser,alice,"));
    assert!(csv.contains("\n#PERMSTER_SETTINGS:{"));

    let delivered = std::fs::read_to_string(server.export_dir.join("XData/xd.csv")).unwrap();
    assert_eq!(delivered, csv);

    let stats: StatsResponse = client
        .get(format!("{}/api/stats", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(stats.processed_ids >= 1);

    let last_error: Option<serde_json::Value> = client
        .get(format!("{}/api/last-error", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(last_error.is_none());
}

#[tokio::test]
async fn http_clear_processed_allows_recount() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();
    enable_collection(&client, &server).await;

    let observation = serde_json::json!({ "postId": "recount-1", "authorKey": "bob", "views": 10 });
    for _ in 0..2 {
        client
            .post(format!("{}/api/observations", server.base_url))
            .json(&observation)
            .send()
            .await
            .unwrap();
    }

    let response = client
        .delete(format!("{}/api/processed", server.base_url))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let stats: StatsResponse = client
        .get(format!("{}/api/stats", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats.processed_ids, 0);

    let accepted: AcceptResponse = client
        .post(format!("{}/api/observations", server.base_url))
        .json(&observation)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(accepted.status, "accepted");
}
