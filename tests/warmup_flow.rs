//! End-to-end runs: queue database, worker loop and a mock origin.

use std::sync::Arc;
use std::time::Duration;

use pagewarm::{
    DatabaseQueue, NewJob, PreconfiguredCredentialsProvider, Throttle, Worker, WorkerSettings,
};
use wiremock::matchers::{body_string_contains, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

const LOGIN_PAGE: &str = r#"
    <form action="/customer/account/loginPost/" method="post">
        <input name="form_key" type="hidden" value="f0rmk3y" />
    </form>
"#;

async fn mock_login_form(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/customer/account/login/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Set-Cookie", "PHPSESSID=visitor-1; Max-Age=3600; Path=/")
                .set_body_string(LOGIN_PAGE),
        )
        .mount(server)
        .await;
}

fn settings(dir: &tempfile::TempDir) -> WorkerSettings {
    WorkerSettings {
        min_runtime: Duration::ZERO,
        session_storage_dir: Some(dir.path().join("sessions")),
        // An emergency pause on the deliberate-failure cases would stall
        // the test for tens of seconds.
        throttle: Throttle::Off,
        ..Default::default()
    }
}

fn worker(queue: Arc<DatabaseQueue>) -> Worker {
    Worker::new(
        queue,
        Arc::new(PreconfiguredCredentialsProvider::new("hunter2", "acme")),
    )
}

async fn enqueue(queue: &DatabaseQueue, server: &MockServer, count: i64, group: Option<&str>) {
    let entries = (1..=count)
        .map(|id| NewJob {
            url: format!("{}/p/{id}", server.uri()),
            entity_id: id,
            entity_type: "product".to_string(),
            customer_group: group.map(str::to_string),
            priority: 0,
        })
        .collect();
    queue.push(entries).await.unwrap();
}

#[tokio::test]
async fn completed_jobs_are_removed_from_the_queue() {
    let server = MockServer::start().await;
    mock_login_form(&server).await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/p/\d+$"))
        .respond_with(ResponseTemplate::new(204).insert_header("X-Magento-Cache-Debug", "MISS"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(DatabaseQueue::open(&dir.path().join("queue.db")).unwrap());
    enqueue(&queue, &server, 15, None).await;

    let stats = worker(queue.clone()).run(&settings(&dir)).await.unwrap();

    assert_eq!(stats.total(), 15);
    assert_eq!(stats.completed(), 15);
    assert_eq!(stats.failed(), 0);
    assert!(queue.is_empty().await.unwrap());
}

#[tokio::test]
async fn customer_group_jobs_log_in_and_reuse_the_session() {
    let server = MockServer::start().await;
    mock_login_form(&server).await;

    // A successful login redirects to the account page and hands out the
    // variant cookie on the way.
    Mock::given(method("POST"))
        .and(path("/customer/account/loginPost/"))
        .and(body_string_contains("form_key=f0rmk3y"))
        .and(body_string_contains("login%5Bpassword%5D=hunter2"))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("Set-Cookie", "X-Magento-Vary=variant-a; Max-Age=3600; Path=/")
                .insert_header("Location", "/customer/account/"),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/customer/account/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/p/\d+$"))
        .respond_with(ResponseTemplate::new(204).insert_header("X-Magento-Cache-Debug", "MISS"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(DatabaseQueue::open(&dir.path().join("queue.db")).unwrap());
    enqueue(&queue, &server, 5, Some("wholesale")).await;

    let stats = worker(queue.clone()).run(&settings(&dir)).await.unwrap();

    assert_eq!(stats.completed(), 5);
    assert!(queue.is_empty().await.unwrap());

    // One login for five jobs, and the session survives on disk.
    let host = url::Url::parse(&server.uri()).unwrap();
    let session_file = dir.path().join("sessions").join(format!(
        "{}:{}-cg-wholesale.json",
        host.host_str().unwrap(),
        host.port().unwrap()
    ));
    assert!(session_file.exists());
}

#[tokio::test]
async fn failed_jobs_stay_queued_for_a_later_lease() {
    let server = MockServer::start().await;
    mock_login_form(&server).await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/p/\d+$"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(DatabaseQueue::open(&dir.path().join("queue.db")).unwrap());
    enqueue(&queue, &server, 4, None).await;

    let stats = worker(queue.clone()).run(&settings(&dir)).await.unwrap();

    assert_eq!(stats.failed(), 4);
    assert_eq!(queue.len().await.unwrap(), 4);
}

#[tokio::test]
async fn login_rejection_aborts_the_run_and_keeps_the_queue() {
    let server = MockServer::start().await;
    mock_login_form(&server).await;

    // The origin accepts the POST but never hands out the variant
    // cookie: credentials were wrong.
    Mock::given(method("POST"))
        .and(path("/customer/account/loginPost/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(DatabaseQueue::open(&dir.path().join("queue.db")).unwrap());
    enqueue(&queue, &server, 3, Some("wholesale")).await;

    let result = worker(queue.clone()).run(&settings(&dir)).await;

    assert!(result.is_err());
    assert_eq!(queue.len().await.unwrap(), 3);
}
