//! Draft persistence against a local axum backend.

use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use cube_cli::config::PersistenceConfig;
use cube_cli::persistence::HttpPersistence;
use cube_protocol::DraftRecord;
use cube_runtime::{DispatchError, Persistence};
use tokio::net::TcpListener;

type Drafts = Arc<Mutex<Vec<DraftRecord>>>;

async fn save(State(drafts): State<Drafts>, Json(record): Json<DraftRecord>) -> StatusCode {
	drafts.lock().unwrap().push(record);
	StatusCode::OK
}

async fn backend(router: Router) -> String {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		axum::serve(listener, router).await.unwrap();
	});
	format!("http://{addr}")
}

fn record() -> DraftRecord {
	DraftRecord {
		user_id: "u1".to_string(),
		ai_name: "DeepSeek".to_string(),
		draft_content: "hello".to_string(),
		share_url: "https://share.example/s1".to_string(),
		share_img_url: String::new(),
		task_id: Some("t1".to_string()),
	}
}

#[tokio::test]
async fn drafts_are_posted_to_save_endpoint() {
	let drafts = Drafts::default();
	let url = backend(Router::new().route("/saveDraftContent", post(save)).with_state(Arc::clone(&drafts))).await;

	let persistence = HttpPersistence::new(&PersistenceConfig { url, timeout_ms: 5_000 }).unwrap();
	persistence.save_draft(record()).await.unwrap();

	let saved = drafts.lock().unwrap().clone();
	assert_eq!(saved, vec![record()]);
}

#[tokio::test]
async fn server_errors_surface_as_persistence_failures() {
	let url = backend(Router::new().route("/saveDraftContent", post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "db down") }))).await;

	let persistence = HttpPersistence::new(&PersistenceConfig { url, timeout_ms: 5_000 }).unwrap();
	let err = persistence.save_draft(record()).await.unwrap_err();
	assert!(matches!(err, DispatchError::Persistence(ref message) if message.contains("500") && message.contains("db down")));
}
