//! Integration tests: drive the whole controller stack the way the server
//! binary wires it (YAML config, seeded memory store, controller, dummy
//! hardware) and watch state flow back into the store.

use spalloc_bmp_core::model::{JobState, LinkFlags};
use spalloc_bmp_core::report::{LogOnlyEmailSender, StaticSerialMapper};
use spalloc_bmp_core::txrx::DummyConnector;
use spalloc_bmp_core::{BmpController, MemoryStore, Store};
use spalloc_bmp_server::settings::{seed_memory_store, ServerConfig};
use std::sync::Arc;
use std::time::Duration;

// Boards carry no addresses so the dummy runs never spawn real pings.
const CONFIG: &str = r#"
controller:
  period_ms: 50
  use_dummy_bmp: true
machines:
  - name: spin5
    bmps:
      - { cabinet: 0, frame: 0, address: "10.11.12.1" }
    boards:
      - { board_id: 100, x: 0, y: 0, z: 0, cabinet: 0, frame: 0, board_num: 3 }
      - { board_id: 101, x: 0, y: 0, z: 1, cabinet: 0, frame: 0, board_num: 4 }
serial_map:
  DUMMY-3: PHYS-3
"#;

async fn build() -> (Arc<MemoryStore>, BmpController, ServerConfig) {
    let config: ServerConfig = serde_yaml::from_str(CONFIG).unwrap();
    let store = Arc::new(MemoryStore::new());
    seed_memory_store(&store, &config).await;
    let controller = BmpController::new(
        config.controller.clone(),
        store.clone(),
        Arc::new(DummyConnector),
        Arc::new(LogOnlyEmailSender),
        Arc::new(StaticSerialMapper::new(config.serial_map.clone())),
    )
    .await
    .unwrap();
    (store, controller, config)
}

/// Full job lifecycle: allocate → power on → ready → destroy → powered off.
#[tokio::test(start_paused = true)]
async fn job_lifecycle_end_to_end() {
    let (store, controller, _) = build().await;
    store.add_job(42, JobState::Power).await;
    store.allocate(42, &[100, 101]).await;
    for board in [100, 101] {
        store
            .add_change(42, board, JobState::Queued, JobState::Ready, true, LinkFlags::ALL_ON)
            .await
            .unwrap();
    }

    // Two cycles: one takes and dispatches, the next applies outcomes.
    controller.process_requests_once().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    controller.process_requests_once().await.unwrap();

    assert_eq!(store.job_state(42).await.unwrap(), Some(JobState::Ready));
    assert!(store.board(100).await.unwrap().unwrap().power);
    assert!(store.board(101).await.unwrap().unwrap().power);

    // Tear the job down again.
    for board in [100, 101] {
        store
            .add_change(42, board, JobState::Ready, JobState::Destroyed, false, LinkFlags::ALL_ON)
            .await
            .unwrap();
    }
    controller.process_requests_once().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    controller.process_requests_once().await.unwrap();

    assert_eq!(
        store.job_state(42).await.unwrap(),
        Some(JobState::Destroyed)
    );
    let rec = store.board(100).await.unwrap().unwrap();
    assert!(!rec.power);
    assert_eq!(rec.allocated_to, None);

    controller.shutdown().await.unwrap();
}

/// The periodic scheduler does the same without manual cycles.
#[tokio::test(start_paused = true)]
async fn scheduler_ticks_drive_the_store() {
    let (store, controller, _) = build().await;
    store.add_job(7, JobState::Power).await;
    store
        .add_change(7, 100, JobState::Queued, JobState::Ready, true, LinkFlags::ALL_ON)
        .await
        .unwrap();

    controller.start();
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if store.job_state(7).await.unwrap() == Some(JobState::Ready) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("scheduler never applied the change");

    controller.shutdown().await.unwrap();
}

/// Management counters reflect queue state.
#[tokio::test(start_paused = true)]
async fn management_counters() {
    let (store, controller, _) = build().await;
    store.add_job(42, JobState::Power).await;
    store
        .add_change(42, 100, JobState::Queued, JobState::Ready, true, LinkFlags::ALL_ON)
        .await
        .unwrap();

    assert_eq!(controller.pending_request_count().await.unwrap(), 1);
    assert_eq!(controller.active_request_count().await, 0);

    controller.process_requests_once().await.unwrap();
    assert_eq!(controller.pending_request_count().await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    controller.process_requests_once().await.unwrap();
    assert_eq!(controller.active_request_count().await, 0);
    assert_eq!(store.job_state(42).await.unwrap(), Some(JobState::Ready));

    controller.shutdown().await.unwrap();
}
