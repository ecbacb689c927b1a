use anyhow::Result;
use serde_json::json;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

use darkroom::config::Config;
use darkroom::context::AppContext;
use darkroom::db::{BoundingBox, Database, DetectedFace, MediaType, NewAsset};
use darkroom::error::TaskError;
use darkroom::faces::{cluster_unassigned, recluster_all, Unsupervised};
use darkroom::index::{BruteForceIndex, SharedIndex};
use darkroom::providers::Providers;
use darkroom::tasks::handlers::PersonReclusterHandler;
use darkroom::tasks::{
    Executor, HandlerOutcome, HandlerRegistry, TaskContext, TaskHandler, TaskKind, TaskState,
};

fn context_at(db_path: &Path, config: Config) -> Arc<AppContext> {
    let db = Database::open(db_path).unwrap();
    db.initialize().unwrap();
    Arc::new(AppContext::new(
        Arc::new(db),
        SharedIndex::new(Box::new(BruteForceIndex::new())),
        Providers::placeholder(),
        config,
    ))
}

fn immediate_retries(max: u32) -> Config {
    let mut config = Config::default();
    config.retry.max_task_retries = max;
    config.retry.base_delay_ms = 0;
    config.retry.jitter = 0.0;
    config
}

fn executor_with(ctx: &Arc<AppContext>, handler: impl TaskHandler + 'static) -> Executor {
    let mut registry = HandlerRegistry::new();
    registry.register(handler);
    Executor::new(ctx.clone(), Arc::new(registry))
}

/// Fails with the given error on every run.
struct Failing {
    transient: bool,
    runs: Arc<AtomicUsize>,
}

impl TaskHandler for Failing {
    fn kind(&self) -> TaskKind {
        TaskKind::Caption
    }

    fn run(&self, _ctx: &AppContext, _task: &TaskContext) -> Result<HandlerOutcome> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.transient {
            Err(TaskError::Connection("backend refused".into()).into())
        } else {
            Err(TaskError::InvalidPayload("bad input".into()).into())
        }
    }
}

struct Panicking;

impl TaskHandler for Panicking {
    fn kind(&self) -> TaskKind {
        TaskKind::Thumb
    }

    fn run(&self, _ctx: &AppContext, _task: &TaskContext) -> Result<HandlerOutcome> {
        panic!("decoder blew up");
    }
}

#[test]
fn concurrent_workers_never_claim_the_same_task() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("queue.db");
    let seed = Database::open(&db_path).unwrap();
    seed.initialize().unwrap();
    for i in 0..200 {
        seed.enqueue(TaskKind::Phash, &json!({ "asset_id": i }), None).unwrap();
    }

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let db_path = db_path.clone();
            thread::spawn(move || {
                let db = Database::open(&db_path).unwrap();
                let mut claimed = Vec::new();
                loop {
                    match db.claim_next_task().unwrap() {
                        Some(task) => {
                            assert!(db.mark_done(task.id).unwrap());
                            claimed.push(task.id);
                        }
                        None if db.count_by_state().unwrap().pending == 0 => break,
                        None => {}
                    }
                }
                claimed
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for worker in workers {
        for id in worker.join().unwrap() {
            assert!(seen.insert(id), "task {} claimed twice", id);
        }
    }
    assert_eq!(seen.len(), 200);
    assert_eq!(seed.count_by_state().unwrap().done, 200);
}

#[test]
fn transient_failures_retry_then_dead_letter() {
    let dir = tempdir().unwrap();
    let ctx = context_at(&dir.path().join("q.db"), immediate_retries(3));
    let runs = Arc::new(AtomicUsize::new(0));
    let executor = executor_with(
        &ctx,
        Failing {
            transient: true,
            runs: runs.clone(),
        },
    );
    let id = ctx.db.enqueue(TaskKind::Caption, &json!({ "asset_id": 1 }), None).unwrap();

    let mut states = Vec::new();
    while let Some(outcome) = executor.run_once().unwrap() {
        states.push(outcome.state);
    }

    assert_eq!(
        states,
        vec![TaskState::Pending, TaskState::Pending, TaskState::Pending, TaskState::Dead]
    );
    assert_eq!(runs.load(Ordering::SeqCst), 4);

    let task = ctx.db.get_task(id).unwrap().unwrap();
    assert_eq!(task.state, TaskState::Dead);
    assert_eq!(task.retry_count, 3);
    assert!(task.last_error.unwrap().contains("backend refused"));
    assert_eq!(ctx.metrics.retries(TaskKind::Caption), 3);
}

#[test]
fn permanent_failure_goes_straight_to_dead_and_can_be_requeued() {
    let dir = tempdir().unwrap();
    let ctx = context_at(&dir.path().join("q.db"), immediate_retries(3));
    let runs = Arc::new(AtomicUsize::new(0));
    let executor = executor_with(
        &ctx,
        Failing {
            transient: false,
            runs: runs.clone(),
        },
    );
    let id = ctx.db.enqueue(TaskKind::Caption, &json!({ "asset_id": 1 }), None).unwrap();

    let outcome = executor.run_once().unwrap().unwrap();
    assert_eq!(outcome.state, TaskState::Dead);
    assert!(executor.run_once().unwrap().is_none());

    assert!(ctx.db.requeue(id).unwrap());
    let task = ctx.db.get_task(id).unwrap().unwrap();
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(task.retry_count, 0);
    assert!(task.last_error.is_none());

    assert_eq!(executor.run_once().unwrap().unwrap().task_id, id);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn panics_and_unknown_kinds_are_dead_lettered() {
    let dir = tempdir().unwrap();
    let ctx = context_at(&dir.path().join("q.db"), immediate_retries(5));
    let executor = executor_with(&ctx, Panicking);

    let panicked = ctx.db.enqueue(TaskKind::Thumb, &json!({ "asset_id": 1 }), None).unwrap();
    let orphan = ctx.db.enqueue(TaskKind::VideoEmbed, &json!({ "segment_id": 1 }), None).unwrap();
    executor.drain().unwrap();

    let task = ctx.db.get_task(panicked).unwrap().unwrap();
    assert_eq!(task.state, TaskState::Dead);
    assert!(task.last_error.unwrap().contains("decoder blew up"));

    let task = ctx.db.get_task(orphan).unwrap().unwrap();
    assert_eq!(task.state, TaskState::Dead);
    assert_eq!(task.retry_count, 0);
    assert!(task.last_error.unwrap().contains("video_embed"));
}

#[test]
fn canceling_a_pending_task_means_it_never_runs() {
    let dir = tempdir().unwrap();
    let ctx = context_at(&dir.path().join("q.db"), Config::default());
    let runs = Arc::new(AtomicUsize::new(0));
    let executor = executor_with(
        &ctx,
        Failing {
            transient: true,
            runs: runs.clone(),
        },
    );
    let id = ctx.db.enqueue(TaskKind::Caption, &json!({ "asset_id": 1 }), None).unwrap();

    assert_eq!(ctx.db.request_cancel(id).unwrap(), Some(TaskState::Canceled));
    assert!(executor.run_once().unwrap().is_none());
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

/// Requests cancellation of its own task before reclustering.
struct CancelFirst;

impl TaskHandler for CancelFirst {
    fn kind(&self) -> TaskKind {
        TaskKind::PersonRecluster
    }

    fn run(&self, ctx: &AppContext, task: &TaskContext) -> Result<HandlerOutcome> {
        ctx.db.request_cancel(task.task.id)?;
        PersonReclusterHandler.run(ctx, task)
    }
}

#[test]
fn running_recluster_stops_cooperatively_when_canceled() {
    let dir = tempdir().unwrap();
    let ctx = context_at(&dir.path().join("q.db"), Config::default());
    let asset_id = ctx
        .db
        .upsert_asset(&NewAsset {
            path: "/photos/group.jpg".into(),
            filename: "group.jpg".into(),
            directory: "/photos".into(),
            media_type: MediaType::Image,
            size_bytes: 10,
            sha256_hash: Some("abc".into()),
        })
        .unwrap()
        .id();
    let faces: Vec<DetectedFace> = (0..4)
        .map(|i| DetectedFace {
            bbox: BoundingBox { x: i * 10, y: 0, width: 10, height: 10 },
            confidence: Some(0.9),
        })
        .collect();
    for face_id in ctx.db.replace_faces(asset_id, &faces).unwrap() {
        ctx.db.set_face_embedding(face_id, &[1.0, 0.0]).unwrap();
    }

    let executor = executor_with(&ctx, CancelFirst);
    let id = ctx.db.enqueue(TaskKind::PersonRecluster, &json!({}), None).unwrap();
    let outcome = executor.run_once().unwrap().unwrap();

    assert_eq!(outcome.state, TaskState::Canceled);
    let task = ctx.db.get_task(id).unwrap().unwrap();
    assert_eq!(task.state, TaskState::Canceled);
    assert_eq!(task.progress_current, Some(0));
    assert_eq!(task.progress_total, Some(4));
    assert_eq!(ctx.db.count_unassigned_embedded_faces().unwrap(), 4);
}

/// `count` faces on one asset, face `i` pointing along axis `i % directions`.
fn seed_directional_faces(db: &Database, count: usize, directions: usize) -> i64 {
    let asset_id = db
        .upsert_asset(&NewAsset {
            path: "/photos/stadium.jpg".into(),
            filename: "stadium.jpg".into(),
            directory: "/photos".into(),
            media_type: MediaType::Image,
            size_bytes: 10,
            sha256_hash: Some("crowd".into()),
        })
        .unwrap()
        .id();
    let faces: Vec<DetectedFace> = (0..count)
        .map(|i| DetectedFace {
            bbox: BoundingBox { x: i as i32 * 10, y: 0, width: 10, height: 10 },
            confidence: Some(0.9),
        })
        .collect();
    let ids = db.replace_faces(asset_id, &faces).unwrap();
    for (i, face_id) in ids.iter().enumerate() {
        let mut embedding = vec![0.0; directions];
        embedding[i % directions] = 1.0;
        db.set_face_embedding(*face_id, &embedding).unwrap();
    }
    asset_id
}

/// Every face has a person, and every person's count matches its members.
fn assert_clusters_consistent(db: &Database, asset_id: i64, persons: usize, faces: usize) {
    assert_eq!(db.count_unassigned_embedded_faces().unwrap(), 0);

    let mut members = std::collections::HashMap::new();
    for face in db.faces_for_asset(asset_id).unwrap() {
        *members.entry(face.person_id.unwrap()).or_insert(0i64) += 1;
    }
    let with_faces: Vec<_> = db
        .list_persons()
        .unwrap()
        .into_iter()
        .filter(|p| p.face_count > 0)
        .collect();
    assert_eq!(with_faces.len(), persons);
    assert_eq!(with_faces.iter().map(|p| p.face_count).sum::<i64>(), faces as i64);
    for person in &with_faces {
        assert_eq!(members.get(&person.id).copied(), Some(person.face_count));
    }
}

#[test]
fn concurrent_incremental_passes_assign_each_face_once() {
    let dir = tempdir().unwrap();
    let db = Arc::new(Database::open(&dir.path().join("q.db")).unwrap());
    db.initialize().unwrap();
    let asset_id = seed_directional_faces(&db, 400, 8);
    let config = Config::default().clustering;

    let passes: Vec<_> = (0..2)
        .map(|_| {
            let db = db.clone();
            let config = config.clone();
            thread::spawn(move || cluster_unassigned(&db, &config).unwrap())
        })
        .collect();
    let outcomes: Vec<_> = passes.into_iter().map(|p| p.join().unwrap()).collect();

    assert_eq!(db.count_persons().unwrap(), 8);
    assert_clusters_consistent(&db, asset_id, 8, 400);
    let placed: usize = outcomes
        .iter()
        .map(|o| o.assigned + o.persons_created + o.persons_reused)
        .sum();
    assert_eq!(placed, 400);
}

#[test]
fn recluster_and_incremental_pass_do_not_interleave() {
    let dir = tempdir().unwrap();
    let db = Arc::new(Database::open(&dir.path().join("q.db")).unwrap());
    db.initialize().unwrap();
    let asset_id = seed_directional_faces(&db, 400, 8);
    let config = Config::default().clustering;

    let full = {
        let db = db.clone();
        let config = config.clone();
        thread::spawn(move || recluster_all(&db, &config, &Unsupervised).unwrap())
    };
    let incremental = {
        let db = db.clone();
        let config = config.clone();
        thread::spawn(move || cluster_unassigned(&db, &config).unwrap())
    };
    let full = full.join().unwrap();
    incremental.join().unwrap();

    assert!(!full.canceled);
    assert_eq!(db.count_persons().unwrap(), 8);
    assert_clusters_consistent(&db, asset_id, 8, 400);
}

#[test]
fn ingest_pipeline_runs_end_to_end() {
    let dir = tempdir().unwrap();
    let library = dir.path().join("library");
    std::fs::create_dir_all(library.join("2024")).unwrap();
    image::RgbImage::from_pixel(40, 30, image::Rgb([30, 60, 220]))
        .save(library.join("sea.png"))
        .unwrap();
    image::RgbImage::from_pixel(30, 40, image::Rgb([220, 30, 30]))
        .save(library.join("2024").join("poppy.png"))
        .unwrap();
    std::fs::write(library.join("notes.txt"), b"not media").unwrap();

    let mut config = Config::default();
    config.db_path = dir.path().join("darkroom.db");
    config.thumbnails.path = dir.path().join("thumbs");
    let ctx = Arc::new(AppContext::open(config).unwrap());
    let executor = Executor::new(ctx.clone(), Arc::new(HandlerRegistry::standard()));

    ctx.db
        .enqueue(TaskKind::Ingest, &json!({ "path": library.to_string_lossy() }), None)
        .unwrap();
    let processed = executor.drain().unwrap();

    // Directory walk, two file ingests, five follow-ups per image.
    assert_eq!(processed, 13);
    let counts = ctx.db.count_by_state().unwrap();
    assert_eq!((counts.done, counts.dead, counts.pending), (13, 0, 0));
    assert_eq!(ctx.db.count_assets().unwrap(), 2);
    assert_eq!(ctx.index.len().unwrap(), 2);

    let sea = ctx
        .db
        .get_asset_by_path(&library.join("sea.png").to_string_lossy())
        .unwrap()
        .unwrap();
    assert_eq!(sea.caption.as_deref(), Some("A mostly blue landscape image"));
    assert!(sea.thumbnail_path.is_some());
    assert!(sea.perceptual_hash.is_some());

    let hits = darkroom::search::search_by_text(&ctx, "red", 1).unwrap();
    assert!(hits[0].asset.path.ends_with("poppy.png"));

    let rendered = ctx.metrics.render(&ctx.db, &ctx.index).unwrap();
    assert!(rendered.contains("darkroom_tasks_processed_total{kind=\"embed\",state=\"done\"} 2\n"));
}
