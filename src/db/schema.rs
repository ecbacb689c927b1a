pub const SCHEMA: &str = r#"
-- Task queue: one row per unit of asynchronous work
CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,                  -- snake_case TaskKind name
    payload TEXT NOT NULL DEFAULT '{}',  -- JSON object, keys depend on kind
    state TEXT NOT NULL DEFAULT 'pending',
    priority INTEGER NOT NULL DEFAULT 100,  -- lower runs first
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    scheduled_at TEXT,                   -- not claimable before this instant
    created_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    progress_current INTEGER,
    progress_total INTEGER,
    cancel_requested INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks(state, priority, id);
CREATE INDEX IF NOT EXISTS idx_tasks_kind ON tasks(kind, state);

-- Ingested media files
CREATE TABLE IF NOT EXISTS assets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    filename TEXT NOT NULL,
    directory TEXT NOT NULL,
    media_type TEXT NOT NULL,            -- 'image' or 'video'
    size_bytes INTEGER NOT NULL,
    sha256_hash TEXT,
    width INTEGER,
    height INTEGER,
    perceptual_hash TEXT,
    thumbnail_path TEXT,
    caption TEXT,
    caption_model TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_assets_sha256 ON assets(sha256_hash);

-- Dense vectors per (asset, modality); re-runs overwrite in place
CREATE TABLE IF NOT EXISTS embeddings (
    asset_id INTEGER NOT NULL,
    modality TEXT NOT NULL,              -- 'image' or 'video:<segment id>'
    vector BLOB NOT NULL,                -- float32 little-endian
    dim INTEGER NOT NULL,
    model_name TEXT NOT NULL,
    model_version TEXT NOT NULL,
    device TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (asset_id, modality),
    FOREIGN KEY (asset_id) REFERENCES assets(id) ON DELETE CASCADE
);

-- Person clusters
CREATE TABLE IF NOT EXISTS persons (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT,
    centroid BLOB,                       -- unit-normalized running mean, NULL while empty
    face_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Detected faces
CREATE TABLE IF NOT EXISTS faces (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    asset_id INTEGER NOT NULL,
    bbox_x INTEGER NOT NULL,
    bbox_y INTEGER NOT NULL,
    bbox_w INTEGER NOT NULL,
    bbox_h INTEGER NOT NULL,
    confidence REAL,
    embedding BLOB,                      -- attached by face_embed
    embedding_dim INTEGER,
    person_id INTEGER,                   -- attached by clustering
    created_at TEXT NOT NULL,
    FOREIGN KEY (asset_id) REFERENCES assets(id) ON DELETE CASCADE,
    FOREIGN KEY (person_id) REFERENCES persons(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_faces_asset ON faces(asset_id);
CREATE INDEX IF NOT EXISTS idx_faces_person ON faces(person_id);

-- Video segments produced by scene detection
CREATE TABLE IF NOT EXISTS video_segments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    asset_id INTEGER NOT NULL,
    segment_index INTEGER NOT NULL,
    start_ms INTEGER NOT NULL,
    end_ms INTEGER NOT NULL,
    keyframe_path TEXT,
    created_at TEXT NOT NULL,
    FOREIGN KEY (asset_id) REFERENCES assets(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_video_segments_asset ON video_segments(asset_id);
"#;
