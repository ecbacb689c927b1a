use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::{Config, IndexBackend};
use crate::db::embeddings::IMAGE_MODALITY;
use crate::db::{timestamp, Database};
use crate::index::SharedIndex;
use crate::metrics::Metrics;
use crate::providers::Providers;
use crate::search;

/// Everything a handler may touch, built once and shared by all workers.
pub struct AppContext {
    pub db: Arc<Database>,
    pub index: SharedIndex,
    pub providers: Providers,
    pub metrics: Arc<Metrics>,
    pub config: Config,
}

impl AppContext {
    pub fn new(db: Arc<Database>, index: SharedIndex, providers: Providers, config: Config) -> Self {
        Self {
            db,
            index,
            providers,
            metrics: Arc::new(Metrics::new()),
            config,
        }
    }

    /// Open the store and index named by the config.
    ///
    /// A flat index saved on disk is kept when it still matches the stored
    /// image embeddings; otherwise the index is rebuilt from them.
    pub fn open(config: Config) -> Result<Self> {
        let db = Database::open(&config.db_path)?;
        db.initialize().context("Failed to initialize database schema")?;

        let index = SharedIndex::from_config(&config.index)?;
        let providers = Providers::from_config(&config.providers);
        let ctx = Self::new(Arc::new(db), index, providers, config);

        if ctx.index_is_stale()? {
            let loaded = search::rebuild_index(&ctx)?;
            tracing::info!(entries = loaded, "Built vector index from stored embeddings");
        }
        Ok(ctx)
    }

    /// The index was loaded empty, holds a different number of entries than
    /// the store, or was saved before the newest embedding write. The last
    /// two happen when the process exits without saving.
    fn index_is_stale(&self) -> Result<bool> {
        let indexed = self.index.len()?;
        let stored = self.db.count_embeddings_by_modality(IMAGE_MODALITY)?;
        if indexed == 0 {
            return Ok(stored > 0);
        }
        if indexed as i64 != stored {
            tracing::warn!(indexed, stored, "Saved vector index is out of date");
            return Ok(true);
        }

        if self.config.index.backend != IndexBackend::Flat {
            return Ok(false);
        }
        let Some(latest) = self.db.latest_embedding_update(IMAGE_MODALITY)? else {
            return Ok(false);
        };
        let saved_at = std::fs::metadata(&self.config.index.path)
            .and_then(|m| m.modified())
            .map(|t| timestamp(DateTime::<Utc>::from(t)))?;
        if latest > saved_at {
            tracing::warn!(saved_at = %saved_at, latest = %latest, "Saved vector index predates newer embeddings");
            return Ok(true);
        }
        Ok(false)
    }

    /// Persist the index when the backend supports it.
    pub fn save_index(&self) -> Result<()> {
        if self.config.index.backend == IndexBackend::Flat {
            self.index.save(&self.config.index.path)?;
            tracing::info!(path = %self.config.index.path.display(), "Saved vector index");
        }
        Ok(())
    }
}
