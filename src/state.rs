//! Shared application state handed to handlers and CLI commands.

use std::sync::Arc;

use crate::combine::PdfCombiner;
use crate::config::EngineConfig;
use crate::db::{PgRepository, Repository};
use crate::delivery::{DeliveryChannel, LoggingDeliveryChannel};
use crate::endorsement::EndorsementEngine;
use crate::error::EngineError;
use crate::identifiers::IdentifierAllocator;
use crate::package::PackageManager;
use crate::render::ComponentRenderer;
use crate::storage::{ArtifactStore, LocalArtifactStore};
use crate::templates::TemplateRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: EngineConfig,
    pub repo: Arc<dyn Repository>,
    pub store: Arc<dyn ArtifactStore>,
    pub allocator: IdentifierAllocator,
    pub registry: TemplateRegistry,
    pub packages: PackageManager,
    pub endorsements: EndorsementEngine,
}

impl AppState {
    /// Connect to Postgres, apply migrations and open the local artifact store.
    pub async fn from_config(config: EngineConfig) -> Result<Self, EngineError> {
        let database_url = config
            .require_database_url()
            .map_err(|e| EngineError::validation(e.to_string()))?;
        let repo = PgRepository::connect(database_url, config.db_max_connections).await?;
        repo.migrate().await?;

        let store = LocalArtifactStore::new(&config.storage_root, &config.storage_base_url);
        log::info!("artifact store rooted at {}", store.root().display());

        Ok(Self::with_parts(
            config,
            Arc::new(repo),
            Arc::new(store),
            Arc::new(LoggingDeliveryChannel),
        ))
    }

    /// Wire every component over the given repository, store and channel.
    pub fn with_parts(
        config: EngineConfig,
        repo: Arc<dyn Repository>,
        store: Arc<dyn ArtifactStore>,
        delivery: Arc<dyn DeliveryChannel>,
    ) -> Self {
        let allocator = IdentifierAllocator::new(repo.clone());
        let registry = TemplateRegistry::new(repo.clone(), config.template_cache_ttl);
        let renderer = ComponentRenderer::new(store.clone(), config.render_timeout);
        let combiner = PdfCombiner::new(store.clone(), config.combine_primary, config.render_timeout);
        let packages = PackageManager::new(
            repo.clone(),
            store.clone(),
            registry.clone(),
            renderer.clone(),
            combiner,
            delivery,
            config.bulk_concurrency,
        );
        let endorsements =
            EndorsementEngine::new(repo.clone(), store.clone(), allocator.clone(), renderer);

        Self {
            config,
            repo,
            store,
            allocator,
            registry,
            packages,
            endorsements,
        }
    }
}
