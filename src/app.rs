use std::sync::Arc;

use axum::{Extension, Router};

use crate::dispatch::{DispatchOrchestrator, DispatchSettings, Dispatcher};
use crate::job_queue::start_dispatch_worker;
use crate::ledger::CreditLedger;
use crate::polling::{PollSettings, Poller};
use crate::pricing::PricingEngine;
use crate::provider::VideoProvider;
use crate::rate_limit::RateLimiter;
use crate::reconciler::Reconciler;
use crate::retry::RetryPolicy;
use crate::routes::api_routes;
use crate::storage::{LocalObjectStorage, ObjectStorage, OutputArchiver};
use crate::store::Store;
use crate::sweeper::{SweepSettings, Sweeper};
use crate::webhooks::WebhookIngestor;

/// Collaborators and settings the generation core is assembled from.
pub struct ServiceDeps {
    pub store: Arc<dyn Store>,
    pub provider: Arc<dyn VideoProvider>,
    pub archiver: Arc<dyn OutputArchiver>,
    pub storage: Arc<LocalObjectStorage>,
    pub limiter: Arc<dyn RateLimiter>,
    pub retry: RetryPolicy,
    pub poll: PollSettings,
    pub sweep: SweepSettings,
    pub dispatch: DispatchSettings,
    pub webhook_secret: String,
}

/// key: service-wiring -> one instance of every component
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn Store>,
    pub ledger: CreditLedger,
    pub pricing: PricingEngine,
    pub reconciler: Reconciler,
    pub poller: Poller,
    pub orchestrator: DispatchOrchestrator,
    pub ingestor: Arc<WebhookIngestor>,
    pub sweeper: Sweeper,
    pub storage: Arc<LocalObjectStorage>,
}

impl Services {
    /// Build the components and start the dispatch worker. Without a callback
    /// URL, polling is resumed for jobs the provider already holds. The
    /// sweeper is returned unstarted.
    pub fn start(deps: ServiceDeps) -> Self {
        let store = deps.store;
        let ledger = CreditLedger::new(store.clone());
        let pricing = PricingEngine::new(store.clone());
        let reconciler = Reconciler::new(store.clone(), deps.archiver, deps.retry);
        let poller = Poller::new(
            store.clone(),
            deps.provider.clone(),
            reconciler.clone(),
            deps.poll,
        );
        if deps.dispatch.callback_url.is_none() {
            let resume = poller.clone();
            tokio::spawn(async move {
                resume.resume_in_flight().await;
            });
        }
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            deps.provider.clone(),
            reconciler.clone(),
            poller.clone(),
            deps.dispatch,
        ));
        let queue = start_dispatch_worker(store.clone(), dispatcher);
        let orchestrator =
            DispatchOrchestrator::new(pricing.clone(), ledger.clone(), deps.limiter, queue);
        let ingestor = Arc::new(WebhookIngestor::new(
            store.clone(),
            reconciler.clone(),
            deps.webhook_secret,
            deps.provider.name(),
        ));
        let sweeper = Sweeper::new(store.clone(), reconciler.clone(), ledger.clone(), deps.sweep);

        Self {
            store,
            ledger,
            pricing,
            reconciler,
            poller,
            orchestrator,
            ingestor,
            sweeper,
            storage: deps.storage,
        }
    }

    pub fn router(&self) -> Router {
        let object_storage: Arc<dyn ObjectStorage> = self.storage.clone();
        api_routes()
            .layer(Extension(self.store.clone()))
            .layer(Extension(self.ledger.clone()))
            .layer(Extension(self.pricing.clone()))
            .layer(Extension(self.orchestrator.clone()))
            .layer(Extension(self.ingestor.clone()))
            .layer(Extension(object_storage))
            .layer(Extension(self.storage.clone()))
    }
}
