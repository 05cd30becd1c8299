//! Stage adapter wiring.

use std::sync::Arc;

use crate::io::attachments::{AttachmentFetcher, CommandFetcher, UnconfiguredFetcher};
use crate::io::config::OrchestratorConfig;
use crate::io::generation::{CommandGenerator, Generator, UnconfiguredGenerator};
use crate::io::layout::OrchestratorPaths;
use crate::io::notification::{CommandNotifier, Notifier, OutboxNotifier};
use crate::io::publication::{LocalPublisher, Publisher};
use crate::io::readiness::{CommandProbe, LocalProbe, ReadinessProbe};

/// The external stages the engine drives, plus the attachment fetcher used
/// before generation.
#[derive(Clone)]
pub struct Stages {
    pub generator: Arc<dyn Generator>,
    pub publisher: Arc<dyn Publisher>,
    pub probe: Arc<dyn ReadinessProbe>,
    pub notifier: Arc<dyn Notifier>,
    pub fetcher: Arc<dyn AttachmentFetcher>,
}

impl Stages {
    /// Build adapters from config. Stages without a configured command use
    /// the local dry-run adapters rooted in `.orchestrator/`.
    pub fn from_config(paths: &OrchestratorPaths, cfg: &OrchestratorConfig) -> Self {
        let limit = cfg.output_limit_bytes;
        let generator: Arc<dyn Generator> = match &cfg.adapters.generator {
            Some(argv) => Arc::new(CommandGenerator::new(argv.clone(), limit)),
            None => Arc::new(UnconfiguredGenerator),
        };
        let probe: Arc<dyn ReadinessProbe> = match &cfg.adapters.probe {
            Some(argv) => Arc::new(CommandProbe::new(argv.clone(), limit)),
            None => Arc::new(LocalProbe::new(&paths.artifacts_dir, &cfg.pages_host)),
        };
        let notifier: Arc<dyn Notifier> = match &cfg.adapters.notifier {
            Some(argv) => Arc::new(CommandNotifier::new(argv.clone(), cfg.check_timeout(), limit)),
            None => Arc::new(OutboxNotifier::new(&paths.outbox_path)),
        };
        let fetcher: Arc<dyn AttachmentFetcher> = match &cfg.adapters.fetcher {
            Some(argv) => Arc::new(CommandFetcher::new(argv.clone(), limit)),
            None => Arc::new(UnconfiguredFetcher),
        };
        Self {
            generator,
            publisher: Arc::new(LocalPublisher::new(&paths.artifacts_dir, &cfg.owner)),
            probe,
            notifier,
            fetcher,
        }
    }
}

impl std::fmt::Debug for Stages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stages").finish_non_exhaustive()
    }
}
