use std::sync::Arc;

use helm_link::{CompletionSynchronizer, HttpTaskDispatcher, TaskDispatcher, TransportLink};
use helm_plan::{
    BrowserTool, ChatCompletionsCollaborator, Collaborator, DataTool, EngineEventSink, PlanEngine,
    ShellTool, TaskTracker, ToolRegistry,
};
use helm_relay::{RelayRegistry, TcpConnector};
use helm_store::{HistoryStore, MemoryHistoryStore};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::HelmConfig;

/// Everything a running `helm` process shares between its surfaces.
pub struct Services {
    pub link: TransportLink,
    pub synchronizer: CompletionSynchronizer,
    pub store: Arc<dyn HistoryStore>,
    pub engine: Arc<PlanEngine>,
    pub relays: RelayRegistry,
    background: Vec<JoinHandle<()>>,
}

impl Services {
    pub fn from_config(config: &HelmConfig, events: EngineEventSink) -> Result<Self, String> {
        let collaborator = ChatCompletionsCollaborator::new(config.collaborator_config())
            .map_err(|error| error.to_string())?;
        let dispatcher =
            HttpTaskDispatcher::new(&config.link.dispatch_url).map_err(|error| error.to_string())?;
        Ok(Self::assemble(
            config,
            Arc::new(collaborator),
            Arc::new(dispatcher),
            events,
        ))
    }

    pub fn assemble(
        config: &HelmConfig,
        collaborator: Arc<dyn Collaborator>,
        dispatcher: Arc<dyn TaskDispatcher>,
        events: EngineEventSink,
    ) -> Self {
        let link = TransportLink::new(config.link_config());
        let synchronizer = CompletionSynchronizer::new(dispatcher);
        let store: Arc<dyn HistoryStore> = Arc::new(MemoryHistoryStore::new());

        let tools = ToolRegistry::new()
            .with_tool(Arc::new(
                BrowserTool::new(synchronizer.clone())
                    .with_link(link.clone())
                    .with_completion_timeout(config.completion_timeout()),
            ))
            .with_tool(Arc::new(ShellTool::new(
                config.shell_timeout(),
                config.engine.working_dir.clone(),
            )))
            .with_tool(Arc::new(DataTool));
        let engine = PlanEngine::new(collaborator, tools, store.clone())
            .with_config(config.engine_config())
            .with_events(events);

        let relays = RelayRegistry::from_targets(
            config.relays.iter().cloned(),
            Arc::new(TcpConnector::default()),
        );

        Self {
            link,
            synchronizer,
            store,
            engine: Arc::new(engine),
            relays,
            background: Vec::new(),
        }
    }

    /// Opens the agent link and starts feeding its traffic into the
    /// synchronizer and the task tracker.
    pub fn start(&mut self) {
        info!(url = %self.link.config().url, "starting agent link");
        self.link.connect();
        self.background.push(self.synchronizer.attach(&self.link));
        self.background
            .push(TaskTracker::new(self.store.clone()).attach(&self.link));
    }

    pub fn shutdown(&mut self) {
        self.link.shutdown();
        for task in self.background.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Services {
    fn drop(&mut self) {
        self.shutdown();
    }
}
