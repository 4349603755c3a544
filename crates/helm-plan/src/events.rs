use helm_store::{ToolKind, now_millis};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub sequence_no: u64,
    pub timestamp: u64,
    pub session_id: String,
    pub kind: EngineEventKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum EngineEventKind {
    Plan(PlanEvent),
    Step(StepEvent),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanEvent {
    Started {
        request: String,
    },
    Parsed {
        step_count: usize,
    },
    Completed {
        step_count: usize,
        failure_count: usize,
    },
    Failed {
        reason: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepEvent {
    Started {
        index: usize,
        total: usize,
        tool: ToolKind,
        text: String,
    },
    Completed {
        index: usize,
        total: usize,
        task_id: Option<String>,
        success: bool,
        message: String,
    },
}

pub trait EngineEventObserver: Send + Sync {
    fn on_event(&self, event: &EngineEvent);
}

impl<F> EngineEventObserver for F
where
    F: Fn(&EngineEvent) + Send + Sync,
{
    fn on_event(&self, event: &EngineEvent) {
        self(event);
    }
}

pub type SharedEngineEventObserver = Arc<dyn EngineEventObserver>;
pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;
pub type EngineEventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

/// Where engine events go: any number of in-process observers, then an
/// optional stream.
#[derive(Clone, Default)]
pub struct EngineEventSink {
    observers: Vec<SharedEngineEventObserver>,
    stream: Option<EngineEventSender>,
}

impl EngineEventSink {
    pub fn with_observer(observer: SharedEngineEventObserver) -> Self {
        Self::default().observe(observer)
    }

    pub fn with_sender(sender: EngineEventSender) -> Self {
        Self {
            observers: Vec::new(),
            stream: Some(sender),
        }
    }

    pub fn observe(mut self, observer: SharedEngineEventObserver) -> Self {
        self.observers.push(observer);
        self
    }

    /// False when nothing would see an event, including a stream whose
    /// receiver is gone.
    pub fn is_enabled(&self) -> bool {
        !self.observers.is_empty() || self.stream.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    pub fn emit(&self, event: EngineEvent) {
        for observer in &self.observers {
            observer.on_event(&event);
        }
        if let Some(stream) = self.stream.as_ref() {
            let _ = stream.send(event);
        }
    }
}

pub fn engine_event_channel() -> (EngineEventSender, EngineEventReceiver) {
    mpsc::unbounded_channel()
}

pub(crate) fn engine_event(
    sequence_no: u64,
    session_id: &str,
    kind: EngineEventKind,
) -> EngineEvent {
    EngineEvent {
        sequence_no,
        timestamp: now_millis(),
        session_id: session_id.to_string(),
        kind,
    }
}
