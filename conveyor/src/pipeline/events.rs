use std::sync::{Arc, Mutex, PoisonError, RwLock};

use conveyor_api::{Observer, PipelineEvent, PipelineSignal};
use flume::{Receiver, Sender};

/// Fans pipeline events out to observers and signal subscribers.
pub(crate) struct EventHub<I, T> {
    pipeline: String,
    observers: RwLock<Vec<Arc<dyn Observer<I, T>>>>,
    subscribers: Mutex<Vec<Sender<PipelineSignal>>>,
}

impl<I: 'static, T: 'static> EventHub<I, T> {
    pub(crate) fn new(pipeline: &str) -> Self {
        EventHub {
            pipeline: pipeline.to_string(),
            observers: RwLock::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn observe(&self, observer: Arc<dyn Observer<I, T>>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub(crate) fn subscribe(&self) -> Receiver<PipelineSignal> {
        let (tx, rx) = flume::unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: PipelineEvent<'_, I, T>) {
        let signal = PipelineSignal::from(&event);
        tracing::trace!(pipeline = %self.pipeline, ?signal, "pipeline event");

        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            observer.on_event(&event);
        }

        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        if !subscribers.is_empty() {
            // Drop subscribers whose receiver is gone.
            subscribers.retain(|tx| tx.send(signal.clone()).is_ok());
        }
    }
}
