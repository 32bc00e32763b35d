//! Loop body deciding which queued items enter the pipeline.

use std::sync::{Arc, Weak};

use conveyor_api::{Filter, PackageFactory};

use super::PipelineInner;
use crate::thread::LoopBody;

/// Item waiting for the filter, tagged with the generation it was queued in.
pub(crate) struct Queued<I> {
    pub(crate) generation: u64,
    pub(crate) item: I,
}

pub(crate) struct FilterBody<I: Send + 'static, T: Send + 'static> {
    pub(crate) filter: Arc<dyn Filter<I>>,
    pub(crate) factory: Arc<dyn PackageFactory<I, T>>,
    pub(crate) pipeline: Weak<PipelineInner<I, T>>,
}

impl<I: Send + 'static, T: Send + 'static> FilterBody<I, T> {
    fn dispatch(&self, generation: u64, send: Vec<T>, skip: Vec<I>) {
        match self.pipeline.upgrade() {
            Some(pipeline) => pipeline.dispatch_filtered(generation, send, skip),
            None => tracing::debug!("pipeline dropped, discarding filter results"),
        }
    }
}

impl<I: Send + 'static, T: Send + 'static> LoopBody for FilterBody<I, T> {
    type Item = Queued<I>;

    fn run_batch(&mut self, batch: Vec<Queued<I>>) {
        let mut generation = None;
        let mut send = Vec::new();
        let mut skip = Vec::new();

        for Queued { generation: tag, item } in batch {
            if generation.is_some_and(|current| current != tag) {
                let current = generation.unwrap_or(tag);
                self.dispatch(current, std::mem::take(&mut send), std::mem::take(&mut skip));
            }
            generation = Some(tag);

            let payload = if self.filter.admit(&item) {
                self.factory.build(&item)
            } else {
                None
            };
            match payload {
                Some(payload) => send.push(payload),
                None => skip.push(item),
            }
        }

        if let Some(generation) = generation {
            self.dispatch(generation, send, skip);
        }
    }

    fn name(&self) -> &str {
        "filter"
    }
}
