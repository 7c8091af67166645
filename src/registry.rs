// src/registry.rs
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::context::JobContext;
use crate::job::{Job, JobType};

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;
pub type HandlerFn = Arc<dyn Fn(JobContext, Job) -> HandlerFuture + Send + Sync>;

/// Job type → handler. Registering a type twice keeps the last handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, HandlerFn>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, job_type: impl Into<JobType>, handler: F)
    where
        F: Fn(JobContext, Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: HandlerFn = Arc::new(move |ctx, job| handler(ctx, job).boxed());
        self.handlers.insert(job_type.into(), handler);
    }

    pub fn get(&self, job_type: &JobType) -> Option<HandlerFn> {
        self.handlers.get(job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
