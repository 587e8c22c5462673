use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use crate::event::{Event, Severity};
use crate::metrics_consts::{STAGE_DROPPED, STAGE_FAILED};

/// What a stage decided about one event.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Forward(Event),
    Drop,
}

/// One transformation step. Takes the event by value and hands back a new
/// one, so a stage can never alter what another stage observed.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(&self, event: Event) -> anyhow::Result<StageOutcome>;
}

struct AsyncFnStage<F, Fut> {
    name: String,
    f: F,
    _future: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> Stage for AsyncFnStage<F, Fut>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<StageOutcome>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, event: Event) -> anyhow::Result<StageOutcome> {
        (self.f)(event).await
    }
}

struct SyncFnStage<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F> Stage for SyncFnStage<F>
where
    F: Fn(Event) -> anyhow::Result<StageOutcome> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, event: Event) -> anyhow::Result<StageOutcome> {
        (self.f)(event)
    }
}

/// Wraps an async closure, e.g. one that calls out to a lookup service.
pub fn stage_fn<F, Fut>(name: &str, f: F) -> Arc<dyn Stage>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<StageOutcome>> + Send + 'static,
{
    Arc::new(AsyncFnStage {
        name: name.to_owned(),
        f,
        _future: PhantomData,
    })
}

pub fn stage_sync<F>(name: &str, f: F) -> Arc<dyn Stage>
where
    F: Fn(Event) -> anyhow::Result<StageOutcome> + Send + Sync + 'static,
{
    Arc::new(SyncFnStage {
        name: name.to_owned(),
        f,
    })
}

pub fn filter_out_type(event_type: &str) -> Arc<dyn Stage> {
    let event_type = event_type.to_owned();
    stage_sync("filter_out_type", move |event| {
        if event.event_type == event_type {
            Ok(StageOutcome::Drop)
        } else {
            Ok(StageOutcome::Forward(event))
        }
    })
}

/// Drops events below `min`. Unrecognized severities are dropped too.
pub fn filter_min_severity(min: Severity) -> Arc<dyn Stage> {
    stage_sync("filter_min_severity", move |event| {
        match event.severity_level() {
            Some(level) if level >= min => Ok(StageOutcome::Forward(event)),
            _ => Ok(StageOutcome::Drop),
        }
    })
}

pub fn add_field(key: &str, value: impl Into<Value>) -> Arc<dyn Stage> {
    let key = key.to_owned();
    let value = value.into();
    stage_sync("add_field", move |event| {
        Ok(StageOutcome::Forward(event.with_field(&key, value.clone())))
    })
}

/// Sets `key` to the processing time, RFC 3339 in UTC.
pub fn stamp_field(key: &str) -> Arc<dyn Stage> {
    let key = key.to_owned();
    stage_sync("stamp_field", move |event| {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        Ok(StageOutcome::Forward(event.with_field(&key, now)))
    })
}

/// Ordered stages folded left to right.
#[derive(Clone, Default)]
pub struct StageChain {
    pipeline: String,
    stages: Vec<Arc<dyn Stage>>,
}

impl StageChain {
    pub fn new(pipeline: &str, stages: Vec<Arc<dyn Stage>>) -> Self {
        Self {
            pipeline: pipeline.to_owned(),
            stages,
        }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stops at the first stage that drops the event; later stages never see it.
    pub async fn apply(&self, event: Event) -> anyhow::Result<StageOutcome> {
        let mut current = event;
        for stage in &self.stages {
            let outcome = stage.apply(current).await.with_context(|| {
                metrics::counter!(STAGE_FAILED, "pipeline" => self.pipeline.clone(), "stage" => stage.name().to_owned())
                    .increment(1);
                format!("stage {} failed", stage.name())
            })?;
            match outcome {
                StageOutcome::Forward(next) => current = next,
                StageOutcome::Drop => {
                    metrics::counter!(STAGE_DROPPED, "pipeline" => self.pipeline.clone(), "stage" => stage.name().to_owned())
                        .increment(1);
                    return Ok(StageOutcome::Drop);
                }
            }
        }
        Ok(StageOutcome::Forward(current))
    }
}
