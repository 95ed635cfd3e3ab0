use crate::derivative::quantize_width;
use crate::metrics::Metrics;
use crate::pipeline::{DerivativePipeline, EnsureOutcome};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};

/// Upper bound on widths accepted in one request; equals the canonical set size.
const MAX_WIDTHS_PER_JOB: usize = crate::derivative::CANONICAL_WIDTHS.len();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmupJob {
    pub slug: String,
    pub widths: Vec<u32>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WarmupQueueError {
    #[error("warmup queue is full")]
    QueueFull,
    #[error("warmup queue is closed")]
    Closed,
}

/// Body of `POST /admin/wm/{slug}/warm`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WarmRequest {
    pub widths: Option<Vec<u32>>,
}

/// Quantizes and de-duplicates requested widths, falling back to the
/// configured defaults when none are given.
pub fn plan_widths(requested: Option<&[u32]>, defaults: &[u32]) -> Vec<u32> {
    let source = match requested {
        Some(widths) if !widths.is_empty() => widths,
        _ => defaults,
    };
    let mut widths = Vec::new();
    for width in source {
        let width = quantize_width(*width as i64);
        if !widths.contains(&width) {
            widths.push(width);
        }
    }
    widths.sort_unstable();
    widths.truncate(MAX_WIDTHS_PER_JOB);
    widths
}

pub fn try_enqueue(
    sender: &mpsc::Sender<WarmupJob>,
    metrics: &Metrics,
    job: WarmupJob,
) -> Result<(), WarmupQueueError> {
    sender.try_send(job).map_err(|err| match err {
        mpsc::error::TrySendError::Full(_) => WarmupQueueError::QueueFull,
        mpsc::error::TrySendError::Closed(_) => WarmupQueueError::Closed,
    })?;
    metrics.set_warmup_queue_depth((sender.max_capacity() - sender.capacity()) as i64);
    Ok(())
}

pub fn spawn_workers(
    pipeline: DerivativePipeline,
    metrics: Arc<Metrics>,
    receiver: mpsc::Receiver<WarmupJob>,
    workers: usize,
) {
    let receiver = Arc::new(Mutex::new(receiver));
    let worker_count = workers.max(1);
    for _ in 0..worker_count {
        let pipeline = pipeline.clone();
        let metrics = metrics.clone();
        let receiver = receiver.clone();
        tokio::spawn(async move {
            loop {
                let job = {
                    let mut guard = receiver.lock().await;
                    let job = guard.recv().await;
                    metrics.set_warmup_queue_depth(guard.len() as i64);
                    job
                };
                let Some(job) = job else { break };
                run_job(&pipeline, &metrics, job).await;
            }
        });
    }
}

async fn run_job(pipeline: &DerivativePipeline, metrics: &Metrics, job: WarmupJob) {
    for width in &job.widths {
        let started = Instant::now();
        match pipeline.ensure(&job.slug, *width).await {
            Ok(outcome) => {
                let outcome = match outcome {
                    EnsureOutcome::Existing => "existing",
                    EnsureOutcome::Generated => "generated",
                };
                metrics.observe_warmup(outcome);
                info!(
                    slug = %job.slug,
                    width,
                    outcome,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "warmup derivative ready"
                );
            }
            Err(err) => {
                metrics.observe_warmup("failed");
                warn!(slug = %job.slug, width, error = ?err, "warmup derivative failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::harness;
    use std::time::Duration;

    #[test]
    fn plan_widths_quantizes_and_dedupes() {
        assert_eq!(plan_widths(Some(&[1000, 1024, 100, 9000]), &[2048]), vec![512, 1024, 4096]);
        assert_eq!(plan_widths(None, &[2048, 1024]), vec![1024, 2048]);
        assert_eq!(plan_widths(Some(&[]), &[1536]), vec![1536]);
    }

    #[test]
    fn warm_request_rejects_unknown_fields() {
        assert!(serde_json::from_str::<WarmRequest>(r#"{"widths":[512]}"#).is_ok());
        assert!(serde_json::from_str::<WarmRequest>(r#"{}"#).is_ok());
        assert!(serde_json::from_str::<WarmRequest>(r#"{"width":512}"#).is_err());
        assert!(serde_json::from_str::<WarmRequest>(r#"{"widths":["big"]}"#).is_err());
    }

    #[test]
    fn full_queue_is_reported() {
        let metrics = Metrics::new();
        let (sender, _receiver) = mpsc::channel(1);
        let job = WarmupJob {
            slug: "a".to_string(),
            widths: vec![512],
        };
        assert!(try_enqueue(&sender, &metrics, job.clone()).is_ok());
        assert_eq!(
            try_enqueue(&sender, &metrics, job),
            Err(WarmupQueueError::QueueFull)
        );
    }

    #[tokio::test]
    async fn workers_generate_requested_widths() {
        let h = harness().await;
        let (sender, receiver) = mpsc::channel(4);
        spawn_workers(h.pipeline.clone(), h.metrics.clone(), receiver, 1);
        try_enqueue(
            &sender,
            &h.metrics,
            WarmupJob {
                slug: "sample-photo".to_string(),
                widths: vec![512, 1024],
            },
        )
        .unwrap();
        try_enqueue(
            &sender,
            &h.metrics,
            WarmupJob {
                slug: "does-not-exist".to_string(),
                widths: vec![512],
            },
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            let text = h.metrics.gather().unwrap();
            if text.contains("wm_warmup_jobs_total{outcome=\"failed\"} 1") {
                break;
            }
            assert!(Instant::now() < deadline, "warmup never drained");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(h.watermarks.object("sample-photo_wm_512_v1.jpg").is_some());
        assert!(h.watermarks.object("sample-photo_wm_1024_v1.jpg").is_some());
    }
}
