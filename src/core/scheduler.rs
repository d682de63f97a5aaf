//! Drives detector passes on load, on a fixed interval and on document
//! mutation.
//!
//! Every enabled detector gets its own task and its own trigger queue, so
//! passes of one category never overlap while categories interleave
//! freely. Each completed pass is forwarded as its own message.

use crate::config::Config;
use crate::core::aggregator::{AggregatorMessage, TargetKey};
use crate::detectors::{build_detectors, DetectionContext, Detector, DetectorError};
use crate::diagnostics::SharedDiagnosticsLog;
use crate::instrument::InstrumentationRegistry;
use crate::platform::SharedPage;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::task::JoinHandle;

/// Why a pass runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Load,
    Tick,
    Mutation,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Load => f.write_str("load"),
            Trigger::Tick => f.write_str("tick"),
            Trigger::Mutation => f.write_str("mutation"),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run one pass and wrap the outcome for the aggregator.
fn execute(
    detector: &mut dyn Detector,
    ctx: &DetectionContext,
    target: &TargetKey,
    trigger: Trigger,
) -> AggregatorMessage {
    let category = detector.category();
    tracing::debug!(target_key = %target, %category, %trigger, "running detector pass");
    let outcome = catch_unwind(AssertUnwindSafe(|| detector.run(ctx)))
        .unwrap_or_else(|payload| Err(DetectorError::Panicked(panic_message(payload))));
    match outcome {
        Ok(set) => AggregatorMessage::Findings {
            target: target.clone(),
            category,
            set,
        },
        Err(error) => AggregatorMessage::Failure {
            target: target.clone(),
            category,
            error,
        },
    }
}

/// Owns a session's attachments to the page and releases them on drop.
struct Attachment {
    ctx: DetectionContext,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.ctx.release();
    }
}

/// The detectors of one target session with the context they run against.
///
/// Dropping a session that was never started releases its observers; a
/// started session hands them to its [`SessionHandle`].
pub struct Session {
    target: TargetKey,
    attachment: Attachment,
    detectors: Vec<Box<dyn Detector>>,
}

impl Session {
    /// Create a session and install every detector's interceptors.
    pub fn new(
        target: TargetKey,
        ctx: DetectionContext,
        mut detectors: Vec<Box<dyn Detector>>,
    ) -> Self {
        for detector in detectors.iter_mut() {
            detector.install(&ctx);
        }
        tracing::info!(
            target_key = %target,
            session = %ctx.page.session_id(),
            detectors = detectors.len(),
            "detection session created"
        );
        Self {
            target,
            attachment: Attachment { ctx },
            detectors,
        }
    }

    /// Build the session `config` describes for `page`.
    pub fn from_config(
        target: TargetKey,
        page: SharedPage,
        config: &Config,
        log: SharedDiagnosticsLog,
    ) -> Result<Self, DetectorError> {
        let registry = Arc::new(InstrumentationRegistry::for_page(&page).with_diagnostics(log));
        let ctx = DetectionContext::new(page, registry, config.policy);
        let detectors = build_detectors(&config.categories, config.max_evidence_per_signal)?;
        Ok(Self::new(target, ctx, detectors))
    }

    pub fn target(&self) -> &TargetKey {
        &self.target
    }

    pub fn context(&self) -> &DetectionContext {
        &self.attachment.ctx
    }

    /// Run every detector once, in order, on the calling thread.
    pub fn run_pass(&mut self, trigger: Trigger) -> Vec<AggregatorMessage> {
        let ctx = &self.attachment.ctx;
        let target = &self.target;
        self.detectors
            .iter_mut()
            .map(|detector| execute(detector.as_mut(), ctx, target, trigger))
            .collect()
    }
}

/// Starts sessions on the current tokio runtime.
#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.poll_interval)
    }

    /// Spawn one task per detector, queue the load pass and start
    /// triggering ticks and mutations. Must be called inside a runtime.
    pub fn start(
        &self,
        session: Session,
        sink: UnboundedSender<AggregatorMessage>,
    ) -> SessionHandle {
        let Session {
            target,
            attachment,
            detectors,
        } = session;
        let ctx = attachment.ctx.clone();

        let mut triggers = Vec::with_capacity(detectors.len());
        let mut tasks = Vec::with_capacity(detectors.len() + 1);

        for mut detector in detectors {
            let (tx, mut rx) = unbounded_channel::<Trigger>();
            let _ = tx.send(Trigger::Load);
            triggers.push(tx);

            let ctx = ctx.clone();
            let target = target.clone();
            let sink = sink.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(trigger) = rx.recv().await {
                    let message = execute(detector.as_mut(), &ctx, &target, trigger);
                    if sink.send(message).is_err() {
                        break;
                    }
                }
            }));
        }

        let ticks = triggers.clone();
        let period = self.poll_interval.max(Duration::from_millis(1));
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately; the load pass covers it.
            interval.tick().await;
            loop {
                interval.tick().await;
                if !broadcast(&ticks, Trigger::Tick) {
                    break;
                }
            }
        }));

        let mutations = triggers.clone();
        ctx.observe_mutations(Arc::new(move |record| {
            if !record.added.is_empty() || !record.removed.is_empty() {
                broadcast(&mutations, Trigger::Mutation);
            }
        }));

        tracing::info!(
            target_key = %target,
            interval_ms = period.as_millis() as u64,
            "detection session started"
        );
        SessionHandle {
            target,
            attachment: Some(attachment),
            triggers,
            tasks,
        }
    }
}

/// Send `trigger` to every queue; false once all of them are closed.
fn broadcast(queues: &[UnboundedSender<Trigger>], trigger: Trigger) -> bool {
    let mut delivered = false;
    for tx in queues {
        delivered |= tx.send(trigger).is_ok();
    }
    delivered
}

/// A running session. Stopping, or dropping, aborts the detector tasks,
/// disconnects every mutation observer the session registered and detaches
/// its interceptor observers.
pub struct SessionHandle {
    target: TargetKey,
    attachment: Option<Attachment>,
    triggers: Vec<UnboundedSender<Trigger>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn target(&self) -> &TargetKey {
        &self.target
    }

    /// Queue one extra pass of every detector.
    pub fn trigger(&self, trigger: Trigger) {
        broadcast(&self.triggers, trigger);
    }

    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|t| !t.is_finished())
    }

    pub fn stop(&mut self) {
        self.triggers.clear();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        drop(self.attachment.take());
        tracing::info!(target_key = %self.target, "detection session stopped");
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.attachment.is_some() || !self.tasks.is_empty() {
            self.stop();
        }
    }
}
