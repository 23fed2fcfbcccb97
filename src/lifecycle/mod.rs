//! Run lifecycle: open, sample/emit loop, and exactly-once close.
//!
//! The controller owns the step counter and the run handle. Termination
//! arrives as a cancelled [`CancellationToken`], observed during bootstrap
//! and while the loop waits on a sample or on the inter-tick sleep. A
//! second signal during a stalled close is handled by [`signal`]. Every
//! exit path goes
//! through [`Controller::shutdown`] or the failure close, both gated by
//! [`RunHandle::mark_closed`].

pub mod signal;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bootstrap;
use crate::emitter::{RetryPolicy, StepEmitter};
use crate::sampler::{Reading, Sampler};
use crate::tracking::{Params, RunInfo, RunStatus, StartRunOptions, TrackingClient};

/// Controller lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unstarted,
    Running,
    Closing,
    Closed,
}

/// An opened tracking run with a one-way closed flag.
#[derive(Debug)]
pub struct RunHandle {
    info: RunInfo,
    closed: AtomicBool,
}

impl RunHandle {
    pub fn new(info: RunInfo) -> Self {
        Self {
            info,
            closed: AtomicBool::new(false),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.info.run_id
    }

    pub fn info(&self) -> &RunInfo {
        &self.info
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Flip the handle to closed. Returns true only for the first caller.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }
}

/// Monotonic per-run step index starting at 0.
#[derive(Debug, Default)]
pub struct StepCounter {
    next: u64,
}

impl StepCounter {
    /// Step the next tick will be emitted under.
    pub fn current(&self) -> u64 {
        self.next
    }

    pub fn advance(&mut self) {
        self.next += 1;
    }
}

/// Drives one run from bootstrap to close.
pub struct Controller<C, S> {
    client: Arc<C>,
    sampler: S,
    emitter: StepEmitter<C>,
    steps: StepCounter,
    run: Option<RunHandle>,
    state: State,
}

impl<C: TrackingClient, S: Sampler> Controller<C, S> {
    pub fn new(client: Arc<C>, sampler: S, retry: RetryPolicy) -> Self {
        let emitter = StepEmitter::new(Arc::clone(&client), retry);
        Self {
            client,
            sampler,
            emitter,
            steps: StepCounter::default(),
            run: None,
            state: State::Unstarted,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Number of ticks emitted so far, which is also the next step index.
    pub fn steps_emitted(&self) -> u64 {
        self.steps.current()
    }

    pub fn run_info(&self) -> Option<&RunInfo> {
        self.run.as_ref().map(RunHandle::info)
    }

    /// Open the run and log parameters. Unstarted → Running.
    ///
    /// If `cancel` fires before the run exists the controller goes straight
    /// to Closed and nothing is left to close. If it fires while parameters
    /// are being logged the controller stays Running, so [`Controller::run`]
    /// closes the run right away.
    pub async fn start(
        &mut self,
        experiment_name: &str,
        opts: &StartRunOptions,
        params: &Params,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.state != State::Unstarted {
            bail!("controller already started (state {:?})", self.state);
        }

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            run = bootstrap::open_run(self.client.as_ref(), experiment_name, opts) => Some(run?),
        };
        let Some(run) = opened else {
            info!("cancelled before a run was opened");
            self.state = State::Closed;
            return Ok(());
        };

        let logged = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("cancelled while logging parameters");
                Ok(())
            }
            res = bootstrap::log_params(self.client.as_ref(), &run, params) => res,
        };

        self.run = Some(run);
        self.state = State::Running;

        if let Err(e) = logged {
            self.fail(&e).await;
            return Err(e);
        }
        Ok(())
    }

    /// Sample, emit and sleep until `cancel` fires, then close the run.
    ///
    /// A sampling or emission error closes the run as failed and is
    /// returned; the loop is not retried.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        if self.state != State::Running {
            bail!("controller is not running (state {:?})", self.state);
        }

        let interval = self.sampler.interval();
        info!(
            sampler = self.sampler.name(),
            interval_ms = interval.as_millis() as u64,
            "sampling loop started",
        );

        loop {
            let sampled = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("cancelled while sampling");
                    break;
                }
                readings = self.sampler.sample() => readings,
            };

            if let Err(e) = self.tick(sampled).await {
                self.fail(&e).await;
                return Err(e);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("cancelled while sleeping");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }

        self.shutdown().await
    }

    async fn tick(&mut self, sampled: Result<Vec<Reading>>) -> Result<()> {
        let step = self.steps.current();
        let readings = sampled.with_context(|| format!("sampling step {step}"))?;

        let run = self.run.as_ref().context("no open run")?;
        self.emitter.emit(run.run_id(), &readings, step).await?;
        self.steps.advance();
        Ok(())
    }

    /// Close the run as failed after `err`. A close error is only logged.
    async fn fail(&mut self, err: &anyhow::Error) {
        error!(error = %format!("{err:#}"), step = self.steps.current(), "run failed");
        if let Err(close_err) = self.close(RunStatus::Failed).await {
            warn!(error = %format!("{close_err:#}"), "failed to close run after failure");
        }
    }

    /// Close the run as finished. Running → Closing → Closed.
    ///
    /// Calling this again, or after the run was already closed, does nothing.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.close(RunStatus::Finished).await
    }

    async fn close(&mut self, status: RunStatus) -> Result<()> {
        let Some(run) = &self.run else {
            self.state = State::Closed;
            return Ok(());
        };

        if !run.mark_closed() {
            debug!(run_id = run.run_id(), "run already closed");
            self.state = State::Closed;
            return Ok(());
        }

        self.state = State::Closing;
        info!(
            run_id = run.run_id(),
            %status,
            steps = self.steps.current(),
            "closing run",
        );

        let result = self
            .client
            .end_run(run.run_id(), status)
            .await
            .with_context(|| format!("closing run {}", run.run_id()));

        self.state = State::Closed;
        result
    }
}

/// Open a run, sample until `cancel` fires, and close the run.
pub async fn monitor<C: TrackingClient, S: Sampler>(
    client: Arc<C>,
    sampler: S,
    retry: RetryPolicy,
    experiment_name: &str,
    opts: &StartRunOptions,
    params: &Params,
    cancel: CancellationToken,
) -> Result<()> {
    let mut controller = Controller::new(client, sampler, retry);
    controller.start(experiment_name, opts, params, &cancel).await?;
    if controller.state() == State::Closed {
        return Ok(());
    }
    controller.run(cancel).await?;

    info!(steps = controller.steps_emitted(), "run closed");
    Ok(())
}
