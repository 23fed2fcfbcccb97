use anyhow::{Context, Result};
use tracing::info;

use crate::lifecycle::RunHandle;
use crate::tracking::{Params, StartRunOptions, TrackingClient};

/// Select the experiment and open a run in it.
pub async fn open_run<C: TrackingClient>(
    client: &C,
    experiment_name: &str,
    opts: &StartRunOptions,
) -> Result<RunHandle> {
    let experiment = client
        .set_experiment(experiment_name)
        .await
        .with_context(|| format!("selecting experiment {experiment_name:?}"))?;
    info!(name = %experiment.name, id = %experiment.id, "experiment selected");

    let info = client
        .start_run(&experiment, opts)
        .await
        .context("starting run")?;
    info!(
        run_id = %info.run_id,
        experiment_id = %info.experiment_id,
        log_system_metrics = opts.log_system_metrics,
        "run started",
    );

    Ok(RunHandle::new(info))
}

/// Log the static parameters of an open run, once.
pub async fn log_params<C: TrackingClient>(
    client: &C,
    run: &RunHandle,
    params: &Params,
) -> Result<()> {
    if params.is_empty() {
        info!("no parameters to log");
        return Ok(());
    }

    client
        .log_params(run.run_id(), params)
        .await
        .context("logging parameters")?;
    info!(count = params.len(), "parameters logged");
    Ok(())
}
