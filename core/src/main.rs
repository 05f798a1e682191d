use anyhow::Result;
use magpie::{
  assets::asset_jobs::setup_asset_jobs,
  context::ApplicationContext,
  crawler::crawler_jobs::setup_crawler_jobs,
  enrichment::{enrichment_jobs::setup_enrichment_jobs, video_jobs::setup_video_jobs},
  hooks::{rule_engine::setup_rule_engine_jobs, webhook_jobs::setup_webhook_jobs},
  import::import_controller::ImportController,
  search::search_jobs::setup_search_jobs,
  settings::Settings,
  telemetry::Telemetry,
};
use mimalloc::MiMalloc;
use std::{sync::Arc, time::Duration};
use tokio::{spawn, time::sleep};
use tracing::{error, info};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const LEASE_RECOVERY_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(12);

fn spawn_lease_recovery(app_context: &Arc<ApplicationContext>) {
  let app_context = Arc::clone(app_context);
  spawn(async move {
    loop {
      match app_context.queue_repository.recover_expired_leases().await {
        Ok(recovered) if recovered > 0 => {
          info!(count = recovered, "Recovered jobs with expired leases");
        }
        Ok(_) => {}
        Err(e) => {
          error!(message = e.to_string(), "Lease recovery failed");
        }
      }
      tokio::select! {
        _ = sleep(LEASE_RECOVERY_INTERVAL) => {}
        _ = app_context.shutdown.cancelled() => return,
      }
    }
  });
}

#[tokio::main]
async fn main() -> Result<()> {
  dotenv::dotenv().ok();
  let settings = Arc::new(Settings::new()?);
  let telemetry = Telemetry::init(&settings.tracing)?;

  let app_context = ApplicationContext::init_with(Arc::clone(&settings)).await?;
  info!("Application context initialized");

  // Jobs orphaned by a previous crash become dispatchable before workers
  // start polling.
  app_context.queue_repository.recover_expired_leases().await?;
  spawn_lease_recovery(&app_context);

  let shutdown = app_context.shutdown.clone();
  setup_crawler_jobs(&app_context, &shutdown)?;
  setup_enrichment_jobs(&app_context, &shutdown)?;
  setup_search_jobs(&app_context, &shutdown)?;
  setup_video_jobs(&app_context, &shutdown)?;
  setup_webhook_jobs(&app_context, &shutdown)?;
  setup_rule_engine_jobs(&app_context, &shutdown)?;
  setup_asset_jobs(&app_context, &shutdown)?;

  Arc::clone(&app_context.browser).spawn_reaper();
  ImportController::new(Arc::clone(&app_context)).spawn(shutdown.clone());
  info!("Workers started");

  tokio::signal::ctrl_c().await?;
  info!("Shutdown signal received, draining workers");
  shutdown.cancel();
  sleep(SHUTDOWN_GRACE).await;
  app_context.browser.shutdown_shared().await;
  telemetry.shutdown()?;
  Ok(())
}
