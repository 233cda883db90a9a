// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Apply path: the node's single Applier task, and GOL retention.
//!
//! # Retention
//!
//! The retention task periodically reclaims GOL records every registered
//! destination has confirmed. It also trims the node's own local operation
//! stream through the local Tailer's cursor, since those operations are
//! already durable in the GOL.

use crate::applier::GlobalApplier;
use crate::config::ResumeFrom;
use crate::cursor::CursorStore;
use crate::log::GlobalLog;
use crate::store::DocumentStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Spawn the Applier task for this node's destination.
pub(crate) fn spawn_applier(
    mut applier: GlobalApplier,
    resume_from: ResumeFrom,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let span = info_span!("applier", destination_id = %applier.destination_id());

    tokio::spawn(
        async move {
            let link = applier.link().clone();

            if let Err(e) = applier.start(resume_from).await {
                error!(
                    error = %e,
                    ?resume_from,
                    "Applier could not resolve its checkpoint; resync this destination"
                );
                link.fail(&e);
                return;
            }

            info!(position = applier.position(), "Applier started");
            match applier.run(shutdown).await {
                Ok(()) => link.stop(),
                Err(e) => link.fail(&e),
            }
        }
        .instrument(span),
    )
}

/// Spawn the periodic retention task.
pub(crate) fn spawn_retention(
    log: Arc<GlobalLog>,
    store: Arc<DocumentStore>,
    cursors: Arc<CursorStore>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let span = info_span!("retention", origin_id = %store.origin_id());

    tokio::spawn(
        async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_ms = interval.as_millis() as u64, "Retention task started");

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        reclaim_once(&log, &store, &cursors).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Retention task stopping");
                            break;
                        }
                    }
                }
            }

            info!("Retention task stopped");
        }
        .instrument(span),
    )
}

async fn reclaim_once(log: &GlobalLog, store: &DocumentStore, cursors: &CursorStore) {
    if let Err(e) = log.reclaim().await {
        warn!(error = %e, "Global log reclaim failed");
    }

    let Some(tailed) = cursors.get(store.origin_id()).await else {
        return;
    };
    match store.trim_local_oplog(tailed).await {
        Ok(0) => {}
        Ok(trimmed) => debug!(through = tailed, trimmed, "Trimmed local operation stream"),
        Err(e) => warn!(error = %e, "Local operation stream trim failed"),
    }
}
