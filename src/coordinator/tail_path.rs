//! Tail path: one task per origin stream.
//!
//! Resolves the resume position, then runs the [`SourceTailer`] loop until
//! shutdown. A fatal error marks only this link failed; the node and every
//! other link keep running.

use crate::config::ResumeFrom;
use crate::tailer::SourceTailer;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, Instrument};

/// Spawn the tailer task for one origin.
pub(crate) fn spawn_tailer(
    mut tailer: SourceTailer,
    resume_from: ResumeFrom,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let span = info_span!("tailer", origin_id = %tailer.origin_id());

    tokio::spawn(
        async move {
            let link = tailer.link().clone();

            if let Err(e) = tailer.start(resume_from).await {
                error!(
                    error = %e,
                    ?resume_from,
                    "Tailer could not resolve its resume position; resync this origin"
                );
                link.fail(&e);
                return;
            }

            info!(position = tailer.position(), "Tailer started");
            match tailer.run(shutdown).await {
                Ok(()) => link.stop(),
                Err(e) => link.fail(&e),
            }
        }
        .instrument(span),
    )
}
