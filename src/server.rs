//! Top-level server accept loop: binds a listening endpoint and spawns
//! one [`dispatcher::serve_connection`] task per accepted channel.
//!
//! Replaces the teacher crate's `handle_forever`/`process_socket` pair
//! with the same shape — accept, spawn, loop — generalized to the
//! session-table/local-filesystem pairing this crate's dispatcher needs.

use std::sync::Arc;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tracing::{error, info};

use crate::dispatcher::{self, DispatchOutcome};
use crate::error::XpnResult;
use crate::localfs::LocalFs;
use crate::session::SessionTable;
use crate::transport;

/// Accepts connections on `endpoint` until a client sends `FINALIZE`.
/// Every connection gets its own [`SessionTable`]-sharing dispatcher task,
/// running concurrently with every other connection's task; the accept
/// loop itself never blocks on a connection finishing.
pub async fn run(endpoint: &str, fs: Arc<dyn LocalFs>) -> XpnResult<()> {
    let mut acceptor = transport::listen(endpoint).await?;
    let sessions = Arc::new(SessionTable::new());
    info!(endpoint, "server listening");

    let mut handlers = FuturesUnordered::new();

    loop {
        tokio::select! {
            accepted = acceptor.accept() => {
                match accepted {
                    Ok(channel) => {
                        let fs = fs.clone();
                        let sessions = sessions.clone();
                        handlers.push(tokio::spawn(async move {
                            dispatcher::serve_connection(channel, fs.as_ref(), &sessions).await
                        }));
                    }
                    Err(e) => error!(error = %e, "accept failed, continuing"),
                }
            }
            // A FINALIZE on any one connection stops the whole server, per
            // the external-interface table's description of FINALIZE as a
            // process-wide shutdown request rather than a per-channel one.
            Some(result) = handlers.next(), if !handlers.is_empty() => {
                if let Ok(Ok(DispatchOutcome::Finalized)) = result {
                    info!(endpoint, "server finalized");
                    return Ok(());
                }
            }
        }
    }
}
