//! Translates control requests into forwarding session operations

use chrono::Utc;
use portfwd_core::{ForwardingSession, SessionSnapshot};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use crate::error::ApiError;
use crate::models::{ClientInfo, ForwardAction, ForwardWorkParams, ServerSummary};

/// Process metadata reported next to the session status
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub rest_api_addr: String,
    pub version: String,
}

/// Entry point for every control operation the HTTP layer performs
#[derive(Clone)]
pub struct ControlPlane {
    session: Arc<ForwardingSession>,
}

impl ControlPlane {
    pub fn new(session: Arc<ForwardingSession>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<ForwardingSession> {
        &self.session
    }

    /// Work out what a `/ForwardWork` request is asking for
    pub fn parse_action(params: &ForwardWorkParams) -> Result<ForwardAction, ApiError> {
        let status = params
            .status
            .as_deref()
            .ok_or_else(|| ApiError::BadRequest("missing status parameter".to_string()))?;

        match status.trim() {
            "1" => match (params.from_addr.as_deref(), params.to_addr.as_deref()) {
                (Some(from), Some(to)) if !from.trim().is_empty() && !to.trim().is_empty() => {
                    Ok(ForwardAction::Start {
                        from_addr: from.trim().to_string(),
                        to_addr: to.trim().to_string(),
                    })
                }
                _ => Err(ApiError::BadRequest(
                    "fromAddr and toAddr are required to start forwarding".to_string(),
                )),
            },
            "0" => Ok(ForwardAction::Stop),
            other => Err(ApiError::BadRequest(format!(
                "invalid status parameter: {}",
                other
            ))),
        }
    }

    /// Replace the active rule with `from_addr -> to_addr`
    ///
    /// Returns once the listener is bound; relaying continues in the background.
    pub async fn request_start(
        &self,
        from_addr: &str,
        to_addr: &str,
    ) -> Result<SocketAddr, ApiError> {
        info!(from = %from_addr, to = %to_addr, "Start requested");
        // Start stops any running rule under the same lock before binding
        let local_addr = self.session.start(from_addr, to_addr).await?;
        Ok(local_addr)
    }

    /// Stop forwarding; always succeeds
    pub async fn request_stop(&self) -> usize {
        info!("Stop requested");
        self.session.stop().await
    }

    /// Compose the session snapshot with process metadata
    pub async fn request_status(&self, process: &ProcessInfo) -> ServerSummary {
        let snapshot = self.session.snapshot().await;
        summarize(&snapshot, process)
    }
}

fn runtime_task_count() -> usize {
    tokio::runtime::Handle::try_current()
        .map(|handle| handle.metrics().num_alive_tasks())
        .unwrap_or(0)
}

fn summarize(snapshot: &SessionSnapshot, process: &ProcessInfo) -> ServerSummary {
    let clients: Vec<ClientInfo> = snapshot
        .connections
        .iter()
        .map(|c| ClientInfo {
            id: c.id.as_u64(),
            peer_addr: c.peer_addr.to_string(),
            target_addr: c.target_addr.clone(),
            connected_at: c.connected_at,
            bytes_to_target: c.bytes_to_target,
            bytes_to_source: c.bytes_to_source,
        })
        .collect();

    let clients_list = if clients.is_empty() {
        None
    } else {
        Some(clients.iter().map(|c| c.peer_addr.clone()).collect())
    };

    ServerSummary {
        runtime_num_tasks: runtime_task_count(),
        runtime_os: std::env::consts::OS.to_string(),
        runtime_arch: std::env::consts::ARCH.to_string(),
        rest_api_addr: process.rest_api_addr.clone(),
        server_time: Utc::now(),
        clients_count: snapshot.connection_count,
        clients_list,
        forward_info: snapshot.forward_info(),
        version: process.version.clone(),
        clients,
    }
}
