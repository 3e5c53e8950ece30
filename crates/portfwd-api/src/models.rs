use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

/// Response envelope for `/ForwardWork`
///
/// `code` is 0 on success and 1 on any failure, with `msg` carrying the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ApiResponse {
    /// 0 on success, 1 on failure
    pub code: i32,
    /// Failure reason, empty on success
    pub msg: String,
}

impl ApiResponse {
    pub fn ok() -> Self {
        Self {
            code: 0,
            msg: String::new(),
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            code: 1,
            msg: msg.into(),
        }
    }
}

/// Parameters accepted by `/ForwardWork`, from the query string or a urlencoded body
#[derive(Debug, Clone, Default, Deserialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Query)]
pub struct ForwardWorkParams {
    /// Shared secret
    pub auth: Option<String>,
    /// "1" starts forwarding, "0" stops it
    pub status: Option<String>,
    /// Address to listen on (host:port), required when starting
    #[serde(rename = "fromAddr")]
    pub from_addr: Option<String>,
    /// Address to forward to (host:port), required when starting
    #[serde(rename = "toAddr")]
    pub to_addr: Option<String>,
}

impl ForwardWorkParams {
    /// Fill fields missing here from `other`
    pub fn merge(self, other: ForwardWorkParams) -> Self {
        Self {
            auth: self.auth.or(other.auth),
            status: self.status.or(other.status),
            from_addr: self.from_addr.or(other.from_addr),
            to_addr: self.to_addr.or(other.to_addr),
        }
    }
}

/// Requested action for `/ForwardWork`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardAction {
    Start { from_addr: String, to_addr: String },
    Stop,
}

/// Per-connection detail in the server summary
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ClientInfo {
    /// Connection ID
    pub id: u64,
    /// Remote address of the inbound client
    pub peer_addr: String,
    /// Target the connection is relayed to
    pub target_addr: String,
    /// When the connection was accepted
    pub connected_at: DateTime<Utc>,
    /// Bytes copied from the client to the target
    pub bytes_to_target: u64,
    /// Bytes copied from the target to the client
    pub bytes_to_source: u64,
}

/// Status snapshot served by `/ServerSummary`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServerSummary {
    /// Number of live runtime tasks
    #[serde(rename = "runtime_NumGoroutine")]
    pub runtime_num_tasks: usize,
    /// Operating system
    #[serde(rename = "runtime_GOOS")]
    pub runtime_os: String,
    /// CPU architecture
    #[serde(rename = "runtime_GOARCH")]
    pub runtime_arch: String,
    /// Address the control plane listens on
    #[serde(rename = "restApi_Addr")]
    pub rest_api_addr: String,
    /// Current server time
    #[serde(rename = "server_Time")]
    pub server_time: DateTime<Utc>,
    /// Number of live relayed connections
    #[serde(rename = "clients_Count")]
    pub clients_count: usize,
    /// Remote addresses of live connections, null when there are none
    #[serde(rename = "clients_List")]
    pub clients_list: Option<Vec<String>>,
    /// Active forwarding rule as "<from> - <to>", empty when stopped
    #[serde(rename = "forwardInfo")]
    pub forward_info: String,
    /// Service version
    pub version: String,
    /// Connection details
    pub clients: Vec<ClientInfo>,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Whether a forwarding rule is active
    pub forwarding: bool,
    /// Active connections count
    pub active_connections: usize,
}
