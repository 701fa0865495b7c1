//! Lifeguard client wire protocol.
//!
//! Unlike IPHB's byte-exact frame layout, the lifeguard socket's wire
//! format is unspecified beyond its request/response field lists, so
//! newline-delimited JSON is used here, consistent with the
//! `serde_json` usage already in the API surface.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifeguardRequest {
    ProcessStart {
        command: String,
        action: String,
        uid: u32,
        gid: u32,
        nice: i32,
        restart_limit: u32,
        restart_period_secs: u64,
    },
    ProcessStop {
        command: String,
        signal: i32,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifeguardResponse {
    StartStatus { pid: Option<i32>, status: i32 },
    StopStatus { killed: bool, info: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_process_start_request() {
        let line = r#"{"kind":"process_start","command":"/usr/bin/foo","action":"RESPAWN","uid":0,"gid":0,"nice":0,"restart_limit":3,"restart_period_secs":10}"#;
        let req: LifeguardRequest = serde_json::from_str(line).unwrap();
        assert!(matches!(req, LifeguardRequest::ProcessStart { restart_limit: 3, .. }));
    }

    #[test]
    fn encodes_start_status_response() {
        let resp = LifeguardResponse::StartStatus { pid: Some(42), status: 0 };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"pid\":42"));
    }
}
