//! IPHB wire frames
//!
//! Fixed-size request/response structs over a Unix-domain stream
//! socket. Encoded/decoded by hand with explicit little-endian byte
//! layouts rather than deriving `serde` + a binary codec crate, to
//! match the wire shape of the original C structs byte for byte.

use crate::error::{DsmeError, DsmeResult};

pub const CMD_WAIT: u32 = 1;
pub const CMD_STAT: u32 = 2;

/// `_iphb_req_t`: 4-byte command, followed by a WAIT payload when
/// `command == CMD_WAIT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IphbRequest {
    Wait { mintime: u16, maxtime: u16, pid: u32, wakeup: bool },
    Stat,
}

pub const WAIT_FRAME_LEN: usize = 4 + 2 + 2 + 4 + 1;
pub const STAT_FRAME_LEN: usize = 4;

impl IphbRequest {
    pub fn decode(buf: &[u8]) -> DsmeResult<Self> {
        if buf.len() < STAT_FRAME_LEN {
            return Err(DsmeError::ClientProtocol("frame too short".to_string()));
        }
        let command = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        match command {
            CMD_WAIT => {
                if buf.len() < WAIT_FRAME_LEN {
                    return Err(DsmeError::ClientProtocol("truncated WAIT frame".to_string()));
                }
                let mintime = u16::from_le_bytes(buf[4..6].try_into().unwrap());
                let maxtime = u16::from_le_bytes(buf[6..8].try_into().unwrap());
                let pid = u32::from_le_bytes(buf[8..12].try_into().unwrap());
                let wakeup = buf[12] != 0;
                Ok(IphbRequest::Wait { mintime, maxtime, pid, wakeup })
            }
            CMD_STAT => Ok(IphbRequest::Stat),
            other => Err(DsmeError::ClientProtocol(format!("unknown command {other}"))),
        }
    }
}

/// `_iphb_wait_resp_t { waited: u32 }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IphbWaitResponse {
    pub waited_secs: u32,
}

impl IphbWaitResponse {
    pub fn encode(self) -> [u8; 4] {
        self.waited_secs.to_le_bytes()
    }
}

/// `iphb_stats { clients, waiting, next_hb }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IphbStats {
    pub clients: u32,
    pub waiting: u32,
    pub next_hb_secs: u32,
}

impl IphbStats {
    pub fn encode(self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[0..4].copy_from_slice(&self.clients.to_le_bytes());
        out[4..8].copy_from_slice(&self.waiting.to_le_bytes());
        out[8..12].copy_from_slice(&self.next_hb_secs.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_wait_frame() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&CMD_WAIT.to_le_bytes());
        buf.extend_from_slice(&5u16.to_le_bytes());
        buf.extend_from_slice(&60u16.to_le_bytes());
        buf.extend_from_slice(&1234u32.to_le_bytes());
        buf.push(1);

        let req = IphbRequest::decode(&buf).unwrap();
        assert_eq!(req, IphbRequest::Wait { mintime: 5, maxtime: 60, pid: 1234, wakeup: true });
    }

    #[test]
    fn decodes_stat_frame() {
        let buf = CMD_STAT.to_le_bytes();
        assert_eq!(IphbRequest::decode(&buf).unwrap(), IphbRequest::Stat);
    }

    #[test]
    fn rejects_truncated_wait_frame() {
        let buf = CMD_WAIT.to_le_bytes();
        assert!(IphbRequest::decode(&buf).is_err());
    }

    #[test]
    fn rejects_unknown_command() {
        let buf = 99u32.to_le_bytes();
        assert!(IphbRequest::decode(&buf).is_err());
    }
}
