//! Demo business logic: heartbeat, register and login.
//!
//! Bodies are fixed-layout structs in network byte order. Register and
//! login answer with the structure they received (after sanitizing it),
//! which is enough for clients to test the full round trip.

use crate::runtime::dispatch::{Dispatcher, Request};
use bytes::{Buf, BufMut, BytesMut};
use std::time::Instant;
use tracing::{debug, warn};

pub const CMD_PING: u16 = 0;
pub const CMD_REGISTER: u16 = 5;
pub const CMD_LOGIN: u16 = 6;

/// Size of the dispatch table; codes 1 to 4 are reserved.
pub const CMD_TABLE_SIZE: usize = 7;

const USERNAME_LEN: usize = 56;
const PASSWORD_LEN: usize = 40;

/// Register request: `u32 kind`, `[u8; 56] username`, `[u8; 40] password`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBody {
    pub kind: u32,
    pub username: [u8; USERNAME_LEN],
    pub password: [u8; PASSWORD_LEN],
}

impl RegisterBody {
    pub const LEN: usize = 4 + USERNAME_LEN + PASSWORD_LEN;

    /// Parse a body of exactly [`Self::LEN`] bytes. Strings are forced to end in NUL.
    pub fn parse(mut body: &[u8]) -> Option<Self> {
        if body.len() != Self::LEN {
            return None;
        }
        let kind = body.get_u32();
        let mut username = [0u8; USERNAME_LEN];
        body.copy_to_slice(&mut username);
        let mut password = [0u8; PASSWORD_LEN];
        body.copy_to_slice(&mut password);

        username[USERNAME_LEN - 1] = 0;
        password[PASSWORD_LEN - 1] = 0;
        Some(Self {
            kind,
            username,
            password,
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(Self::LEN);
        out.put_u32(self.kind);
        out.put_slice(&self.username);
        out.put_slice(&self.password);
        out
    }

    /// Username up to its first NUL.
    pub fn username(&self) -> String {
        let end = self.username.iter().position(|&b| b == 0).unwrap_or(USERNAME_LEN);
        String::from_utf8_lossy(&self.username[..end]).into_owned()
    }
}

/// Login request: `u32 account`, `u64 secret`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginBody {
    pub account: u32,
    pub secret: u64,
}

impl LoginBody {
    pub const LEN: usize = 12;

    pub fn parse(mut body: &[u8]) -> Option<Self> {
        if body.len() != Self::LEN {
            return None;
        }
        Some(Self {
            account: body.get_u32(),
            secret: body.get_u64(),
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(Self::LEN);
        out.put_u32(self.account);
        out.put_u64(self.secret);
        out
    }
}

/// Dispatch table with the demo handlers installed.
pub fn dispatcher() -> Dispatcher {
    let mut dispatcher = Dispatcher::with_size(CMD_TABLE_SIZE);
    dispatcher
        .register(CMD_PING, handle_ping)
        .register(CMD_REGISTER, handle_register)
        .register(CMD_LOGIN, handle_login);
    dispatcher
}

/// Heartbeat: refresh the idle timer and answer with an empty packet.
fn handle_ping(req: &Request<'_>) -> bool {
    if req.body().is_some() {
        warn!(conn_id = req.target().index, "Heartbeat with a body, ignoring");
        return false;
    }

    let mut session = req.conn().session.lock();
    session.last_ping = Instant::now();
    req.reply_empty(CMD_PING);
    true
}

fn handle_register(req: &Request<'_>) -> bool {
    let body = match req.body().and_then(RegisterBody::parse) {
        Some(body) => body,
        None => {
            warn!(conn_id = req.target().index, "Malformed register request");
            return false;
        }
    };

    let _session = req.conn().session.lock();
    debug!(conn_id = req.target().index, user = %body.username(), kind = body.kind, "Register");
    req.reply(CMD_REGISTER, &body.encode());
    true
}

fn handle_login(req: &Request<'_>) -> bool {
    let body = match req.body().and_then(LoginBody::parse) {
        Some(body) => body,
        None => {
            warn!(conn_id = req.target().index, "Malformed login request");
            return false;
        }
    };

    let _session = req.conn().session.lock();
    debug!(conn_id = req.target().index, account = body.account, "Login");
    req.reply(CMD_LOGIN, &body.encode());
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_forces_nul_termination() {
        let mut raw = vec![0u8; RegisterBody::LEN];
        raw[..4].copy_from_slice(&3u32.to_be_bytes());
        raw[4..4 + USERNAME_LEN].fill(b'a');
        raw[4 + USERNAME_LEN..].fill(b'b');

        let body = RegisterBody::parse(&raw).unwrap();
        assert_eq!(body.kind, 3);
        assert_eq!(body.username[USERNAME_LEN - 1], 0);
        assert_eq!(body.password[PASSWORD_LEN - 1], 0);
        assert_eq!(body.username(), "a".repeat(USERNAME_LEN - 1));
        assert_eq!(body.encode().len(), RegisterBody::LEN);
    }

    #[test]
    fn test_wrong_body_sizes_rejected() {
        assert!(RegisterBody::parse(&[0u8; 99]).is_none());
        assert!(LoginBody::parse(&[0u8; 11]).is_none());
        assert!(LoginBody::parse(&[0u8; 13]).is_none());
    }

    #[test]
    fn test_login_layout() {
        let body = LoginBody {
            account: 0x0102_0304,
            secret: 5,
        };
        let encoded = body.encode();
        assert_eq!(&encoded[..4], &[1, 2, 3, 4]);
        assert_eq!(LoginBody::parse(&encoded), Some(body));
    }

    #[test]
    fn test_dispatcher_slots() {
        let dispatcher = dispatcher();
        assert_eq!(dispatcher.len(), CMD_TABLE_SIZE);
        assert!(dispatcher.get(CMD_PING).is_some());
        assert!(dispatcher.get(CMD_REGISTER).is_some());
        assert!(dispatcher.get(CMD_LOGIN).is_some());
        for reserved in 1..=4 {
            assert!(dispatcher.get(reserved).is_none());
        }
    }
}
