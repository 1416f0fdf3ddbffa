//! Deterministic engine for state machine tests.
//!
//! Records are `[kind][len_hi][len_lo][payload]`. One record per call, and
//! an incomplete record consumes nothing, so callers must preserve partial
//! input across reads. The server runs one delegated task per handshake.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::{
    CryptoEngine, DelegatedTask, EngineError, EngineFactory, EngineResult, EngineStatus,
    HandshakeStatus, Role,
};
use crate::buffer::NetBuffer;

const HELLO: u8 = 1;
const ACK: u8 = 2;
const DATA: u8 = 3;
const CLOSE: u8 = 4;

pub(crate) const HEADER: usize = 3;
pub(crate) const MAX_PAYLOAD: usize = 64;
const MASK: u8 = 0x5a;

#[derive(Debug, Default)]
pub(crate) struct ScriptStats {
    pub engines: AtomicUsize,
    pub tasks_run: AtomicUsize,
    pub close_notify_wraps: AtomicUsize,
    pub close_outbound_calls: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    SendHello,
    AwaitHello,
    RunTask,
    AwaitAck,
    Established,
}

pub(crate) struct ScriptedEngine {
    role: Role,
    phase: Phase,
    stats: Arc<ScriptStats>,
    task_done: Arc<AtomicBool>,
    task_handed_out: bool,
    packet_size: Arc<AtomicUsize>,
    app_size: Arc<AtomicUsize>,
    outbound_closed: bool,
    outbound_done: bool,
}

impl ScriptedEngine {
    fn result(&self, status: EngineStatus, hs: Option<HandshakeStatus>, consumed: usize, produced: usize) -> EngineResult {
        EngineResult {
            status,
            handshake_status: hs.unwrap_or_else(|| self.handshake_status()),
            bytes_consumed: consumed,
            bytes_produced: produced,
        }
    }

    fn put_record(dst: &mut NetBuffer, kind: u8, payload: &[u8]) -> bool {
        if dst.remaining() < HEADER + payload.len() {
            return false;
        }
        let len = payload.len() as u16;
        dst.put_slice(&[kind, (len >> 8) as u8, len as u8]);
        let masked: Vec<u8> = payload.iter().map(|b| b ^ MASK).collect();
        dst.put_slice(&masked);
        true
    }
}

impl CryptoEngine for ScriptedEngine {
    fn role(&self) -> Role {
        self.role
    }

    fn begin_handshake(&mut self) -> Result<(), EngineError> {
        self.phase = match self.role {
            Role::Client => Phase::SendHello,
            Role::Server => Phase::AwaitHello,
        };
        Ok(())
    }

    fn wrap(&mut self, src: &mut NetBuffer, dst: &mut NetBuffer) -> Result<EngineResult, EngineError> {
        if self.outbound_done {
            return Ok(self.result(EngineStatus::Closed, None, 0, 0));
        }
        if self.outbound_closed {
            if !Self::put_record(dst, CLOSE, &[]) {
                return Ok(self.result(EngineStatus::BufferOverflow, None, 0, 0));
            }
            self.outbound_done = true;
            self.stats.close_notify_wraps.fetch_add(1, Ordering::SeqCst);
            return Ok(self.result(EngineStatus::Closed, None, 0, HEADER));
        }

        match self.phase {
            Phase::SendHello => {
                if !Self::put_record(dst, HELLO, &[]) {
                    return Ok(self.result(EngineStatus::BufferOverflow, None, 0, 0));
                }
                self.phase = Phase::AwaitAck;
                Ok(self.result(EngineStatus::Ok, None, 0, HEADER))
            }
            Phase::RunTask if self.task_done.load(Ordering::SeqCst) => {
                if !Self::put_record(dst, ACK, &[]) {
                    return Ok(self.result(EngineStatus::BufferOverflow, None, 0, 0));
                }
                self.phase = Phase::Established;
                Ok(self.result(EngineStatus::Ok, Some(HandshakeStatus::Finished), 0, HEADER))
            }
            Phase::Established if src.has_remaining() => {
                let n = src.remaining().min(MAX_PAYLOAD);
                let payload = src.chunk()[..n].to_vec();
                if !Self::put_record(dst, DATA, &payload) {
                    return Ok(self.result(EngineStatus::BufferOverflow, None, 0, 0));
                }
                src.advance(n);
                Ok(self.result(EngineStatus::Ok, None, n, HEADER + n))
            }
            _ => Ok(self.result(EngineStatus::Ok, None, 0, 0)),
        }
    }

    fn unwrap(&mut self, src: &mut NetBuffer, dst: &mut NetBuffer) -> Result<EngineResult, EngineError> {
        let input = src.chunk();
        if input.len() < HEADER {
            return Ok(self.result(EngineStatus::BufferUnderflow, None, 0, 0));
        }
        let kind = input[0];
        let len = u16::from_be_bytes([input[1], input[2]]) as usize;
        if input.len() < HEADER + len {
            return Ok(self.result(EngineStatus::BufferUnderflow, None, 0, 0));
        }
        if kind == DATA && dst.remaining() < len {
            return Ok(self.result(EngineStatus::BufferOverflow, None, 0, 0));
        }
        let payload: Vec<u8> = input[HEADER..HEADER + len].iter().map(|b| b ^ MASK).collect();
        src.advance(HEADER + len);
        let consumed = HEADER + len;

        match (self.phase, kind) {
            (Phase::AwaitHello, HELLO) => {
                self.phase = Phase::RunTask;
                Ok(self.result(EngineStatus::Ok, None, consumed, 0))
            }
            (Phase::AwaitAck, ACK) => {
                self.phase = Phase::Established;
                Ok(self.result(EngineStatus::Ok, Some(HandshakeStatus::Finished), consumed, 0))
            }
            (Phase::Established, DATA) => {
                dst.put_slice(&payload);
                Ok(self.result(EngineStatus::Ok, None, consumed, len))
            }
            (_, CLOSE) => Ok(self.result(EngineStatus::Closed, None, consumed, 0)),
            (phase, kind) => Err(EngineError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected record {kind} in {phase:?}"),
            ))),
        }
    }

    fn handshake_status(&self) -> HandshakeStatus {
        if self.outbound_closed {
            return if self.outbound_done {
                HandshakeStatus::NotHandshaking
            } else {
                HandshakeStatus::NeedWrap
            };
        }
        match self.phase {
            Phase::SendHello => HandshakeStatus::NeedWrap,
            Phase::AwaitHello | Phase::AwaitAck => HandshakeStatus::NeedUnwrap,
            Phase::RunTask if self.task_done.load(Ordering::SeqCst) => HandshakeStatus::NeedWrap,
            Phase::RunTask => HandshakeStatus::NeedTask,
            Phase::Established => HandshakeStatus::NotHandshaking,
        }
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        if self.phase != Phase::RunTask || self.task_handed_out {
            return None;
        }
        self.task_handed_out = true;
        let done = self.task_done.clone();
        let stats = self.stats.clone();
        Some(Box::new(move || {
            stats.tasks_run.fetch_add(1, Ordering::SeqCst);
            done.store(true, Ordering::SeqCst);
        }))
    }

    fn close_outbound(&mut self) {
        self.stats.close_outbound_calls.fetch_add(1, Ordering::SeqCst);
        self.outbound_closed = true;
    }

    fn is_outbound_done(&self) -> bool {
        self.outbound_done
    }

    fn packet_buffer_size(&self) -> usize {
        self.packet_size.load(Ordering::SeqCst)
    }

    fn application_buffer_size(&self) -> usize {
        self.app_size.load(Ordering::SeqCst)
    }
}

/// Creates scripted engines sharing one set of counters and size knobs.
#[derive(Clone)]
pub(crate) struct ScriptedFactory {
    pub stats: Arc<ScriptStats>,
    pub packet_size: Arc<AtomicUsize>,
    pub app_size: Arc<AtomicUsize>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::with_sizes(2 * (HEADER + MAX_PAYLOAD), 2 * MAX_PAYLOAD)
    }

    pub fn with_sizes(packet_size: usize, app_size: usize) -> Self {
        Self {
            stats: Arc::new(ScriptStats::default()),
            packet_size: Arc::new(AtomicUsize::new(packet_size)),
            app_size: Arc::new(AtomicUsize::new(app_size)),
        }
    }
}

impl EngineFactory for ScriptedFactory {
    fn new_engine(&self, role: Role) -> Result<Box<dyn CryptoEngine>, EngineError> {
        self.stats.engines.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedEngine {
            role,
            phase: match role {
                Role::Client => Phase::SendHello,
                Role::Server => Phase::AwaitHello,
            },
            stats: self.stats.clone(),
            task_done: Arc::new(AtomicBool::new(false)),
            task_handed_out: false,
            packet_size: self.packet_size.clone(),
            app_size: self.app_size.clone(),
            outbound_closed: false,
            outbound_done: false,
        }))
    }
}
