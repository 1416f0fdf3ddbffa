//! Handshake and record-layer state machine.
//!
//! One handler per [`HandshakeStatus`]. [`drive`] runs handlers until one
//! has to wait for the socket or the session has to close. It is re-entered
//! on every readiness event, never per byte.

use std::time::Duration;

use crate::engine::{EngineStatus, HandshakeStatus};

use super::channel::Channel;
use super::context::{ReadEnd, SessionContext, UnwrapInto};
use super::SessionError;

/// Session-level effects of driving the engine.
pub trait SessionEvents {
    /// The handshake completed. Called once per session.
    fn handshake_finished(&mut self, elapsed: Duration) -> Result<(), SessionError>;

    /// Decrypted application data, in wire order.
    fn plaintext(&mut self, data: &[u8]) -> Result<(), SessionError>;

    /// Whether more plaintext can be taken now. While this is `false` the
    /// steady state leaves ciphertext unread and waits; whoever frees room
    /// must drive the session again, as no new readiness edge will come.
    fn accepts_plaintext(&mut self) -> bool {
        true
    }
}

/// Where [`drive`] stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drive {
    /// Nothing more to do until the next readiness event.
    Waiting,
    /// The peer or the engine ended the session; it must be closed.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Next(HandshakeStatus),
    Wait,
    Close,
}

/// Run the state machine until it blocks on I/O or the session ends.
///
/// Errors are fatal for the session.
pub fn drive<C: Channel>(
    ctx: &mut SessionContext<C>,
    events: &mut dyn SessionEvents,
) -> Result<Drive, SessionError> {
    if ctx.is_closed() {
        return Ok(Drive::Closed);
    }

    let mut status = ctx.engine()?.handshake_status();
    loop {
        let step = match status {
            HandshakeStatus::NeedWrap => need_wrap(ctx)?,
            HandshakeStatus::NeedUnwrap => need_unwrap(ctx)?,
            HandshakeStatus::NeedTask => need_task(ctx)?,
            HandshakeStatus::Finished => finished(ctx, events)?,
            HandshakeStatus::NotHandshaking => steady(ctx, events)?,
        };
        match step {
            Step::Next(next) => status = next,
            Step::Wait => return Ok(Drive::Waiting),
            Step::Close => return Ok(Drive::Closed),
        }
    }
}

fn need_wrap<C: Channel>(ctx: &mut SessionContext<C>) -> Result<Step, SessionError> {
    let result = ctx.wrap_handshake()?;
    if result.bytes_produced > 0 {
        ctx.flush_out_net()?;
    }
    match result.status {
        EngineStatus::Ok => {
            if result.bytes_produced == 0 && result.handshake_status == HandshakeStatus::NeedWrap {
                return Err(SessionError::Contract {
                    op: "wrap",
                    status: result.status,
                });
            }
            Ok(Step::Next(result.handshake_status))
        }
        EngineStatus::Closed => Ok(Step::Close),
        EngineStatus::BufferOverflow => {
            ctx.enlarge_out_net()?;
            Ok(Step::Next(HandshakeStatus::NeedWrap))
        }
        EngineStatus::BufferUnderflow => Err(SessionError::Contract {
            op: "wrap",
            status: result.status,
        }),
    }
}

fn need_unwrap<C: Channel>(ctx: &mut SessionContext<C>) -> Result<Step, SessionError> {
    let read = ctx.read_in_net()?;
    let result = ctx.unwrap(UnwrapInto::Scratch)?;
    match result.status {
        EngineStatus::Ok => Ok(Step::Next(result.handshake_status)),
        EngineStatus::BufferUnderflow => match read.end {
            ReadEnd::Eof => Ok(Step::Close),
            ReadEnd::Full if ctx.in_net_full() => {
                ctx.enlarge_in_net()?;
                Ok(Step::Next(HandshakeStatus::NeedUnwrap))
            }
            ReadEnd::Full => Ok(Step::Next(HandshakeStatus::NeedUnwrap)),
            ReadEnd::Drained => Ok(Step::Wait),
        },
        EngineStatus::Closed => Ok(Step::Close),
        EngineStatus::BufferOverflow => Err(SessionError::Contract {
            op: "unwrap",
            status: result.status,
        }),
    }
}

fn need_task<C: Channel>(ctx: &mut SessionContext<C>) -> Result<Step, SessionError> {
    let engine = ctx.engine_mut()?;
    let mut ran = 0;
    while let Some(task) = engine.delegated_task() {
        task();
        ran += 1;
    }
    let status = engine.handshake_status();
    tracing::trace!(session = %ctx.id(), ran, ?status, "Delegated tasks done");
    if status == HandshakeStatus::NeedTask && ran == 0 {
        return Err(SessionError::Contract {
            op: "delegated_task",
            status: EngineStatus::Ok,
        });
    }
    Ok(Step::Next(status))
}

fn finished<C: Channel>(
    ctx: &mut SessionContext<C>,
    events: &mut dyn SessionEvents,
) -> Result<Step, SessionError> {
    if ctx.mark_established() {
        let elapsed = ctx.handshake_elapsed();
        tracing::debug!(session = %ctx.id(), elapsed_ms = elapsed.as_millis() as u64, "Handshake finished");
        events.handshake_finished(elapsed)?;
    }
    // Application data may have arrived in the same read as the last
    // handshake record.
    Ok(Step::Next(ctx.engine()?.handshake_status()))
}

fn steady<C: Channel>(
    ctx: &mut SessionContext<C>,
    events: &mut dyn SessionEvents,
) -> Result<Step, SessionError> {
    loop {
        if !events.accepts_plaintext() {
            return Ok(Step::Wait);
        }
        let read = ctx.read_in_net()?;

        while ctx.has_buffered_input() {
            if !events.accepts_plaintext() {
                return Ok(Step::Wait);
            }
            let result = ctx.unwrap(UnwrapInto::App)?;
            if result.bytes_produced > 0 {
                if let Some(delivered) = ctx.drain_app(|data| events.plaintext(data)) {
                    delivered?;
                }
            }
            match result.status {
                EngineStatus::Ok => match result.handshake_status {
                    HandshakeStatus::NeedWrap | HandshakeStatus::NeedTask => {
                        return Ok(Step::Next(result.handshake_status));
                    }
                    _ if result.bytes_consumed == 0 && result.bytes_produced == 0 => break,
                    _ => {}
                },
                EngineStatus::BufferUnderflow if ctx.in_net_full() => ctx.enlarge_in_net()?,
                EngineStatus::BufferUnderflow => break,
                EngineStatus::BufferOverflow => ctx.enlarge_in_app()?,
                EngineStatus::Closed => return Ok(Step::Close),
            }
        }

        match read.end {
            ReadEnd::Full if read.bytes == 0 && ctx.in_net_full() => {
                return Err(SessionError::Contract {
                    op: "unwrap",
                    status: EngineStatus::BufferUnderflow,
                });
            }
            ReadEnd::Full => {}
            ReadEnd::Eof => return Ok(Step::Close),
            ReadEnd::Drained => {
                return Ok(match ctx.engine()?.handshake_status() {
                    HandshakeStatus::NeedWrap => Step::Next(HandshakeStatus::NeedWrap),
                    _ => Step::Wait,
                });
            }
        }
    }
}
