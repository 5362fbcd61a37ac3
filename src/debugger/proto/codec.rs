//! Binary framing for the debug wire.
//!
//! Every frame is `[len: u32][seq: u32][kind: u8][code: u16][payload]` with
//! big-endian integers, `len` counts everything after itself. `seq` correlates
//! a reply with its command, events carry the sequence of the target side.
//! A connection starts with both sides writing the same handshake preamble.

use crate::debugger::error::Error;
use crate::debugger::proto::{
    Command, Event, FrameDescriptor, Location, Reply, RequestHandle, StepKind, ThreadId,
};
use crate::debugger::variable::{ArrayRef, ObjectRef, TypeTag, Value, VariableBinding};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const HANDSHAKE: &[u8] = b"RDWP-Handshake";

/// Frame header length after the length prefix: seq + kind + code.
const HEADER_LEN: usize = 4 + 1 + 2;

pub const KIND_COMMAND: u8 = 0;
pub const KIND_REPLY: u8 = 1;
pub const KIND_EVENT: u8 = 2;

mod cmd_code {
    pub const LIST_THREADS: u16 = 1;
    pub const RESOLVE_LINE: u16 = 2;
    pub const RESOLVE_METHOD: u16 = 3;
    pub const SET_BREAKPOINT: u16 = 4;
    pub const CLEAR_BREAKPOINT: u16 = 5;
    pub const SET_EXC_WATCH: u16 = 6;
    pub const CLEAR_EXC_WATCH: u16 = 7;
    pub const SUSPEND: u16 = 8;
    pub const RESUME: u16 = 9;
    pub const SUSPEND_ALL: u16 = 10;
    pub const RESUME_ALL: u16 = 11;
    pub const STEP: u16 = 12;
    pub const FRAMES: u16 = 13;
    pub const LOCALS: u16 = 14;
    pub const DISPOSE: u16 = 15;
}

mod reply_code {
    pub const OK: u16 = 0;
    // any other value is a target error code, payload carries the message
}

mod event_code {
    pub const THREAD_START: u16 = 100;
    pub const THREAD_DEATH: u16 = 101;
    pub const CLASS_PREPARED: u16 = 102;
    pub const CLASS_UNLOADED: u16 = 103;
    pub const BREAKPOINT_HIT: u16 = 104;
    pub const STEP_COMPLETE: u16 = 105;
    pub const EXCEPTION_THROWN: u16 = 106;
    pub const TARGET_EXIT: u16 = 107;
    pub const DISCONNECTED: u16 = 108;
}

mod value_kind {
    pub const NULL: u8 = 255;
}

/// One wire frame, payload still encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub seq: u32,
    pub kind: u8,
    pub code: u16,
    pub payload: Bytes,
}

impl Packet {
    /// Append this frame to an output buffer.
    pub fn write_to(&self, out: &mut BytesMut) {
        out.put_u32((HEADER_LEN + self.payload.len()) as u32);
        out.put_u32(self.seq);
        out.put_u8(self.kind);
        out.put_u16(self.code);
        out.extend_from_slice(&self.payload);
    }

    /// Try to split one complete frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` if the buffer does not hold a full frame yet.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<Packet>, Error> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len < HEADER_LEN {
            return Err(Error::MalformedPacket(format!(
                "frame length {len} below header size"
            )));
        }
        if buf.len() < 4 + len {
            return Ok(None);
        }
        buf.advance(4);
        let mut frame = buf.split_to(len);
        let seq = frame.get_u32();
        let kind = frame.get_u8();
        let code = frame.get_u16();
        Ok(Some(Packet {
            seq,
            kind,
            code,
            payload: frame.freeze(),
        }))
    }
}

// ---------------------------------- encoding ----------------------------------

struct Writer {
    buf: BytesMut,
}

impl Writer {
    fn new() -> Self {
        Writer {
            buf: BytesMut::new(),
        }
    }

    fn string(&mut self, s: &str) {
        self.buf.put_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn location(&mut self, loc: &Location) {
        match loc {
            Location::Line { class, line } => {
                self.buf.put_u8(0);
                self.string(class);
                self.buf.put_u32(*line);
            }
            Location::Method {
                class,
                method,
                offset,
            } => {
                self.buf.put_u8(1);
                self.string(class);
                self.string(method);
                self.buf.put_u64(*offset);
            }
        }
    }

    fn value(&mut self, value: &Value) {
        match value {
            Value::Null => self.buf.put_u8(value_kind::NULL),
            Value::Bool(v) => {
                self.buf.put_u8(TypeTag::Bool as u8);
                self.buf.put_u8(*v as u8);
            }
            Value::Byte(v) => {
                self.buf.put_u8(TypeTag::Byte as u8);
                self.buf.put_i8(*v);
            }
            Value::Short(v) => {
                self.buf.put_u8(TypeTag::Short as u8);
                self.buf.put_i16(*v);
            }
            Value::Int(v) => {
                self.buf.put_u8(TypeTag::Int as u8);
                self.buf.put_i32(*v);
            }
            Value::Long(v) => {
                self.buf.put_u8(TypeTag::Long as u8);
                self.buf.put_i64(*v);
            }
            Value::Float(v) => {
                self.buf.put_u8(TypeTag::Float as u8);
                self.buf.put_f32(*v);
            }
            Value::Double(v) => {
                self.buf.put_u8(TypeTag::Double as u8);
                self.buf.put_f64(*v);
            }
            Value::Char(v) => {
                self.buf.put_u8(TypeTag::Char as u8);
                self.buf.put_u32(*v as u32);
            }
            Value::Object(o) => {
                self.buf.put_u8(TypeTag::Object as u8);
                self.buf.put_u64(o.id);
                self.string(&o.class);
            }
            Value::Array(a) => {
                self.buf.put_u8(TypeTag::Array as u8);
                self.buf.put_u64(a.id);
                self.string(&a.component);
                self.buf.put_u32(a.length);
            }
        }
    }

    fn binding(&mut self, binding: &VariableBinding) {
        self.string(&binding.name);
        self.buf.put_u8(binding.tag as u8);
        self.value(&binding.value);
    }

    fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

pub fn encode_command(seq: u32, command: &Command) -> Packet {
    let mut w = Writer::new();
    let code = match command {
        Command::ListThreads => cmd_code::LIST_THREADS,
        Command::ResolveLine { class, line } => {
            w.string(class);
            w.buf.put_u32(*line);
            cmd_code::RESOLVE_LINE
        }
        Command::ResolveMethod { class, method } => {
            w.string(class);
            w.string(method);
            cmd_code::RESOLVE_METHOD
        }
        Command::SetBreakpoint { location } => {
            w.location(location);
            cmd_code::SET_BREAKPOINT
        }
        Command::ClearBreakpoint { handle } => {
            w.buf.put_u64(handle.0);
            cmd_code::CLEAR_BREAKPOINT
        }
        Command::SetExceptionWatch { class_pattern } => {
            w.string(class_pattern);
            cmd_code::SET_EXC_WATCH
        }
        Command::ClearExceptionWatch { handle } => {
            w.buf.put_u64(handle.0);
            cmd_code::CLEAR_EXC_WATCH
        }
        Command::Suspend { thread } => {
            w.buf.put_u64(thread.0);
            cmd_code::SUSPEND
        }
        Command::Resume { thread } => {
            w.buf.put_u64(thread.0);
            cmd_code::RESUME
        }
        Command::SuspendAll => cmd_code::SUSPEND_ALL,
        Command::ResumeAll => cmd_code::RESUME_ALL,
        Command::Step { thread, kind } => {
            w.buf.put_u64(thread.0);
            w.buf.put_u8(*kind as u8);
            cmd_code::STEP
        }
        Command::Frames { thread } => {
            w.buf.put_u64(thread.0);
            cmd_code::FRAMES
        }
        Command::Locals { thread, frame } => {
            w.buf.put_u64(thread.0);
            w.buf.put_u32(*frame);
            cmd_code::LOCALS
        }
        Command::Dispose => cmd_code::DISPOSE,
    };
    Packet {
        seq,
        kind: KIND_COMMAND,
        code,
        payload: w.finish(),
    }
}

pub fn encode_reply(seq: u32, reply: &Reply) -> Packet {
    let mut w = Writer::new();
    let code = match reply {
        Reply::Error { code, message } => {
            w.string(message);
            *code
        }
        Reply::Ack => reply_code::OK,
        Reply::Threads(threads) => {
            w.buf.put_u32(threads.len() as u32);
            for t in threads {
                w.buf.put_u64(t.0);
            }
            reply_code::OK
        }
        Reply::Resolved { location } => {
            w.buf.put_u8(1);
            w.location(location);
            reply_code::OK
        }
        Reply::ClassNotLoaded => {
            w.buf.put_u8(0);
            reply_code::OK
        }
        Reply::RequestSet { handle } => {
            w.buf.put_u64(handle.0);
            reply_code::OK
        }
        Reply::Frames(frames) => {
            w.buf.put_u32(frames.len() as u32);
            for fr in frames {
                w.buf.put_u32(fr.index);
                w.location(&fr.location);
            }
            reply_code::OK
        }
        Reply::Locals(bindings) => {
            w.buf.put_u32(bindings.len() as u32);
            for b in bindings {
                w.binding(b);
            }
            reply_code::OK
        }
    };
    Packet {
        seq,
        kind: KIND_REPLY,
        code,
        payload: w.finish(),
    }
}

pub fn encode_event(seq: u32, event: &Event) -> Packet {
    let mut w = Writer::new();
    let code = match event {
        Event::ThreadStart { thread } => {
            w.buf.put_u64(thread.0);
            event_code::THREAD_START
        }
        Event::ThreadDeath { thread } => {
            w.buf.put_u64(thread.0);
            event_code::THREAD_DEATH
        }
        Event::ClassPrepared { class } => {
            w.string(class);
            event_code::CLASS_PREPARED
        }
        Event::ClassUnloaded { class } => {
            w.string(class);
            event_code::CLASS_UNLOADED
        }
        Event::BreakpointHit {
            thread,
            handle,
            location,
        } => {
            w.buf.put_u64(thread.0);
            w.buf.put_u64(handle.0);
            w.location(location);
            event_code::BREAKPOINT_HIT
        }
        Event::StepComplete { thread, location } => {
            w.buf.put_u64(thread.0);
            w.location(location);
            event_code::STEP_COMPLETE
        }
        Event::ExceptionThrown {
            thread,
            class,
            message,
            location,
        } => {
            w.buf.put_u64(thread.0);
            w.string(class);
            w.string(message);
            match location {
                Some(loc) => {
                    w.buf.put_u8(1);
                    w.location(loc);
                }
                None => w.buf.put_u8(0),
            }
            event_code::EXCEPTION_THROWN
        }
        Event::TargetExit { code } => {
            w.buf.put_i32(*code);
            event_code::TARGET_EXIT
        }
        Event::Disconnected => event_code::DISCONNECTED,
    };
    Packet {
        seq,
        kind: KIND_EVENT,
        code,
        payload: w.finish(),
    }
}

// ---------------------------------- decoding ----------------------------------

struct Reader {
    buf: Bytes,
}

impl Reader {
    fn new(payload: Bytes) -> Self {
        Reader { buf: payload }
    }

    fn need(&self, n: usize) -> Result<(), Error> {
        if self.buf.remaining() < n {
            return Err(Error::MalformedPacket("truncated payload".into()));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, Error> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn i8(&mut self) -> Result<i8, Error> {
        self.need(1)?;
        Ok(self.buf.get_i8())
    }

    fn i16(&mut self) -> Result<i16, Error> {
        self.need(2)?;
        Ok(self.buf.get_i16())
    }

    fn u32(&mut self) -> Result<u32, Error> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn i32(&mut self) -> Result<i32, Error> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    fn u64(&mut self) -> Result<u64, Error> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    fn i64(&mut self) -> Result<i64, Error> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    fn f32(&mut self) -> Result<f32, Error> {
        self.need(4)?;
        Ok(self.buf.get_f32())
    }

    fn f64(&mut self) -> Result<f64, Error> {
        self.need(8)?;
        Ok(self.buf.get_f64())
    }

    fn string(&mut self) -> Result<String, Error> {
        let len = self.u32()? as usize;
        self.need(len)?;
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::MalformedPacket("string is not valid utf-8".into()))
    }

    fn location(&mut self) -> Result<Location, Error> {
        match self.u8()? {
            0 => Ok(Location::Line {
                class: self.string()?,
                line: self.u32()?,
            }),
            1 => Ok(Location::Method {
                class: self.string()?,
                method: self.string()?,
                offset: self.u64()?,
            }),
            v => Err(Error::MalformedPacket(format!("unknown location kind {v}"))),
        }
    }

    fn value(&mut self) -> Result<Value, Error> {
        let kind = self.u8()?;
        if kind == value_kind::NULL {
            return Ok(Value::Null);
        }
        let tag = TypeTag::from_repr(kind)
            .ok_or_else(|| Error::MalformedPacket(format!("unknown value kind {kind}")))?;
        Ok(match tag {
            TypeTag::Bool => Value::Bool(self.u8()? != 0),
            TypeTag::Byte => Value::Byte(self.i8()?),
            TypeTag::Short => Value::Short(self.i16()?),
            TypeTag::Int => Value::Int(self.i32()?),
            TypeTag::Long => Value::Long(self.i64()?),
            TypeTag::Float => Value::Float(self.f32()?),
            TypeTag::Double => Value::Double(self.f64()?),
            TypeTag::Char => {
                let raw = self.u32()?;
                let c = char::from_u32(raw).ok_or_else(|| {
                    Error::MalformedPacket(format!("invalid char scalar {raw:#x}"))
                })?;
                Value::Char(c)
            }
            TypeTag::Object => Value::Object(ObjectRef {
                id: self.u64()?,
                class: self.string()?,
            }),
            TypeTag::Array => Value::Array(ArrayRef {
                id: self.u64()?,
                component: self.string()?,
                length: self.u32()?,
            }),
        })
    }

    fn binding(&mut self) -> Result<VariableBinding, Error> {
        let name = self.string()?;
        let raw_tag = self.u8()?;
        let tag = TypeTag::from_repr(raw_tag)
            .ok_or_else(|| Error::MalformedPacket(format!("unknown type tag {raw_tag}")))?;
        let value = self.value()?;
        Ok(VariableBinding { name, tag, value })
    }

    fn thread(&mut self) -> Result<ThreadId, Error> {
        Ok(ThreadId(self.u64()?))
    }

    fn handle(&mut self) -> Result<RequestHandle, Error> {
        Ok(RequestHandle(self.u64()?))
    }

    fn finish(self) -> Result<(), Error> {
        if self.buf.has_remaining() {
            return Err(Error::MalformedPacket(format!(
                "{} trailing bytes after payload",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

pub fn decode_command(packet: &Packet) -> Result<Command, Error> {
    debug_assert_eq!(packet.kind, KIND_COMMAND);
    let mut r = Reader::new(packet.payload.clone());
    let command = match packet.code {
        cmd_code::LIST_THREADS => Command::ListThreads,
        cmd_code::RESOLVE_LINE => Command::ResolveLine {
            class: r.string()?,
            line: r.u32()?,
        },
        cmd_code::RESOLVE_METHOD => Command::ResolveMethod {
            class: r.string()?,
            method: r.string()?,
        },
        cmd_code::SET_BREAKPOINT => Command::SetBreakpoint {
            location: r.location()?,
        },
        cmd_code::CLEAR_BREAKPOINT => Command::ClearBreakpoint {
            handle: r.handle()?,
        },
        cmd_code::SET_EXC_WATCH => Command::SetExceptionWatch {
            class_pattern: r.string()?,
        },
        cmd_code::CLEAR_EXC_WATCH => Command::ClearExceptionWatch {
            handle: r.handle()?,
        },
        cmd_code::SUSPEND => Command::Suspend {
            thread: r.thread()?,
        },
        cmd_code::RESUME => Command::Resume {
            thread: r.thread()?,
        },
        cmd_code::SUSPEND_ALL => Command::SuspendAll,
        cmd_code::RESUME_ALL => Command::ResumeAll,
        cmd_code::STEP => {
            let thread = r.thread()?;
            let raw = r.u8()?;
            let kind = StepKind::from_repr(raw)
                .ok_or_else(|| Error::MalformedPacket(format!("unknown step kind {raw}")))?;
            Command::Step { thread, kind }
        }
        cmd_code::FRAMES => Command::Frames {
            thread: r.thread()?,
        },
        cmd_code::LOCALS => Command::Locals {
            thread: r.thread()?,
            frame: r.u32()?,
        },
        cmd_code::DISPOSE => Command::Dispose,
        code => return Err(Error::MalformedPacket(format!("unknown command code {code}"))),
    };
    r.finish()?;
    Ok(command)
}

/// Decode a reply packet. The shape of a success payload depends on the
/// command it answers, so the original command must be supplied.
pub fn decode_reply(command: &Command, packet: &Packet) -> Result<Reply, Error> {
    debug_assert_eq!(packet.kind, KIND_REPLY);
    let mut r = Reader::new(packet.payload.clone());
    if packet.code != reply_code::OK {
        let reply = Reply::Error {
            code: packet.code,
            message: r.string()?,
        };
        r.finish()?;
        return Ok(reply);
    }
    let reply = match command {
        Command::ListThreads => {
            let count = r.u32()? as usize;
            let mut threads = Vec::with_capacity(count);
            for _ in 0..count {
                threads.push(r.thread()?);
            }
            Reply::Threads(threads)
        }
        Command::ResolveLine { .. } | Command::ResolveMethod { .. } => match r.u8()? {
            0 => Reply::ClassNotLoaded,
            1 => Reply::Resolved {
                location: r.location()?,
            },
            v => {
                return Err(Error::MalformedPacket(format!(
                    "unknown resolution marker {v}"
                )))
            }
        },
        Command::SetBreakpoint { .. } | Command::SetExceptionWatch { .. } => Reply::RequestSet {
            handle: r.handle()?,
        },
        Command::Frames { .. } => {
            let count = r.u32()? as usize;
            let mut frames = Vec::with_capacity(count);
            for _ in 0..count {
                frames.push(FrameDescriptor {
                    index: r.u32()?,
                    location: r.location()?,
                });
            }
            Reply::Frames(frames)
        }
        Command::Locals { .. } => {
            let count = r.u32()? as usize;
            let mut bindings = Vec::with_capacity(count);
            for _ in 0..count {
                bindings.push(r.binding()?);
            }
            Reply::Locals(bindings)
        }
        _ => Reply::Ack,
    };
    r.finish()?;
    Ok(reply)
}

pub fn decode_event(packet: &Packet) -> Result<Event, Error> {
    debug_assert_eq!(packet.kind, KIND_EVENT);
    let mut r = Reader::new(packet.payload.clone());
    let event = match packet.code {
        event_code::THREAD_START => Event::ThreadStart {
            thread: r.thread()?,
        },
        event_code::THREAD_DEATH => Event::ThreadDeath {
            thread: r.thread()?,
        },
        event_code::CLASS_PREPARED => Event::ClassPrepared { class: r.string()? },
        event_code::CLASS_UNLOADED => Event::ClassUnloaded { class: r.string()? },
        event_code::BREAKPOINT_HIT => Event::BreakpointHit {
            thread: r.thread()?,
            handle: r.handle()?,
            location: r.location()?,
        },
        event_code::STEP_COMPLETE => Event::StepComplete {
            thread: r.thread()?,
            location: r.location()?,
        },
        event_code::EXCEPTION_THROWN => {
            let thread = r.thread()?;
            let class = r.string()?;
            let message = r.string()?;
            let location = match r.u8()? {
                0 => None,
                1 => Some(r.location()?),
                v => {
                    return Err(Error::MalformedPacket(format!(
                        "unknown location marker {v}"
                    )))
                }
            };
            Event::ExceptionThrown {
                thread,
                class,
                message,
                location,
            }
        }
        event_code::TARGET_EXIT => Event::TargetExit { code: r.i32()? },
        event_code::DISCONNECTED => Event::Disconnected,
        code => return Err(Error::MalformedPacket(format!("unknown event code {code}"))),
    };
    r.finish()?;
    Ok(event)
}
