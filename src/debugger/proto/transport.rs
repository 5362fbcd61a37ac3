//! Live protocol transport.
//!
//! A dedicated reader thread drains frames from the [`Link`] and splits the
//! stream in two: replies are routed to the pending command that owns the
//! sequence id, events are buffered on a channel until the event loop consumes
//! them. Losing the connection fails every pending command with
//! [`Error::TransportClosed`] and terminates the event stream with a
//! [`Event::Disconnected`].

use crate::debugger::error::Error;
use crate::debugger::proto::codec::{self, Packet, HANDSHAKE, KIND_EVENT, KIND_REPLY};
use crate::debugger::proto::{Command, Event, Reply};
use bytes::BytesMut;
use log::{debug, warn};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Byte stream carrying protocol frames, concurrently usable from the sender
/// side and the reader thread.
pub trait Link: Send + Sync {
    /// Blocking read of the next complete frame.
    fn recv(&self) -> Result<Packet, Error>;

    /// Write one frame.
    fn send(&self, packet: &Packet) -> Result<(), Error>;

    /// Unblock any reader and drop the connection. Idempotent.
    fn shutdown(&self);
}

/// Command/event interface the engine runs against.
///
/// Implemented by the live [`Transport`] and by the trace
/// [`Replayer`](crate::debugger::record::Replayer) - the event loop, registry
/// and controller never know which one drives them.
pub trait Wire: Send + Sync {
    /// Issue a command and await its correlated reply.
    fn request(&self, command: Command) -> Result<Reply, Error>;

    /// Blocking wait for the next inbound event. The stream is infinite until
    /// a terminal [`Event::Disconnected`] and is not restartable afterwards.
    fn next_event(&self) -> Result<Event, Error>;

    /// Cancel pending commands and release the underlying connection.
    fn close(&self);
}

// ---------------------------------- tcp link ----------------------------------

struct RecvHalf {
    stream: TcpStream,
    buf: BytesMut,
}

/// TCP implementation of [`Link`] with the handshake preamble exchange.
pub struct TcpLink {
    stream: TcpStream,
    rx: Mutex<RecvHalf>,
    tx: Mutex<TcpStream>,
}

impl TcpLink {
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, Error> {
        let mut stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;

        stream.write_all(HANDSHAKE)?;
        let mut answer = vec![0u8; HANDSHAKE.len()];
        stream.read_exact(&mut answer)?;
        if answer != HANDSHAKE {
            return Err(Error::Handshake);
        }

        let rx = RecvHalf {
            stream: stream.try_clone()?,
            buf: BytesMut::with_capacity(8 * 1024),
        };
        let tx = stream.try_clone()?;
        Ok(TcpLink {
            stream,
            rx: Mutex::new(rx),
            tx: Mutex::new(tx),
        })
    }
}

impl Link for TcpLink {
    fn recv(&self) -> Result<Packet, Error> {
        let mut half = self.rx.lock().expect("lock poisoned");
        let mut chunk = [0u8; 8 * 1024];
        loop {
            if let Some(packet) = Packet::parse(&mut half.buf)? {
                return Ok(packet);
            }
            let read_n = half.stream.read(&mut chunk)?;
            if read_n == 0 {
                return Err(Error::TransportClosed);
            }
            half.buf.extend_from_slice(&chunk[..read_n]);
        }
    }

    fn send(&self, packet: &Packet) -> Result<(), Error> {
        let mut out = BytesMut::new();
        packet.write_to(&mut out);
        let mut stream = self.tx.lock().expect("lock poisoned");
        stream.write_all(&out)?;
        stream.flush()?;
        Ok(())
    }

    fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

// --------------------------------- live wire ----------------------------------

type PendingMap = HashMap<u32, mpsc::Sender<Result<Packet, Error>>>;

/// Live [`Wire`] over a [`Link`].
pub struct Transport {
    link: Arc<dyn Link>,
    seq: AtomicU32,
    pending: Arc<Mutex<PendingMap>>,
    events: Mutex<mpsc::Receiver<Event>>,
    reply_timeout: Duration,
    closed: AtomicBool,
}

impl Transport {
    /// Start the reader thread over `link`.
    pub fn start(link: impl Link + 'static, reply_timeout: Duration) -> Self {
        let link: Arc<dyn Link> = Arc::new(link);
        let pending: Arc<Mutex<PendingMap>> = Arc::default();
        let (events_tx, events_rx) = mpsc::channel();

        let reader_link = link.clone();
        let reader_pending = pending.clone();
        thread::Builder::new()
            .name("remdbg-transport".into())
            .spawn(move || reader_loop(reader_link, reader_pending, events_tx))
            .expect("spawn transport reader");

        Transport {
            link,
            seq: AtomicU32::new(1),
            pending,
            events: Mutex::new(events_rx),
            reply_timeout,
            closed: AtomicBool::new(false),
        }
    }
}

fn reader_loop(
    link: Arc<dyn Link>,
    pending: Arc<Mutex<PendingMap>>,
    events_tx: mpsc::Sender<Event>,
) {
    loop {
        let packet = match link.recv() {
            Ok(packet) => packet,
            Err(e) => {
                debug!(target: "transport", "link read failed, tearing down: {e}");
                fail_pending(&pending, || Error::TransportClosed);
                let _ = events_tx.send(Event::Disconnected);
                return;
            }
        };

        match packet.kind {
            KIND_REPLY => {
                let waiter = pending.lock().expect("lock poisoned").remove(&packet.seq);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(packet));
                    }
                    // late reply after a timeout, or target bug
                    None => warn!(target: "transport", "orphan reply, seq {}", packet.seq),
                }
            }
            KIND_EVENT => match codec::decode_event(&packet) {
                Ok(event) => {
                    debug!(target: "transport", "inbound event `{}`", event.name());
                    let terminal = event.is_terminal();
                    if events_tx.send(event).is_err() {
                        return;
                    }
                    if terminal {
                        fail_pending(&pending, || Error::TransportClosed);
                        return;
                    }
                }
                // a single bad event never terminates the stream
                Err(e) => warn!(target: "transport", "dropping undecodable event: {e}"),
            },
            kind => warn!(target: "transport", "dropping frame with unknown kind {kind}"),
        }
    }
}

fn fail_pending(pending: &Mutex<PendingMap>, err: impl Fn() -> Error) {
    let waiters = std::mem::take(&mut *pending.lock().expect("lock poisoned"));
    for (_, tx) in waiters {
        let _ = tx.send(Err(err()));
    }
}

impl Wire for Transport {
    fn request(&self, command: Command) -> Result<Reply, Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::SessionDetached);
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel();
        self.pending
            .lock()
            .expect("lock poisoned")
            .insert(seq, tx);

        debug!(target: "transport", "send `{}`, seq {seq}", command.name());
        let packet = codec::encode_command(seq, &command);
        if let Err(e) = self.link.send(&packet) {
            self.pending.lock().expect("lock poisoned").remove(&seq);
            return Err(e);
        }

        match rx.recv_timeout(self.reply_timeout) {
            Ok(Ok(reply_packet)) => match codec::decode_reply(&command, &reply_packet)? {
                Reply::Error { code, message } => Err(Error::ErrorReply { code, message }),
                reply => Ok(reply),
            },
            Ok(Err(e)) => Err(e),
            Err(RecvTimeoutError::Timeout) => {
                self.pending.lock().expect("lock poisoned").remove(&seq);
                Err(Error::CommandTimeout(command.name(), self.reply_timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::TransportClosed),
        }
    }

    fn next_event(&self) -> Result<Event, Error> {
        self.events
            .lock()
            .expect("lock poisoned")
            .recv()
            .map_err(|_| Error::TransportClosed)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        fail_pending(&self.pending, || Error::SessionDetached);
        self.link.shutdown();
    }
}
