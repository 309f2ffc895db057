use crossbeam_channel::{Receiver, Sender};
use wire::Message;

use crate::error::{Error, Result};

use std::collections::HashMap;
use std::io::BufReader;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub type ConnectionId = u64;

pub fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst)
}

/// Events multiplexed onto the single dispatch loop. Every inbound
/// frame, timer tick and worker result arrives here; handlers run
/// one at a time on the loop thread.
pub enum Event {
    Opened {
        conn: ConnectionId,
        stream: TcpStream,
    },
    Message {
        conn: ConnectionId,
        message: Message,
    },
    Outbound {
        conn: ConnectionId,
        message: Message,
    },
    Closed {
        conn: ConnectionId,
    },
    Tick,
    Shutdown,
}

/// Writer halves of live connections, keyed by connection id. Only
/// the loop thread touches this table.
pub struct Connections {
    streams: HashMap<ConnectionId, TcpStream>,
}

impl Connections {
    fn new() -> Connections {
        Connections {
            streams: HashMap::new(),
        }
    }

    fn register(&mut self, conn: ConnectionId, stream: TcpStream) {
        self.streams.insert(conn, stream);
    }

    fn remove(&mut self, conn: ConnectionId) {
        self.streams.remove(&conn);
    }

    pub fn send(&mut self, conn: ConnectionId, message: &Message)
            -> Result<()> {
        let stream = match self.streams.get_mut(&conn) {
            Some(stream) => stream,
            None => return Err(Error::NotFound(format!(
                "connection {}", conn))),
        };

        if let Err(e) = wire::write_message(message, stream) {
            self.streams.remove(&conn);
            return Err(e.into());
        }

        Ok(())
    }
}

pub trait EventHandler {
    fn handle(&mut self, event: Event, connections: &mut Connections,
        sender: &Sender<Event>) -> Result<()>;
}

pub struct Reactor {
    sender: Sender<Event>,
    receiver: Receiver<Event>,
    connections: Connections,
}

impl Reactor {
    pub fn new() -> Reactor {
        let (sender, receiver) = crossbeam_channel::unbounded();

        Reactor {
            sender: sender,
            receiver: receiver,
            connections: Connections::new(),
        }
    }

    pub fn sender(&self) -> Sender<Event> {
        self.sender.clone()
    }

    /// Accept inbound connections, one reader thread each, frames
    /// flowing into the event queue.
    pub fn listen(&self, listener: TcpListener) -> JoinHandle<()> {
        let sender = self.sender.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => spawn_reader(next_connection_id(),
                        stream, sender.clone()),
                    Err(e) => {
                        warn!("failed to accept connection: {}", e);
                        break;
                    },
                }
            }
        })
    }

    /// Periodic ticks drive coordinator deadlines. The thread exits
    /// when the queue is gone.
    pub fn spawn_ticker(&self, interval: Duration) -> JoinHandle<()> {
        let sender = self.sender.clone();
        std::thread::spawn(move || {
            loop {
                std::thread::sleep(interval);
                if sender.send(Event::Tick).is_err() {
                    break;
                }
            }
        })
    }

    /// The dispatch loop: connection bookkeeping and outbound writes
    /// happen here, everything else goes to the handler. A handler
    /// error is logged and discarded, the loop never dies.
    pub fn run(&mut self, handler: &mut dyn EventHandler) {
        loop {
            let event = match self.receiver.recv() {
                Ok(event) => event,
                Err(_) => break,
            };

            match event {
                Event::Opened { conn, stream } =>
                    self.connections.register(conn, stream),
                Event::Outbound { conn, message } => {
                    if let Err(e) =
                            self.connections.send(conn, &message) {
                        warn!("outbound send on connection {} \
                            failed: {}", conn, e);
                    }
                },
                Event::Closed { conn } => {
                    self.connections.remove(conn);
                    if let Err(e) = handler.handle(
                            Event::Closed { conn: conn },
                            &mut self.connections, &self.sender) {
                        warn!("close handler failed: {}", e);
                    }
                },
                Event::Shutdown => {
                    let _ = handler.handle(Event::Shutdown,
                        &mut self.connections, &self.sender);
                    break;
                },
                x => {
                    if let Err(e) = handler.handle(x,
                            &mut self.connections, &self.sender) {
                        warn!("handler failed: {}", e);
                    }
                },
            }
        }
    }
}

/// Register the writer half, then decode frames on a dedicated
/// thread until the peer goes away.
pub fn spawn_reader(conn: ConnectionId, stream: TcpStream,
        sender: Sender<Event>) {
    match stream.try_clone() {
        Ok(writer) => {
            let _ = sender.send(Event::Opened {
                conn: conn,
                stream: writer,
            });
        },
        Err(e) => {
            warn!("failed to clone connection {}: {}", conn, e);
            return;
        },
    }

    std::thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        loop {
            match wire::read_message(&mut reader) {
                Ok(message) => {
                    let event = Event::Message {
                        conn: conn,
                        message: message,
                    };
                    if sender.send(event).is_err() {
                        return;
                    }
                },
                Err(_) => break,
            }
        }

        let _ = sender.send(Event::Closed { conn: conn });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::Sender;
    use wire::{Message, MetadataKind};

    struct CountingHandler {
        messages: usize,
        ticks: usize,
        closed: usize,
    }

    impl EventHandler for CountingHandler {
        fn handle(&mut self, event: Event,
                _connections: &mut Connections,
                _sender: &Sender<Event>) -> Result<()> {
            match event {
                Event::Message { .. } => self.messages += 1,
                Event::Tick => self.ticks += 1,
                Event::Closed { .. } => self.closed += 1,
                _ => {},
            }

            Err(Error::Validation("handler always fails".to_string()))
        }
    }

    #[test]
    fn loop_survives_handler_errors() {
        let mut reactor = Reactor::new();
        let sender = reactor.sender();

        let message = Message::MetadataRequest {
            kind: MetadataKind::Filesystem,
            filesystem: None,
        };
        sender.send(Event::Message {
            conn: 7,
            message: message.clone(),
        }).unwrap();
        sender.send(Event::Tick).unwrap();
        sender.send(Event::Message {
            conn: 7,
            message: message,
        }).unwrap();
        sender.send(Event::Closed { conn: 7 }).unwrap();
        sender.send(Event::Shutdown).unwrap();

        let mut handler = CountingHandler {
            messages: 0,
            ticks: 0,
            closed: 0,
        };
        reactor.run(&mut handler);

        assert_eq!(handler.messages, 2);
        assert_eq!(handler.ticks, 1);
        assert_eq!(handler.closed, 1);
    }
}
