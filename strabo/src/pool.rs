use crossbeam_channel::Sender;
use wire::Message;

use crate::error::{Error, Result};
use crate::reactor::{self, Event};

use std::collections::HashMap;
use std::net::TcpStream;
use std::time::{Duration, Instant};

struct PooledConnection {
    stream: TcpStream,
    last_used: Instant,
}

/// Outbound peer connections, keyed by address. Dialed lazily and
/// retained until idle or broken; replies flow back through the
/// reader thread attached at dial time, so correlation stays with
/// the coordinator.
pub struct ConnectionPool {
    sender: Sender<Event>,
    connections: HashMap<String, PooledConnection>,
}

impl ConnectionPool {
    pub fn new(sender: Sender<Event>) -> ConnectionPool {
        ConnectionPool {
            sender: sender,
            connections: HashMap::new(),
        }
    }

    /// Send on the cached connection, dialing on first use. One
    /// failed attempt evicts and redials; the second failure is the
    /// caller's problem.
    pub fn send(&mut self, addr: &str, message: &Message)
            -> Result<()> {
        let mut last_error: Option<Error> = None;
        for _ in 0..2 {
            match self.try_send(addr, message) {
                Ok(_) => return Ok(()),
                Err(e) => {
                    self.connections.remove(addr);
                    last_error = Some(e);
                },
            }
        }

        Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            format!("send to '{}' failed: {}", addr,
                last_error.unwrap()))))
    }

    fn try_send(&mut self, addr: &str, message: &Message)
            -> Result<()> {
        if !self.connections.contains_key(addr) {
            let stream = TcpStream::connect(addr)?;
            reactor::spawn_reader(reactor::next_connection_id(),
                stream.try_clone()?, self.sender.clone());
            self.connections.insert(addr.to_string(),
                PooledConnection {
                    stream: stream,
                    last_used: Instant::now(),
                });
        }

        let connection = self.connections.get_mut(addr).unwrap();
        wire::write_message(message, &mut connection.stream)?;
        connection.last_used = Instant::now();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Evict connections unused for longer than `max_idle`; their
    /// reader threads observe the close and drain.
    pub fn sweep_idle(&mut self, max_idle: Duration) {
        let now = Instant::now();
        self.connections.retain(|addr, connection| {
            let keep =
                now.duration_since(connection.last_used) < max_idle;
            if !keep {
                debug!("evicting idle connection to {}", addr);
            }
            keep
        });
    }

    /// Drop every cached connection.
    pub fn drain(&mut self) {
        self.connections.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;
    use wire::Message;

    use std::net::TcpListener;

    #[test]
    fn dial_caches_and_replies_flow_back() {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut pool = ConnectionPool::new(sender);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        // echo both frames back to the dialer
        let echo = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            for _ in 0..2 {
                let message = wire::read_message(&mut stream).unwrap();
                wire::write_message(&message, &mut stream).unwrap();
            }
        });

        pool.send(&addr, &Message::Shutdown).unwrap();
        pool.send(&addr, &Message::Shutdown).unwrap();
        assert_eq!(pool.len(), 1);
        echo.join().unwrap();

        // the dialed connection registered itself and the echoed
        // replies arrive as ordinary events
        let mut opened = 0;
        let mut messages = 0;
        while let Ok(event) = receiver.recv_timeout(
                Duration::from_secs(5)) {
            match event {
                Event::Opened { .. } => opened += 1,
                Event::Message { .. } => {
                    messages += 1;
                    if messages == 2 {
                        break;
                    }
                },
                _ => {},
            }
        }

        assert_eq!(opened, 1);
        assert_eq!(messages, 2);
    }

    #[test]
    fn unreachable_peer_surfaces_io_error() {
        let reactor = Reactor::new();
        let mut pool = ConnectionPool::new(reactor.sender());

        // a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        match pool.send(&addr, &Message::Shutdown) {
            Err(Error::Io(_)) => {},
            x => panic!("expected Io error, found {:?}",
                x.map(|_| ())),
        }
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn idle_connections_evicted() {
        let (sender, _receiver) = crossbeam_channel::unbounded();
        let mut pool = ConnectionPool::new(sender);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let hold = std::thread::spawn(move || {
            listener.accept().unwrap()
        });

        pool.send(&addr, &Message::Shutdown).unwrap();
        assert_eq!(pool.len(), 1);
        hold.join().unwrap();

        pool.sweep_idle(Duration::from_secs(300));
        assert_eq!(pool.len(), 1);

        pool.sweep_idle(Duration::from_millis(0));
        assert_eq!(pool.len(), 0);
    }
}
