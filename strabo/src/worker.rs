use crossbeam_channel::Sender;
use wire::{Message, QueryPayload, RecordRow};

use crate::error::Result;
use crate::reactor::{ConnectionId, Event};
use crate::store;

use std::path::PathBuf;
use std::thread::JoinHandle;

/// A block scan taken off the loop: everything the reply needs is
/// owned by the job, so workers never touch the registry or the
/// connection pool.
pub struct ScanJob {
    pub conn: ConnectionId,
    pub query_id: String,
    pub origin: String,
    pub dry_run: bool,
    pub interactive: bool,
    pub block_ids: Vec<String>,
    pub rows: Vec<RecordRow>,
    pub spool_path: PathBuf,
}

/// Fixed pool of scan workers over a bounded channel. Results come
/// back to the loop as outbound reply events.
pub struct WorkerPool {
    sender: Sender<ScanJob>,
    join_handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(thread_count: usize, events: Sender<Event>)
            -> WorkerPool {
        let (sender, receiver) = crossbeam_channel::bounded(256);

        let mut join_handles = Vec::new();
        for _ in 0..thread_count.max(1) {
            let receiver_clone: crossbeam_channel::Receiver<ScanJob> =
                receiver.clone();
            let events_clone = events.clone();

            let join_handle = std::thread::spawn(move || {
                loop {
                    // fetch next job
                    let job = match receiver_clone.recv() {
                        Ok(job) => job,
                        Err(_) => break,
                    };

                    let conn = job.conn;
                    let message = process(job);
                    if events_clone.send(Event::Outbound {
                        conn: conn,
                        message: message,
                    }).is_err() {
                        break;
                    }
                }
            });

            join_handles.push(join_handle);
        }

        WorkerPool {
            sender: sender,
            join_handles: join_handles,
        }
    }

    pub fn submit(&self, job: ScanJob) -> Result<()> {
        self.sender.send(job).map_err(|_|
            crate::error::Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "worker pool is gone")))
    }

    /// Drop the job channel and join the workers.
    pub fn shutdown(self) {
        drop(self.sender);
        for join_handle in self.join_handles {
            let _ = join_handle.join();
        }
    }
}

fn process(job: ScanJob) -> Message {
    let (payload, error) = if job.dry_run {
        (QueryPayload::BlockIds(job.block_ids), None)
    } else if job.interactive {
        (QueryPayload::Rows(job.rows), None)
    } else {
        match store::spool_rows(&job.spool_path, &job.rows) {
            Ok(stats) => (QueryPayload::Spooled(stats), None),
            Err(e) => (QueryPayload::Rows(Vec::new()),
                Some(e.to_string())),
        }
    };

    Message::QueryResponse {
        query_id: job.query_id,
        origin: job.origin,
        payload: payload,
        error: error,
    }
}
