use crossbeam_channel::Sender;
use wire::{Block, Coordinate, FilesystemAction, FilesystemDescriptor,
    Message, Metadata, MetadataKind, QueryPayload, QuerySpec};

use crate::coordinator::Coordinator;
use crate::error::{Error, Result};
use crate::filesystem::FilesystemManager;
use crate::geohash;
use crate::partition::Partitioner;
use crate::pool::ConnectionPool;
use crate::reactor::{ConnectionId, Connections, Event, EventHandler};
use crate::topology::{NetworkTopology, NodeInfo};
use crate::worker::{ScanJob, WorkerPool};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

// outbound connections unused this long are evicted on a tick
const POOL_IDLE_LIMIT: Duration = Duration::from_secs(300);

/// Everything the orchestrator needs from the outside world, passed
/// in explicitly so tests can supply their own.
pub struct Environment {
    pub hostname: String,
    pub port: u16,
    pub query_timeout: Duration,
    pub worker_threads: usize,
}

/// The storage node orchestrator: owns the filesystem registry, the
/// outbound pool, the worker pool and the coordinator map, and
/// handles every request kind on the dispatch loop.
pub struct Node {
    environment: Environment,
    topology: Arc<NetworkTopology>,
    partitioner: Partitioner,
    filesystems: FilesystemManager,
    pool: ConnectionPool,
    workers: WorkerPool,
    coordinators: HashMap<String, Coordinator>,
    sequence: u64,
}

impl Node {
    pub fn new(environment: Environment,
            topology: Arc<NetworkTopology>,
            filesystems: FilesystemManager,
            events: Sender<Event>) -> Node {
        Node {
            partitioner: Partitioner::new(topology.clone()),
            pool: ConnectionPool::new(events.clone()),
            workers: WorkerPool::new(
                environment.worker_threads, events),
            environment: environment,
            topology: topology,
            filesystems: filesystems,
            coordinators: HashMap::new(),
            sequence: 0,
        }
    }

    fn next_request_id(&mut self) -> String {
        self.sequence += 1;
        format!("{}-{}", self.environment.hostname, self.sequence)
    }

    fn handle_message(&mut self, conn: ConnectionId,
            message: Message, connections: &mut Connections,
            sender: &Sender<Event>) -> Result<()> {
        match message {
            Message::StorageRequest { block } => {
                trace!("StorageRequest on connection {}", conn);
                self.handle_storage_request(block)
            },
            Message::StorageEvent { block } => {
                trace!("StorageEvent on connection {}", conn);
                self.handle_storage_event(block)
            },
            Message::QueryRequest { query } => {
                trace!("QueryRequest on connection {}", conn);
                self.handle_query_request(conn, query, connections)
            },
            Message::QueryEvent { query_id, origin, query } => {
                trace!("QueryEvent {} from {}", query_id, origin);
                self.handle_query_event(conn, query_id, query,
                    connections)
            },
            Message::QueryResponse { query_id, origin, payload,
                    error } => {
                trace!("QueryResponse {} from {}", query_id, origin);
                self.handle_query_response(query_id, origin,
                    payload, error, connections);
                Ok(())
            },
            Message::MetadataRequest { kind, filesystem } => {
                trace!("MetadataRequest on connection {}", conn);
                self.handle_metadata_request(conn, kind, filesystem,
                    connections)
            },
            Message::MetadataEvent { request_id, origin, kind,
                    filesystem } => {
                trace!("MetadataEvent {} from {}",
                    request_id, origin);
                self.handle_metadata_event(conn, request_id, kind,
                    filesystem, connections)
            },
            Message::MetadataResponse { request_id, origin, result,
                    error, .. } => {
                trace!("MetadataResponse {} from {}",
                    request_id, origin);
                self.handle_metadata_response(request_id, origin,
                    result, error, connections);
                Ok(())
            },
            Message::FilesystemRequest { action, descriptor } => {
                trace!("FilesystemRequest on connection {}", conn);
                self.handle_filesystem_request(action, descriptor)
            },
            Message::FilesystemEvent { action, descriptor } => {
                trace!("FilesystemEvent on connection {}", conn);
                self.handle_filesystem_event(action, descriptor)
            },
            Message::Shutdown => {
                info!("shutdown requested on connection {}", conn);
                let _ = sender.send(Event::Shutdown);
                Ok(())
            },
        }
    }

    /// Route the block to its one destination; the receiving side
    /// never stores locally.
    fn handle_storage_request(&mut self, mut block: Block)
            -> Result<()> {
        let descriptor =
            match self.filesystems.get(&block.filesystem) {
                Some(filesystem) => filesystem.descriptor().clone(),
                None => return Err(Error::NotFound(format!(
                    "filesystem '{}'", block.filesystem))),
            };

        derive_spatial(&descriptor, &mut block.metadata)?;
        let destination = self.partitioner
            .locate_data(&block.metadata, &descriptor)?;

        self.pool.send(&destination.addr(),
            &Message::StorageEvent { block: block })
    }

    /// The placed block arrives at its destination; hand it to the
    /// local filesystem.
    fn handle_storage_event(&mut self, mut block: Block)
            -> Result<()> {
        let descriptor =
            match self.filesystems.get(&block.filesystem) {
                Some(filesystem) => filesystem.descriptor().clone(),
                None => return Err(Error::NotFound(format!(
                    "filesystem '{}'", block.filesystem))),
            };

        derive_spatial(&descriptor, &mut block.metadata)?;
        let spatial = block.metadata.spatial
            .as_ref().unwrap().clone();
        let cell = geohash::encode(&spatial,
            descriptor.spatial_precision as usize)?;

        let filesystem = self.filesystems
            .get_mut(&block.filesystem).unwrap();
        filesystem.store_mut().store(&block, &cell)?;
        Ok(())
    }

    fn handle_query_request(&mut self, conn: ConnectionId,
            query: QuerySpec, connections: &mut Connections)
            -> Result<()> {
        let id = self.next_request_id();

        let descriptor =
            match self.filesystems.get(&query.filesystem) {
                Some(filesystem) => filesystem.descriptor().clone(),
                None => {
                    reply_query_error(connections, conn, &id,
                        &self.environment.hostname, &format!(
                            "unknown filesystem '{}'",
                            query.filesystem));
                    return Ok(());
                },
            };

        if let Err(e) = validate_query(&query) {
            reply_query_error(connections, conn, &id,
                &self.environment.hostname, &e.to_string());
            return Ok(());
        }

        let destinations = match self.partitioner.find_destinations(
                query.polygon.as_deref(), query.time.as_ref(),
                &descriptor) {
            Ok(destinations) => destinations,
            Err(e) => {
                reply_query_error(connections, conn, &id,
                    &self.environment.hostname, &e.to_string());
                return Ok(());
            },
        };

        let event = Message::QueryEvent {
            query_id: id.clone(),
            origin: self.environment.hostname.clone(),
            query: query,
        };

        let deadline =
            Instant::now() + self.environment.query_timeout;
        let mut coordinator = Coordinator::query(&id, conn,
            &self.environment.hostname, Some(deadline));
        coordinator.dispatch(&destinations, &event, &mut self.pool);

        self.conclude(coordinator, connections);
        Ok(())
    }

    /// Match local blocks and offload the scan; the reply returns on
    /// this same connection once the worker finishes.
    fn handle_query_event(&mut self, conn: ConnectionId,
            query_id: String, query: QuerySpec,
            connections: &mut Connections) -> Result<()> {
        let hostname = self.environment.hostname.clone();

        let filesystem = match self.filesystems.get(&query.filesystem)
                {
            Some(filesystem) => filesystem,
            None => {
                reply_query_error(connections, conn, &query_id,
                    &hostname, &format!("unknown filesystem '{}'",
                        query.filesystem));
                return Ok(());
            },
        };

        let entries = match filesystem.store().match_blocks(&query) {
            Ok(entries) => entries,
            Err(e) => {
                reply_query_error(connections, conn, &query_id,
                    &hostname, &e.to_string());
                return Ok(());
            },
        };

        let job = ScanJob {
            conn: conn,
            query_id: query_id.clone(),
            origin: hostname.clone(),
            dry_run: query.dry_run,
            interactive: query.interactive,
            block_ids: entries.iter()
                .map(|entry| entry.id.clone()).collect(),
            rows: filesystem.store()
                .rows(&query.filesystem, &entries),
            spool_path: filesystem.spool_path(&query_id),
        };

        if let Err(e) = self.workers.submit(job) {
            reply_query_error(connections, conn, &query_id,
                &hostname, &e.to_string());
        }

        Ok(())
    }

    fn handle_query_response(&mut self, query_id: String,
            origin: String, payload: QueryPayload,
            error: Option<String>, connections: &mut Connections) {
        let coordinator =
            match self.coordinators.get_mut(&query_id) {
                Some(coordinator) => coordinator,
                None => {
                    warn!("response for unknown query id '{}' \
                        dropped", query_id);
                    return;
                },
            };

        coordinator.merge_query(&origin, payload, error);
        if coordinator.is_complete() {
            let coordinator =
                self.coordinators.remove(&query_id).unwrap();
            self.conclude(coordinator, connections);
        }
    }

    fn handle_metadata_request(&mut self, conn: ConnectionId,
            kind: MetadataKind, filesystem: Option<String>,
            connections: &mut Connections) -> Result<()> {
        let id = self.next_request_id();
        let destinations: Vec<NodeInfo> = self.topology.all_nodes()
            .into_iter().cloned().collect();

        let event = Message::MetadataEvent {
            request_id: id.clone(),
            origin: self.environment.hostname.clone(),
            kind: kind,
            filesystem: filesystem,
        };

        let deadline =
            Instant::now() + self.environment.query_timeout;
        let mut coordinator = Coordinator::metadata(&id, conn,
            &self.environment.hostname, kind, Some(deadline));
        coordinator.dispatch(&destinations, &event, &mut self.pool);

        self.conclude(coordinator, connections);
        Ok(())
    }

    fn handle_metadata_event(&mut self, conn: ConnectionId,
            request_id: String, kind: MetadataKind,
            filesystem: Option<String>,
            connections: &mut Connections) -> Result<()> {
        let reply = match self.local_metadata(kind,
                filesystem.as_deref()) {
            Ok(result) => Message::MetadataResponse {
                request_id: request_id,
                origin: self.environment.hostname.clone(),
                kind: kind,
                result: Some(result.to_string()),
                error: None,
            },
            Err(e) => Message::MetadataResponse {
                request_id: request_id,
                origin: self.environment.hostname.clone(),
                kind: kind,
                result: None,
                error: Some(e.to_string()),
            },
        };

        if let Err(e) = connections.send(conn, &reply) {
            warn!("metadata reply on connection {} failed: {}",
                conn, e);
        }

        Ok(())
    }

    fn handle_metadata_response(&mut self, request_id: String,
            origin: String, result: Option<String>,
            error: Option<String>, connections: &mut Connections) {
        let coordinator =
            match self.coordinators.get_mut(&request_id) {
                Some(coordinator) => coordinator,
                None => {
                    warn!("response for unknown request id '{}' \
                        dropped", request_id);
                    return;
                },
            };

        coordinator.merge_metadata(&origin, result, error);
        if coordinator.is_complete() {
            let coordinator =
                self.coordinators.remove(&request_id).unwrap();
            self.conclude(coordinator, connections);
        }
    }

    /// Admin changes reach every node, this one included, through
    /// the same event broadcast.
    fn handle_filesystem_request(&mut self,
            action: FilesystemAction,
            descriptor: FilesystemDescriptor) -> Result<()> {
        validate_descriptor(&descriptor)?;

        let event = Message::FilesystemEvent {
            action: action,
            descriptor: descriptor,
        };

        let topology = self.topology.clone();
        for node in topology.all_nodes() {
            if let Err(e) = self.pool.send(&node.addr(), &event) {
                warn!("filesystem broadcast to {} failed: {}",
                    node, e);
            }
        }

        Ok(())
    }

    fn handle_filesystem_event(&mut self, action: FilesystemAction,
            descriptor: FilesystemDescriptor) -> Result<()> {
        match action {
            FilesystemAction::Create => {
                validate_descriptor(&descriptor)?;
                info!("creating filesystem '{}'", descriptor.name);
                self.filesystems.create(descriptor)
            },
            FilesystemAction::Delete => {
                info!("deleting filesystem '{}'", descriptor.name);
                self.filesystems.delete(&descriptor.name)
            },
        }
    }

    // if the coordinator is already complete the reply goes out now,
    // otherwise it waits in the map for responses or the deadline
    fn conclude(&mut self, mut coordinator: Coordinator,
            connections: &mut Connections) {
        if !coordinator.is_complete() {
            self.coordinators.insert(
                coordinator.id().to_string(), coordinator);
            return;
        }

        let client = coordinator.client();
        let reply = coordinator.finish();
        if let Err(e) = connections.send(client, &reply) {
            warn!("reply for request {} on connection {} failed: {}",
                coordinator.id(), client, e);
        }
    }

    fn handle_tick(&mut self, connections: &mut Connections) {
        self.pool.sweep_idle(POOL_IDLE_LIMIT);

        let now = Instant::now();
        let expired: Vec<String> = self.coordinators.iter()
            .filter(|(_, coordinator)| coordinator.expired(now))
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            warn!("request {} hit its deadline", id);
            let mut coordinator =
                self.coordinators.remove(&id).unwrap();
            let client = coordinator.client();
            let reply = coordinator.finish();
            if let Err(e) = connections.send(client, &reply) {
                warn!("reply for request {} on connection {} \
                    failed: {}", id, client, e);
            }
        }
    }

    fn handle_closed(&mut self, conn: ConnectionId) {
        let cancelled: Vec<String> = self.coordinators.iter()
            .filter(|(_, coordinator)| coordinator.client() == conn)
            .map(|(id, _)| id.clone())
            .collect();

        for id in cancelled {
            info!("client gone, cancelling request {}", id);
            if let Some(mut coordinator) =
                    self.coordinators.remove(&id) {
                coordinator.cancel();
            }
        }
    }

    fn local_metadata(&self, kind: MetadataKind,
            filesystem: Option<&str>)
            -> Result<serde_json::Value> {
        let mut result = serde_json::Map::new();
        for (name, handle) in self.filesystems.iter() {
            if let Some(filter) = filesystem {
                if name != filter {
                    continue;
                }
            }

            let value = match kind {
                MetadataKind::Filesystem =>
                    serde_json::to_value(handle.descriptor())?,
                MetadataKind::Features => serde_json::to_value(
                    &handle.descriptor().feature_schema)?,
                MetadataKind::Overview => {
                    let summary = handle.store().summary();
                    serde_json::json!({
                        "block_count": summary.block_count,
                        "extents": summary.extents,
                        "time_range": summary.time_range,
                    })
                },
            };

            result.insert(name.clone(), value);
        }

        if let Some(filter) = filesystem {
            if result.is_empty() {
                return Err(Error::NotFound(format!(
                    "filesystem '{}'", filter)));
            }
        }

        Ok(serde_json::Value::Object(result))
    }
}

impl EventHandler for Node {
    fn handle(&mut self, event: Event,
            connections: &mut Connections,
            sender: &Sender<Event>) -> Result<()> {
        match event {
            Event::Message { conn, message } =>
                self.handle_message(conn, message, connections,
                    sender),
            Event::Tick => {
                self.handle_tick(connections);
                Ok(())
            },
            Event::Closed { conn } => {
                self.handle_closed(conn);
                Ok(())
            },
            Event::Shutdown => {
                self.pool.drain();
                Ok(())
            },
            _ => Ok(()),
        }
    }
}

fn reply_query_error(connections: &mut Connections,
        conn: ConnectionId, query_id: &str, origin: &str,
        error: &str) {
    let reply = Message::QueryResponse {
        query_id: query_id.to_string(),
        origin: origin.to_string(),
        payload: QueryPayload::Rows(Vec::new()),
        error: Some(error.to_string()),
    };

    if let Err(e) = connections.send(conn, &reply) {
        warn!("error reply on connection {} failed: {}", conn, e);
    }
}

// records without explicit coordinates fall back to the features
// named by the filesystem's spatial hint
fn derive_spatial(descriptor: &FilesystemDescriptor,
        metadata: &mut Metadata) -> Result<()> {
    if metadata.spatial.is_some() {
        return Ok(());
    }

    let hint = match &descriptor.spatial_hint {
        Some(hint) => hint,
        None => return Err(Error::Validation(format!(
            "no coordinates and no spatial hint in '{}'",
            descriptor.name))),
    };

    let lat = metadata.feature(&hint.lat_name)
        .and_then(|value| value.numeric());
    let lon = metadata.feature(&hint.lon_name)
        .and_then(|value| value.numeric());

    match (lat, lon) {
        (Some(lat), Some(lon)) => {
            metadata.spatial = Some(Coordinate::new(lat, lon));
            Ok(())
        },
        _ => Err(Error::Validation(format!(
            "features '{}'/'{}' missing or non numeric",
            hint.lat_name, hint.lon_name))),
    }
}

fn validate_descriptor(descriptor: &FilesystemDescriptor)
        -> Result<()> {
    if descriptor.name.is_empty()
            || descriptor.name.contains('/')
            || descriptor.name.contains("..") {
        return Err(Error::Validation(format!(
            "invalid filesystem name '{}'", descriptor.name)));
    }

    if descriptor.spatial_precision < 1
            || descriptor.spatial_precision
                > geohash::MAX_PRECISION as u8 {
        return Err(Error::Validation(format!(
            "spatial precision {} outside [1, {}]",
            descriptor.spatial_precision, geohash::MAX_PRECISION)));
    }

    if descriptor.nodes_per_group == 0 {
        return Err(Error::Validation(
            "nodes per group must be positive".to_string()));
    }

    Ok(())
}

fn validate_query(query: &QuerySpec) -> Result<()> {
    if let Some(polygon) = &query.polygon {
        if polygon.is_empty() {
            return Err(Error::Validation(
                "empty query polygon".to_string()));
        }
    }

    if let Some(window) = &query.time {
        if window.end_ms < window.start_ms {
            return Err(Error::Validation(
                "query window ends before it starts".to_string()));
        }
    }

    Ok(())
}
