use wire::{Message, MetadataKind, QueryPayload, RecordRow};

use crate::pool::ConnectionPool;
use crate::reactor::ConnectionId;
use crate::topology::NodeInfo;

use std::collections::HashSet;
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Created,
    Waiting,
    Complete,
}

enum Kind {
    Query,
    Metadata(MetadataKind),
}

/// One coordinator per inflight client request: it knows who was
/// contacted, merges partial responses as they arrive, and sends
/// exactly one reply when the last peer answers, the deadline fires
/// or the client goes away.
pub struct Coordinator {
    id: String,
    client: ConnectionId,
    origin: String,
    kind: Kind,
    outstanding: HashSet<String>,
    rows: Vec<RecordRow>,
    block_ids: Vec<String>,
    spooled: serde_json::Map<String, serde_json::Value>,
    results: serde_json::Map<String, serde_json::Value>,
    missing: Vec<String>,
    deadline: Option<Instant>,
    state: State,
}

impl Coordinator {
    pub fn query(id: &str, client: ConnectionId, origin: &str,
            deadline: Option<Instant>) -> Coordinator {
        Coordinator::new(id, client, origin, Kind::Query, deadline)
    }

    pub fn metadata(id: &str, client: ConnectionId, origin: &str,
            kind: MetadataKind, deadline: Option<Instant>)
            -> Coordinator {
        Coordinator::new(id, client, origin,
            Kind::Metadata(kind), deadline)
    }

    fn new(id: &str, client: ConnectionId, origin: &str, kind: Kind,
            deadline: Option<Instant>) -> Coordinator {
        Coordinator {
            id: id.to_string(),
            client: client,
            origin: origin.to_string(),
            kind: kind,
            outstanding: HashSet::new(),
            rows: Vec::new(),
            block_ids: Vec::new(),
            spooled: serde_json::Map::new(),
            results: serde_json::Map::new(),
            missing: Vec::new(),
            deadline: deadline,
            state: State::Created,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client(&self) -> ConnectionId {
        self.client
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Send the subquery to every destination. A peer that cannot be
    /// reached at all contributes nothing and lands in `missing`
    /// immediately; everyone else is awaited.
    pub fn dispatch(&mut self, destinations: &[NodeInfo],
            message: &Message, pool: &mut ConnectionPool) {
        for node in destinations {
            if let Err(e) = pool.send(&node.addr(), message) {
                warn!("dispatch {} to {} failed: {}",
                    self.id, node, e);
                self.missing.push(node.hostname.clone());
                continue;
            }

            self.expect(&node.hostname);
        }

        self.state = State::Waiting;
    }

    pub fn expect(&mut self, host: &str) {
        self.outstanding.insert(host.to_string());
    }

    pub fn merge_query(&mut self, origin: &str,
            payload: QueryPayload, error: Option<String>) {
        if !self.take_outstanding(origin) {
            return;
        }

        if let Some(error) = error {
            warn!("peer {} failed request {}: {}",
                origin, self.id, error);
            self.missing.push(origin.to_string());
            return;
        }

        match payload {
            QueryPayload::BlockIds(mut ids) =>
                self.block_ids.append(&mut ids),
            QueryPayload::Rows(mut rows) =>
                self.rows.append(&mut rows),
            QueryPayload::Spooled(stats) => {
                match serde_json::to_value(&stats) {
                    Ok(value) => {
                        self.spooled.insert(
                            origin.to_string(), value);
                    },
                    Err(e) => {
                        warn!("unencodable spool stats from {}: {}",
                            origin, e);
                        self.missing.push(origin.to_string());
                    },
                }
            },
            QueryPayload::Aggregate { .. } =>
                warn!("aggregate payload from peer {} dropped",
                    origin),
        }
    }

    pub fn merge_metadata(&mut self, origin: &str,
            result: Option<String>, error: Option<String>) {
        if !self.take_outstanding(origin) {
            return;
        }

        if let Some(error) = error {
            warn!("peer {} failed request {}: {}",
                origin, self.id, error);
            self.missing.push(origin.to_string());
            return;
        }

        let result = result.unwrap_or_else(|| "null".to_string());
        match serde_json::from_str(&result) {
            Ok(value) => {
                self.results.insert(origin.to_string(), value);
            },
            Err(e) => {
                warn!("malformed metadata from {}: {}", origin, e);
                self.missing.push(origin.to_string());
            },
        }
    }

    fn take_outstanding(&mut self, origin: &str) -> bool {
        if self.state != State::Waiting
                || !self.outstanding.remove(origin) {
            warn!("unexpected reply from {} for request {}",
                origin, self.id);
            return false;
        }

        true
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Waiting && self.outstanding.is_empty()
    }

    pub fn expired(&self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }

    /// Client went away; complete without sending anything.
    pub fn cancel(&mut self) {
        self.state = State::Complete;
    }

    /// Terminal transition: peers still outstanding count as empty
    /// replies and are listed in `missing`. Returns the single reply
    /// for the client.
    pub fn finish(&mut self) -> Message {
        for host in self.outstanding.drain() {
            self.missing.push(host);
        }
        self.missing.sort();
        self.missing.dedup();
        self.state = State::Complete;

        match &self.kind {
            Kind::Query => {
                let spooled_json = if self.spooled.is_empty() {
                    None
                } else {
                    Some(serde_json::Value::Object(
                        std::mem::take(&mut self.spooled))
                        .to_string())
                };

                Message::QueryResponse {
                    query_id: self.id.clone(),
                    origin: self.origin.clone(),
                    payload: QueryPayload::Aggregate {
                        rows: std::mem::take(&mut self.rows),
                        block_ids:
                            std::mem::take(&mut self.block_ids),
                        spooled_json: spooled_json,
                        missing: self.missing.clone(),
                    },
                    error: None,
                }
            },
            Kind::Metadata(kind) => {
                let result = serde_json::Value::Object(
                    std::mem::take(&mut self.results)).to_string();

                Message::MetadataResponse {
                    request_id: self.id.clone(),
                    origin: self.origin.clone(),
                    kind: *kind,
                    result: Some(result),
                    error: None,
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wire::SpoolStats;

    fn waiting_query(hosts: &[&str]) -> Coordinator {
        let mut coordinator =
            Coordinator::query("node1-1", 5, "node1", None);
        for host in hosts {
            coordinator.expect(host);
        }
        coordinator.state = State::Waiting;
        coordinator
    }

    fn row(host: &str) -> RecordRow {
        RecordRow {
            filesystem: "weather".to_string(),
            path: format!("/data/{}/x.blk", host),
            size: 64,
            timestamp_ms: 0,
            geohash: "dr5r".to_string(),
        }
    }

    #[test]
    fn merges_and_completes() {
        let mut coordinator = waiting_query(&["node2", "node3"]);
        assert!(!coordinator.is_complete());

        coordinator.merge_query("node2",
            QueryPayload::Rows(vec![row("node2")]), None);
        assert!(!coordinator.is_complete());

        coordinator.merge_query("node3",
            QueryPayload::Rows(vec![row("node3")]), None);
        assert!(coordinator.is_complete());

        match coordinator.finish() {
            Message::QueryResponse { payload:
                    QueryPayload::Aggregate {
                        rows, missing, .. }, .. } => {
                assert_eq!(rows.len(), 2);
                assert!(missing.is_empty());
            },
            _ => panic!("expected aggregate query response"),
        }
        assert_eq!(coordinator.state(), State::Complete);
    }

    #[test]
    fn timed_out_peers_become_missing() {
        let mut coordinator = waiting_query(&["node2", "node3"]);
        coordinator.merge_query("node3",
            QueryPayload::BlockIds(vec!["dr5r/0-0".to_string()]),
            None);

        match coordinator.finish() {
            Message::QueryResponse { payload:
                    QueryPayload::Aggregate {
                        block_ids, missing, .. }, .. } => {
                assert_eq!(block_ids.len(), 1);
                assert_eq!(missing, vec!["node2".to_string()]);
            },
            _ => panic!("expected aggregate query response"),
        }
    }

    #[test]
    fn peer_error_counts_as_missing() {
        let mut coordinator = waiting_query(&["node2"]);
        coordinator.merge_query("node2",
            QueryPayload::Rows(Vec::new()),
            Some("disk on fire".to_string()));

        assert!(coordinator.is_complete());
        match coordinator.finish() {
            Message::QueryResponse { payload:
                    QueryPayload::Aggregate { missing, .. }, .. } =>
                assert_eq!(missing, vec!["node2".to_string()]),
            _ => panic!("expected aggregate query response"),
        }
    }

    #[test]
    fn unexpected_reply_dropped() {
        let mut coordinator = waiting_query(&["node2"]);
        coordinator.merge_query("node9",
            QueryPayload::Rows(vec![row("node9")]), None);

        assert!(!coordinator.is_complete());
        match coordinator.finish() {
            Message::QueryResponse { payload:
                    QueryPayload::Aggregate { rows, .. }, .. } =>
                assert!(rows.is_empty()),
            _ => panic!("expected aggregate query response"),
        }
    }

    #[test]
    fn spooled_replies_keyed_by_host() {
        let mut coordinator = waiting_query(&["node2", "node3"]);
        for host in &["node2", "node3"] {
            coordinator.merge_query(host,
                QueryPayload::Spooled(SpoolStats {
                    path: format!("/data/{}/spool.json", host),
                    size: 128,
                    count: 2,
                }), None);
        }

        match coordinator.finish() {
            Message::QueryResponse { payload:
                    QueryPayload::Aggregate {
                        spooled_json: Some(json), .. }, .. } => {
                let value: serde_json::Value =
                    serde_json::from_str(&json).unwrap();
                assert_eq!(value["node2"]["count"], 2);
                assert_eq!(value["node3"]["size"], 128);
            },
            _ => panic!("expected spooled aggregate"),
        }
    }

    #[test]
    fn metadata_merge_keyed_by_host() {
        let mut coordinator = Coordinator::metadata("node1-2", 5,
            "node1", MetadataKind::Overview, None);
        coordinator.expect("node2");
        coordinator.state = State::Waiting;

        coordinator.merge_metadata("node2",
            Some(r#"{"weather":{"block_count":3}}"#.to_string()),
            None);

        match coordinator.finish() {
            Message::MetadataResponse { result: Some(result), .. } => {
                let value: serde_json::Value =
                    serde_json::from_str(&result).unwrap();
                assert_eq!(
                    value["node2"]["weather"]["block_count"], 3);
            },
            _ => panic!("expected metadata response"),
        }
    }

    #[test]
    fn cancel_completes_without_reply() {
        let mut coordinator = waiting_query(&["node2"]);
        coordinator.cancel();
        assert_eq!(coordinator.state(), State::Complete);
    }
}
