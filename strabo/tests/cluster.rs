use wire::{Block, Coordinate, Feature, FeatureValue,
    FilesystemAction, FilesystemDescriptor, Message, MetadataKind,
    QueryPayload, QuerySpec, TemporalType};

use strabo::filesystem::FilesystemManager;
use strabo::node::{Environment, Node};
use strabo::reactor::Reactor;
use strabo::topology::{Group, NetworkTopology, NodeInfo};

use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

// 2023-06-15T12:00:00Z
const NOON: i64 = 1686830400000;

fn spawn_node(hostname: &str, listener: TcpListener,
        topology: Arc<NetworkTopology>, directory: &Path,
        query_timeout: Duration) {
    let environment = Environment {
        hostname: hostname.to_string(),
        port: listener.local_addr().unwrap().port(),
        query_timeout: query_timeout,
        worker_threads: 2,
    };

    let filesystems = FilesystemManager::open(directory).unwrap();

    let mut reactor = Reactor::new();
    let _ = reactor.listen(listener);
    let _ = reactor.spawn_ticker(Duration::from_millis(50));

    let mut node = Node::new(environment, topology,
        filesystems, reactor.sender());

    std::thread::spawn(move || {
        reactor.run(&mut node);
    });
}

// accepts connections and reads frames without ever replying
fn spawn_unresponsive(listener: TcpListener) {
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(_) => break,
            };

            std::thread::spawn(move || {
                let mut buffer = [0u8; 4096];
                while let Ok(count) = stream.read(&mut buffer) {
                    if count == 0 {
                        break;
                    }
                }
            });
        }
    });
}

fn descriptor() -> FilesystemDescriptor {
    FilesystemDescriptor {
        name: "weather".to_string(),
        spatial_precision: 4,
        temporal_type: TemporalType::Day,
        nodes_per_group: 1,
        feature_schema: Vec::new(),
        spatial_hint: None,
    }
}

fn block(lat: f64, lon: f64) -> Block {
    Block {
        filesystem: "weather".to_string(),
        metadata: wire::Metadata {
            timestamp_ms: NOON,
            spatial: Some(Coordinate::new(lat, lon)),
            features: vec!(Feature::new("temperature",
                FeatureValue::Double(21.5))),
        },
        payload: vec![7u8; 128],
    }
}

fn world_query(interactive: bool, dry_run: bool) -> QuerySpec {
    QuerySpec {
        filesystem: "weather".to_string(),
        polygon: Some(vec!(
            Coordinate::new(-89.0, -179.0),
            Coordinate::new(-89.0, 179.0),
            Coordinate::new(89.0, 179.0),
            Coordinate::new(89.0, -179.0),
        )),
        time: None,
        feature_predicates: Vec::new(),
        metadata_predicates: Vec::new(),
        interactive: interactive,
        dry_run: dry_run,
    }
}

fn request(stream: &mut TcpStream, message: &Message) -> Message {
    wire::write_message(message, stream).unwrap();
    wire::read_message(stream).unwrap()
}

/// Fan-out with one unresponsive peer: contributions from the two
/// live nodes arrive, the dead host lands in `missing`, and the
/// reply comes back within the configured deadline.
#[test]
fn query_fan_out_with_partial_failure() {
    let _ = env_logger::builder().is_test(true).try_init();

    // three groups of one node each; 127.0.0.3 never answers
    let listeners: Vec<TcpListener> = (2..5)
        .map(|octet| TcpListener::bind(
            format!("127.0.0.{}:0", octet)).unwrap())
        .collect();

    let groups: Vec<Group> = listeners.iter().enumerate()
        .map(|(index, listener)| Group {
            name: format!("g{}", index),
            nodes: vec!(NodeInfo::new(
                &format!("127.0.0.{}", index + 2),
                listener.local_addr().unwrap().port())),
        })
        .collect();
    let topology = Arc::new(NetworkTopology::new(groups));

    let directories: Vec<tempfile::TempDir> = (0..3)
        .map(|_| tempfile::tempdir().unwrap())
        .collect();

    let mut listeners = listeners.into_iter();
    spawn_node("127.0.0.2", listeners.next().unwrap(),
        topology.clone(), directories[0].path(),
        Duration::from_secs(2));
    spawn_unresponsive(listeners.next().unwrap());
    spawn_node("127.0.0.4", listeners.next().unwrap(),
        topology.clone(), directories[2].path(),
        Duration::from_secs(2));

    let entry = topology.groups()[0].nodes[0].clone();
    let mut client =
        TcpStream::connect(entry.addr()).unwrap();

    // create the filesystem everywhere, then place one block on
    // each live node: the "gbsu" cell hashes to group 0, "dr5r"
    // to group 2
    wire::write_message(&Message::FilesystemRequest {
        action: FilesystemAction::Create,
        descriptor: descriptor(),
    }, &mut client).unwrap();
    std::thread::sleep(Duration::from_millis(800));

    wire::write_message(&Message::StorageRequest {
        block: block(48.6, -4.4),
    }, &mut client).unwrap();
    wire::write_message(&Message::StorageRequest {
        block: block(40.7, -74.0),
    }, &mut client).unwrap();
    std::thread::sleep(Duration::from_millis(800));

    // interactive query over the whole world
    let started = Instant::now();
    let reply = request(&mut client, &Message::QueryRequest {
        query: world_query(true, false),
    });
    let elapsed = started.elapsed();

    match reply {
        Message::QueryResponse { payload: QueryPayload::Aggregate {
                rows, missing, .. }, error: None, .. } => {
            assert_eq!(rows.len(), 2);
            let mut geohashes: Vec<String> = rows.iter()
                .map(|row| row.geohash.clone()).collect();
            geohashes.sort();
            assert_eq!(geohashes, vec!["dr5r", "gbsu"]);
            assert_eq!(missing, vec!["127.0.0.3".to_string()]);
        },
        x => panic!("unexpected reply {:?}", x),
    }

    // one reply, after the deadline but not long after
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_secs(10));

    // dry run returns block identifiers only
    let reply = request(&mut client, &Message::QueryRequest {
        query: world_query(false, true),
    });
    match reply {
        Message::QueryResponse { payload: QueryPayload::Aggregate {
                rows, block_ids, missing, .. }, .. } => {
            assert!(rows.is_empty());
            assert_eq!(block_ids.len(), 2);
            assert_eq!(missing, vec!["127.0.0.3".to_string()]);
        },
        x => panic!("unexpected reply {:?}", x),
    }

    wire::write_message(&Message::Shutdown, &mut client).unwrap();
}

fn parse_result(reply: &Message) -> serde_json::Value {
    match reply {
        Message::MetadataResponse { result: Some(result), .. } =>
            serde_json::from_str(result).unwrap(),
        x => panic!("unexpected reply {:?}", x),
    }
}

/// CREATE propagates to every node, DELETE removes state and the
/// on-disk directory, and a restarted registry reflects the delete.
#[test]
fn filesystem_lifecycle() {
    let _ = env_logger::builder().is_test(true).try_init();

    let listeners: Vec<TcpListener> = (6..8)
        .map(|octet| TcpListener::bind(
            format!("127.0.0.{}:0", octet)).unwrap())
        .collect();

    let groups: Vec<Group> = listeners.iter().enumerate()
        .map(|(index, listener)| Group {
            name: format!("g{}", index),
            nodes: vec!(NodeInfo::new(
                &format!("127.0.0.{}", index + 6),
                listener.local_addr().unwrap().port())),
        })
        .collect();
    let topology = Arc::new(NetworkTopology::new(groups));

    let directories: Vec<tempfile::TempDir> = (0..2)
        .map(|_| tempfile::tempdir().unwrap())
        .collect();

    for (index, listener) in listeners.into_iter().enumerate() {
        spawn_node(&format!("127.0.0.{}", index + 6), listener,
            topology.clone(), directories[index].path(),
            Duration::from_secs(5));
    }

    let entry = topology.groups()[0].nodes[0].clone();
    let mut client = TcpStream::connect(entry.addr()).unwrap();

    // broadcast create, then poll until every node reports it
    wire::write_message(&Message::FilesystemRequest {
        action: FilesystemAction::Create,
        descriptor: descriptor(),
    }, &mut client).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let reply = request(&mut client, &Message::MetadataRequest {
            kind: MetadataKind::Filesystem,
            filesystem: None,
        });

        let result = parse_result(&reply);
        let present = ["127.0.0.6", "127.0.0.7"].iter()
            .all(|host| !result[*host]["weather"].is_null());
        if present {
            break;
        }

        assert!(Instant::now() < deadline,
            "create never propagated: {}", result);
        std::thread::sleep(Duration::from_millis(200));
    }

    for directory in &directories {
        assert!(directory.path().join("weather").exists());
    }

    // broadcast delete, poll until every node reports it gone
    wire::write_message(&Message::FilesystemRequest {
        action: FilesystemAction::Delete,
        descriptor: descriptor(),
    }, &mut client).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let reply = request(&mut client, &Message::MetadataRequest {
            kind: MetadataKind::Filesystem,
            filesystem: None,
        });

        let result = parse_result(&reply);
        let absent = ["127.0.0.6", "127.0.0.7"].iter()
            .all(|host| result[*host]["weather"].is_null());
        if absent {
            break;
        }

        assert!(Instant::now() < deadline,
            "delete never propagated: {}", result);
        std::thread::sleep(Duration::from_millis(200));
    }

    for directory in &directories {
        assert!(!directory.path().join("weather").exists());
    }

    // a registry reopened from the same directory reflects the
    // delete
    let restored =
        FilesystemManager::open(directories[0].path()).unwrap();
    assert!(restored.get("weather").is_none());

    wire::write_message(&Message::Shutdown, &mut client).unwrap();
}
