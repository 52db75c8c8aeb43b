//! Shared mock device for integration tests.
//!
//! Hosts an in-memory FAT-like filesystem behind the wire protocol and
//! wires it to a [`SysexClient`] through in-process channels. Options
//! cover reply fragmentation, artificial latency, and scripted error
//! codes per command.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use smsysex_core::fat;
use smsysex_core::protocol::{self, Envelope, FileEntry, MessageKind};
use smsysex_core::{ChannelSink, EngineConfig, SysexClient};

/// In-memory filesystem the mock device serves.
#[derive(Debug, Default)]
pub struct MockFs {
    pub dirs: HashSet<String>,
    pub files: HashMap<String, Vec<u8>>,
}

impl MockFs {
    pub fn with_root() -> Self {
        let mut fs = Self::default();
        fs.dirs.insert("/".to_string());
        fs
    }

    pub fn add_dir(&mut self, path: &str) {
        self.dirs.insert(path.to_string());
    }

    pub fn add_file(&mut self, path: &str, data: &[u8]) {
        self.files.insert(path.to_string(), data.to_vec());
    }

    fn children(&self, dir: &str) -> Vec<FileEntry> {
        let mut entries = Vec::new();
        for path in &self.dirs {
            if path != "/" && parent(path) == dir {
                entries.push(FileEntry {
                    name: name(path).to_string(),
                    size: 0,
                    attr: fat::ATTR_DIRECTORY,
                    date: 0,
                    time: 0,
                });
            }
        }
        for (path, data) in &self.files {
            if parent(path) == dir {
                entries.push(FileEntry {
                    name: name(path).to_string(),
                    size: data.len() as u64,
                    attr: fat::ATTR_ARCHIVE,
                    date: 0,
                    time: 0,
                });
            }
        }
        // deliberately unsorted; ordering is the host's job
        entries
    }
}

fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(index) => &path[..index],
    }
}

fn name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Behavior knobs for the mock device.
#[derive(Debug, Clone, Default)]
pub struct DeviceOptions {
    /// Deliver replies in pieces of this many bytes
    pub fragment: Option<usize>,
    /// Sleep before answering each request
    pub reply_delay: Option<Duration>,
}

/// Handle to the spawned device task's state.
pub struct MockDevice {
    pub fs: Arc<Mutex<MockFs>>,
    /// Scripted error codes, popped per command key before normal handling
    pub failures: Arc<Mutex<HashMap<String, VecDeque<u32>>>>,
}

impl MockDevice {
    /// Queue error codes the device returns for the next calls of `key`.
    pub fn fail_next(&self, key: &str, codes: &[u32]) {
        self.failures
            .lock()
            .entry(key.to_string())
            .or_default()
            .extend(codes);
    }
}

/// Install a test log subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Build a client wired to a freshly spawned mock device.
pub fn mock_client(config: EngineConfig, options: DeviceOptions) -> (Arc<SysexClient>, MockDevice) {
    let (sink, mut outbound_rx) = ChannelSink::new();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let fs = Arc::new(Mutex::new(MockFs::with_root()));
    let failures = Arc::new(Mutex::new(HashMap::new()));
    let device = MockDevice {
        fs: Arc::clone(&fs),
        failures: Arc::clone(&failures),
    };

    tokio::spawn(async move {
        let mut handles: HashMap<u32, String> = HashMap::new();
        let mut next_fid = 1u32;
        while let Some(bytes) = outbound_rx.recv().await {
            if let Some(delay) = options.reply_delay {
                tokio::time::sleep(delay).await;
            }
            let envelope = protocol::decode(&bytes).expect("decode host request");
            let (body, binary) =
                handle_command(&fs, &failures, &mut handles, &mut next_fid, &envelope);
            let reply = protocol::encode_raw(
                MessageKind::JsonReply,
                envelope.msg_id,
                body.to_string().as_bytes(),
                binary.as_deref(),
            );
            let delivered = match options.fragment {
                Some(size) => reply
                    .chunks(size)
                    .all(|piece| inbound_tx.send(piece.to_vec()).is_ok()),
                None => inbound_tx.send(reply).is_ok(),
            };
            if !delivered {
                return;
            }
        }
    });

    let (client, _events) = SysexClient::new(Box::new(sink), inbound_rx, config);
    (Arc::new(client), device)
}

fn wrap(key: &str, inner: Value) -> Value {
    let mut map = Map::new();
    map.insert(format!("^{key}"), inner);
    Value::Object(map)
}

#[allow(clippy::too_many_lines)]
fn handle_command(
    fs: &Mutex<MockFs>,
    failures: &Mutex<HashMap<String, VecDeque<u32>>>,
    handles: &mut HashMap<u32, String>,
    next_fid: &mut u32,
    envelope: &Envelope,
) -> (Value, Option<Vec<u8>>) {
    let key = envelope
        .body
        .as_object()
        .and_then(|map| map.keys().next())
        .cloned()
        .expect("single-key command body");
    let args = envelope.body.get(&key).cloned().unwrap_or(Value::Null);

    if let Some(code) = failures
        .lock()
        .get_mut(&key)
        .and_then(VecDeque::pop_front)
    {
        return (wrap(&key, json!({"err": code})), None);
    }

    let str_arg = |field: &str| args.get(field).and_then(Value::as_str).unwrap_or("").to_string();
    let num_arg = |field: &str| args.get(field).and_then(Value::as_u64).unwrap_or(0);

    match key.as_str() {
        "session" => (
            wrap(&key, json!({"sid": 1, "midMin": 0x40, "midMax": 0x47})),
            None,
        ),
        "ping" => (wrap(&key, json!({"err": 0})), None),
        "dir" => {
            let path = str_arg("path");
            let offset = num_arg("offset") as usize;
            let lines = num_arg("lines") as usize;
            let fs = fs.lock();
            if !fs.dirs.contains(&path) {
                return (wrap(&key, json!({"err": 5})), None);
            }
            let page: Vec<FileEntry> = fs
                .children(&path)
                .into_iter()
                .skip(offset)
                .take(lines)
                .collect();
            let list = serde_json::to_value(page).expect("serialize listing");
            (wrap(&key, json!({"list": list, "err": 0})), None)
        }
        "open" => {
            let path = str_arg("path");
            let write = num_arg("write");
            let mut fs = fs.lock();
            let size = if write == 1 {
                if !fs.dirs.contains(parent(&path)) {
                    return (wrap(&key, json!({"err": 5})), None);
                }
                fs.files.insert(path.clone(), Vec::new());
                0
            } else {
                match fs.files.get(&path) {
                    Some(data) => data.len() as u64,
                    None => return (wrap(&key, json!({"err": 4})), None),
                }
            };
            let fid = *next_fid;
            *next_fid += 1;
            handles.insert(fid, path);
            (wrap(&key, json!({"fid": fid, "size": size, "err": 0})), None)
        }
        "write" => {
            let fid = num_arg("fid") as u32;
            let addr = num_arg("addr") as usize;
            let size = num_arg("size") as usize;
            let Some(path) = handles.get(&fid) else {
                return (wrap(&key, json!({"err": 9})), None);
            };
            let mut block = envelope.binary.clone().unwrap_or_default();
            block.truncate(size);
            let mut fs = fs.lock();
            let file = fs.files.entry(path.clone()).or_default();
            if file.len() < addr + block.len() {
                file.resize(addr + block.len(), 0);
            }
            file[addr..addr + block.len()].copy_from_slice(&block);
            (wrap(&key, json!({"err": 0})), None)
        }
        "read" => {
            let fid = num_arg("fid") as u32;
            let addr = num_arg("addr") as usize;
            let size = num_arg("size") as usize;
            let Some(path) = handles.get(&fid) else {
                return (wrap(&key, json!({"err": 9})), None);
            };
            let fs = fs.lock();
            let Some(data) = fs.files.get(path) else {
                return (wrap(&key, json!({"err": 4})), None);
            };
            let end = (addr + size).min(data.len());
            let block = data[addr.min(data.len())..end].to_vec();
            (
                wrap(
                    &key,
                    json!({"fid": fid, "addr": addr, "size": block.len(), "err": 0}),
                ),
                Some(block),
            )
        }
        "close" => {
            handles.remove(&(num_arg("fid") as u32));
            (wrap(&key, json!({"err": 0})), None)
        }
        "delete" => {
            let path = str_arg("path");
            let mut fs = fs.lock();
            if fs.files.remove(&path).is_some() {
                (wrap(&key, json!({"err": 0})), None)
            } else if fs.dirs.contains(&path) {
                let prefix = format!("{path}/");
                fs.dirs
                    .retain(|dir| dir != &path && !dir.starts_with(&prefix));
                fs.files.retain(|file, _| !file.starts_with(&prefix));
                (wrap(&key, json!({"err": 0})), None)
            } else {
                (wrap(&key, json!({"err": 4})), None)
            }
        }
        "mkdir" => {
            let path = str_arg("path");
            let mut fs = fs.lock();
            if fs.dirs.contains(&path) {
                (wrap(&key, json!({"err": 8})), None)
            } else {
                fs.dirs.insert(path);
                (wrap(&key, json!({"err": 0})), None)
            }
        }
        _ => (wrap(&key, json!({"err": 19})), None),
    }
}
