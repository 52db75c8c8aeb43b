//! End-to-end tests of the transfer engine against a mock device.

mod common;

use std::time::Duration;

use common::{mock_client, DeviceOptions};
use smsysex_core::{
    ConflictChoice, DeviceStatus, EngineConfig, Error, ListOptions, TransferEngine, TransferStatus,
    UploadFile, UploadOptions,
};

fn engine_with(
    config: EngineConfig,
    options: DeviceOptions,
) -> (
    TransferEngine,
    tokio::sync::mpsc::UnboundedReceiver<smsysex_core::ConflictRequest>,
    common::MockDevice,
) {
    let (client, device) = mock_client(config.clone(), options);
    let (engine, conflicts) = TransferEngine::new(client, config.transfer, config.retry);
    (engine, conflicts, device)
}

fn upload(name: &str, data: &[u8]) -> UploadFile {
    UploadFile {
        name: name.to_string(),
        data: data.to_vec(),
    }
}

#[tokio::test]
async fn test_listing_sorts_directories_first_then_case_insensitive() {
    let (engine, _conflicts, device) = engine_with(EngineConfig::default(), DeviceOptions::default());
    {
        let mut fs = device.fs.lock();
        fs.add_dir("/KITS");
        fs.add_dir("/A");
        fs.add_file("/b.txt", b"b");
        fs.add_file("/a.txt", b"a");
        fs.add_file("/Zed.wav", b"z");
    }

    let entries = engine
        .list_directory("/", ListOptions::default())
        .await
        .expect("list");
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["A", "KITS", "a.txt", "b.txt", "Zed.wav"]);
    assert_eq!(
        engine.cached_listing("/").expect("cached").len(),
        entries.len()
    );
}

#[tokio::test]
async fn test_listing_paginates_across_pages() {
    let mut config = EngineConfig::default();
    config.transfer.dir_lines = 8;
    let (engine, _conflicts, device) = engine_with(config, DeviceOptions::default());
    {
        let mut fs = device.fs.lock();
        for i in 0..20 {
            fs.add_file(&format!("/f{i:02}.wav"), b"x");
        }
    }

    let entries = engine
        .list_directory("/", ListOptions::default())
        .await
        .expect("list");
    assert_eq!(entries.len(), 20);
}

#[tokio::test]
async fn test_listing_retries_then_succeeds() {
    let mut config = EngineConfig::default();
    config.transfer.dir_retry_delay_ms = 10;
    let (engine, _conflicts, device) = engine_with(config, DeviceOptions::default());
    device.fs.lock().add_file("/one.wav", b"1");
    device.fail_next("dir", &[1]);

    let entries = engine
        .list_directory("/", ListOptions::default())
        .await
        .expect("list after retry");
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn test_listing_falls_back_to_empty_after_retries() {
    let mut config = EngineConfig::default();
    config.transfer.dir_retry_delay_ms = 10;
    let (engine, _conflicts, device) = engine_with(config, DeviceOptions::default());
    device.fs.lock().add_file("/one.wav", b"1");
    device.fail_next("dir", &[1, 1, 1]);

    let entries = engine
        .list_directory("/", ListOptions::default())
        .await
        .expect("degrades, never errors");
    assert!(entries.is_empty());
    assert_eq!(engine.cached_listing("/"), Some(Vec::new()));
}

#[tokio::test]
async fn test_upload_then_download_roundtrip() {
    common::init_tracing();
    let (engine, _conflicts, device) = engine_with(EngineConfig::default(), DeviceOptions::default());
    device.fs.lock().add_dir("/dest");
    engine
        .list_directory("/dest", ListOptions::default())
        .await
        .expect("prime cache");

    let data: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
    let ids = engine
        .upload_files(
            vec![upload("tone.bin", &data)],
            "/dest",
            UploadOptions::default(),
        )
        .await
        .expect("upload");
    assert_eq!(ids.len(), 1);

    let queue = engine.queue().borrow().clone();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].status, TransferStatus::Done);
    assert_eq!(queue[0].bytes_transferred, data.len() as u64);

    assert_eq!(
        device.fs.lock().files.get("/dest/tone.bin"),
        Some(&data),
        "device must hold the uploaded bytes"
    );
    let cached = engine.cached_listing("/dest").expect("cached");
    assert!(cached.iter().any(|e| e.name == "tone.bin"));

    let progress = engine.progress().borrow().clone();
    assert_eq!(progress.bytes_transferred, data.len() as u64);
    assert!((progress.percentage() - 100.0).abs() < f64::EPSILON);

    let downloaded = engine.download_file("/dest/tone.bin").await.expect("download");
    assert_eq!(downloaded, data);
}

#[tokio::test]
async fn test_conflicting_upload_can_be_skipped() {
    let (engine, mut conflicts, device) =
        engine_with(EngineConfig::default(), DeviceOptions::default());
    {
        let mut fs = device.fs.lock();
        fs.add_dir("/dest");
        fs.add_file("/dest/song.wav", b"original");
    }
    engine
        .list_directory("/dest", ListOptions::default())
        .await
        .expect("prime cache");

    tokio::spawn(async move {
        while let Some(request) = conflicts.recv().await {
            assert_eq!(request.name, "song.wav");
            request.resolve(ConflictChoice::Skip);
        }
    });

    let ids = engine
        .upload_files(
            vec![upload("song.wav", b"replacement"), upload("new.wav", b"new")],
            "/dest",
            UploadOptions::default(),
        )
        .await
        .expect("upload");
    assert_eq!(ids.len(), 1, "only the non-conflicting file is queued");

    let fs = device.fs.lock();
    assert_eq!(
        fs.files.get("/dest/song.wav").map(Vec::as_slice),
        Some(b"original".as_slice()),
        "skip must leave the existing file alone"
    );
    assert_eq!(
        fs.files.get("/dest/new.wav").map(Vec::as_slice),
        Some(b"new".as_slice()),
        "sibling uploads must still run"
    );
}

#[tokio::test]
async fn test_conflicting_upload_overwrite_preset() {
    let (engine, _conflicts, device) =
        engine_with(EngineConfig::default(), DeviceOptions::default());
    {
        let mut fs = device.fs.lock();
        fs.add_dir("/dest");
        fs.add_file("/dest/song.wav", b"original");
    }
    engine
        .list_directory("/dest", ListOptions::default())
        .await
        .expect("prime cache");

    let ids = engine
        .upload_files(
            vec![upload("song.wav", b"replacement")],
            "/dest",
            UploadOptions {
                on_conflict: Some(ConflictChoice::Overwrite),
            },
        )
        .await
        .expect("upload");
    assert_eq!(ids.len(), 1);
    assert_eq!(
        device.fs.lock().files.get("/dest/song.wav").map(Vec::as_slice),
        Some(b"replacement".as_slice())
    );
}

#[tokio::test]
async fn test_cancel_all_settles_every_item_and_cleans_partials() {
    common::init_tracing();
    let mut config = EngineConfig::default();
    config.transfer.chunk_size = 256;
    let (engine, _conflicts, device) = engine_with(
        config,
        DeviceOptions {
            reply_delay: Some(Duration::from_millis(20)),
            ..DeviceOptions::default()
        },
    );
    device.fs.lock().add_dir("/dest");

    let files: Vec<UploadFile> = (0..10)
        .map(|i| upload(&format!("f{i}.bin"), &vec![0x5A; 1280]))
        .collect();
    let worker = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .upload_files(files, "/dest", UploadOptions::default())
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    engine.cancel_all();
    let ids = worker.await.expect("join").expect("upload returns ids");
    assert_eq!(ids.len(), 10);

    let queue = engine.queue().borrow().clone();
    assert_eq!(queue.len(), 10);
    for item in &queue {
        assert_eq!(
            item.status,
            TransferStatus::Canceled,
            "item {} must settle as cancelled",
            item.id
        );
    }

    let fs = device.fs.lock();
    assert!(
        !fs.files.keys().any(|path| path.starts_with("/dest/")),
        "partially written files must be cleaned up, found {:?}",
        fs.files.keys().collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_cancelling_one_item_leaves_siblings_running() {
    let mut config = EngineConfig::default();
    config.transfer.chunk_size = 256;
    let (engine, _conflicts, device) = engine_with(
        config,
        DeviceOptions {
            reply_delay: Some(Duration::from_millis(10)),
            ..DeviceOptions::default()
        },
    );
    device.fs.lock().add_dir("/dest");

    let files = vec![
        upload("victim.bin", &vec![1u8; 2048]),
        upload("survivor.bin", &vec![2u8; 2048]),
    ];
    let worker = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .upload_files(files, "/dest", UploadOptions::default())
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(40)).await;
    let victim_id = engine.queue().borrow()[0].id;
    engine.cancel_transfer(victim_id).expect("cancel");
    worker.await.expect("join").expect("upload");

    let queue = engine.queue().borrow().clone();
    assert_eq!(queue[0].status, TransferStatus::Canceled);
    assert_eq!(queue[1].status, TransferStatus::Done);
    let fs = device.fs.lock();
    assert!(!fs.files.contains_key("/dest/victim.bin"));
    assert_eq!(fs.files.get("/dest/survivor.bin").map(Vec::len), Some(2048));
}

#[tokio::test]
async fn test_delete_missing_path_is_idempotent() {
    let (engine, _conflicts, _device) =
        engine_with(EngineConfig::default(), DeviceOptions::default());
    engine.delete_path("/nope.txt").await.expect("not-found deletes succeed");
}

#[tokio::test]
async fn test_deleting_directory_purges_browser_state() {
    let (engine, _conflicts, device) =
        engine_with(EngineConfig::default(), DeviceOptions::default());
    {
        let mut fs = device.fs.lock();
        fs.add_dir("/KITS");
        fs.add_dir("/KITS/SUB");
        fs.add_file("/KITS/a.wav", b"a");
        fs.add_file("/KITS/SUB/b.wav", b"b");
        fs.add_file("/other.txt", b"o");
    }
    for path in ["/", "/KITS", "/KITS/SUB"] {
        engine
            .list_directory(path, ListOptions::default())
            .await
            .expect("prime cache");
    }
    engine.set_expanded("/KITS", true);
    engine.set_expanded("/KITS/SUB", true);
    engine.set_selected("/KITS/a.wav", true);
    engine.set_selected("/other.txt", true);

    engine.delete_path("/KITS").await.expect("delete");

    assert!(engine.cached_listing("/KITS").is_none());
    assert!(engine.cached_listing("/KITS/SUB").is_none());
    assert!(!engine.is_expanded("/KITS"));
    assert!(!engine.is_expanded("/KITS/SUB"));
    assert_eq!(engine.selected(), vec!["/other.txt".to_string()]);
    let root = engine.cached_listing("/").expect("root cache");
    assert!(!root.iter().any(|e| e.name == "KITS"));
    assert!(!device.fs.lock().dirs.contains("/KITS"));
}

#[tokio::test]
async fn test_download_of_missing_file_reports_not_found() {
    let (engine, _conflicts, _device) =
        engine_with(EngineConfig::default(), DeviceOptions::default());
    let err = engine
        .download_file("/missing.bin")
        .await
        .expect_err("must fail");
    assert!(matches!(err, Error::Device(DeviceStatus::NotFound)));
    let queue = engine.queue().borrow().clone();
    assert_eq!(queue[0].status, TransferStatus::Failed);
    assert!(queue[0].error.is_some());
}

#[tokio::test]
async fn test_move_relocates_file_and_updates_cache() {
    let (engine, _conflicts, device) =
        engine_with(EngineConfig::default(), DeviceOptions::default());
    {
        let mut fs = device.fs.lock();
        fs.add_dir("/b");
        fs.add_file("/a.wav", b"move me");
    }
    engine
        .list_directory("/", ListOptions::default())
        .await
        .expect("prime cache");

    engine.move_path("/a.wav", "/b/a2.wav").await.expect("move");

    let fs = device.fs.lock();
    assert!(!fs.files.contains_key("/a.wav"));
    assert_eq!(
        fs.files.get("/b/a2.wav").map(Vec::as_slice),
        Some(b"move me".as_slice())
    );
    drop(fs);
    let root = engine.cached_listing("/").expect("root cache");
    assert!(!root.iter().any(|e| e.name == "a.wav"));
    let queue = engine.queue().borrow().clone();
    assert_eq!(queue[0].status, TransferStatus::Done);
}

#[tokio::test]
async fn test_fragmented_replies_reassemble_end_to_end() {
    let (engine, _conflicts, device) = engine_with(
        EngineConfig::default(),
        DeviceOptions {
            fragment: Some(7),
            ..DeviceOptions::default()
        },
    );
    {
        let mut fs = device.fs.lock();
        fs.add_dir("/dest");
        fs.add_file("/dest/x.wav", b"fragments everywhere");
    }

    let entries = engine
        .list_directory("/dest", ListOptions::default())
        .await
        .expect("list over fragmented transport");
    assert_eq!(entries.len(), 1);

    let data = engine.download_file("/dest/x.wav").await.expect("download");
    assert_eq!(data, b"fragments everywhere");
}

#[tokio::test]
async fn test_create_directory_and_file() {
    let (engine, _conflicts, device) =
        engine_with(EngineConfig::default(), DeviceOptions::default());
    engine
        .list_directory("/", ListOptions::default())
        .await
        .expect("prime cache");

    engine.create_directory("/NEW").await.expect("mkdir");
    engine.create_file("/NEW/x.txt", b"hi").await.expect("create");

    let fs = device.fs.lock();
    assert!(fs.dirs.contains("/NEW"));
    assert_eq!(fs.files.get("/NEW/x.txt").map(Vec::as_slice), Some(b"hi".as_slice()));
    drop(fs);

    let root = engine.cached_listing("/").expect("root cache");
    assert!(root.iter().any(|e| e.name == "NEW" && e.is_directory()));
}
