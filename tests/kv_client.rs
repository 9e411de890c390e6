mod common;

use std::time::Duration;

use common::{header, FakeRemote, Faults, TOKEN};
use flarecache::{
    build::bazel::remote::execution::v2::Digest,
    client::DownloadOutcome,
    digest::{digest_of, sha256_hex},
    transport::{
        HEADER_APP_ID, HEADER_BUILD_ID, HEADER_DELETE_ON_REWRITE, HEADER_STEP_ID,
        HEADER_VALIDATION_LEVEL, HEADER_VALIDATION_SHA256,
    },
    KvError, Result, SessionState,
};
use tonic::Code;

#[tokio::test]
async fn upload_then_download_round_trips() -> Result<()> {
    let remote = FakeRemote::start().await;
    let client = remote.client().await;

    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let key = sha256_hex(&data);
    client.upload_bytes(&key, data.clone()).await?;
    assert_eq!(remote.blob(&key), Some(data.clone()));
    assert_eq!(client.download_bytes(&key).await?, data);

    let write = &remote.metadata("Write")[0];
    assert_eq!(header(write, HEADER_VALIDATION_SHA256), Some(key));
    assert_eq!(header(write, HEADER_VALIDATION_LEVEL).as_deref(), Some("error"));
    let read = &remote.metadata("Read")[0];
    assert_eq!(header(read, HEADER_VALIDATION_LEVEL).as_deref(), Some("WARN"));
    assert_eq!(
        header(read, "authorization"),
        Some(format!("bearer {}", TOKEN))
    );
    Ok(())
}

#[tokio::test]
async fn empty_blob_is_a_single_finishing_write() -> Result<()> {
    let remote = FakeRemote::start().await;
    let client = remote.client().await;

    let key = sha256_hex(b"");
    client.upload_bytes(&key, Vec::new()).await?;
    assert_eq!(remote.calls("Write"), 1);
    assert_eq!(remote.blob(&key), Some(Vec::new()));
    assert!(client.download_bytes(&key).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn blob_at_message_limit_round_trips() -> Result<()> {
    let remote = FakeRemote::start().await;
    let client = remote.client().await;

    let data = vec![0x5au8; 4 * 1024 * 1024];
    let key = sha256_hex(&data);
    client.upload_bytes(&key, data.clone()).await?;
    assert_eq!(remote.calls("Write"), 1);
    assert_eq!(client.download_bytes(&key).await?, data);
    Ok(())
}

#[tokio::test]
async fn interrupted_upload_resumes_at_committed_offset() -> Result<()> {
    let remote = FakeRemote::start().await;
    let client = remote.client().await;
    remote.set_faults(Faults {
        fail_write_after: Some(300),
        ..Default::default()
    });

    let data: Vec<u8> = (0..1024u32).map(|i| (i % 256) as u8).collect();
    let key = sha256_hex(&data);
    client.upload_bytes(&key, data.clone()).await?;

    assert_eq!(
        remote.write_offsets(),
        vec![(key.clone(), 0), (key.clone(), 300)]
    );
    assert_eq!(remote.calls("QueryWriteStatus"), 1);
    assert_eq!(remote.blob(&key), Some(data));
    Ok(())
}

#[tokio::test]
async fn already_exists_restarts_with_delete_on_rewrite() -> Result<()> {
    let remote = FakeRemote::start().await;
    let client = remote.client().await;
    remote.set_faults(Faults {
        already_exists: 1,
        ..Default::default()
    });

    let data = b"collision".to_vec();
    let key = sha256_hex(&data);
    client.upload_bytes(&key, data.clone()).await?;

    let writes = remote.metadata("Write");
    assert_eq!(writes.len(), 2);
    assert_eq!(header(&writes[0], HEADER_DELETE_ON_REWRITE), None);
    assert_eq!(
        header(&writes[1], HEADER_DELETE_ON_REWRITE).as_deref(),
        Some("true")
    );
    assert_eq!(remote.write_offsets()[1].1, 0);
    assert_eq!(remote.blob(&key), Some(data));
    Ok(())
}

#[tokio::test]
async fn persistent_already_exists_restarts_only_once() -> Result<()> {
    let remote = FakeRemote::start().await;
    let client = remote.client().await;
    remote.set_faults(Faults {
        already_exists: 10,
        ..Default::default()
    });

    let data = b"always collides".to_vec();
    let key = sha256_hex(&data);
    let err = client.upload_bytes(&key, data).await.unwrap_err();
    assert_eq!(err.code(), Some(Code::AlreadyExists), "{err}");

    // One plain write, then the rewrite and its retries under the policy.
    let writes = remote.metadata("Write");
    assert_eq!(writes.len(), 4);
    assert_eq!(header(&writes[0], HEADER_DELETE_ON_REWRITE), None);
    for write in &writes[1..] {
        assert_eq!(
            header(write, HEADER_DELETE_ON_REWRITE).as_deref(),
            Some("true")
        );
    }
    assert_eq!(remote.calls("QueryWriteStatus"), 2);
    assert_eq!(remote.blob(&key), None);
    Ok(())
}

#[tokio::test]
async fn bogus_checksum_is_an_integrity_error() -> Result<()> {
    let remote = FakeRemote::start().await;
    let client = remote.client().await;
    remote.insert("blob", b"payload");
    remote.set_faults(Faults {
        bogus_validation_header: true,
        ..Default::default()
    });

    let err = client.download_bytes("blob").await.unwrap_err();
    assert!(matches!(err, KvError::IntegrityMismatch { .. }), "{err}");
    // Retried up to the download budget.
    assert_eq!(remote.calls("Read"), 3);
    Ok(())
}

#[tokio::test]
async fn missing_key_is_not_retried() -> Result<()> {
    let remote = FakeRemote::start().await;
    let client = remote.client().await;

    let err = client.download_bytes("nope").await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(remote.calls("Read"), 1);
    Ok(())
}

#[tokio::test]
async fn rejected_token_is_fatal() -> Result<()> {
    let remote = FakeRemote::start().await;
    let client = remote.client().await;
    remote.set_faults(Faults {
        rejected_token: Some(TOKEN.into()),
        ..Default::default()
    });

    let err = client.get_capabilities().await.unwrap_err();
    assert!(matches!(err, KvError::CacheUnauthenticated(_)), "{err}");
    assert_eq!(remote.calls("GetCapabilities"), 1);

    let err = client.upload_bytes("k", b"v".to_vec()).await.unwrap_err();
    assert!(matches!(err, KvError::CacheUnauthenticated(_)), "{err}");
    assert_eq!(remote.calls("Write"), 1);
    Ok(())
}

#[tokio::test]
async fn session_change_applies_to_next_call() -> Result<()> {
    let remote = FakeRemote::start().await;
    let client = remote.client().await;

    client.get_capabilities().await?;
    client.change_session(SessionState::new("inv-2", "app-2", "build-2", "step-2"));
    client.get_capabilities().await?;

    let calls = remote.metadata("GetCapabilities");
    assert_eq!(header(&calls[0], HEADER_APP_ID).as_deref(), Some("app-1"));
    assert_eq!(header(&calls[1], HEADER_APP_ID).as_deref(), Some("app-2"));
    assert_eq!(header(&calls[1], HEADER_BUILD_ID).as_deref(), Some("build-2"));
    assert_eq!(header(&calls[1], HEADER_STEP_ID).as_deref(), Some("step-2"));
    Ok(())
}

#[tokio::test]
async fn find_missing_splits_oversized_requests() -> Result<()> {
    let remote = FakeRemote::start().await;
    let client = remote.client().await;

    let digests: Vec<Digest> = (0..70_000u64)
        .map(|i| Digest {
            hash: format!("{:064x}", i),
            size_bytes: i as i64,
        })
        .collect();
    for digest in digests.iter().step_by(2) {
        remote.insert(&digest.hash, b"");
    }

    let missing = client.find_missing(&digests).await?;
    assert!(remote.calls("FindMissingBlobs") > 1);
    assert_eq!(missing.len(), 35_000);
    let expected: Vec<&Digest> = digests.iter().skip(1).step_by(2).collect();
    assert_eq!(missing.iter().collect::<Vec<_>>(), expected);
    Ok(())
}

#[tokio::test]
async fn find_missing_of_nothing_skips_the_wire() -> Result<()> {
    let remote = FakeRemote::start().await;
    let client = remote.client().await;
    assert!(client.find_missing(&[]).await?.is_empty());
    assert_eq!(remote.calls("FindMissingBlobs"), 0);
    Ok(())
}

#[tokio::test]
async fn delete_removes_the_key() -> Result<()> {
    let remote = FakeRemote::start().await;
    let client = remote.client().await;
    remote.insert("gone", b"soon");

    client.delete("gone").await?;
    assert_eq!(remote.blob("gone"), None);
    assert!(client.download_bytes("gone").await.unwrap_err().is_not_found());
    Ok(())
}

#[tokio::test]
async fn query_write_status_reports_stored_blobs() -> Result<()> {
    let remote = FakeRemote::start().await;
    let client = remote.client().await;
    remote.insert("done", b"12345");

    let status = client.query_write_status("done").await?;
    assert!(status.complete);
    assert_eq!(status.committed_size, 5);
    Ok(())
}

#[tokio::test]
async fn file_download_skips_existing_targets() -> Result<()> {
    let remote = FakeRemote::start().await;
    let client = remote.client().await;
    let digest = digest_of(b"file body");
    remote.insert(&digest.hash, b"file body");

    let dir = tempfile::tempdir()?;
    let target = dir.path().join("nested/out.bin");
    let first = client
        .download_file(&target, &digest.hash, 0o600, true, false)
        .await?;
    let second = client
        .download_file(&target, &digest.hash, 0o600, true, false)
        .await?;

    assert_eq!(first, DownloadOutcome::Downloaded);
    assert_eq!(second, DownloadOutcome::Skipped);
    assert_eq!(remote.calls("Read"), 1);
    assert_eq!(tokio::fs::read(&target).await?, b"file body");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = tokio::fs::metadata(&target).await?.permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn read_only_target_needs_force_overwrite() -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let remote = FakeRemote::start().await;
    let client = remote.client().await;
    remote.insert("fresh", b"fresh");

    let dir = tempfile::tempdir()?;
    let target = dir.path().join("locked");
    tokio::fs::write(&target, b"stale").await?;
    tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o444)).await?;

    let err = client
        .download_file(&target, "fresh", 0o644, false, false)
        .await
        .unwrap_err();
    assert!(matches!(err, KvError::FileExistsAndNotWritable(_)), "{err}");
    assert_eq!(remote.calls("Read"), 0);

    client
        .download_file(&target, "fresh", 0o644, false, true)
        .await?;
    assert_eq!(tokio::fs::read(&target).await?, b"fresh");
    Ok(())
}

#[tokio::test]
async fn failed_download_leaves_no_file() -> Result<()> {
    let remote = FakeRemote::start().await;
    let client = remote.client().await;

    let dir = tempfile::tempdir()?;
    let target = dir.path().join("never");
    let err = client
        .download_file(&target, "absent", 0, false, false)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(!target.exists());
    Ok(())
}

#[tokio::test]
async fn integrity_failure_leaves_no_file() -> Result<()> {
    let remote = FakeRemote::start().await;
    let client = remote.client().await;
    remote.insert("blob", b"payload");
    remote.set_faults(Faults {
        bogus_validation_header: true,
        ..Default::default()
    });

    let dir = tempfile::tempdir()?;
    let target = dir.path().join("corrupt");
    let err = client
        .download_file(&target, "blob", 0o644, false, false)
        .await
        .unwrap_err();
    assert!(matches!(err, KvError::IntegrityMismatch { .. }), "{err}");
    assert!(!target.exists());
    Ok(())
}

#[tokio::test]
async fn connect_to_nothing_fails_fast() {
    let remote = FakeRemote::start().await;
    let mut config = remote.config();
    drop(remote);
    config.endpoint.port = 1;
    let result = tokio::time::timeout(
        Duration::from_secs(15),
        flarecache::KvClient::connect(config, SessionState::default()),
    )
    .await
    .expect("connect honours its own timeout");
    assert!(result.is_err());
}

#[test]
fn arbitrary_payloads_round_trip_through_the_remote() -> Result<()> {
    use proptest::{
        collection::vec,
        prelude::any,
        test_runner::{Config, TestCaseError, TestRunner},
    };

    let runtime = tokio::runtime::Runtime::new()?;
    let remote = runtime.block_on(FakeRemote::start());
    let client = runtime.block_on(remote.client());

    let mut runner = TestRunner::new(Config::with_cases(32));
    let outcome = runner.run(&vec(any::<u8>(), 0..200_000), |data| {
        let key = sha256_hex(&data);
        let fetched = runtime
            .block_on(async {
                client.upload_bytes(&key, data.clone()).await?;
                client.download_bytes(&key).await
            })
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        proptest::prop_assert_eq!(fetched, data);
        Ok(())
    });
    if let Err(e) = outcome {
        panic!("{}", e);
    }
    Ok(())
}
