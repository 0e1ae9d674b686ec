//! Crash-restart resume scenarios.

use std::time::Duration;

use codedrop::{crypto::digest, msg::ControlMsg, Cfg};

mod test_channel;
mod test_data;

use test_data::{file_bytes, run_pair, store_root};

fn test_cfg() -> Cfg {
    Cfg { session_timeout: Duration::from_secs(30), ..Cfg::default() }
}

/// The receiver dies mid-transfer; a second run over the same store root
/// resumes from the persisted byte offset and delivers identical bytes.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn receiver_restart_resumes_transfer() {
    let data = file_bytes(20, 5 * 1024 * 1024);
    let root = store_root("resume");
    let _ = std::fs::remove_dir_all(&root);

    // First attempt: the only data channel dies after a dozen frames, taking
    // both engines down. Chunks persisted until then survive in the store.
    let dying = test_channel::Cfg { disconnect_after: Some(12), ..Default::default() };
    let first = run_pair(test_cfg(), "999999", data.clone(), vec![dying], root.clone()).await;

    assert!(first.sent.is_err() || first.received.is_err(), "first attempt must not finish");
    assert!(first.delivered.is_none());

    let persisted = first
        .receiver_msgs
        .iter()
        .filter_map(|msg| match msg {
            ControlMsg::ChunkBatchAck { received_bytes, .. } => Some(*received_bytes),
            _ => None,
        })
        .max()
        .unwrap_or(0);
    assert!(persisted > 0, "some chunks must have been persisted before the crash");

    // Second attempt: fresh engines, same code and store root.
    let second = run_pair(
        test_cfg(),
        "999999",
        data.clone(),
        vec![test_channel::Cfg::default()],
        root.clone(),
    )
    .await;

    second.sent.as_ref().unwrap();
    second.received.as_ref().unwrap();
    assert_eq!(digest(second.delivered()), digest(&data));

    let resume = second.receiver_msgs.iter().find_map(|msg| match msg {
        ControlMsg::ResumeFrom { byte_offset, received_chunks } => {
            Some((*byte_offset, received_chunks.len()))
        }
        _ => None,
    });
    let (byte_offset, chunks) = resume.expect("second attempt must resume, not restart");
    assert!(byte_offset >= persisted, "resume offset must cover all persisted bytes");
    assert!(byte_offset < data.len() as u64);
    assert!(chunks > 0);
    assert!(
        !second.receiver_msgs.iter().any(|msg| matches!(msg, ControlMsg::StartTransfer)),
        "a resumable transfer must not start from scratch"
    );

    let _ = std::fs::remove_dir_all(&root);
}

/// A transfer against an empty store starts from scratch even when an offer
/// with the same code was seen before under a different file.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn different_file_under_same_code_starts_fresh() {
    let root = store_root("fresh");
    let _ = std::fs::remove_dir_all(&root);

    let first_data = file_bytes(21, 1024 * 1024);
    let dying = test_channel::Cfg { disconnect_after: Some(2), ..Default::default() };
    let _ = run_pair(test_cfg(), "424242", first_data, vec![dying], root.clone()).await;

    // Same code, different size: a different transfer id, so no resume.
    let second_data = file_bytes(22, 2 * 1024 * 1024);
    let second = run_pair(
        test_cfg(),
        "424242",
        second_data.clone(),
        vec![test_channel::Cfg::default()],
        root.clone(),
    )
    .await;

    second.sent.as_ref().unwrap();
    second.received.as_ref().unwrap();
    assert_eq!(digest(second.delivered()), digest(&second_data));
    assert!(
        second.receiver_msgs.iter().any(|msg| matches!(msg, ControlMsg::StartTransfer)),
        "a different file must start from scratch"
    );

    let _ = std::fs::remove_dir_all(&root);
}
