mod common;

use common::{daft_punk, play, Harness, VOICE_CHANNEL};
use preview_proto::protocol::{
    ConnectionHandle, GroupId, MessageContent, PlayerEvent, PlayerEventKind, RequestId,
    SessionState,
};
use std::sync::atomic::Ordering;
use std::time::Duration;

const QUERY: &str = "Daft Punk One More Time";

fn player(group: u64, request_id: RequestId, kind: PlayerEventKind) -> PlayerEvent {
    PlayerEvent {
        group_id: GroupId(group),
        request_id,
        kind,
    }
}

#[tokio::test]
async fn test_preview_plays_and_cleans_up() {
    let h = Harness::builder().start();
    h.handle.submit(play(1, QUERY)).await.unwrap();

    h.wait_for_state(1, SessionState::Playing).await;
    let voice = h.voice.clone();
    common::eventually("playback to start", || voice.subscribes() == 1).await;

    let cards = h.gateway.cards();
    assert_eq!(cards.len(), 1);
    assert_eq!(cards[0].title, "One More Time");
    assert_eq!(cards[0].author, "Daft Punk");
    assert_eq!(cards[0].color, 0x1DB954);
    assert_eq!(
        cards[0].thumbnail_url.as_deref(),
        Some("https://i.scdn.co/image/discovery")
    );

    let source = h.voice.plays().remove(0);
    assert_eq!(source.title, "One More Time");
    assert!(source.path.exists());

    h.handle
        .player_event(player(1, source.request_id, PlayerEventKind::Playing))
        .await
        .unwrap();
    h.handle
        .player_event(player(1, source.request_id, PlayerEventKind::Idle))
        .await
        .unwrap();

    h.wait_for_state(1, SessionState::Idle).await;
    assert!(!source.path.exists());
    assert_eq!(h.staged_files(), 0);

    // Natural completion keeps the voice connection.
    assert!(h.voice.leaves().is_empty());
    assert!(h.snapshot(1).await.unwrap().connected);
}

#[tokio::test]
async fn test_track_without_preview_cannot_play() {
    let h = Harness::builder()
        .track("Daft Punk One More Time", daft_punk(false))
        .start();
    h.handle.submit(play(1, QUERY)).await.unwrap();

    h.wait_for_text("Cannot play: One More Time by Daft Punk.").await;
    h.wait_for_state(1, SessionState::Idle).await;

    assert_eq!(h.gateway.cards().len(), 1);
    assert!(h.voice.plays().is_empty());
    let voice = h.voice.clone();
    common::eventually("voice to be left", || voice.leaves().len() == 1).await;
    assert_eq!(h.staged_files(), 0);
}

#[tokio::test]
async fn test_unknown_track_is_not_found() {
    let h = Harness::builder().start();
    h.handle.submit(play(1, "asdkjhasdkjhasd")).await.unwrap();

    h.wait_for_text("Could not find the track.").await;
    h.wait_for_state(1, SessionState::Idle).await;

    assert!(h.gateway.cards().is_empty());
    assert_eq!(h.fetcher.calls(), 0);
    let voice = h.voice.clone();
    common::eventually("voice to be left", || voice.leaves().len() == 1).await;
    assert_eq!(
        h.voice.leaves()[0],
        ConnectionHandle {
            group_id: GroupId(1),
            channel_id: VOICE_CHANNEL,
        }
    );
}

#[tokio::test]
async fn test_busy_group_rejects_second_request() {
    let h = Harness::builder().gated().start();
    h.handle.submit(play(1, QUERY)).await.unwrap();
    h.wait_for_state(1, SessionState::Fetching).await;
    let fetcher = h.fetcher.clone();
    common::eventually("fetch to start", || fetcher.calls() == 1).await;

    h.handle.submit(play(1, "anything else")).await.unwrap();
    h.wait_for_text("Already playing in this server, wait for the current preview to finish.")
        .await;

    let reply = h
        .gateway
        .messages()
        .into_iter()
        .find(|m| matches!(m.content, MessageContent::Reply { .. }))
        .unwrap();
    assert!(matches!(
        reply.content,
        MessageContent::Reply { user_id, .. } if user_id.0 == 42
    ));

    // The rejection made no external calls and did not disturb the session.
    assert_eq!(h.catalog.calls(), 1);
    assert_eq!(h.voice.joins(), 1);
    assert_eq!(h.fetcher.calls(), 1);
    assert_eq!(h.snapshot(1).await.unwrap().state, SessionState::Fetching);

    h.fetcher.open();
    h.wait_for_state(1, SessionState::Playing).await;
}

#[tokio::test]
async fn test_groups_run_independently() {
    let h = Harness::builder().start();
    h.handle.submit(play(1, QUERY)).await.unwrap();
    h.handle.submit(play(2, QUERY)).await.unwrap();

    h.wait_for_state(1, SessionState::Playing).await;
    h.wait_for_state(2, SessionState::Playing).await;
    let voice = h.voice.clone();
    common::eventually("both plays", || voice.plays().len() == 2).await;

    let plays = h.voice.plays();
    assert_ne!(plays[0].path, plays[1].path);
    assert_ne!(plays[0].request_id, plays[1].request_id);

    let group_one = h.snapshot(1).await.unwrap().request_id.unwrap();
    let (one, two): (Vec<_>, Vec<_>) = plays.into_iter().partition(|s| s.request_id == group_one);

    h.handle
        .player_event(player(1, one[0].request_id, PlayerEventKind::Idle))
        .await
        .unwrap();
    h.wait_for_state(1, SessionState::Idle).await;

    assert!(!one[0].path.exists());
    assert!(two[0].path.exists());
    assert_eq!(h.snapshot(2).await.unwrap().state, SessionState::Playing);
}

#[tokio::test]
async fn test_error_then_idle_reports_once() {
    let h = Harness::builder().start();
    h.handle.submit(play(1, QUERY)).await.unwrap();
    h.wait_for_state(1, SessionState::Playing).await;
    let voice = h.voice.clone();
    common::eventually("playback to start", || voice.subscribes() == 1).await;
    let source = h.voice.plays().remove(0);

    h.handle
        .player_event(player(
            1,
            source.request_id,
            PlayerEventKind::Error {
                message: "stream ended unexpectedly".into(),
                track_title: Some("One More Time".into()),
            },
        ))
        .await
        .unwrap();
    h.handle
        .player_event(player(1, source.request_id, PlayerEventKind::Idle))
        .await
        .unwrap();
    h.settle().await;

    let failures: Vec<_> = h
        .gateway
        .texts()
        .into_iter()
        .filter(|t| t == "Playback failed for One More Time.")
        .collect();
    assert_eq!(failures.len(), 1);
    assert!(!source.path.exists());
    assert_eq!(h.snapshot(1).await.unwrap().state, SessionState::Idle);
    assert!(h.voice.leaves().is_empty());

    // The group accepts a new request afterwards.
    h.handle.submit(play(1, QUERY)).await.unwrap();
    h.wait_for_state(1, SessionState::Playing).await;
}

#[tokio::test]
async fn test_stale_player_event_is_ignored() {
    let h = Harness::builder().start();
    h.handle.submit(play(1, QUERY)).await.unwrap();
    h.wait_for_state(1, SessionState::Playing).await;
    let voice = h.voice.clone();
    common::eventually("playback to start", || voice.subscribes() == 1).await;
    let source = h.voice.plays().remove(0);

    let stale = RequestId(source.request_id.0 + 100);
    h.handle
        .player_event(player(1, stale, PlayerEventKind::Idle))
        .await
        .unwrap();
    h.settle().await;

    assert_eq!(h.snapshot(1).await.unwrap().state, SessionState::Playing);
    assert!(source.path.exists());
}

#[tokio::test]
async fn test_requester_outside_voice_is_rejected() {
    let h = Harness::builder().start();
    let mut cmd = play(1, QUERY);
    cmd.voice_channel_id = None;
    h.handle.submit(cmd).await.unwrap();

    h.wait_for_text("You need to join a voice channel first!").await;
    assert_eq!(h.voice.joins(), 0);
    assert_eq!(h.catalog.calls(), 0);
    assert!(h.snapshot(1).await.is_none());
}

#[tokio::test]
async fn test_other_text_is_ignored() {
    let h = Harness::builder().start();
    let mut cmd = play(1, QUERY);
    cmd.text = "!playlist rock".into();
    h.handle.submit(cmd).await.unwrap();
    h.settle().await;

    // Only the settle probe got a reply.
    assert_eq!(h.gateway.count(), 1);
    assert_eq!(h.voice.joins(), 0);
}

#[tokio::test]
async fn test_join_failure_skips_resolution() {
    let h = Harness::builder().start();
    h.voice.fail_join.store(true, Ordering::SeqCst);
    h.handle.submit(play(1, QUERY)).await.unwrap();

    h.wait_for_text("Could not join your voice channel.").await;
    h.wait_for_state(1, SessionState::Idle).await;
    assert_eq!(h.catalog.calls(), 0);
    assert!(h.voice.leaves().is_empty());
}

#[tokio::test]
async fn test_fetch_failure_leaves_voice() {
    let h = Harness::builder().start();
    *h.fetcher.fail_status.lock().unwrap() = Some(404);
    h.handle.submit(play(1, QUERY)).await.unwrap();

    h.wait_for_text("Could not load the preview for One More Time.").await;
    h.wait_for_state(1, SessionState::Idle).await;
    let voice = h.voice.clone();
    common::eventually("voice to be left", || voice.leaves().len() == 1).await;
    assert_eq!(h.staged_files(), 0);
}

#[tokio::test]
async fn test_play_failure_releases_payload() {
    let h = Harness::builder().start();
    h.voice.fail_play.store(true, Ordering::SeqCst);
    h.handle.submit(play(1, QUERY)).await.unwrap();

    h.wait_for_text("Playback failed for One More Time.").await;
    h.wait_for_state(1, SessionState::Idle).await;
    assert_eq!(h.staged_files(), 0);
    assert!(h.voice.leaves().is_empty());
}

#[tokio::test]
async fn test_deadline_forces_idle() {
    let h = Harness::builder().deadline(Duration::from_millis(100)).start();
    h.handle.submit(play(1, QUERY)).await.unwrap();
    h.wait_for_state(1, SessionState::Playing).await;

    h.wait_for_state(1, SessionState::Idle).await;
    assert_eq!(h.staged_files(), 0);
}

#[tokio::test]
async fn test_voice_disconnect_destroys_session() {
    let h = Harness::builder().start();
    h.handle.submit(play(1, QUERY)).await.unwrap();
    h.wait_for_state(1, SessionState::Playing).await;

    h.handle.voice_disconnected(GroupId(1)).await.unwrap();
    let status = h.status.clone();
    common::eventually_async("session removal", || {
        let status = status.clone();
        async move { status.get(GroupId(1)).await.is_none() }
    })
    .await;
    assert_eq!(h.staged_files(), 0);
}

#[tokio::test]
async fn test_shutdown_releases_and_leaves() {
    let h = Harness::builder().start();
    h.handle.submit(play(1, QUERY)).await.unwrap();
    h.wait_for_state(1, SessionState::Playing).await;

    h.handle.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), h.task)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(h.voice.leaves().len(), 1);
    assert_eq!(std::fs::read_dir(h.staging.path()).unwrap().count(), 0);
    assert!(h.status.all().await.is_empty());
}

#[tokio::test]
async fn test_next_request_waits_for_slow_leave() {
    let h = Harness::builder().start();
    h.voice.leave_delay_ms.store(300, Ordering::SeqCst);

    h.handle.submit(play(1, "asdkjhasdkjhasd")).await.unwrap();
    h.wait_for_text("Could not find the track.").await;
    h.wait_for_state(1, SessionState::Leaving).await;

    // The old channel is still being left, so the group is busy.
    h.handle.submit(play(1, QUERY)).await.unwrap();
    h.wait_for_text("Already playing in this server, wait for the current preview to finish.")
        .await;
    assert_eq!(h.voice.joins(), 1);

    h.wait_for_state(1, SessionState::Idle).await;
    h.handle.submit(play(1, QUERY)).await.unwrap();
    h.wait_for_state(1, SessionState::Playing).await;
    let voice = h.voice.clone();
    common::eventually("playback to start", || voice.subscribes() == 1).await;

    assert_eq!(h.voice.calls(), vec!["join", "leave", "join"]);
    assert!(h.snapshot(1).await.unwrap().connected);
}

#[tokio::test]
async fn test_disconnect_without_held_connection_is_ignored() {
    let h = Harness::builder().start();
    h.voice.join_delay_ms.store(200, Ordering::SeqCst);
    h.handle.submit(play(1, QUERY)).await.unwrap();
    let voice = h.voice.clone();
    common::eventually("join to start", || voice.joins() == 1).await;

    // A late report about an earlier connection must not drop the request.
    h.handle.voice_disconnected(GroupId(1)).await.unwrap();
    h.wait_for_state(1, SessionState::Playing).await;
}

#[tokio::test]
async fn test_shutdown_leaves_join_still_in_flight() {
    let h = Harness::builder().start();
    h.voice.join_delay_ms.store(100, Ordering::SeqCst);
    h.handle.submit(play(1, QUERY)).await.unwrap();
    h.wait_for_state(1, SessionState::Resolving).await;
    let voice = h.voice.clone();
    common::eventually("join to start", || voice.joins() == 1).await;

    h.handle.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), h.task)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(h.voice.calls(), vec!["join", "leave"]);
    assert_eq!(
        h.voice.leaves(),
        vec![ConnectionHandle {
            group_id: GroupId(1),
            channel_id: VOICE_CHANNEL,
        }]
    );
    assert!(h.status.all().await.is_empty());
}

#[tokio::test]
async fn test_shutdown_waits_for_leave_in_flight() {
    let h = Harness::builder().start();
    h.voice.leave_delay_ms.store(100, Ordering::SeqCst);
    h.handle.submit(play(1, "asdkjhasdkjhasd")).await.unwrap();
    h.wait_for_state(1, SessionState::Leaving).await;

    h.handle.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), h.task)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(h.voice.calls(), vec!["join", "leave"]);
}
