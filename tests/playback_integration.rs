//! Playback, warm-up and karaoke through the composed client
//!
//! Runs against the scripted platform, so no audio device is needed:
//! ```bash
//! cargo test --test playback_integration
//! ```

use std::sync::Arc;

use voxsync::capture::ScriptedMicrophone;
use voxsync::karaoke::WordTiming;
use voxsync::platform::scripted::{PlayScript, ScriptedPlatform, SinkCall};
use voxsync::platform::PlatformProfile;
use voxsync::playback::{
    PlayOutcome, PlaybackNotice, PlaybackRequest, PlaybackStatus, UnlockState,
};
use voxsync::settings::ClientSettings;
use voxsync::VoiceClient;

fn client_on(platform: &ScriptedPlatform) -> VoiceClient {
    VoiceClient::new(
        ClientSettings::default(),
        platform.factory(),
        Arc::new(ScriptedMicrophone::new(48000)),
    )
}

fn request(id: &str) -> PlaybackRequest {
    PlaybackRequest::new(id, format!("https://cdn.example.com/{}.wav", id), "assistant-reply")
}

async fn wait_for_held(platform: &ScriptedPlatform, count: usize) {
    loop {
        if platform.sinks().iter().map(|s| s.held_count()).sum::<usize>() >= count {
            return;
        }
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn newer_play_supersedes_one_still_loading() {
    let platform = ScriptedPlatform::new(PlatformProfile::unconstrained());
    platform.push_script(PlayScript::Hold);
    let client = client_on(&platform);

    let manager = client.playback().clone();
    let first = tokio::spawn(async move { manager.play(request("a")).await });
    wait_for_held(&platform, 1).await;
    assert_eq!(client.playback().status(), PlaybackStatus::Loading);

    assert_eq!(client.playback().play(request("b")).await, PlayOutcome::Started);
    assert_eq!(first.await.unwrap(), PlayOutcome::Cancelled);

    assert_eq!(
        client.playback().active_request().await.map(|r| r.id),
        Some("b".to_string())
    );
    assert_eq!(client.playback().status(), PlaybackStatus::Playing);

    let sinks = platform.sinks();
    assert_eq!(sinks.len(), 2);
    let first_calls = sinks[0].calls();
    assert!(first_calls.contains(&SinkCall::Pause));
    assert!(first_calls.contains(&SinkCall::Detach));
    assert_eq!(sinks[0].held_count(), 0);
    assert_eq!(sinks[1].source(), Some("https://cdn.example.com/b.wav".to_string()));
}

#[tokio::test(start_paused = true)]
async fn rapid_plays_leave_one_active_sink() {
    let platform = ScriptedPlatform::new(PlatformProfile::unconstrained());
    let client = client_on(&platform);

    for id in ["a", "b", "c", "d"] {
        client.playback().play(request(id)).await;
    }

    let sinks = platform.sinks();
    let active: Vec<_> = sinks.iter().filter(|s| s.source().is_some()).collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].source(), Some("https://cdn.example.com/d.wav".to_string()));
    for sink in &sinks[..3] {
        assert!(sink.calls().contains(&SinkCall::Detach));
    }
}

#[tokio::test(start_paused = true)]
async fn gesture_rejection_is_retried_on_next_gesture() {
    let platform = ScriptedPlatform::new(PlatformProfile::constrained());
    platform.push_script(PlayScript::RejectGesture);
    let client = client_on(&platform);
    let mut notices = client.playback().subscribe();

    assert_eq!(client.playback().play(request("x")).await, PlayOutcome::Deferred);
    assert_eq!(
        client.playback().pending_request().await.map(|r| r.id),
        Some("x".to_string())
    );
    let mut deferred = None;
    while let Ok(notice) = notices.try_recv() {
        if let PlaybackNotice::Deferred(req) = notice {
            deferred = Some(req.id);
        }
    }
    assert_eq!(deferred, Some("x".to_string()));

    assert_eq!(client.on_user_gesture().await, Some(PlayOutcome::Started));
    assert!(client.playback().pending_request().await.is_none());
    assert_eq!(
        client.playback().active_request().await.map(|r| r.id),
        Some("x".to_string())
    );
    assert_eq!(client.unlocker().wait_settled().await, UnlockState::Unlocked);

    // Nothing left to retry
    assert_eq!(client.on_user_gesture().await, None);
}

#[tokio::test(start_paused = true)]
async fn later_rejection_overwrites_pending_request() {
    let platform = ScriptedPlatform::new(PlatformProfile::constrained());
    platform.push_script(PlayScript::RejectGesture);
    platform.push_script(PlayScript::RejectGesture);
    let client = client_on(&platform);

    client.playback().play(request("x")).await;
    client.playback().play(request("y")).await;
    assert_eq!(
        client.playback().pending_request().await.map(|r| r.id),
        Some("y".to_string())
    );

    assert_eq!(client.playback().retry_pending().await, Some(PlayOutcome::Started));
    assert_eq!(
        client.playback().active_request().await.map(|r| r.id),
        Some("y".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn karaoke_follows_playback_clock() {
    let platform = ScriptedPlatform::new(PlatformProfile::unconstrained());
    let client = client_on(&platform);
    let words = vec![WordTiming::new("Hi", 0.0, 0.3), WordTiming::new("there", 0.3, 0.6)];

    assert_eq!(client.playback().play(request("a")).await, PlayOutcome::Started);
    let mut session = client.karaoke_for_playback(words).unwrap();

    let sink = platform.sinks().last().cloned().unwrap();
    sink.set_time(0.45);

    loop {
        let update = session.next_update().await.unwrap();
        if update.elapsed_seconds >= 0.45 {
            assert_eq!(update.word_index, Some(1));
            assert!(update.is_active);
            break;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn stop_releases_playback_and_goes_idle() {
    let platform = ScriptedPlatform::new(PlatformProfile::unconstrained());
    let client = client_on(&platform);

    client.playback().play(request("a")).await;
    client.playback().stop().await;

    assert_eq!(client.playback().status(), PlaybackStatus::Idle);
    assert!(client.playback().active_request().await.is_none());
    assert!(client.karaoke_for_playback(Vec::<WordTiming>::new()).is_none());
}
