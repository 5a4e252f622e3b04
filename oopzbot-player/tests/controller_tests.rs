//! Playback controller integration tests
//!
//! Full core on in-memory stores with the tokio clock paused: pause/seek
//! ordering, STOP, skip-on-failure, revision ordering, auto-advance,
//! prefetch and stale-result handling. Stream refusal by the agent and a
//! failing queue database are covered at the end.

mod helpers;

use helpers::{track, Harness, ScriptedBackend, ScriptedResolver};
use oopzbot_common::{Command, NotificationKind, PlayState};
use oopzbot_player::queue::QueueStore;
use oopzbot_player::store::{StateStore, KEY_CURRENT, KEY_QUEUE};
use oopzbot_player::{Error, Phase};
use std::time::Duration;

fn close(actual: f64, expected: f64, tolerance: f64) -> bool {
    (actual - expected).abs() <= tolerance
}

#[tokio::test(start_paused = true)]
async fn test_pause_seek_resume_lands_on_offset() {
    let h = Harness::builder().start();
    let song = track(1, 200);

    h.controller.enqueue(song.clone(), "alice").await.unwrap();
    h.wait_playing(&song.id).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    h.controller.command(Command::pause()).await.unwrap();
    h.controller.command(Command::seek(30.0)).await.unwrap();

    let paused = h.snapshot().await;
    assert_eq!(paused.phase, Phase::Paused);
    assert!(close(paused.elapsed, 30.0, 0.01), "elapsed {}", paused.elapsed);
    assert_eq!(paused.play_state.pause_elapsed.map(|e| e.round()), Some(30.0));

    // Stays put while paused
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(close(h.snapshot().await.elapsed, 30.0, 0.01));

    h.controller.command(Command::resume()).await.unwrap();
    let state = h.flushed().await;
    assert!(!state.paused);
    assert!(state.pause_elapsed.is_none());
    assert!(close(
        state.elapsed_at(oopzbot_common::time::epoch_secs()),
        30.0,
        1.0
    ));

    let resumed = h.snapshot().await;
    assert_eq!(resumed.phase, Phase::Playing);
    assert!(close(resumed.elapsed, 30.0, 0.5), "elapsed {}", resumed.elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_seek_while_playing_then_pause() {
    let h = Harness::builder().start();
    let song = track(1, 200);

    h.controller.enqueue(song.clone(), "alice").await.unwrap();
    h.wait_playing(&song.id).await;

    h.controller.command(Command::resume()).await.unwrap();
    h.controller.command(Command::seek(30.0)).await.unwrap();
    let playing = h.snapshot().await;
    assert_eq!(playing.phase, Phase::Playing);
    assert!(close(playing.elapsed, 30.0, 0.01));

    tokio::time::sleep(Duration::from_secs(2)).await;
    h.controller.command(Command::pause()).await.unwrap();
    let state = h.flushed().await;
    assert!(state.paused);
    assert!(close(state.pause_elapsed.unwrap(), 32.0, 0.3));
}

#[tokio::test(start_paused = true)]
async fn test_seek_is_clamped_to_track() {
    let h = Harness::builder().start();
    let song = track(1, 200);

    h.controller.enqueue(song.clone(), "alice").await.unwrap();
    h.wait_playing(&song.id).await;
    h.controller.command(Command::pause()).await.unwrap();

    h.controller.command(Command::seek(-12.0)).await.unwrap();
    assert!(close(h.snapshot().await.elapsed, 0.0, 0.01));

    h.controller.command(Command::seek(999.0)).await.unwrap();
    assert!(close(h.snapshot().await.elapsed, 200.0, 0.01));
}

#[tokio::test(start_paused = true)]
async fn test_enqueue_then_stop_clears_everything() {
    let resolver = ScriptedResolver::new();
    let first = track(1, 200);
    resolver.delay(&first.id, Duration::from_millis(500));
    let h = Harness::builder().resolver(resolver).start();

    assert_eq!(h.controller.enqueue(first.clone(), "alice").await.unwrap(), 1);
    h.controller.enqueue(track(2, 200), "bob").await.unwrap();
    h.controller.command(Command::stop()).await.unwrap();

    let idle = h.wait_until("idle", Duration::from_secs(5), |s| s.phase == Phase::Idle).await;
    assert!(idle.queue.is_empty());
    assert!(idle.current.is_none());

    // The in-flight resolution finishing later changes nothing
    tokio::time::sleep(Duration::from_secs(2)).await;
    let later = h.snapshot().await;
    assert_eq!(later.phase, Phase::Idle);
    assert!(later.current.is_none());

    let state = h.flushed().await;
    assert!(state.is_cleared());
    assert!(!state.paused);
    assert!(h.store.get(KEY_CURRENT).await.unwrap().is_none());
    assert_eq!(
        h.store.get(KEY_QUEUE).await.unwrap(),
        Some(serde_json::json!([]))
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_while_playing_stops_actuator_state() {
    let h = Harness::builder().start();
    let song = track(1, 200);

    h.controller.enqueue(song.clone(), "alice").await.unwrap();
    h.wait_playing(&song.id).await;
    h.controller.command(Command::stop()).await.unwrap();

    let idle = h.snapshot().await;
    assert_eq!(idle.phase, Phase::Idle);
    assert!(idle.play_state.is_cleared());

    let status = h.bridge.status().await.unwrap();
    assert!(status.stream_ref.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_unresolvable_track_is_skipped_with_notify() {
    let resolver = ScriptedResolver::new();
    let broken = track(1, 200);
    let good = track(2, 200);
    resolver.fail_always(&broken.id);
    let h = Harness::builder().resolver(resolver.clone()).start();

    h.controller.enqueue(broken.clone(), "alice").await.unwrap();
    h.controller.enqueue(good.clone(), "bob").await.unwrap();

    let playing = h.wait_playing(&good.id).await;
    assert_eq!(playing.current.unwrap().requester, "bob");
    assert_eq!(resolver.calls(&broken.id), 2);

    let skipped = h
        .notifier
        .wait_for(NotificationKind::Skipped, Duration::from_secs(5))
        .await;
    assert!(skipped.message.contains("Song 1"), "{}", skipped.message);
    assert_eq!(skipped.payload["requester"], "alice");

    // Not cached
    assert!(h.cache.entry(&broken.id).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_is_retried_not_skipped() {
    let resolver = ScriptedResolver::new();
    let flaky = track(1, 200);
    resolver.fail_times(&flaky.id, 1);
    let h = Harness::builder().resolver(resolver.clone()).start();

    h.controller.enqueue(flaky.clone(), "alice").await.unwrap();
    h.wait_playing(&flaky.id).await;

    assert_eq!(resolver.calls(&flaky.id), 2);
    assert!(h.notifier.of_kind(NotificationKind::Skipped).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_revisions_strictly_increase() {
    let h = Harness::builder().start();

    h.controller.enqueue(track(1, 200), "alice").await.unwrap();
    h.controller.enqueue(track(2, 200), "bob").await.unwrap();
    h.controller.enqueue(track(3, 200), "carol").await.unwrap();
    h.wait_playing(&track(1, 200).id).await;

    for command in [
        Command::pause(),
        Command::seek(12.0),
        Command::resume(),
        Command::volume(40),
        Command::next(),
    ] {
        h.controller.command(command).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    h.wait_playing(&track(2, 200).id).await;
    h.controller.promote(0).await.unwrap();
    h.controller.command(Command::stop()).await.unwrap();
    let last = h.flushed().await;

    let revisions = h.store.revisions();
    assert!(revisions.len() > 3);
    assert!(
        revisions.windows(2).all(|w| w[0] < w[1]),
        "revisions not strictly increasing: {:?}",
        revisions
    );
    assert_eq!(revisions.last().copied(), Some(last.revision));
}

#[tokio::test(start_paused = true)]
async fn test_auto_advance_until_idle() {
    let h = Harness::builder().start();
    let first = track(1, 3);
    let second = track(2, 3);

    h.controller.enqueue(first.clone(), "alice").await.unwrap();
    h.controller.enqueue(second.clone(), "bob").await.unwrap();

    h.wait_playing(&first.id).await;
    let next = h.wait_playing(&second.id).await;
    assert!(next.queue.is_empty());
    assert!(next.elapsed < 1.0);

    let idle = h
        .wait_until("queue exhausted", Duration::from_secs(10), |s| s.phase == Phase::Idle)
        .await;
    assert!(idle.play_state.is_cleared());
    assert!(h.flushed().await.is_cleared());

    use oopzbot_player::cache::MetadataStore;
    let plays = h.metadata.recent_plays(10).await.unwrap();
    assert_eq!(plays.len(), 2);
    assert_eq!(plays[0].track_id, second.id);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_duration_uses_default() {
    let h = Harness::builder().start();
    let song = track(1, 0);

    h.controller.enqueue(song.clone(), "alice").await.unwrap();
    let playing = h.wait_playing(&song.id).await;
    assert!(close(playing.play_state.duration, 300.0, 0.01));
}

#[tokio::test(start_paused = true)]
async fn test_queue_head_is_prefetched() {
    let h = Harness::builder().start();
    let first = track(1, 200);
    let second = track(2, 200);

    h.controller.enqueue(first.clone(), "alice").await.unwrap();
    h.controller.enqueue(second.clone(), "bob").await.unwrap();
    h.wait_playing(&first.id).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.resolver.calls(&second.id), 1);
    let cached = h.cache.entry(&second.id).await.unwrap().unwrap();
    assert_eq!(cached.use_count, 0);

    h.controller.command(Command::next()).await.unwrap();
    h.wait_playing(&second.id).await;
    assert_eq!(h.resolver.calls(&second.id), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let played = h.cache.entry(&second.id).await.unwrap().unwrap();
    assert_eq!(played.use_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_prefetch_of_replaced_head_is_dropped() {
    let resolver = ScriptedResolver::new();
    let first = track(1, 200);
    let slow = track(2, 200);
    let promoted = track(3, 200);
    resolver.delay(&slow.id, Duration::from_millis(500));
    let h = Harness::builder().resolver(resolver.clone()).start();

    h.controller.enqueue(first.clone(), "alice").await.unwrap();
    h.wait_playing(&first.id).await;
    h.controller.enqueue(slow.clone(), "bob").await.unwrap();
    h.controller.enqueue(promoted.clone(), "carol").await.unwrap();
    h.controller.promote(1).await.unwrap();

    // Both prefetches land; the slow one is no longer the head
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(resolver.calls(&slow.id), 1);

    h.controller.command(Command::next()).await.unwrap();
    let next = h.snapshot().await;
    assert_eq!(next.phase, Phase::Playing);
    assert_eq!(next.current.unwrap().track.id, promoted.id);
    assert_eq!(resolver.calls(&promoted.id), 1);
}

#[tokio::test(start_paused = true)]
async fn test_prefetch_disabled() {
    let h = Harness::builder().prefetch(false).start();
    let first = track(1, 200);
    let second = track(2, 200);

    h.controller.enqueue(first.clone(), "alice").await.unwrap();
    h.controller.enqueue(second.clone(), "bob").await.unwrap();
    h.wait_playing(&first.id).await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.resolver.calls(&second.id), 0);
}

#[tokio::test(start_paused = true)]
async fn test_next_during_resolution_discards_late_result() {
    let resolver = ScriptedResolver::new();
    let slow = track(1, 200);
    let fast = track(2, 200);
    resolver.delay(&slow.id, Duration::from_millis(800));
    let h = Harness::builder().resolver(resolver.clone()).start();

    h.controller.enqueue(slow.clone(), "alice").await.unwrap();
    h.controller.enqueue(fast.clone(), "bob").await.unwrap();
    let resolving = h.snapshot().await;
    assert_eq!(resolving.phase, Phase::Resolving);

    h.controller.command(Command::next()).await.unwrap();
    h.wait_playing(&fast.id).await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    let after = h.snapshot().await;
    assert_eq!(after.current.unwrap().track.id, fast.id);
    assert_eq!(resolver.calls(&slow.id), 1);
}

#[tokio::test(start_paused = true)]
async fn test_next_with_nothing_queued_is_ignored() {
    let h = Harness::builder().start();
    let before = h.flushed().await.revision;

    h.controller.command(Command::next()).await.unwrap();
    let after = h.snapshot().await;
    assert_eq!(after.phase, Phase::Idle);
    assert_eq!(after.play_state.revision, before);
}

#[tokio::test(start_paused = true)]
async fn test_volume_is_echoed_and_forwarded() {
    let h = Harness::builder().start();

    h.controller.command(Command::volume(35)).await.unwrap();
    let state = h.flushed().await;
    assert_eq!(state.volume, 35);
    assert!(state.is_cleared());
    assert_eq!(h.bridge.status().await.unwrap().volume, 35);

    h.controller.enqueue(track(1, 200), "alice").await.unwrap();
    let playing = h.wait_playing(&track(1, 200).id).await;
    assert_eq!(playing.play_state.volume, 35);
}

#[tokio::test(start_paused = true)]
async fn test_queue_operations_keep_order() {
    let resolver = ScriptedResolver::new();
    let h = Harness::builder().resolver(resolver).start();
    let playing = track(1, 200);

    h.controller.enqueue(playing.clone(), "alice").await.unwrap();
    h.wait_playing(&playing.id).await;
    for n in 2..=5 {
        h.controller.enqueue(track(n, 200), "bob").await.unwrap();
    }

    let removed = h.controller.remove(1).await.unwrap();
    assert_eq!(removed.track.id, track(3, 200).id);
    h.controller.promote(2).await.unwrap();

    let ids: Vec<_> = h
        .snapshot()
        .await
        .queue
        .into_iter()
        .map(|e| e.track.id)
        .collect();
    assert_eq!(ids, vec![track(5, 200).id, track(2, 200).id, track(4, 200).id]);

    let err = h.controller.remove(9).await.unwrap_err();
    assert!(matches!(err, Error::QueueIndexInvalid { index: 9, len: 3 }));
    let err = h.controller.promote(3).await.unwrap_err();
    assert!(matches!(err, Error::QueueIndexInvalid { .. }));

    assert_eq!(h.controller.clear_queue().await.unwrap(), 3);
    let after = h.snapshot().await;
    assert!(after.queue.is_empty());
    assert_eq!(after.phase, Phase::Playing);
}

// Real clock: SQLite work runs off the runtime, paused time would race it
#[tokio::test]
async fn test_restart_resumes_persisted_queue() {
    let pool = oopzbot_common::db::init_memory_database().await.unwrap();
    {
        let queue = QueueStore::load(pool.clone()).await.unwrap();
        queue.enqueue(track(1, 200), "alice").await.unwrap();
        queue.enqueue(track(2, 200), "bob").await.unwrap();
    }

    let queue = QueueStore::load(pool.clone()).await.unwrap();
    let h = Harness::builder()
        .queue(queue)
        .initial(PlayState::cleared(55, 41))
        .start();

    let playing = h.wait_playing(&track(1, 200).id).await;
    assert_eq!(playing.queue.len(), 1);
    assert_eq!(playing.play_state.volume, 55);
    assert!(playing.play_state.revision > 41);
    assert!(h.store.revisions().iter().all(|r| *r > 41));
}

#[tokio::test(start_paused = true)]
async fn test_refused_stream_is_refreshed_and_restarted() {
    let (agent, remote) = ScriptedBackend::new("primary");
    let song = track(1, 200);
    let url = ScriptedResolver::stream_url(&song.id);
    remote.refuse_stream(&url, 1);
    let h = Harness::builder().backend(agent).start();

    h.controller.enqueue(song.clone(), "alice").await.unwrap();
    h.wait_playing(&song.id).await;
    h.wait_until("refreshed stream to start", Duration::from_secs(5), |_| {
        !remote.starts().is_empty()
    })
    .await;

    assert_eq!(h.resolver.calls(&song.id), 2);
    assert_eq!(remote.count("start"), 2);
    assert_eq!(remote.starts()[0].0, url);

    let status = h.bridge.status().await.unwrap();
    assert_eq!(status.backend.as_deref(), Some("primary"));
    assert_eq!(status.failovers, 0);
    assert!(!status.degraded);
    assert_eq!(status.stream_ref.as_deref(), Some(url.as_str()));

    let playing = h.snapshot().await;
    assert_eq!(playing.phase, Phase::Playing);
    assert!(!playing.actuator_degraded);
    assert!(h.notifier.of_kind(NotificationKind::Skipped).is_empty());
    assert!(h.notifier.of_kind(NotificationKind::Degraded).is_empty());

    // One play, however many resolutions it took
    let cached = h.cache.entry(&song.id).await.unwrap().unwrap();
    assert_eq!(cached.use_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_stream_refused_after_refresh_is_skipped() {
    let (agent, remote) = ScriptedBackend::new("primary");
    let dead = track(1, 200);
    let good = track(2, 200);
    remote.refuse_stream(&ScriptedResolver::stream_url(&dead.id), u32::MAX);
    let h = Harness::builder().backend(agent).start();

    h.controller.enqueue(dead.clone(), "alice").await.unwrap();
    h.controller.enqueue(good.clone(), "bob").await.unwrap();
    h.wait_playing(&good.id).await;

    let skipped = h
        .notifier
        .wait_for(NotificationKind::Skipped, Duration::from_secs(5))
        .await;
    assert!(skipped.message.contains("Song 1"), "{}", skipped.message);
    assert_eq!(skipped.payload["requester"], "alice");
    assert_eq!(h.resolver.calls(&dead.id), 2);

    h.wait_until("good stream to start", Duration::from_secs(5), |_| {
        !remote.starts().is_empty()
    })
    .await;
    assert_eq!(
        remote.starts(),
        vec![(ScriptedResolver::stream_url(&good.id), 0.0)]
    );

    let status = h.bridge.status().await.unwrap();
    assert_eq!(status.failovers, 0);
    assert!(!status.degraded);
    assert!(!h.snapshot().await.actuator_degraded);
}

#[tokio::test]
async fn test_stalled_queue_write_times_out() {
    let pool = oopzbot_common::db::init_memory_database().await.unwrap();
    let queue = QueueStore::load(pool.clone())
        .await
        .unwrap()
        .with_write_timeout(Duration::from_millis(100));
    let h = Harness::builder().queue(queue).start();
    let song = track(1, 200);

    // Single connection pool: holding it stalls every write
    let held = pool.acquire().await.unwrap();
    let err = h.controller.enqueue(song.clone(), "alice").await.unwrap_err();
    assert!(matches!(err, Error::StoreWriteFailed(_)), "{:?}", err);

    let idle = h.snapshot().await;
    assert_eq!(idle.phase, Phase::Idle);
    assert!(idle.queue.is_empty());

    drop(held);
    h.controller.enqueue(song.clone(), "alice").await.unwrap();
    h.wait_playing(&song.id).await;
}

#[tokio::test]
async fn test_failed_dequeue_is_retried_on_tick() {
    let pool = oopzbot_common::db::init_memory_database().await.unwrap();
    let queue = QueueStore::load(pool.clone()).await.unwrap();
    let h = Harness::builder().queue(queue).start();
    let first = track(1, 200);
    let second = track(2, 200);

    h.controller.enqueue(first.clone(), "alice").await.unwrap();
    h.controller.enqueue(second.clone(), "bob").await.unwrap();
    h.wait_playing(&first.id).await;

    sqlx::query("ALTER TABLE queue RENAME TO queue_offline")
        .execute(&pool)
        .await
        .unwrap();
    h.controller.command(Command::next()).await.unwrap();
    let stuck = h
        .wait_until("advance to fail", Duration::from_secs(5), |s| {
            s.phase == Phase::Resolving && s.current.is_none()
        })
        .await;
    assert_eq!(stuck.queue.len(), 1);

    // Retries keep failing without dropping the queue
    tokio::time::sleep(Duration::from_millis(350)).await;
    let still = h.snapshot().await;
    assert_eq!(still.phase, Phase::Resolving);
    assert_eq!(still.queue.len(), 1);

    sqlx::query("ALTER TABLE queue_offline RENAME TO queue")
        .execute(&pool)
        .await
        .unwrap();
    let playing = h.wait_playing(&second.id).await;
    assert!(playing.queue.is_empty());
}
