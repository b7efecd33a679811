mod common;

use common::{harness, runtime, test_config, token_mock};
use mockito::{Matcher, Server};
use serde_json::json;
use spotify_player_control::api::CommandSlot;
use spotify_player_control::host::{BufferSink, SinkData};
use spotify_player_control::models::Command;
use std::time::Duration;

async fn wait_for(rx: &mut tokio::sync::mpsc::UnboundedReceiver<String>, source: &str) {
    loop {
        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("data-ready signal")
            .expect("channel open");
        if got == source {
            return;
        }
    }
}

#[test]
fn unauthenticated_execute_sends_nothing() {
    let mut server = Server::new();
    let base = server.url();
    let m = server.mock("PUT", "/me/player/volume").expect(0).create();

    let h = harness(&test_config(&base, &base), None);
    let mut sink = BufferSink::new();
    let ok = runtime().block_on(h.client.execute(Command::Volume, &mut sink, r#"{"volume_percent": 50}"#));

    assert!(!ok);
    assert!(sink.is_untouched());
    assert_eq!(h.client.dispatcher().slot(Command::Volume), CommandSlot::default());
    m.assert();
}

#[test]
fn volume_dispatch_poll_and_drain() {
    let mut server = Server::new();
    let base = server.url();
    let _t = token_mock(&mut server, 1);
    let m = server
        .mock("PUT", "/me/player/volume")
        .match_query(Matcher::UrlEncoded("volume_percent".into(), "50".into()))
        .match_header("authorization", "Bearer access-1")
        .with_status(204)
        .expect(1)
        .create();

    let mut h = harness(&test_config(&base, &base), Some("r"));
    let client = &h.client;
    let rx = &mut h.rx;
    runtime().block_on(async {
        let args = r#"{"volume_percent": 50}"#;

        let mut first = BufferSink::new();
        assert!(client.execute(Command::Volume, &mut first, args).await);
        assert!(first.is_untouched());
        assert!(client.dispatcher().slot(Command::Volume).processing);

        let mut second = BufferSink::new();
        assert!(client.execute(Command::Volume, &mut second, args).await, "busy poll still reports true");
        assert!(second.is_untouched());

        wait_for(rx, "volume").await;
        let slot = client.dispatcher().slot(Command::Volume);
        assert!(slot.data_ready && !slot.processing);

        let mut third = BufferSink::new();
        assert!(client.execute(Command::Volume, &mut third, args).await);
        assert_eq!(third.data, SinkData::Null);
        assert!(third.errors.is_empty());
        assert_eq!(client.dispatcher().slot(Command::Volume), CommandSlot::default());
    });
    m.assert();
}

#[test]
fn get_payload_is_delivered_once() {
    let mut server = Server::new();
    let base = server.url();
    let _t = token_mock(&mut server, 1);
    let m = server
        .mock("GET", "/me/player")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"is_playing": true, "progress_ms": 1200}).to_string())
        .expect(2)
        .create();

    let mut h = harness(&test_config(&base, &base), Some("r"));
    let client = &h.client;
    let rx = &mut h.rx;
    runtime().block_on(async {
        let mut sink = BufferSink::new();
        assert!(client.execute(Command::PlaybackState, &mut sink, "").await);
        wait_for(rx, "playback_state").await;

        let mut drained = BufferSink::new();
        assert!(client.execute(Command::PlaybackState, &mut drained, "").await);
        assert_eq!(drained.data, SinkData::Json(json!({"is_playing": true, "progress_ms": 1200})));
        assert!(drained.errors.is_empty());

        // slot is empty again, so the next call starts a new request
        let mut again = BufferSink::new();
        assert!(client.execute(Command::PlaybackState, &mut again, "").await);
        assert!(again.is_untouched());
        assert!(client.dispatcher().slot(Command::PlaybackState).processing);
        wait_for(rx, "playback_state").await;
    });
    m.assert();
}

#[test]
fn get_with_no_content_drains_null() {
    let mut server = Server::new();
    let base = server.url();
    let _t = token_mock(&mut server, 1);
    let _m = server.mock("GET", "/me/player/currently-playing").with_status(204).create();

    let mut h = harness(&test_config(&base, &base), Some("r"));
    let client = &h.client;
    let rx = &mut h.rx;
    runtime().block_on(async {
        let mut sink = BufferSink::new();
        assert!(client.execute(Command::CurrentlyPlaying, &mut sink, "").await);
        wait_for(rx, "currently_playing").await;
        let mut drained = BufferSink::new();
        assert!(client.execute(Command::CurrentlyPlaying, &mut drained, "").await);
        assert_eq!(drained.data, SinkData::Null);
        assert!(drained.errors.is_empty());
    });
}

#[test]
fn mutating_command_reports_status_code() {
    let mut server = Server::new();
    let base = server.url();
    let _t = token_mock(&mut server, 1);
    let _m = server
        .mock("POST", "/me/player/next")
        .with_status(404)
        .with_header("content-type", "application/json")
        .with_body(json!({"error": {"status": 404, "message": "Player command failed: No active device found"}}).to_string())
        .create();

    let mut h = harness(&test_config(&base, &base), Some("r"));
    let client = &h.client;
    let rx = &mut h.rx;
    runtime().block_on(async {
        let mut sink = BufferSink::new();
        assert!(client.execute(Command::Next, &mut sink, "").await);
        wait_for(rx, "next").await;
        let mut drained = BufferSink::new();
        assert!(client.execute(Command::Next, &mut drained, "").await);
        assert_eq!(drained.data, SinkData::Null);
        assert_eq!(drained.errors, vec!["404".to_string()]);
    });
}

#[test]
fn missing_argument_reports_and_frees_the_slot() {
    let mut server = Server::new();
    let base = server.url();
    let _t = token_mock(&mut server, 1);
    let m = server
        .mock("PUT", "/me/player/volume")
        .match_query(Matcher::UrlEncoded("volume_percent".into(), "20".into()))
        .with_status(204)
        .expect(1)
        .create();
    let unsent = server
        .mock("PUT", "/me/player/volume")
        .match_query(Matcher::UrlEncoded("device_id".into(), "d1".into()))
        .expect(0)
        .create();

    let mut h = harness(&test_config(&base, &base), Some("r"));
    let client = &h.client;
    let rx = &mut h.rx;
    runtime().block_on(async {
        let mut sink = BufferSink::new();
        assert!(!client.execute(Command::Volume, &mut sink, r#"{"device_id": "d1"}"#).await);
        assert_eq!(sink.errors, vec!["Argument 'volume_percent' required.".to_string()]);
        assert_eq!(sink.data, SinkData::Unset);
        assert!(!client.dispatcher().slot(Command::Volume).processing);

        let mut retry = BufferSink::new();
        assert!(client.execute(Command::Volume, &mut retry, r#"{"volume_percent": 20}"#).await);
        assert!(retry.is_untouched());
        wait_for(rx, "volume").await;
    });
    m.assert();
    unsent.assert();
}

#[test]
fn play_sends_device_in_query_and_rest_in_body() {
    let mut server = Server::new();
    let base = server.url();
    let _t = token_mock(&mut server, 1);
    let m = server
        .mock("PUT", "/me/player/play")
        .match_query(Matcher::UrlEncoded("device_id".into(), "kitchen".into()))
        .match_body(Matcher::Json(json!({"context_uri": "spotify:album:1", "offset": {"position": 2}})))
        .with_status(204)
        .expect(1)
        .create();

    let mut h = harness(&test_config(&base, &base), Some("r"));
    let client = &h.client;
    let rx = &mut h.rx;
    runtime().block_on(async {
        let args = r#"{"device_id": "kitchen", "context_uri": "spotify:album:1", "offset": {"position": 2}}"#;
        let mut sink = BufferSink::new();
        assert!(client.execute(Command::Play, &mut sink, args).await);
        wait_for(rx, "play").await;
        let mut drained = BufferSink::new();
        assert!(client.execute(Command::Play, &mut drained, args).await);
        assert!(drained.errors.is_empty(), "unexpected errors: {:?}", drained.errors);
    });
    m.assert();
}

#[test]
fn slots_are_independent() {
    let mut server = Server::new();
    let base = server.url();
    let _t = token_mock(&mut server, 1);
    let _pause = server.mock("PUT", "/me/player/pause").with_status(204).create();
    let _shuffle = server
        .mock("PUT", "/me/player/shuffle")
        .match_query(Matcher::UrlEncoded("state".into(), "true".into()))
        .with_status(204)
        .create();

    let mut h = harness(&test_config(&base, &base), Some("r"));
    let client = &h.client;
    let rx = &mut h.rx;
    runtime().block_on(async {
        let mut a = BufferSink::new();
        let mut b = BufferSink::new();
        assert!(client.execute(Command::Pause, &mut a, "{}").await);
        assert!(client.execute(Command::Shuffle, &mut b, r#"{"state": true}"#).await);
        assert!(client.dispatcher().slot(Command::Pause).processing);
        assert!(client.dispatcher().slot(Command::Shuffle).processing);

        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(
                tokio::time::timeout(Duration::from_secs(5), rx.recv())
                    .await
                    .expect("signal")
                    .expect("open"),
            );
        }
        seen.sort();
        assert_eq!(seen, vec!["pause".to_string(), "shuffle".to_string()]);
        assert!(client.dispatcher().slot(Command::Pause).data_ready);
        assert!(client.dispatcher().slot(Command::Shuffle).data_ready);
    });
}

#[test]
fn transport_failure_is_buffered_as_error() {
    let mut server = Server::new();
    let auth_base = server.url();
    let _t = token_mock(&mut server, 1);
    // grab a free port and close it so nothing answers there
    let dead_port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let api_base = format!("http://127.0.0.1:{}/v1", dead_port);

    let mut h = harness(&test_config(&api_base, &auth_base), Some("r"));
    let client = &h.client;
    let rx = &mut h.rx;
    runtime().block_on(async {
        let mut sink = BufferSink::new();
        assert!(client.execute(Command::Devices, &mut sink, "").await);
        wait_for(rx, "devices").await;
        let mut drained = BufferSink::new();
        assert!(client.execute(Command::Devices, &mut drained, "").await);
        assert_eq!(drained.data, SinkData::Null);
        assert_eq!(drained.errors.len(), 1);
        assert!(!drained.errors[0].is_empty());
    });
}
