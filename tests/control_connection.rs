mod common;

use common::{Behavior, FakeServer};
use rouilleftp::core_cache::ListingCache;
use rouilleftp::core_error::FtpError;
use rouilleftp::core_ftpcommand::FtpCommand;
use rouilleftp::core_log::SessionLogs;
use rouilleftp::core_network::{CommandOptions, ConnectParams, ControlConnection, KeepAliveMode};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn params(server: &FakeServer) -> ConnectParams {
    let mut params = ConnectParams::new("127.0.0.1", server.port(), "anonymous", "guest@");
    params.server_reply_timeout = Duration::from_secs(5);
    params
}

async fn connected(params: ConnectParams) -> ControlConnection {
    let conn = ControlConnection::new(params, Arc::new(SessionLogs::default())).unwrap();
    let path = conn.connect().await.unwrap();
    assert_eq!(path, "/");
    conn
}

#[tokio::test]
async fn test_login_detects_unix_server() {
    let server = FakeServer::start(Behavior::default()).await;
    let conn = connected(params(&server)).await;
    assert!(conn.is_connected());
    assert_eq!(conn.path_type(), rouilleftp::core_path::ServerPathType::Unix);
    assert!(conn.system().contains("UNIX"));
    let commands = server.commands();
    assert_eq!(&commands[..2], &["USER anonymous".to_string(), "PASS guest@".to_string()]);

    // Password never reaches the session log in clear.
    let lines = conn.logs().lines(conn.log_uid());
    assert!(lines.iter().any(|l| l.contains("PASS ********")));
    assert!(!lines.iter().any(|l| l.contains("guest@")));

    conn.quit().await.unwrap();
    assert!(!conn.is_connected());
}

#[tokio::test]
async fn test_preliminary_replies_are_never_terminal() {
    let mut behavior = Behavior::default();
    behavior.overrides.insert(
        "NOOP".into(),
        vec![
            "150 working on it".into(),
            "120-still".into(),
            "120 busy".into(),
            "200 finally".into(),
        ],
    );
    let server = FakeServer::start(behavior).await;
    let conn = connected(params(&server)).await;
    let reply = conn
        .send_command(&FtpCommand::NOOP, &CommandOptions::default())
        .await
        .unwrap();
    assert_eq!(reply.code, 200);
    assert_eq!(reply.message(), "finally");
}

#[tokio::test]
async fn test_working_path_is_cached() {
    let server = FakeServer::start(Behavior::default()).await;
    server.add_dir("/pub/sub");
    let conn = connected(params(&server)).await;
    let opts = CommandOptions::default();

    conn.change_working_path("/pub", &opts).await.unwrap();
    conn.change_working_path("/pub", &opts).await.unwrap();
    assert_eq!(server.count("CWD"), 1);
    assert_eq!(conn.current_working_path(false, &opts).await.unwrap(), "/pub");

    let refused = conn.change_working_path("/missing", &opts).await;
    assert!(matches!(refused, Err(FtpError::Server(ref r)) if r.code == 550));

    // Raw commands may move the server anywhere.
    conn.send_command(&FtpCommand::Raw("CWD sub".into()), &opts).await.unwrap();
    assert_eq!(conn.cached_working_path(), None);
    assert_eq!(conn.current_working_path(false, &opts).await.unwrap(), "/pub/sub");
}

#[tokio::test]
async fn test_compressed_listing_round_trip() {
    let mut behavior = Behavior::default();
    behavior.allow_compression = true;
    let server = FakeServer::start(behavior).await;
    server.add_file("/pub/a.txt", b"hello");
    server.add_file("/pub/b.bin", &[7u8; 3000]);
    server.add_dir("/pub/docs");

    let mut p = params(&server);
    p.compress = true;
    let conn = connected(p).await;
    assert!(conn.compress_enabled());

    let listing = conn.list(Some("/pub"), &CommandOptions::default()).await.unwrap();
    assert_eq!(listing, server.listing_of("/pub"));
    assert!(server.commands().iter().any(|c| c == "MODE Z"));
}

#[tokio::test]
async fn test_refused_compression_falls_back() {
    let server = FakeServer::start(Behavior::default()).await;
    server.add_file("/pub/a.txt", b"hello");
    let mut p = params(&server);
    p.compress = true;
    let conn = connected(p).await;
    assert!(!conn.compress_enabled());
    let listing = conn.list(Some("/pub"), &CommandOptions::default()).await.unwrap();
    assert_eq!(listing, server.listing_of("/pub"));
}

#[tokio::test]
async fn test_listing_cache_scenario() {
    let mut behavior = Behavior::default();
    let raw: Vec<u8> = (0..1200u32).map(|i| b"abcdefghij"[(i % 10) as usize]).collect();
    behavior.raw_listings.insert("/".into(), raw.clone());
    let server = FakeServer::start(behavior).await;
    let conn = connected(params(&server)).await;
    let cache = ListingCache::new(1024 * 1024);
    let opts = CommandOptions::default();

    let first = conn.list_cached(&cache, "/", false, &opts).await.unwrap();
    assert_eq!(first.len(), 1200);
    assert_eq!(&first[..], &raw[..]);

    let hit = cache.lookup(&conn.cache_key("/")).unwrap();
    assert_eq!(&hit.listing[..], &raw[..]);
    conn.list_cached(&cache, "/", false, &opts).await.unwrap();
    assert_eq!(server.count("LIST"), 1);

    cache.invalidate_subtree(conn.host(), conn.port(), conn.user(), conn.path_type(), "/");
    assert!(cache.lookup(&conn.cache_key("/")).is_none());
}

#[tokio::test]
async fn test_cancel_sends_abort_and_keeps_session() {
    let mut behavior = Behavior::default();
    behavior.noop_delay = Duration::from_millis(800);
    let server = FakeServer::start(behavior).await;
    let conn = connected(params(&server)).await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let result = conn
        .send_command(&FtpCommand::NOOP, &CommandOptions::with_cancel(cancel.clone()))
        .await;
    assert!(matches!(result, Err(FtpError::Cancelled)));
    assert!(server.commands().iter().any(|c| c == "ABOR"));

    // The reply to ABOR was drained; the next command gets its own reply.
    let reply = conn
        .send_command(&FtpCommand::SYST, &CommandOptions::default())
        .await
        .unwrap();
    assert_eq!(reply.code, 215);
}

#[tokio::test]
async fn test_keep_alive_never_overlaps_commands() {
    let mut behavior = Behavior::default();
    behavior.noop_delay = Duration::from_millis(600);
    let server = FakeServer::start(behavior).await;
    let mut p = params(&server);
    p.keep_alive.enabled = true;
    p.keep_alive.send_every_secs = 1;
    let conn = connected(p).await;
    assert_eq!(conn.keep_alive_mode(), KeepAliveMode::Waiting);

    // The probe goes out after a second of silence and is held by the server;
    // this command lands in the middle of it and must wait its turn.
    tokio::time::sleep(Duration::from_millis(1300)).await;
    let reply = conn
        .send_command(&FtpCommand::SYST, &CommandOptions::default())
        .await
        .unwrap();
    assert_eq!(reply.code, 215);

    let commands = server.commands();
    let noop = commands.iter().position(|c| c == "NOOP").expect("no keep-alive probe");
    let syst = commands.iter().rposition(|c| c == "SYST").unwrap();
    assert!(noop < syst);
    assert!(!server.overlap_detected());
    assert_eq!(conn.keep_alive_mode(), KeepAliveMode::Waiting);
}

#[tokio::test]
async fn test_reply_timeout_tears_connection_down() {
    let mut behavior = Behavior::default();
    behavior.overrides.insert("NOOP".into(), vec![]);
    let server = FakeServer::start(behavior).await;
    let conn = connected(params(&server)).await;

    let opts = CommandOptions {
        reply_timeout: Some(Duration::from_millis(300)),
        ..CommandOptions::default()
    };
    let result = conn.send_command(&FtpCommand::NOOP, &opts).await;
    assert!(matches!(result, Err(FtpError::ReplyTimeout(_))));
    assert!(!conn.is_connected());
    let again = conn.send_command(&FtpCommand::NOOP, &CommandOptions::default()).await;
    assert!(matches!(again, Err(FtpError::NotConnected)));
}

#[tokio::test]
async fn test_keep_alive_never_overlaps_random_interleavings() {
    // (send_every_secs, noop_delay_ms, [(pause_ms, command)])
    let plans: Vec<(u64, u64, Vec<(u64, u8)>)> = {
        let mut rng = rand::thread_rng();
        (0..6)
            .map(|_| {
                let send_every = rng.gen_range(1..=2);
                let noop_delay = rng.gen_range(50..700);
                let commands = (0..6).map(|_| (rng.gen_range(0..900), rng.gen_range(0..3))).collect();
                (send_every, noop_delay, commands)
            })
            .collect()
    };

    let mut rounds = Vec::new();
    for (send_every, noop_delay, commands) in plans {
        rounds.push(tokio::spawn(async move {
            let mut behavior = Behavior::default();
            behavior.noop_delay = Duration::from_millis(noop_delay);
            let server = FakeServer::start(behavior).await;
            let mut p = params(&server);
            p.keep_alive.enabled = true;
            p.keep_alive.send_every_secs = send_every;
            let conn = connected(p).await;

            for (pause, which) in &commands {
                tokio::time::sleep(Duration::from_millis(*pause)).await;
                let cmd = match which {
                    0 => FtpCommand::NOOP,
                    1 => FtpCommand::PWD,
                    _ => FtpCommand::SYST,
                };
                let reply = conn.send_command(&cmd, &CommandOptions::default()).await.unwrap();
                assert!(reply.is_success(), "{:?} got {}", cmd, reply.text());
            }
            let mode = conn.keep_alive_mode();
            assert!(
                matches!(mode, KeepAliveMode::Waiting | KeepAliveMode::Processing),
                "left in {:?}",
                mode
            );
            conn.close().await;
            (server.overlap_detected(), send_every, noop_delay, commands)
        }));
    }
    for round in rounds {
        let (overlap, send_every, noop_delay, commands) = round.await.unwrap();
        assert!(
            !overlap,
            "two commands outstanding with send_every={}s noop_delay={}ms commands={:?}",
            send_every, noop_delay, commands
        );
    }
}

#[tokio::test]
async fn test_unanswered_keep_alive_tears_connection_down() {
    let mut behavior = Behavior::default();
    behavior.overrides.insert("NOOP".into(), vec![]);
    let server = FakeServer::start(behavior).await;
    let mut p = params(&server);
    p.server_reply_timeout = Duration::from_millis(500);
    p.keep_alive.enabled = true;
    p.keep_alive.send_every_secs = 1;
    let conn = connected(p).await;

    // Keep-alive NOOP after one second, reply timeout half a second later.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(server.count("NOOP"), 1);
    assert!(!conn.is_connected());
    assert_eq!(conn.keep_alive_mode(), KeepAliveMode::None);

    let again = conn.send_command(&FtpCommand::SYST, &CommandOptions::default()).await;
    assert!(matches!(again, Err(FtpError::NotConnected)));
    assert_eq!(conn.keep_alive_mode(), KeepAliveMode::None);
}

#[tokio::test]
async fn test_expired_keep_alive_restarts_on_next_command() {
    let server = FakeServer::start(Behavior::default()).await;
    let mut p = params(&server);
    p.keep_alive.enabled = true;
    p.keep_alive.stop_after_mins = 0;
    let conn = connected(p).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(conn.keep_alive_mode(), KeepAliveMode::None);

    conn.send_command(&FtpCommand::NOOP, &CommandOptions::default())
        .await
        .unwrap();
    // Read before the restarted timer task gets its first turn.
    assert_eq!(conn.keep_alive_mode(), KeepAliveMode::Waiting);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(conn.keep_alive_mode(), KeepAliveMode::None);
    conn.send_command(&FtpCommand::SYST, &CommandOptions::default())
        .await
        .unwrap();
    assert_eq!(conn.keep_alive_mode(), KeepAliveMode::Waiting);
}
