//! End-to-end: TCP command to relayed audio, then a clean shutdown

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use spotd::audio::create_shared_queue;
use spotd::config::{EngineConfig, ServerConfig};
use spotd::coordinator::{CoordinationLoop, Notifier, SessionHooks};
use spotd::error::SessionError;
use spotd::network::CommandServer;
use spotd::session::{Credentials, SessionEngine, SimulatedEngine};
use spotd::Error;

fn fast_engine() -> EngineConfig {
    EngineConfig {
        metadata_delay_ms: 20,
        track_duration_secs: 0.3,
        idle_poll_ms: 50,
        ..Default::default()
    }
}

fn read_line(reader: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).expect("read");
    line
}

#[test]
fn test_play_over_tcp_then_interrupt() {
    let relay = create_shared_queue();
    let notifier = Notifier::new();

    let server = {
        let notifier = notifier.clone();
        let config = ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        };
        CommandServer::start(&config, move |command| notifier.submit(command)).unwrap()
    };
    let addr = server.local_addr();

    let hooks = Arc::new(SessionHooks::new(notifier.clone(), relay.clone()));
    let mut engine = SimulatedEngine::new(fast_engine(), hooks).unwrap();
    engine.login(&Credentials::new("listener", "secret")).unwrap();

    let mut coordinator = CoordinationLoop::new(&notifier, engine, relay.clone());
    coordinator.attach_server(server);
    let looper = thread::spawn(move || {
        let outcome = coordinator.run();
        (outcome, coordinator.engine().outstanding_handles())
    });

    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);
    assert!(read_line(&mut reader).starts_with("spotd v"));

    writer.write_all(b"PLAY spotify:track:e2e\r\n").unwrap();
    assert_eq!(read_line(&mut reader), "OK\n");

    let frame = relay
        .take_timeout(Duration::from_secs(5))
        .expect("audio reaches the relay");
    assert_eq!(frame.sample_rate(), 44100);
    assert_eq!(frame.channels(), 2);
    assert!(frame.frame_count() > 0);

    notifier.interrupt();
    let (outcome, outstanding) = looper.join().unwrap();
    assert!(outcome.is_ok());
    assert_eq!(outstanding, 0);

    // Shutdown stopped the server along with the loop
    assert_eq!(read_line(&mut reader), "");
    assert!(TcpStream::connect(addr).is_err());
}

#[test]
fn test_invalid_link_keeps_running() {
    let relay = create_shared_queue();
    let notifier = Notifier::new();

    let hooks = Arc::new(SessionHooks::new(notifier.clone(), relay.clone()));
    let mut engine = SimulatedEngine::new(fast_engine(), hooks).unwrap();
    engine.login(&Credentials::new("listener", "secret")).unwrap();

    let mut coordinator = CoordinationLoop::new(&notifier, engine, relay.clone());
    let looper = thread::spawn(move || {
        let outcome = coordinator.run();
        (outcome, coordinator.engine().outstanding_handles())
    });

    notifier.submit(spotd::protocol::Command::play("not a link"));
    thread::sleep(Duration::from_millis(50));
    assert!(relay.is_empty());

    notifier.interrupt();
    let (outcome, outstanding) = looper.join().unwrap();
    assert!(outcome.is_ok());
    assert_eq!(outstanding, 0);
}

#[test]
fn test_login_failure_ends_loop() {
    let relay = create_shared_queue();
    let notifier = Notifier::new();

    let hooks = Arc::new(SessionHooks::new(notifier.clone(), relay.clone()));
    let mut engine = SimulatedEngine::new(fast_engine(), hooks).unwrap();
    engine.login(&Credentials::new("listener", "")).unwrap();

    let mut coordinator = CoordinationLoop::new(&notifier, engine, relay);
    match coordinator.run() {
        Err(Error::Session(SessionError::LoginFailed(_))) => {}
        other => panic!("expected login failure, got {:?}", other),
    }
}
