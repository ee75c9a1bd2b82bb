//! SIGTERM delivered to the process stops the coordination loop

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use signal_hook::consts::SIGTERM;
use spotd::audio::create_shared_queue;
use spotd::config::EngineConfig;
use spotd::coordinator::{CoordinationLoop, Notifier, SessionHooks, SignalRelay};
use spotd::session::{Credentials, SessionEngine, SimulatedEngine};

#[test]
fn test_sigterm_stops_loop() {
    let relay = create_shared_queue();
    let notifier = Notifier::new();

    let hooks = Arc::new(SessionHooks::new(notifier.clone(), relay.clone()));
    let mut engine = SimulatedEngine::new(EngineConfig::default(), hooks).unwrap();
    engine.login(&Credentials::new("listener", "secret")).unwrap();

    let mut signals = SignalRelay::start(notifier.clone()).unwrap();

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    thread::spawn(move || {
        let mut coordinator = CoordinationLoop::new(&notifier, engine, relay);
        let _ = done_tx.send(coordinator.run().is_ok());
    });

    thread::sleep(Duration::from_millis(50));
    signal_hook::low_level::raise(SIGTERM).unwrap();

    let clean = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("loop exits after SIGTERM");
    assert!(clean);

    signals.stop();
}
