// End-to-end tests against the simulated serial link.
use std::time::Duration;

use plotbot::buffer::Action;
use plotbot::config::BotConfig;
use plotbot::pen::StateEvent;
use plotbot::service::PlotterService;

#[tokio::test]
async fn simulated_link_reports_connection() {
    let service = PlotterService::spawn_in_process(BotConfig::default(), true);
    let mut events = service.subscribe();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("timed out waiting for connection")
            .expect("event stream closed");
        if let StateEvent::SerialConnected { simulation } = event {
            assert!(simulation, "fallback link must report simulation");
            break;
        }
    }
    assert!(service.actual().await.simulation);
}

#[tokio::test]
async fn simulated_writes_produce_acks() {
    let service = PlotterService::spawn_in_process(BotConfig::default(), true);
    let mut events = service.subscribe();
    service.run(Action::Move { x: 40.0, y: 0.0 }).await;

    let mut acks = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while acks == 0 {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("timed out waiting for acks")
            .expect("event stream closed");
        if let StateEvent::SerialData(line) = event {
            assert_eq!(line, "OK");
            acks += 1;
        }
    }
}

#[tokio::test]
async fn moves_complete_within_scheduled_time() {
    let service = PlotterService::spawn_in_process(BotConfig::default(), true);
    let started = tokio::time::Instant::now();
    service.run(Action::Move { x: 500.0, y: 500.0 }).await;

    let deadline = started + Duration::from_secs(30);
    while service.pending().await > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "simulated move never completed"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let actual = service.actual().await;
    assert_eq!(actual.x, 500.0);
    assert_eq!(actual.y, 500.0);
}

#[tokio::test]
async fn direct_commands_run_while_paused() {
    let service = PlotterService::spawn_in_process(BotConfig::default(), true);
    let mut events = service.subscribe();
    let done = service.pause().await;
    done.await.expect("pause completion dropped");

    // A height change outside the buffer still reaches the simulated
    // link and gets acknowledged.
    service.direct_height(plotbot::HeightTarget::preset("up")).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("timed out waiting for ack")
            .expect("event stream closed");
        if let StateEvent::SerialData(line) = event {
            assert_eq!(line, "OK");
            break;
        }
    }
}
