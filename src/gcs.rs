use std::{sync::Arc, time::Duration};

use futures::{stream::FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::mission::Mission;
use crate::network::{self, protocol::{Message, ReplanRequest, Tag}, Session};
use crate::replanner::{Failure, Replanner};
use crate::vehicle::Telemetry;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    NetworkError(#[from] network::Error),

    #[error("Receive loop terminated unexpectedly")]
    JoinError(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The line sent back for a request: the mission or the failure sentinel, never a
/// partial mission.
pub fn reply(result: &std::result::Result<Mission, Failure>) -> String {
    match result.as_ref().map(Mission::to_wire) {
        Ok(Ok(line)) => line,
        Ok(Err(error)) => {
            log::error!("Could not encode mission: {}", error);
            Tag::RouteFailure.as_str().to_owned()
        },
        Err(_) => Tag::RouteFailure.as_str().to_owned(),
    }
}

/// Dials the replanning peer and serves its requests until `cancel` is triggered.
pub async fn run(config: Arc<Config>, cancel: CancellationToken) -> Result<()> {
    let replanner = Arc::new(Replanner::new(&config));
    let mut algorithms = replanner.registry().ids().collect::<Vec<_>>();
    algorithms.sort_unstable();
    log::info!("Serving {}", algorithms.join(", "));
    connect_and_serve(&config.network.ifa, config.network.retry, replanner, cancel).await
}

/// Serves `addr` over a fresh session each time the previous one is lost, since a
/// disabled session is never reused. Only cancellation ends the loop.
pub async fn connect_and_serve(addr: &str, retry: Duration, replanner: Arc<Replanner>,
                               cancel: CancellationToken) -> Result<()> {
    while !cancel.is_cancelled() {
        let session = Arc::new(Session::new(&cancel));
        match session.connect(addr, retry).await {
            Ok(()) => {},
            Err(network::Error::Cancelled) => break,
            Err(error) => {
                log::warn!("Could not set up session with {}: {}", addr, error);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(retry) => continue,
                }
            }
        }
        if let Err(error) = serve(session, replanner.clone(), cancel.clone()).await {
            log::warn!("Session with {} failed: {}", addr, error);
        }
        if !cancel.is_cancelled() {
            log::info!("Lost {}, reconnecting", addr);
        }
    }
    Ok(())
}

/// Keeps the latest telemetry of the vehicle and runs every replanning request on its
/// own task, so that telemetry keeps flowing while a solver runs.
pub async fn serve(session: Arc<Session>, replanner: Arc<Replanner>, cancel: CancellationToken) -> Result<()> {
    let (message_tx, mut message_rx) = mpsc::unbounded_channel();
    let (vehicle_tx, vehicle_rx) = watch::channel(Telemetry::default());
    let receive = tokio::spawn({
        let session = session.clone();
        async move { session.receive_loop(message_tx).await }
    });
    let mut replans = FuturesUnordered::new();
    loop {
        tokio::select! {
            message = message_rx.recv() => match message {
                Some(Message::Telemetry(telemetry)) => {
                    log::debug!("Telemetry: {:?}", telemetry);
                    let _ = vehicle_tx.send(telemetry);
                },
                Some(Message::Replan(request)) => {
                    log::info!("Request for {} from drone {}", request.algorithm, request.drone);
                    let vehicle = vehicle_rx.borrow().clone();
                    replans.push(tokio::spawn(respond(session.clone(), replanner.clone(), request,
                                                      vehicle, cancel.clone())));
                },
                Some(message) => log::debug!("Ignoring {:?}", message),
                None => break,
            },
            Some(result) = replans.next() => if let Err(error) = result {
                log::error!("Replanning task failed: {}", error);
            }
        }
    }
    while let Some(result) = replans.next().await {
        if let Err(error) = result {
            log::error!("Replanning task failed: {}", error);
        }
    }
    receive.await??;
    session.close().await;
    Ok(())
}

async fn respond(session: Arc<Session>, replanner: Arc<Replanner>, request: ReplanRequest,
                 vehicle: Telemetry, cancel: CancellationToken) {
    let result = replanner.execute(&request, &vehicle, &cancel).await;
    match &result {
        /* the caller decides whether this aborts the flight, the peer only gets the sentinel */
        Err(Failure::EmptyRoute) if !vehicle.armed =>
            log::error!("Request for {} produced no route before take-off", request.algorithm),
        Err(failure) => log::warn!("Request for {} failed: {}", request.algorithm, failure),
        Ok(_) => {}
    }
    if let Err(error) = session.send(&reply(&result)).await {
        log::error!("Could not reply to request for {}: {}", request.algorithm, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tokio::{io::{AsyncBufReadExt, AsyncWriteExt, BufReader}, net::TcpListener};

    use crate::algorithm::{AlgorithmDescriptor, Kind, Registry};
    use crate::config::AltitudeDecay;
    use crate::geo::PointGeo;
    use crate::solver::Runner;

    fn replanner(dir: &Path) -> Arc<Replanner> {
        let descriptor = |id: &str, script: &str| {
            let mut descriptor = AlgorithmDescriptor::new(id, Kind::Replanner, "");
            descriptor.working_dir = dir.to_owned();
            descriptor.command = format!("sh {}", script);
            descriptor
        };
        let registry = Registry::from_descriptors(vec![
            descriptor("Echo", "echo.sh"),
            descriptor("Broken", "broken.sh"),
        ]);
        let base = PointGeo { latitude: 0.0, longitude: 0.0, altitude: 0.0 };
        Arc::new(Replanner::with_registry(base, AltitudeDecay::Constant, registry, Runner::default()))
    }

    #[tokio::test]
    async fn requests_are_answered() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("echo.sh"), "printf '0;0\\n100;0\\n' > route.txt\n").await.unwrap();
        tokio::fs::write(dir.path().join("broken.sh"), "exit 1\n").await.unwrap();

        /* the replanning peer */
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let cancel = CancellationToken::new();
        let session = Arc::new(Session::new(&cancel));
        let gcs = tokio::spawn({
            let session = session.clone();
            let replanner = replanner(dir.path());
            let cancel = cancel.clone();
            async move {
                session.connect(&addr, Duration::from_millis(100)).await.unwrap();
                serve(session, replanner, cancel).await
            }
        });
        let (peer, _) = listener.accept().await.unwrap();
        let (read, mut write) = peer.into_split();
        let mut lines = BufReader::new(read).lines();

        write.write_all(b"IFA_GCS_INFO: 0;0;7.5;90;1.5\n").await.unwrap();
        write.write_all(b"IFA_GCS_REPLANNER: Broken;1;;\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("UAV_ROUTE_FAILURE"));

        write.write_all(b"IFA_GCS_REPLANNER: Echo;1;;\n").await.unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        let payload = line.strip_prefix("UAV_ROUTE_SUCCESS: ").unwrap();
        let mission = Mission::from_payload(payload).unwrap();
        assert_eq!(mission.len(), 2);
        assert!(mission.iter().all(|waypoint| waypoint.alt == 7.5));

        write.write_all(b"IFA_GCS_REPLANNER: bogus;1;;\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("UAV_ROUTE_FAILURE"));

        drop(write);
        gcs.await.unwrap().unwrap();
        assert_eq!(session.state(), network::State::Disabled);
    }

    #[tokio::test]
    async fn lost_peers_are_dialled_again() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("echo.sh"), "printf '0;0\\n100;0\\n' > route.txt\n").await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let cancel = CancellationToken::new();
        let gcs = tokio::spawn({
            let replanner = replanner(dir.path());
            let cancel = cancel.clone();
            async move { connect_and_serve(&addr, Duration::from_millis(50), replanner, cancel).await }
        });
        for _ in 0..2 {
            let (peer, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept()).await
                .unwrap().unwrap();
            let (read, mut write) = peer.into_split();
            let mut lines = BufReader::new(read).lines();
            write.write_all(b"IFA_GCS_REPLANNER: Echo;1;;\n").await.unwrap();
            let line = lines.next_line().await.unwrap().unwrap();
            assert!(line.starts_with("UAV_ROUTE_SUCCESS: "));
            /* the peer goes away */
        }
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), gcs).await.unwrap().unwrap().unwrap();
    }

    #[test]
    fn failures_become_the_sentinel() {
        assert_eq!(reply(&Err(Failure::EmptyRoute)), "UAV_ROUTE_FAILURE");
        assert_eq!(reply(&Ok(Mission::new())), "UAV_ROUTE_FAILURE");
    }
}
