use std::{future::pending, net::SocketAddr, time::Duration};

use photon_relay::{
    broker::Broker,
    config::{Config, DeliveryMode},
    net::{
        client::Client,
        frame::FrameRecvStream,
        wire::{MessageKind, PhotonBatch, Request, Response},
        Error,
    },
    worker::{
        direct::DirectServer,
        session::Session,
        sim::Loopback,
        sink::{read_run, FileStorage},
        WorkerAgent,
    },
};
use tokio::{
    net::TcpListener,
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};

const WAIT: Duration = Duration::from_secs(10);

fn photons(event_id: u32, n: usize) -> PhotonBatch {
    let ramp = |offset: f32| -> Vec<f32> {
        (0..n).map(|i| i as f32 + offset).collect()
    };
    PhotonBatch {
        event_id,
        pos: [ramp(0.0), ramp(0.0), ramp(0.0)],
        dir: [ramp(0.5), ramp(0.5), ramp(0.5)],
        pol: [ramp(1.0), ramp(0.0), ramp(0.0)],
        wavelength: ramp(420.0),
        time: ramp(3.0),
        flags: vec![0; n],
    }
}

fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn config(broker: SocketAddr) -> Config {
    Config::builder()
        .frontend_addr(localhost())
        .backend_addr(localhost())
        .broker_addr(broker)
        .heartbeat_interval(Duration::from_millis(100))
        .heartbeat_liveness(3)
        .retry_after(Duration::from_millis(50))
        .build()
}

type Task = JoinHandle<Result<(), Error>>;

async fn start_broker() -> (SocketAddr, SocketAddr, Task) {
    let broker = Broker::bind(&config(localhost())).await.unwrap();
    let addrs = (broker.frontend_addr(), broker.backend_addr());
    (addrs.0, addrs.1, tokio::spawn(broker.run_until(pending::<()>())))
}

fn start_worker(config: &Config, channels: usize) -> Task {
    let session = Session::from_config(
        config,
        Loopback::new(channels),
        FileStorage::new(&config.output_dir),
    );
    tokio::spawn(WorkerAgent::new(config, session).run_until(pending::<()>()))
}

async fn client(addr: SocketAddr) -> Client {
    Client::connect(addr).await.unwrap().with_timeout(WAIT)
}

/// Sends `request` until some worker has registered and answers it.
async fn request_when_ready(
    client: &mut Client,
    request: &Request,
) -> Response {
    timeout(WAIT, async {
        loop {
            match client.request(request).await.unwrap() {
                Response::NoWorkers => sleep(Duration::from_millis(20)).await,
                reply => return reply,
            }
        }
    })
    .await
    .unwrap()
}

fn channels(reply: Response) -> usize {
    match reply {
        Response::DetectorInfo(info) => info.channels(),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn sync_request_travels_through_broker_and_worker() {
    let (frontend, backend, broker) = start_broker().await;
    let worker = start_worker(&config(backend), 4);

    let mut client = client(frontend).await;
    let request = Request::PhotonData(photons(42, 6));
    match request_when_ready(&mut client, &request).await {
        Response::SimComplete { event_id, hits } => {
            assert_eq!(event_id, 42);
            assert_eq!(hits.channel, vec![0, 1, 2, 3, 0, 1]);
            assert_eq!(hits.wavelength[5], 425.0);
        }
        other => panic!("unexpected {:?}", other),
    }

    let info = client.request(&Request::DetectorInfo).await.unwrap();
    assert_eq!(channels(info), 4);
    assert_eq!(
        client.request(&Request::Ping).await.unwrap(),
        Response::Ack
    );

    worker.abort();
    broker.abort();
}

#[tokio::test]
async fn async_run_is_acknowledged_and_written_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let (frontend, backend, broker) = start_broker().await;
    let config = Config::builder()
        .broker_addr(backend)
        .heartbeat_interval(Duration::from_millis(100))
        .flush_threshold(2)
        .output_dir(dir.path())
        .mode(DeliveryMode::Async)
        .build();
    let worker = start_worker(&config, 3);

    let mut client = client(frontend).await;
    let begin = Request::RunBegin {
        name: "/data/photons/run9.root".into(),
    };
    assert_eq!(request_when_ready(&mut client, &begin).await, Response::Ack);
    for id in 0..3 {
        assert_eq!(
            client
                .request(&Request::PhotonData(photons(id, id as usize + 1)))
                .await
                .unwrap(),
            Response::SimCompleteAsync { event_id: id }
        );
    }
    assert_eq!(
        client.request(&Request::RunEnd).await.unwrap(),
        Response::Ack
    );

    let run = read_run(&dir.path().join("run9.hits")).unwrap();
    assert_eq!(run.detector.channels(), 3);
    assert_eq!(run.schema.len(), 10);
    let ids: Vec<u32> = run
        .batches
        .iter()
        .flat_map(|b| b.event_id.iter().copied())
        .collect();
    assert_eq!(ids, vec![0, 1, 2]);
    assert_eq!(run.batches.len(), 2);
    assert_eq!(run.batches[1].channel[0], vec![0, 1, 2]);

    worker.abort();
    broker.abort();
}

#[tokio::test]
async fn silent_broker_triggers_reconnect_and_a_fresh_ready() {
    let listener = TcpListener::bind(localhost()).await.unwrap();
    let config = Config::builder()
        .broker_addr(listener.local_addr().unwrap())
        .heartbeat_interval(Duration::from_millis(30))
        .heartbeat_liveness(2)
        .reconnect_attempts(3)
        .retry_after(Duration::from_millis(10))
        .build();
    let worker = start_worker(&config, 1);

    let (first, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let mut first = FrameRecvStream::new(first);
    let ready = timeout(WAIT, first.recv()).await.unwrap().unwrap();
    assert_eq!(ready, vec![MessageKind::Ready.frame()]);

    // never answer; the worker must give up and open another connection
    let (second, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let mut second = FrameRecvStream::new(second);
    let ready = timeout(WAIT, second.recv()).await.unwrap().unwrap();
    assert_eq!(ready, vec![MessageKind::Ready.frame()]);

    worker.abort();
}

#[tokio::test]
async fn worker_resumes_serving_after_broker_restart() {
    let broker = Broker::bind(&config(localhost())).await.unwrap();
    let frontend = broker.frontend_addr();
    let backend = broker.backend_addr();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let first = tokio::spawn(broker.run_until(stop_rx));

    let config = Config::builder()
        .broker_addr(backend)
        .heartbeat_interval(Duration::from_millis(50))
        .heartbeat_liveness(2)
        .reconnect_attempts(5)
        .retry_after(Duration::from_millis(20))
        .output_dir(std::env::temp_dir())
        .build();
    let worker = start_worker(&config, 2);

    let mut before = client(frontend).await;
    let info = request_when_ready(&mut before, &Request::DetectorInfo).await;
    assert_eq!(channels(info), 2);

    stop_tx.send(()).unwrap();
    timeout(WAIT, first).await.unwrap().unwrap().unwrap();

    // the old listeners close as their tasks wind down
    let restart = Config::builder()
        .frontend_addr(frontend)
        .backend_addr(backend)
        .heartbeat_interval(Duration::from_millis(50))
        .heartbeat_liveness(2)
        .build();
    let broker = timeout(WAIT, async {
        loop {
            match Broker::bind(&restart).await {
                Ok(broker) => return broker,
                Err(_) => sleep(Duration::from_millis(10)).await,
            }
        }
    })
    .await
    .unwrap();
    let second = tokio::spawn(broker.run_until(pending::<()>()));

    let mut after = client(frontend).await;
    let info = request_when_ready(&mut after, &Request::DetectorInfo).await;
    assert_eq!(channels(info), 2);
    assert!(!worker.is_finished());

    worker.abort();
    second.abort();
}

#[tokio::test]
async fn worker_without_retries_terminates() {
    let unused = {
        let listener = TcpListener::bind(localhost()).await.unwrap();
        listener.local_addr().unwrap()
    };
    let config = Config::builder()
        .broker_addr(unused)
        .heartbeat_interval(Duration::from_millis(20))
        .heartbeat_liveness(1)
        .reconnect_attempts(0)
        .build();
    let session = Session::from_config(
        &config,
        Loopback::new(1),
        FileStorage::new(std::env::temp_dir()),
    );

    let agent = WorkerAgent::new(&config, session);
    let result = timeout(WAIT, agent.run_until(pending::<()>()))
        .await
        .unwrap();
    assert!(matches!(
        result,
        Err(Error::ReconnectExhausted { attempts: 0 })
    ));
}

#[tokio::test]
async fn direct_server_answers_without_a_broker() {
    let session = Session::new(
        DeliveryMode::Sync,
        Loopback::new(5),
        FileStorage::new(std::env::temp_dir()),
        10,
    );
    let server = DirectServer::bind(localhost(), session).await.unwrap();
    let addr = server.local_addr();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.run_until(stop_rx));

    let mut client = client(addr).await;
    assert_eq!(client.request(&Request::Ping).await.unwrap(), Response::Ack);
    let info = client.request(&Request::DetectorInfo).await.unwrap();
    assert_eq!(channels(info), 5);
    match client
        .request(&Request::PhotonData(photons(8, 2)))
        .await
        .unwrap()
    {
        Response::SimComplete { event_id, hits } => {
            assert_eq!(event_id, 8);
            assert_eq!(hits.len(), 2);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(
        client
            .request_frames(vec![b"WARP".to_vec()])
            .await
            .unwrap(),
        Response::UnknownRequest.encode()
    );

    stop_tx.send(()).unwrap();
    timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
}
