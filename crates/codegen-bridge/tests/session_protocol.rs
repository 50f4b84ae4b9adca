//! End-to-end session tests against a fake host on a loopback listener.

use std::net::Ipv4Addr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use codegen_bridge::bridge::codec::JsonCodec;
use codegen_bridge::{
    ConnectConfig, Envelope, FileSystemChange, FnGenerator, GenerationError, Generator, Logger,
    MessageType, ProjectDescription, Session, SessionConfig, SessionError, SessionState,
    exit_code,
};

type HostFrames = Framed<TcpStream, JsonCodec<Envelope>>;

/// How the fake host answers the project info request.
#[derive(Clone)]
enum Reply {
    Project(ProjectDescription),
    Silent,
}

struct FakeHost {
    port: u16,
    task: JoinHandle<Vec<Envelope>>,
}

impl FakeHost {
    async fn start(reply: Reply) -> Self {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(serve(listener, reply));
        Self { port, task }
    }

    /// Every envelope received, in order, until the worker closed the connection.
    async fn received(self) -> Vec<Envelope> {
        self.task.await.unwrap()
    }
}

async fn serve(listener: TcpListener, reply: Reply) -> Vec<Envelope> {
    let (stream, _) = listener.accept().await.unwrap();
    let mut frames: HostFrames = Framed::new(stream, JsonCodec::new());
    let mut received = Vec::new();

    while let Some(Ok(envelope)) = frames.next().await {
        if envelope.message_type == MessageType::ProjectInfoRequest
            && let Reply::Project(project) = &reply
        {
            frames
                .send(Envelope::project_info_response(project).unwrap())
                .await
                .unwrap();
        }
        received.push(envelope);
    }
    received
}

fn fast_retries() -> ConnectConfig {
    ConnectConfig::default()
        .with_max_attempts(3)
        .with_backoff_base(Duration::from_millis(5))
}

fn app_project() -> ProjectDescription {
    ProjectDescription::new("/app", "net6.0", "Debug")
}

fn replay(changes: Vec<FileSystemChange>) -> impl Generator {
    FnGenerator(move |_: ProjectDescription, _: String| {
        let changes = changes.clone();
        async move { Ok::<_, GenerationError>(changes) }
    })
}

#[tokio::test]
async fn scaffold_single_file_scenario() {
    let host = FakeHost::start(Reply::Project(app_project())).await;

    let config = SessionConfig::new(host.port).with_connect(fast_retries());
    let mut session = Session::new(config, Logger::none());
    let generator = replay(vec![FileSystemChange::add("/app/Foo.cs", "...")]);

    let report = session.run(&generator).await.unwrap();
    assert_eq!(report.changes_sent, 1);
    assert_eq!(session.state(), SessionState::Closed);

    let received = host.received().await;
    assert_eq!(received.len(), 3);
    assert_eq!(received[0], Envelope::project_info_request());
    let change: FileSystemChange = received[1].payload_as().unwrap();
    assert_eq!(change, FileSystemChange::add("/app/Foo.cs", "..."));
    assert_eq!(received[2], Envelope::completed());
}

#[tokio::test]
async fn every_change_is_forwarded_in_order_before_completion() {
    for count in [0usize, 1, 7] {
        let host = FakeHost::start(Reply::Project(app_project())).await;
        let changes: Vec<_> = (0..count)
            .map(|i| FileSystemChange::add(format!("/app/Gen{i}.cs"), format!("// {i}")))
            .collect();

        let config = SessionConfig::new(host.port).with_connect(fast_retries());
        let mut session = Session::new(config, Logger::none());
        let report = session.run(&replay(changes.clone())).await.unwrap();
        assert_eq!(report.changes_sent, count);

        let received = host.received().await;
        assert_eq!(received.len(), count + 2);
        let forwarded: Vec<FileSystemChange> = received[1..=count]
            .iter()
            .map(|e| {
                assert_eq!(e.message_type, MessageType::FileSystemChange);
                e.payload_as().unwrap()
            })
            .collect();
        assert_eq!(forwarded, changes);
        assert_eq!(received[count + 1].message_type, MessageType::Completed);
    }
}

#[tokio::test]
async fn project_info_is_accepted_exactly_once() {
    let host = FakeHost::start(Reply::Project(app_project())).await;
    let config = SessionConfig::new(host.port).with_connect(fast_retries());
    let mut session = Session::new(config, Logger::none());

    session.run(&replay(Vec::new())).await.unwrap();
    host.received().await;

    let generating = session
        .history()
        .iter()
        .filter(|s| **s == SessionState::Generating)
        .count();
    assert_eq!(generating, 1);
}

#[tokio::test]
async fn unreachable_host_never_sees_a_request() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let (logger, mut capture) = Logger::capture();
    let config = SessionConfig::new(port).with_connect(fast_retries());
    let mut session = Session::new(config, logger);

    let err = session.run(&replay(Vec::new())).await.unwrap_err();
    assert!(matches!(err, SessionError::Connection(_)));
    assert_eq!(err.exit_code(), exit_code::CONNECTION);
    assert_eq!(
        session.history(),
        &[SessionState::Connecting, SessionState::Aborted]
    );

    let lines = capture.drain();
    assert!(lines.iter().any(|l| l.contains("Giving up connecting to host")));
    assert!(!lines.iter().any(|l| l.contains("ProjectInfoRequest")));
}

#[tokio::test]
async fn silent_host_aborts_after_configured_wait() {
    let host = FakeHost::start(Reply::Silent).await;
    let config = SessionConfig::new(host.port)
        .with_connect(fast_retries())
        .with_project_info_timeout(Some(Duration::from_millis(100)));
    let mut session = Session::new(config, Logger::none());

    let err = session.run(&replay(Vec::new())).await.unwrap_err();
    assert!(matches!(err, SessionError::ProjectInformation(_)));
    assert_ne!(err.exit_code(), exit_code::SUCCESS);
    assert_eq!(session.state(), SessionState::Aborted);

    // Host sees the request, then end of stream: the connection was released.
    let received = host.received().await;
    assert_eq!(received, vec![Envelope::project_info_request()]);
}

#[tokio::test]
async fn late_host_is_reached_by_retries() {
    let reserve = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let port = reserve.local_addr().unwrap().port();
    drop(reserve);

    let host = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        serve(listener, Reply::Project(app_project())).await
    });

    let connect = ConnectConfig::default()
        .with_max_attempts(8)
        .with_backoff_base(Duration::from_millis(20))
        .with_backoff_max(Duration::from_millis(100));
    let config = SessionConfig::new(port).with_connect(connect);
    let mut session = Session::new(config, Logger::none());

    session.run(&replay(Vec::new())).await.unwrap();
    let received = host.await.unwrap();
    assert_eq!(received.last(), Some(&Envelope::completed()));
}

#[tokio::test]
async fn session_logs_go_to_the_injected_logger() {
    let host = FakeHost::start(Reply::Project(app_project())).await;
    let (logger, mut capture) = Logger::capture();
    let config = SessionConfig::new(host.port).with_connect(fast_retries());
    let mut session = Session::new(config, logger);

    session.run(&replay(Vec::new())).await.unwrap();
    host.received().await;

    let lines = capture.drain();
    assert!(lines.iter().any(|l| l.contains("Connected to host")));
    assert!(lines.iter().any(|l| l.contains("Session completed")));
}
