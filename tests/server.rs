use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;

use eventide::{
    serve, Action, Conn, ConnHandle, EventHandler, FixedLengthCodec, Options, ServerInfo,
};

const WAIT: Duration = Duration::from_secs(5);

async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[derive(Default)]
struct Recorder {
    opened: AtomicUsize,
    closed: AtomicUsize,
    reacts: AtomicUsize,
    pre_writes: AtomicUsize,
    close_errors: Mutex<Vec<Option<String>>>,
    events: Mutex<Vec<(u64, &'static str)>>,
    frames: Mutex<Vec<Vec<u8>>>,
}

/// Every connection must see exactly one `opened` followed by exactly one
/// `closed`.
fn assert_lifecycle(events: &[(u64, &'static str)]) {
    let mut per_conn: HashMap<u64, Vec<&'static str>> = HashMap::new();
    for (id, event) in events {
        per_conn.entry(*id).or_default().push(event);
    }
    for (id, events) in per_conn {
        assert_eq!(events, ["opened", "closed"], "conn {id}");
    }
}

struct EchoHandler {
    addr_tx: mpsc::UnboundedSender<SocketAddr>,
    state: Arc<Recorder>,
    quit_frame: &'static [u8],
    close_on_react: bool,
}

impl EchoHandler {
    fn new(addr_tx: mpsc::UnboundedSender<SocketAddr>, state: Arc<Recorder>) -> Self {
        EchoHandler {
            addr_tx,
            state,
            quit_frame: b"quit",
            close_on_react: false,
        }
    }
}

impl EventHandler for EchoHandler {
    fn on_init_complete(&self, server: &ServerInfo) -> Action {
        let _ = self.addr_tx.send(server.addr);
        Action::None
    }

    fn on_opened(&self, conn: &mut Conn) -> (Option<Bytes>, Action) {
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        self.state
            .events
            .lock()
            .unwrap()
            .push((conn.id().as_u64(), "opened"));
        (None, Action::None)
    }

    fn on_closed(&self, conn: &mut Conn, err: Option<&io::Error>) -> Action {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        self.state
            .events
            .lock()
            .unwrap()
            .push((conn.id().as_u64(), "closed"));
        self.state
            .close_errors
            .lock()
            .unwrap()
            .push(err.map(|err| err.to_string()));
        Action::None
    }

    fn pre_write(&self) {
        self.state.pre_writes.fetch_add(1, Ordering::SeqCst);
    }

    fn react(&self, conn: &mut Conn) -> (Option<Bytes>, Action) {
        self.state.reacts.fetch_add(1, Ordering::SeqCst);
        let frame = conn.read();
        if frame.is_empty() {
            return (None, Action::None);
        }
        self.state.frames.lock().unwrap().push(frame.to_vec());
        if frame == self.quit_frame {
            return (None, Action::Shutdown);
        }
        if self.close_on_react {
            return (None, Action::Close);
        }
        (Some(frame), Action::None)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tcp_echo_round_trip() {
    let (addr_tx, mut addr_rx) = mpsc::unbounded_channel();
    let state = Arc::new(Recorder::default());
    let server = tokio::spawn(serve(
        EchoHandler::new(addr_tx, Arc::clone(&state)),
        "tcp://127.0.0.1:0",
        Options::default(),
    ));
    let addr = timeout(WAIT, addr_rx.recv()).await.unwrap().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    drop(client);
    wait_until(|| state.closed.load(Ordering::SeqCst) == 1).await;
    assert_eq!(state.opened.load(Ordering::SeqCst), 1);
    // a client hangup is a clean close
    assert_eq!(state.close_errors.lock().unwrap()[0], None);

    let mut quitter = TcpStream::connect(addr).await.unwrap();
    quitter.write_all(b"quit").await.unwrap();
    let result = timeout(WAIT, server).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn react_loop_answers_pipelined_frames() {
    let (addr_tx, mut addr_rx) = mpsc::unbounded_channel();
    let state = Arc::new(Recorder::default());
    let mut handler = EchoHandler::new(addr_tx, Arc::clone(&state));
    handler.quit_frame = b"qq";
    let options = Options {
        codec: Some(Arc::new(FixedLengthCodec::new(2))),
        ..Options::default()
    };
    let server = tokio::spawn(serve(handler, "tcp://127.0.0.1:0", options));
    let addr = timeout(WAIT, addr_rx.recv()).await.unwrap().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"ABCDEF").await.unwrap();
    let mut buf = [0u8; 6];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ABCDEF");

    // one data command produced three frames, each behind its own pre_write
    assert_eq!(
        *state.frames.lock().unwrap(),
        vec![b"AB".to_vec(), b"CD".to_vec(), b"EF".to_vec()]
    );
    assert_eq!(state.pre_writes.load(Ordering::SeqCst), 3);

    client.write_all(b"qq").await.unwrap();
    let result = timeout(WAIT, server).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handler_shutdown_closes_every_connection() {
    let (addr_tx, mut addr_rx) = mpsc::unbounded_channel();
    let state = Arc::new(Recorder::default());
    let server = tokio::spawn(serve(
        EchoHandler::new(addr_tx, Arc::clone(&state)),
        "tcp://127.0.0.1:0",
        Options::default(),
    ));
    let addr = timeout(WAIT, addr_rx.recv()).await.unwrap().unwrap();

    let mut active = TcpStream::connect(addr).await.unwrap();
    active.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    active.read_exact(&mut buf).await.unwrap();

    let _idle = TcpStream::connect(addr).await.unwrap();
    wait_until(|| state.opened.load(Ordering::SeqCst) == 2).await;

    active.write_all(b"quit").await.unwrap();
    let result = timeout(WAIT, server).await.unwrap().unwrap();
    assert!(result.is_ok());

    // both the originating and the idle connection were torn down cleanly
    assert_eq!(state.closed.load(Ordering::SeqCst), 2);
    assert!(state
        .close_errors
        .lock()
        .unwrap()
        .iter()
        .all(|err| err.is_none()));
    assert_lifecycle(&state.events.lock().unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn udp_echo_keeps_no_connection_state() {
    let (addr_tx, mut addr_rx) = mpsc::unbounded_channel();
    let state = Arc::new(Recorder::default());
    let server = tokio::spawn(serve(
        EchoHandler::new(addr_tx, Arc::clone(&state)),
        "udp://127.0.0.1:0",
        Options::default(),
    ));
    let addr = timeout(WAIT, addr_rx.recv()).await.unwrap().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"ping", addr).await.unwrap();
    let mut buf = [0u8; 16];
    let (n, from) = timeout(WAIT, client.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"ping");
    assert_eq!(from, addr);

    // exactly one react per datagram, and no lifecycle callbacks for peers
    wait_until(|| state.reacts.load(Ordering::SeqCst) == 1).await;
    assert_eq!(state.opened.load(Ordering::SeqCst), 0);
    assert_eq!(state.closed.load(Ordering::SeqCst), 0);

    client.send_to(b"quit", addr).await.unwrap();
    let result = timeout(WAIT, server).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert_eq!(state.reacts.load(Ordering::SeqCst), 2);
}

struct TickerHandler {
    ticks: Arc<AtomicUsize>,
}

impl EventHandler for TickerHandler {
    fn tick(&self) -> (Duration, Action) {
        let n = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        if n > 5 {
            (Duration::ZERO, Action::Shutdown)
        } else {
            (Duration::from_millis(10), Action::None)
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ticker_paces_and_shuts_down() {
    let ticks = Arc::new(AtomicUsize::new(0));
    let options = Options {
        ticker: true,
        ..Options::default()
    };
    let started = Instant::now();
    let result = timeout(
        WAIT,
        serve(
            TickerHandler {
                ticks: Arc::clone(&ticks),
            },
            "tcp://127.0.0.1:0",
            options,
        ),
    )
    .await
    .unwrap();
    assert!(result.is_ok());
    assert!(ticks.load(Ordering::SeqCst) >= 5);
    // five 10ms delays were honored before the shutdown tick
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn loop_close_suppresses_the_forced_reader_error() {
    let (addr_tx, mut addr_rx) = mpsc::unbounded_channel();
    let state = Arc::new(Recorder::default());
    let mut handler = EchoHandler::new(addr_tx, Arc::clone(&state));
    handler.close_on_react = true;
    let server = tokio::spawn(serve(handler, "tcp://127.0.0.1:0", Options::default()));
    let addr = timeout(WAIT, addr_rx.recv()).await.unwrap().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"x").await.unwrap();
    wait_until(|| state.closed.load(Ordering::SeqCst) == 1).await;
    // the synthetic wakeup error from unparking the reader never reaches
    // on_closed
    assert_eq!(state.close_errors.lock().unwrap()[0], None);
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).await.unwrap(), 0);

    let mut quitter = TcpStream::connect(addr).await.unwrap();
    quitter.write_all(b"quit").await.unwrap();
    let result = timeout(WAIT, server).await.unwrap().unwrap();
    assert!(result.is_ok());
}

struct WakeHandler {
    addr_tx: mpsc::UnboundedSender<SocketAddr>,
    handle_tx: mpsc::UnboundedSender<ConnHandle>,
    state: Arc<Recorder>,
}

impl EventHandler for WakeHandler {
    fn on_init_complete(&self, server: &ServerInfo) -> Action {
        let _ = self.addr_tx.send(server.addr);
        Action::None
    }

    fn on_opened(&self, conn: &mut Conn) -> (Option<Bytes>, Action) {
        let _ = self.handle_tx.send(conn.handle());
        (None, Action::None)
    }

    fn react(&self, conn: &mut Conn) -> (Option<Bytes>, Action) {
        self.state.reacts.fetch_add(1, Ordering::SeqCst);
        let frame = conn.read();
        if frame == b"quit"[..] {
            return (None, Action::Shutdown);
        }
        (None, Action::None)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wake_and_async_write_reach_the_loop_from_outside() {
    let (addr_tx, mut addr_rx) = mpsc::unbounded_channel();
    let (handle_tx, mut handle_rx) = mpsc::unbounded_channel();
    let state = Arc::new(Recorder::default());
    let server = tokio::spawn(serve(
        WakeHandler {
            addr_tx,
            handle_tx,
            state: Arc::clone(&state),
        },
        "tcp://127.0.0.1:0",
        Options::default(),
    ));
    let addr = timeout(WAIT, addr_rx.recv()).await.unwrap().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let handle = timeout(WAIT, handle_rx.recv()).await.unwrap().unwrap();

    // react runs without any bytes arriving
    handle.wake().unwrap();
    wait_until(|| state.reacts.load(Ordering::SeqCst) >= 1).await;

    handle.async_write(Bytes::from_static(b"hi")).unwrap();
    let mut buf = [0u8; 2];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hi");

    client.write_all(b"quit").await.unwrap();
    let result = timeout(WAIT, server).await.unwrap().unwrap();
    assert!(result.is_ok());
}

struct GreetHandler {
    addr_tx: mpsc::UnboundedSender<SocketAddr>,
    state: Arc<Recorder>,
}

impl EventHandler for GreetHandler {
    fn on_init_complete(&self, server: &ServerInfo) -> Action {
        let _ = self.addr_tx.send(server.addr);
        Action::None
    }

    fn on_opened(&self, _conn: &mut Conn) -> (Option<Bytes>, Action) {
        (Some(Bytes::from_static(b"hi")), Action::None)
    }

    fn pre_write(&self) {
        self.state.pre_writes.fetch_add(1, Ordering::SeqCst);
    }

    fn react(&self, conn: &mut Conn) -> (Option<Bytes>, Action) {
        let frame = conn.read();
        if frame == b"quit"[..] {
            return (None, Action::Shutdown);
        }
        (None, Action::None)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn opened_greeting_is_written_before_any_data() {
    let (addr_tx, mut addr_rx) = mpsc::unbounded_channel();
    let state = Arc::new(Recorder::default());
    let server = tokio::spawn(serve(
        GreetHandler {
            addr_tx,
            state: Arc::clone(&state),
        },
        "tcp://127.0.0.1:0",
        Options::default(),
    ));
    let addr = timeout(WAIT, addr_rx.recv()).await.unwrap().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 2];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hi");
    assert_eq!(state.pre_writes.load(Ordering::SeqCst), 1);

    client.write_all(b"quit").await.unwrap();
    let result = timeout(WAIT, server).await.unwrap().unwrap();
    assert!(result.is_ok());
}

struct AbortHandler;

impl EventHandler for AbortHandler {
    fn on_init_complete(&self, _server: &ServerInfo) -> Action {
        Action::Shutdown
    }

    fn on_opened(&self, _conn: &mut Conn) -> (Option<Bytes>, Action) {
        panic!("no connection should ever be accepted");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn init_shutdown_aborts_startup_cleanly() {
    let result = timeout(
        WAIT,
        serve(AbortHandler, "tcp://127.0.0.1:0", Options::default()),
    )
    .await
    .unwrap();
    assert!(result.is_ok());
}
