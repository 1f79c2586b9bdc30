use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chatio::LineReader;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{Level, info, warn};
use zeroize::Zeroize;

mod auth;
mod registry;
mod secure;
mod security;

use auth::AuthGate;
use registry::{AdmitError, Registry, SessionId};
use secure::EncryptionContext;
use security::{Pipeline, SecurityConfig, Verdict};

const DEFAULT_ENCRYPT_KEY: &str = "default_schrimp_key";
const WRITE_QUEUE_DEPTH: usize = 128;

fn usage_and_exit() -> ! {
    eprintln!(
        "schrimpd (chat server)\n\n\
USAGE:\n  schrimpd [--bind HOST:PORT] [--password PASSWORD]\n\n\
ENV:\n  SCHRIMPD_BIND                default 0.0.0.0:3031\n  SCHRIMPD_PASSWORD            optional; plaintext shared password\n  SCHRIMPD_ENCRYPT             optional; 1 enables transport encryption\n  SCHRIMPD_ENCRYPT_PASSPHRASE  passphrase for transport encryption\n  SCHRIMPD_SECURITY            optional; default 1 (0 disables the pipeline)\n  SCHRIMPD_RATE_WINDOW_S       optional; default 60\n  SCHRIMPD_RATE_MAX            optional; default 15\n  SCHRIMPD_DUP_LIMIT           optional; default 3\n  SCHRIMPD_MAX_MSG_CHARS       optional; default 500\n  SCHRIMPD_OVERLONG            optional; reject | truncate (default reject)\n  SCHRIMPD_BANNED_MODE         optional; reject | mask (default reject)\n  SCHRIMPD_BANNED_WORDS_PATH   optional; JSON array of banned words\n"
    );
    std::process::exit(2);
}

#[derive(Debug, Clone)]
struct Config {
    bind: SocketAddr,
    password: Option<String>,
    encrypt_enabled: bool,
    encrypt_passphrase: Option<String>,
    security: SecurityConfig,
}

/// Read and parse an env var. `Ok(None)` when unset or blank, `Err(())` when
/// set but unparseable; unparseable values must not silently become defaults.
fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ()> {
    match std::env::var(name) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => v.trim().parse().map(Some).map_err(|_| ()),
        Err(_) => Ok(None),
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    match parse_env(name) {
        Ok(Some(v)) => v,
        Ok(None) => default,
        Err(()) => usage_and_exit(),
    }
}

fn parse_args() -> Config {
    let mut bind: SocketAddr = std::env::var("SCHRIMPD_BIND")
        .unwrap_or_else(|_| "0.0.0.0:3031".to_string())
        .parse()
        .unwrap_or_else(|_| usage_and_exit());

    let mut password = std::env::var("SCHRIMPD_PASSWORD").ok();

    let encrypt_enabled = std::env::var("SCHRIMPD_ENCRYPT")
        .ok()
        .is_some_and(|v| v.trim() == "1");
    let encrypt_passphrase = std::env::var("SCHRIMPD_ENCRYPT_PASSPHRASE")
        .ok()
        .filter(|v| !v.trim().is_empty());

    let mut sec = SecurityConfig {
        enabled: !std::env::var("SCHRIMPD_SECURITY")
            .ok()
            .is_some_and(|v| v.trim() == "0"),
        rate_window: Duration::from_secs(env_or(
            "SCHRIMPD_RATE_WINDOW_S",
            security::DEFAULT_RATE_WINDOW.as_secs(),
        )),
        rate_max: env_or("SCHRIMPD_RATE_MAX", security::DEFAULT_RATE_MAX),
        dup_limit: env_or("SCHRIMPD_DUP_LIMIT", security::DEFAULT_DUP_LIMIT),
        max_message_chars: env_or("SCHRIMPD_MAX_MSG_CHARS", security::DEFAULT_MAX_MSG_CHARS),
        ..SecurityConfig::default()
    };
    if let Ok(v) = std::env::var("SCHRIMPD_OVERLONG") {
        sec.overlong = v.parse().unwrap_or_else(|_| usage_and_exit());
    }
    if let Ok(v) = std::env::var("SCHRIMPD_BANNED_MODE") {
        sec.banned_mode = v.parse().unwrap_or_else(|_| usage_and_exit());
    }
    if let Ok(path) = std::env::var("SCHRIMPD_BANNED_WORDS_PATH") {
        if !path.trim().is_empty() {
            match security::load_banned_words(&path) {
                Ok(words) => sec.banned_words = words,
                Err(e) => warn!(err = %e, "using builtin banned word list"),
            }
        }
    }

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--bind" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                bind = v.parse().unwrap_or_else(|_| usage_and_exit());
            }
            "--password" => {
                password = Some(it.next().unwrap_or_else(|| usage_and_exit()));
            }
            "-h" | "--help" => usage_and_exit(),
            _ => usage_and_exit(),
        }
    }

    Config {
        bind,
        password,
        encrypt_enabled,
        encrypt_passphrase,
        security: sec,
    }
}

struct ChatServer {
    registry: Registry,
    pipeline: Pipeline,
    gate: AuthGate,
    shutdown: watch::Sender<bool>,
}

impl ChatServer {
    fn new(mut cfg: Config) -> Self {
        let crypto = if cfg.encrypt_enabled {
            let mut phrase = cfg.encrypt_passphrase.take().unwrap_or_else(|| {
                warn!("encryption enabled without a passphrase; using the builtin default key");
                DEFAULT_ENCRYPT_KEY.to_string()
            });
            let ctx = Arc::new(EncryptionContext::new(&phrase));
            phrase.zeroize();
            Some(ctx)
        } else {
            None
        };

        let (shutdown, _) = watch::channel(false);
        Self {
            registry: Registry::new(crypto),
            pipeline: Pipeline::new(cfg.security.clone()),
            gate: AuthGate::new(cfg.password.take()),
            shutdown,
        }
    }

    /// Stop accepting new connections. Already-admitted sessions continue
    /// until their own reads fail or the client leaves.
    fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    async fn run(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                res = listener.accept() => match res {
                    Ok((stream, peer)) => {
                        info!(peer = %peer, "new connection");
                        let srv = self.clone();
                        tokio::spawn(async move {
                            let conn = tokio::spawn(srv.clone().handle_conn(stream, peer));
                            match conn.await {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => {
                                    warn!(peer = %peer, err = %e, "connection ended with error")
                                }
                                // A panicking handler counts as a transport
                                // fault; its guard has already scheduled the
                                // eviction.
                                Err(e) if e.is_panic() => {
                                    warn!(peer = %peer, "connection task panicked")
                                }
                                Err(_) => {}
                            }
                        });
                    }
                    Err(e) => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        warn!(err = %e, "accept failed");
                    }
                },
            }
        }
        info!("listener closed; existing sessions continue");
        Ok(())
    }

    async fn handle_conn(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
        let session = SessionId::new();
        let (rd, mut wr) = stream.into_split();
        let mut lines = LineReader::new(rd);

        let (write_tx, mut write_rx) = mpsc::channel::<Bytes>(WRITE_QUEUE_DEPTH);
        let writer = tokio::spawn(async move {
            while let Some(b) = write_rx.recv().await {
                if wr.write_all(&b[..]).await.is_err() {
                    break;
                }
            }
        });

        // The guard evicts on unwind; the normal path evicts inline below.
        let guard = EvictGuard {
            srv: self.clone(),
            session: Some(session),
        };
        let result = self.drive_session(session, peer, &mut lines, &write_tx).await;
        guard.evict_now().await;

        // Close our end of the queue so the writer drains and exits.
        drop(write_tx);
        let _ = writer.await;
        result
    }

    /// Idempotent session teardown: registry removal, pipeline state drop
    /// and the leave notice. Safe to call twice; only the call that actually
    /// removes the session broadcasts.
    async fn evict(&self, session: SessionId) {
        if let Some(evicted) = self.registry.remove(session).await {
            self.pipeline.forget(&evicted.name).await;
            info!(name = %evicted.name, session = %session, "disconnected");
            self.registry
                .broadcast(&format!("{} left the chat", evicted.name), None)
                .await;
        }
    }

    async fn drive_session(
        &self,
        session: SessionId,
        peer: SocketAddr,
        lines: &mut LineReader<tokio::net::tcp::OwnedReadHalf>,
        write_tx: &mpsc::Sender<Bytes>,
    ) -> anyhow::Result<()> {
        let _ = write_tx.send(Bytes::from(self.gate.welcome_banner())).await;

        // One password attempt; a failure closes the connection.
        if self.gate.password_required() {
            let Some(line) = lines.read_line().await? else {
                return Ok(());
            };
            let attempt = String::from_utf8_lossy(&line);
            if !self.gate.verify(attempt.trim()) {
                info!(peer = %peer, session = %session, "authentication failed");
                let _ = write_tx
                    .send(Bytes::from_static(auth::AUTH_FAIL.as_bytes()))
                    .await;
                return Ok(());
            }
            let _ = write_tx
                .send(Bytes::from_static(auth::AUTH_OK.as_bytes()))
                .await;
        }

        // Name negotiation: loop until the registry admits us. No retry cap;
        // a client may sit here as long as it likes.
        let (disconnect_tx, disconnect_rx) = watch::channel(false);
        let name = loop {
            let Some(line) = lines.read_line().await? else {
                return Ok(());
            };
            let candidate = auth::candidate_name(&String::from_utf8_lossy(&line), peer.port());
            match self
                .registry
                .try_admit(session, &candidate, peer, write_tx.clone(), disconnect_tx.clone())
                .await
            {
                Ok(()) => break candidate,
                Err(AdmitError::NameConflict(taken)) => {
                    let _ = write_tx
                        .send(Bytes::from(auth::name_taken_prompt(&taken)))
                        .await;
                }
            }
        };

        info!(name = %name, peer = %peer, session = %session, "session admitted");
        self.registry
            .broadcast(&format!("{name} joined the chat!"), Some(session))
            .await;
        let count = self.registry.count().await;
        let _ = write_tx
            .send(Bytes::from(auth::connection_info(&name, count)))
            .await;

        self.message_loop(session, &name, lines, write_tx, disconnect_rx)
            .await
    }

    async fn message_loop(
        &self,
        session: SessionId,
        name: &str,
        lines: &mut LineReader<tokio::net::tcp::OwnedReadHalf>,
        write_tx: &mpsc::Sender<Bytes>,
        mut disconnect_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        loop {
            let line = tokio::select! {
                res = lines.read_line() => res?,
                _ = disconnect_rx.changed() => {
                    info!(name = %name, session = %session, "evicted by registry");
                    return Ok(());
                }
            };
            let Some(line) = line else {
                return Ok(());
            };

            let raw = String::from_utf8_lossy(&line);
            let raw = raw.trim();
            let text = match self.registry.crypto() {
                Some(ctx) => ctx.decrypt(raw),
                None => raw.to_string(),
            };
            let text = text.trim().to_string();
            if text.is_empty() {
                continue;
            }

            // `/quit` works even when the pipeline would reject the sender.
            if text.eq_ignore_ascii_case("/quit") {
                return Ok(());
            }

            // `/users` pays the rate check only; it is not chat, so it never
            // participates in duplicate tracking or content filtering.
            if text.eq_ignore_ascii_case("/users") {
                match self.pipeline.check_command(name, &text).await {
                    Verdict::Rejected(reason) => {
                        let _ = write_tx.send(Bytes::from(format!("{reason}\n"))).await;
                    }
                    Verdict::Accepted(_) => {
                        let mut s = String::from("Connected users:\n");
                        for (name, ip) in self.registry.list_summaries().await {
                            s.push_str(&format!("  • {name} ({ip})\n"));
                        }
                        let _ = write_tx.send(Bytes::from(s)).await;
                    }
                }
                continue;
            }

            match self.pipeline.check(name, &text).await {
                Verdict::Rejected(reason) => {
                    let _ = write_tx.send(Bytes::from(format!("{reason}\n"))).await;
                }
                Verdict::Accepted(text) => {
                    self.registry.broadcast_chat(session, name, &text).await;
                }
            }
        }
    }
}

/// Ensures the session eviction path runs even when the connection task
/// unwinds mid-session. The normal exit path consumes the guard with
/// `evict_now`; if the task panics instead, `Drop` schedules the same
/// idempotent eviction, so a fault never leaves a ghost session holding a
/// name in the registry.
struct EvictGuard {
    srv: Arc<ChatServer>,
    session: Option<SessionId>,
}

impl EvictGuard {
    async fn evict_now(mut self) {
        if let Some(id) = self.session.take() {
            self.srv.evict(id).await;
        }
    }
}

impl Drop for EvictGuard {
    fn drop(&mut self) {
        if let Some(id) = self.session.take() {
            let srv = self.srv.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { srv.evict(id).await });
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,schrimpd=info".into()),
        )
        .with_target(false)
        .with_max_level(Level::INFO)
        .init();

    let cfg = parse_args();
    let listener = TcpListener::bind(cfg.bind).await?;

    info!(
        bind = %cfg.bind,
        security = cfg.security.enabled,
        password = cfg.password.is_some(),
        encryption = cfg.encrypt_enabled,
        "chat server listening"
    );
    info!("connect with: nc {} {}", cfg.bind.ip(), cfg.bind.port());

    let server = Arc::new(ChatServer::new(cfg));

    let srv = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            srv.stop();
        }
    });

    server.run(listener).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn test_config() -> Config {
        Config {
            bind: "127.0.0.1:0".parse().unwrap(),
            password: None,
            encrypt_enabled: false,
            encrypt_passphrase: None,
            security: SecurityConfig::default(),
        }
    }

    async fn start_server(cfg: Config) -> (Arc<ChatServer>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(ChatServer::new(cfg));
        tokio::spawn(server.clone().run(listener));
        (server, addr)
    }

    struct TestClient {
        rd: tokio::net::tcp::OwnedReadHalf,
        wr: tokio::net::tcp::OwnedWriteHalf,
        buf: Vec<u8>,
    }

    impl TestClient {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (rd, wr) = stream.into_split();
            Self {
                rd,
                wr,
                buf: Vec::new(),
            }
        }

        async fn send_line(&mut self, s: &str) {
            self.wr
                .write_all(format!("{s}\n").as_bytes())
                .await
                .unwrap();
        }

        /// Read until `needle` appears, returning (and consuming) everything
        /// up to and including it.
        async fn read_until(&mut self, needle: &str) -> String {
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    if let Some(pos) = find_sub(&self.buf, needle.as_bytes()) {
                        let end = pos + needle.len();
                        let out = self.buf.drain(..end).collect::<Vec<u8>>();
                        return String::from_utf8_lossy(&out).into_owned();
                    }
                    let mut tmp = [0u8; 1024];
                    let n = self.rd.read(&mut tmp).await.unwrap();
                    assert!(n > 0, "connection closed while waiting for {needle:?}");
                    self.buf.extend_from_slice(&tmp[..n]);
                }
            })
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {needle:?}"))
        }

        async fn read_line(&mut self) -> String {
            let s = self.read_until("\n").await;
            s.trim_end().to_string()
        }

        /// True when the server closes the connection within the timeout.
        async fn closed(&mut self) -> bool {
            let mut tmp = [0u8; 1024];
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    match self.rd.read(&mut tmp).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            })
            .await
            .is_ok()
        }
    }

    fn find_sub(hay: &[u8], needle: &[u8]) -> Option<usize> {
        hay.windows(needle.len()).position(|w| w == needle)
    }

    fn info_block_end() -> String {
        format!("{}\n", "-".repeat(30))
    }

    async fn join(addr: SocketAddr, name: &str) -> TestClient {
        let mut c = TestClient::connect(addr).await;
        c.read_until("Enter your username: ").await;
        c.send_line(name).await;
        c.read_until(&info_block_end()).await;
        c
    }

    #[tokio::test]
    async fn chat_reaches_others_but_never_the_sender() {
        let (_srv, addr) = start_server(test_config()).await;
        let mut alice = join(addr, "Alice").await;
        let mut bob = join(addr, "Bob").await;

        assert_eq!(alice.read_line().await, "Bob joined the chat!");

        alice.send_line("hello").await;
        let line = bob.read_line().await;
        assert!(line.starts_with('['), "line: {line}");
        assert!(line.contains("] Alice: hello"), "line: {line}");

        // Alice must not see her own message: the very next line she reads
        // has to be Bob's marker.
        bob.send_line("marker").await;
        let line = alice.read_line().await;
        assert!(line.contains("] Bob: marker"), "line: {line}");
    }

    #[tokio::test]
    async fn name_conflict_prompts_until_a_free_name() {
        let (_srv, addr) = start_server(test_config()).await;
        let _bob = join(addr, "Bob").await;

        let mut c = TestClient::connect(addr).await;
        c.read_until("Enter your username: ").await;
        c.send_line("Bob").await;
        c.read_until("Username 'Bob' is already taken").await;
        c.send_line("Bob2").await;
        c.read_until(&info_block_end()).await;

        c.send_line("/users").await;
        let block = c.read_until("Bob2 (").await;
        assert!(block.contains("Connected users:"), "block: {block}");
        assert!(block.contains("Bob ("), "block: {block}");
    }

    #[tokio::test]
    async fn empty_name_falls_back_to_port_derived_one() {
        let (_srv, addr) = start_server(test_config()).await;

        let mut c = TestClient::connect(addr).await;
        c.read_until("Enter your username: ").await;
        c.send_line("   ").await;
        let info = c.read_until(&info_block_end()).await;
        assert!(info.contains("Connected as: Anonymous_"), "info: {info}");
    }

    #[tokio::test]
    async fn wrong_password_closes_right_password_admits() {
        let mut cfg = test_config();
        cfg.password = Some("sekrit".into());
        let (_srv, addr) = start_server(cfg).await;

        let mut c = TestClient::connect(addr).await;
        c.read_until("Enter password: ").await;
        c.send_line("nope").await;
        c.read_until("Incorrect password").await;
        assert!(c.closed().await);

        let mut c = TestClient::connect(addr).await;
        c.read_until("Enter password: ").await;
        c.send_line("sekrit").await;
        c.read_until("Authentication successful!").await;
        c.read_until("Enter your username: ").await;
        c.send_line("Alice").await;
        let info = c.read_until(&info_block_end()).await;
        assert!(info.contains("Connected as: Alice"), "info: {info}");
    }

    #[tokio::test]
    async fn quit_broadcasts_a_leave_notice() {
        let (_srv, addr) = start_server(test_config()).await;
        let mut alice = join(addr, "Alice").await;
        let mut bob = join(addr, "Bob").await;
        assert_eq!(alice.read_line().await, "Bob joined the chat!");

        bob.send_line("/quit").await;
        assert_eq!(alice.read_line().await, "Bob left the chat");
        assert!(bob.closed().await);
    }

    #[tokio::test]
    async fn duplicate_spam_is_rejected_privately() {
        let (_srv, addr) = start_server(test_config()).await;
        let mut alice = join(addr, "Alice").await;
        let mut bob = join(addr, "Bob").await;
        let mut carol = join(addr, "Carol").await;
        assert_eq!(alice.read_line().await, "Bob joined the chat!");
        assert_eq!(alice.read_line().await, "Carol joined the chat!");
        assert_eq!(bob.read_line().await, "Carol joined the chat!");

        bob.send_line("echo").await;
        bob.send_line("echo").await;
        bob.send_line("echo").await;

        assert!(alice.read_line().await.contains("] Bob: echo"));
        assert!(alice.read_line().await.contains("] Bob: echo"));
        // The third echo bounces back to Bob only.
        assert_eq!(
            bob.read_line().await,
            "Spam detected: too many duplicate messages."
        );

        // Alice's next line is Carol's marker, proving the third echo was
        // never broadcast.
        carol.send_line("marker").await;
        assert!(alice.read_line().await.contains("] Carol: marker"));
    }

    #[tokio::test]
    async fn encrypted_broadcasts_round_trip_on_the_wire() {
        let mut cfg = test_config();
        cfg.encrypt_enabled = true;
        cfg.encrypt_passphrase = Some("wirepass".into());
        let (_srv, addr) = start_server(cfg).await;
        let ctx = EncryptionContext::new("wirepass");

        let mut alice = join(addr, "Alice").await;
        let mut bob = join(addr, "Bob").await;
        assert_eq!(ctx.decrypt(&alice.read_line().await), "Bob joined the chat!");

        alice.send_line(&ctx.encrypt("hello")).await;
        let raw = bob.read_line().await;
        let plain = ctx.decrypt(&raw);
        assert_ne!(raw, plain);
        assert!(plain.contains("] Alice: hello"), "plain: {plain}");

        // Lenient inbound: plaintext from a client without the passphrase is
        // still relayed.
        alice.send_line("plain").await;
        let plain = ctx.decrypt(&bob.read_line().await);
        assert!(plain.contains("] Alice: plain"), "plain: {plain}");
    }

    #[tokio::test]
    async fn panicking_connection_task_still_evicts_its_session() {
        let srv = Arc::new(ChatServer::new(test_config()));

        let session = SessionId::new();
        let (tx, _ghost_rx) = mpsc::channel(8);
        let (dtx, _) = watch::channel(false);
        srv.registry
            .try_admit(session, "Ghost", "127.0.0.1:9000".parse().unwrap(), tx, dtx)
            .await
            .unwrap();

        let (obs_tx, mut obs_rx) = mpsc::channel(8);
        let (obs_dtx, _) = watch::channel(false);
        srv.registry
            .try_admit(
                SessionId::new(),
                "Watcher",
                "127.0.0.1:9001".parse().unwrap(),
                obs_tx,
                obs_dtx,
            )
            .await
            .unwrap();

        let task_srv = srv.clone();
        let handle = tokio::spawn(async move {
            let _guard = EvictGuard {
                srv: task_srv,
                session: Some(session),
            };
            panic!("injected fault");
        });
        assert!(handle.await.unwrap_err().is_panic());

        // The guard-scheduled eviction frees the slot and produces the same
        // leave notice as an orderly disconnect.
        let line = tokio::time::timeout(Duration::from_secs(5), obs_rx.recv())
            .await
            .expect("leave notice within timeout")
            .unwrap();
        assert_eq!(&line[..], b"Ghost left the chat\n");
        assert_eq!(srv.registry.count().await, 1);
    }

    #[tokio::test]
    async fn users_command_repeats_without_tripping_spam() {
        let (_srv, addr) = start_server(test_config()).await;
        let mut c = join(addr, "Alice").await;

        for _ in 0..3 {
            c.send_line("/users").await;
            let block = c.read_until("Alice (").await;
            assert!(block.contains("Connected users:"), "block: {block}");
            assert!(!block.contains("Spam detected"), "block: {block}");
        }
    }

    #[test]
    fn malformed_numeric_env_is_an_error_not_a_default() {
        std::env::set_var("SCHRIMPD_TEST_NUM_OK", "42");
        std::env::set_var("SCHRIMPD_TEST_NUM_BAD", "abc");
        std::env::set_var("SCHRIMPD_TEST_NUM_BLANK", "  ");

        assert_eq!(parse_env::<usize>("SCHRIMPD_TEST_NUM_OK"), Ok(Some(42)));
        assert_eq!(parse_env::<usize>("SCHRIMPD_TEST_NUM_BAD"), Err(()));
        assert_eq!(parse_env::<usize>("SCHRIMPD_TEST_NUM_BLANK"), Ok(None));
        assert_eq!(parse_env::<usize>("SCHRIMPD_TEST_NUM_UNSET"), Ok(None));
    }

    #[tokio::test]
    async fn stop_closes_the_listener_but_not_live_sessions() {
        let (srv, addr) = start_server(test_config()).await;
        let mut alice = join(addr, "Alice").await;
        let mut bob = join(addr, "Bob").await;
        assert_eq!(alice.read_line().await, "Bob joined the chat!");

        srv.stop();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(TcpStream::connect(addr).await.is_err());

        alice.send_line("still here").await;
        assert!(bob.read_line().await.contains("] Alice: still here"));
    }
}
