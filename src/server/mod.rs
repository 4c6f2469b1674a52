//! Mutually-authenticated application server (component C9).
//!
//! Grounded on `original_source/lib/core/components/impl/socketappserver.py`:
//! a `tokio`-driven accept loop over an `openssl::ssl::SslAcceptor`
//! configured for mandatory client-certificate verification, one task per
//! connection, dispatching the `poll`/`kill`/`submit`/`interact` command
//! set defined in spec.md §4.6. TLS idiom and certificate handling adapted
//! from the teacher's `tools/http.rs` (`tokio_openssl::SslStream`) and
//! `tools/cert.rs`.

pub mod app;
pub mod auth;
pub mod tail;
pub mod wire;
pub mod workarea;

use std::cell::Cell;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::process::Stdio;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod, SslVerifyMode};
use openssl::x509::verify::X509VerifyFlags;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::sync::watch;
use tokio_openssl::SslStream;

use crate::config::ServerConfig;
use crate::inventory::Inventory;
use crate::server::app::{AppRecord, AppStatus};
use crate::server::auth::{identify_peer, Authorizer, UserIdentitySource};
use crate::server::tail::TailFollower;
use crate::server::wire::Envelope;
use crate::server::workarea::allocate;
use crate::tools::cert::CertInfo;

/// The incoming `app_data` object (spec.md §4.6's command table); fields
/// not required by a given command are simply left `None`.
#[derive(Debug, Deserialize)]
struct AppRequest {
    service: String,
    command: String,
    appid: Option<u64>,
    title: Option<String>,
    args: Option<Vec<String>>,
    write_request: Option<bool>,
    exec: Option<String>,
    exec_path: Option<String>,
    path: Option<String>,
    #[serde(default)]
    mode: Option<String>,
}

/// `{host, port}` the client listens on for the outbound stdout/stderr
/// tunnels (spec.md §4.6's synchronous-submit and interact flows).
#[derive(Debug, Deserialize)]
struct ClientAddr {
    host: String,
    port: u16,
}

pub struct Server {
    config: ServerConfig,
    inventory: Rc<Inventory>,
    users: Box<dyn UserIdentitySource>,
    authorizer: Box<dyn Authorizer>,
    apps: std::cell::RefCell<Vec<Rc<AppRecord>>>,
    next_app_id: Cell<u64>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        inventory: Rc<Inventory>,
        users: Box<dyn UserIdentitySource>,
        authorizer: Box<dyn Authorizer>,
    ) -> Rc<Self> {
        Rc::new(Server {
            config,
            inventory,
            users,
            authorizer,
            apps: std::cell::RefCell::new(Vec::new()),
            next_app_id: Cell::new(1),
        })
    }

    fn build_acceptor(&self) -> Result<SslAcceptor> {
        let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;
        builder.set_certificate_file(&self.config.certfile, SslFiletype::PEM)?;
        builder.set_private_key_file(&self.config.keyfile, SslFiletype::PEM)?;
        builder.set_ca_file(&self.config.cafile)?;
        builder.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
        if self.config.allow_proxy_certs {
            builder.cert_store_mut().set_flags(X509VerifyFlags::ALLOW_PROXY_CERTS)?;
        }
        Ok(builder.build())
    }

    pub async fn run(self: Rc<Self>) -> Result<()> {
        let acceptor = Rc::new(self.build_acceptor()?);
        let listener = TcpListener::bind(("0.0.0.0", self.config.port))
            .await
            .with_context(|| format!("binding application server port {}", self.config.port))?;
        log::info!("application server listening on port {}", self.config.port);

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let server = self.clone();
            let acceptor = acceptor.clone();
            tokio::task::spawn_local(async move {
                if let Err(err) = server.handle_connection(stream, &acceptor).await {
                    log::warn!("connection from {} failed: {:#}", peer_addr, err);
                }
            });
        }
    }

    async fn handle_connection(self: &Rc<Self>, stream: TcpStream, acceptor: &SslAcceptor) -> Result<()> {
        let ssl = openssl::ssl::Ssl::new(acceptor.context())?;
        let mut tls_stream = SslStream::new(ssl, stream)?;
        std::pin::Pin::new(&mut tls_stream).accept().await.context("TLS handshake failed")?;

        let peer_cert_der = tls_stream
            .ssl()
            .peer_certificate()
            .context("client presented no certificate")?
            .to_der()?;
        let cert = CertInfo::from_der(&peer_cert_der)?;

        let (dn, user_name) = match identify_peer(&cert, self.users.as_ref()) {
            Some(pair) => pair,
            None => {
                let dn = cert.subject_name().unwrap_or_default();
                wire::send(&mut tls_stream, &Envelope::failed(format!("Unidentified user DN {}", dn))).await?;
                return Ok(());
            }
        };
        log::info!("connection authenticated as {} ({})", user_name, dn);

        let request: AppRequest = match wire::recv(&mut tls_stream).await? {
            Some(r) => r,
            None => return Ok(()),
        };

        if !self.authorizer.authorize(&user_name, &request.service) {
            let message = format!("Unauthorized user/service {}/{}", user_name, request.service);
            wire::send(&mut tls_stream, &Envelope::failed(message)).await?;
            return Ok(());
        }

        let response = match request.command.as_str() {
            "poll" | "kill" => self.act_on_app(&request),
            "submit" => self.submit_app(&dn, &user_name, request, &mut tls_stream).await,
            "interact" => self.interact(&dn, &user_name, request, &mut tls_stream).await,
            other => Envelope::failed(format!("Unknown command {}", other)),
        };
        wire::send(&mut tls_stream, &response).await?;
        Ok(())
    }

    fn act_on_app(&self, request: &AppRequest) -> Envelope {
        let appid = match request.appid {
            Some(id) => id,
            None => return Envelope::failed("Missing appid"),
        };
        let apps = self.apps.borrow();
        let app = match apps.iter().find(|a| a.id == appid) {
            Some(app) => app,
            None => return Envelope::failed(format!("Unknown appid {}", appid)),
        };

        if request.command == "kill" {
            if app.status().is_active() {
                app.set_status(AppStatus::Killed);
                Envelope::ok("Task aborted.")
            } else {
                Envelope::ok(format!(
                    "Task already completed with status {} (exit code {:?}).",
                    app.status().name(),
                    app.exit_code.get()
                ))
            }
        } else {
            Envelope::ok(app.to_json())
        }
    }

    /// The authenticated connection's identity becomes the submitted
    /// application's owner (SPEC_FULL.md §4.6, `_submit_app` resolution).
    async fn submit_app<S>(self: &Rc<Self>, dn: &str, user_name: &str, request: AppRequest, tls_stream: &mut S) -> Envelope
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let title = match request.title {
            Some(t) => t,
            None => return Envelope::failed("Missing title"),
        };
        let args = match request.args {
            Some(a) => a,
            None => return Envelope::failed("Missing args"),
        };
        let write_request = match request.write_request {
            Some(w) => w,
            None => return Envelope::failed("Missing write_request"),
        };

        let id = self.next_app_id.get();
        self.next_app_id.set(id + 1);
        let work_area = match &request.path {
            Some(path) => std::path::PathBuf::from(path),
            None => match allocate(&self.config.work_area_root, id) {
                Ok(dir) => dir,
                Err(_) => return Envelope::failed("Failed to create work area"),
            },
        };

        if let Some(exec_path) = &request.exec_path {
            if std::fs::copy(exec_path, work_area.join("exec.py")).is_err() {
                return Envelope::failed(format!("Could not copy {:?}", work_area));
            }
        } else if let Some(exec) = &request.exec {
            if crate::tools::file_set_contents(work_area.join("exec.py"), exec.as_bytes(), None).is_err() {
                return Envelope::failed(format!("Could not write exec.py in {:?}", work_area));
            }
        }

        let record = Rc::new(AppRecord::new(id, dn.to_string(), user_name.to_string(), title, args, write_request, work_area.clone()));
        self.apps.borrow_mut().push(record.clone());
        record.set_status(AppStatus::Assigned);

        let mode = request.mode.as_deref().unwrap_or("asynch");
        if mode == "synch" {
            self.run_synch(record, tls_stream).await
        } else {
            tokio::task::spawn_local(Server::run_asynch(self.config.exec_interpreter.clone(), record.clone()));
            Envelope::ok(json!({"appid": record.id, "path": record.work_area}))
        }
    }

    fn spawn_exec(interpreter: &str, record: &AppRecord) -> Result<tokio::process::Child> {
        let exec_file = record.work_area.join("exec.py");
        let stdout = std::fs::File::create(record.work_area.join("_stdout"))?;
        let stderr = std::fs::File::create(record.work_area.join("_stderr"))?;
        let child = Command::new(interpreter)
            .arg(exec_file)
            .args(&record.args)
            .current_dir(&record.work_area)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .context("spawning submitted application")?;
        Ok(child)
    }

    async fn run_asynch(interpreter: String, record: Rc<AppRecord>) {
        record.set_status(AppStatus::Run);
        let mut child = match Server::spawn_exec(&interpreter, &record) {
            Ok(child) => child,
            Err(err) => {
                record.set_status(AppStatus::Failed(err.to_string()));
                return;
            }
        };
        record.pid.set(child.id());
        Server::await_exit(&mut child, &record).await;
    }

    async fn await_exit(child: &mut tokio::process::Child, record: &AppRecord) {
        match child.wait().await {
            Ok(status) => {
                record.exit_code.set(status.code());
                if status.success() {
                    record.set_status(AppStatus::Succeeded);
                } else {
                    record.set_status(AppStatus::Failed(format!("exited with status {}", status)));
                }
            }
            Err(err) => record.set_status(AppStatus::Failed(err.to_string())),
        }
    }

    /// Streams the running application's stdout/stderr to the client's
    /// listening socket while it runs, then reports its terminal status
    /// (spec.md §4.6's `_serve_synch_app`). Unlike the original, which
    /// polls a separately-updated master record with a 1s backoff, the
    /// application's `AppRecord` is updated in-process as soon as the
    /// child exits, so no polling loop is needed here.
    async fn run_synch<S>(self: &Rc<Self>, record: Rc<AppRecord>, tls_stream: &mut S) -> Envelope
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        record.set_status(AppStatus::Run);
        let mut child = match Server::spawn_exec(&self.config.exec_interpreter, &record) {
            Ok(child) => child,
            Err(err) => {
                record.set_status(AppStatus::Failed(err.to_string()));
                return Envelope::failed(err.to_string());
            }
        };
        record.pid.set(child.id());

        if let Err(err) = wire::send(tls_stream, &Envelope::ok(json!({"appid": record.id, "path": record.work_area}))).await {
            return Envelope::failed(err.to_string());
        }

        let addr: ClientAddr = match wire::recv(tls_stream).await {
            Ok(Some(addr)) => addr,
            _ => return Envelope::failed("Expected client listening address"),
        };
        let socket_addr: SocketAddr = match format!("{}:{}", addr.host, addr.port).parse() {
            Ok(addr) => addr,
            Err(err) => return Envelope::failed(err.to_string()),
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut followers = Vec::new();
        for name in ["_stdout", "_stderr"] {
            if let Ok(sink) = TcpStream::connect(socket_addr).await {
                let follower = TailFollower::new(record.work_area.join(name), Duration::from_millis(500));
                followers.push(tokio::task::spawn_local(stream_until_stop(follower, sink, stop_rx.clone())));
            }
        }

        Server::await_exit(&mut child, &record).await;
        let _ = stop_tx.send(true);
        for follower in followers {
            let _ = follower.await;
        }

        Envelope::ok(json!({"status": record.status().name(), "exit_code": record.exit_code.get()}))
    }

    /// Tunnels an interactive shell over the connection: framed input
    /// lines become the child's stdin, and its stdout/stderr flow raw to
    /// the two sockets the client asked us to connect to (spec.md §4.6's
    /// `_interact`/`SocketConsole`). The interpreter is a plain shell
    /// rather than an embedded language console, since SPEC_FULL.md's
    /// scope is the tunnel, not a bespoke REPL implementation.
    async fn interact<S>(self: &Rc<Self>, dn: &str, user_name: &str, request: AppRequest, tls_stream: &mut S) -> Envelope
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let work_area = match &request.path {
            Some(path) => std::path::PathBuf::from(path),
            None => {
                let id = self.next_app_id.get();
                self.next_app_id.set(id + 1);
                match allocate(&self.config.work_area_root, id) {
                    Ok(dir) => dir,
                    Err(_) => return Envelope::failed("Failed to create work area"),
                }
            }
        };
        log::info!("interactive session for {} ({}) in {:?}", user_name, dn, work_area);

        if let Err(err) = wire::send(tls_stream, &Envelope::ok(Value::Null)).await {
            return Envelope::failed(err.to_string());
        }
        let addr: ClientAddr = match wire::recv(tls_stream).await {
            Ok(Some(addr)) => addr,
            _ => return Envelope::failed("Expected client listening address"),
        };
        let socket_addr: SocketAddr = match format!("{}:{}", addr.host, addr.port).parse() {
            Ok(addr) => addr,
            Err(err) => return Envelope::failed(err.to_string()),
        };

        let mut stdout_sink = match TcpStream::connect(socket_addr).await {
            Ok(s) => s,
            Err(err) => return Envelope::failed(err.to_string()),
        };
        let mut stderr_sink = match TcpStream::connect(socket_addr).await {
            Ok(s) => s,
            Err(err) => return Envelope::failed(err.to_string()),
        };

        let mut child = match Command::new("sh")
            .current_dir(&work_area)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => return Envelope::failed(err.to_string()),
        };
        let mut child_stdin = child.stdin.take().expect("piped stdin");
        let mut child_stdout = child.stdout.take().expect("piped stdout");
        let mut child_stderr = child.stderr.take().expect("piped stderr");

        let stdout_task = tokio::task::spawn_local(async move {
            let mut buf = [0u8; 4096];
            loop {
                match child_stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stdout_sink.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        let stderr_task = tokio::task::spawn_local(async move {
            let mut buf = [0u8; 4096];
            loop {
                match child_stderr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stderr_sink.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        loop {
            match wire::recv::<_, String>(tls_stream).await {
                Ok(Some(line)) => {
                    if child_stdin.write_all(line.as_bytes()).await.is_err() || child_stdin.write_all(b"\n").await.is_err() {
                        break;
                    }
                }
                _ => break,
            }
        }
        drop(child_stdin);

        let _ = child.wait().await;
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        if request.path.is_none() {
            let _ = std::fs::remove_dir_all(&work_area);
        }
        Envelope::ok(Value::Null)
    }

    pub fn active_app_ids(&self) -> HashSet<u64> {
        self.apps.borrow().iter().map(|a| a.id).collect()
    }

    pub fn inventory(&self) -> &Rc<Inventory> {
        &self.inventory
    }
}

async fn stream_until_stop(mut follower: TailFollower, mut sink: TcpStream, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            chunk = follower.next_chunk() => {
                match chunk {
                    Ok(Some(data)) => {
                        if sink.write_all(data.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
            _ = stop.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapUsers(HashMap<String, String>);
    impl UserIdentitySource for MapUsers {
        fn resolve(&self, dn: &str) -> Option<String> {
            self.0.get(dn).cloned()
        }
    }

    struct AllowAll;
    impl Authorizer for AllowAll {
        fn authorize(&self, _user: &str, _service: &str) -> bool {
            true
        }
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            certfile: "/dev/null".into(),
            keyfile: "/dev/null".into(),
            cafile: "/dev/null".into(),
            port: 0,
            work_area_root: std::env::temp_dir().join(format!("ddm-core-server-test-{}", std::process::id())),
            allow_proxy_certs: false,
            exec_interpreter: "python3".into(),
        }
    }

    fn test_server() -> Rc<Server> {
        Server::new(test_config(), Rc::new(Inventory::new(false)), Box::new(MapUsers(HashMap::new())), Box::new(AllowAll))
    }

    #[test]
    fn poll_on_unknown_appid_is_failed_envelope() {
        let server = test_server();
        let request = AppRequest {
            service: "ddm".into(),
            command: "poll".into(),
            appid: Some(999),
            title: None,
            args: None,
            write_request: None,
            exec: None,
            exec_path: None,
            path: None,
            mode: None,
        };
        let envelope = server.act_on_app(&request);
        assert_eq!(envelope.status, wire::Status::Failed);
        std::fs::remove_dir_all(&server.config.work_area_root).ok();
    }

    #[test]
    fn poll_missing_appid_is_failed_envelope() {
        let server = test_server();
        let request = AppRequest {
            service: "ddm".into(),
            command: "poll".into(),
            appid: None,
            title: None,
            args: None,
            write_request: None,
            exec: None,
            exec_path: None,
            path: None,
            mode: None,
        };
        let envelope = server.act_on_app(&request);
        assert_eq!(envelope.status, wire::Status::Failed);
        assert_eq!(envelope.message, "Missing appid");
    }

    #[test]
    fn kill_on_active_app_sets_killed_status() {
        let server = test_server();
        let record = Rc::new(AppRecord::new(1, "CN=alice".into(), "alice".into(), "sync".into(), vec![], true, "/tmp".into()));
        server.apps.borrow_mut().push(record.clone());

        let request = AppRequest {
            service: "ddm".into(),
            command: "kill".into(),
            appid: Some(1),
            title: None,
            args: None,
            write_request: None,
            exec: None,
            exec_path: None,
            path: None,
            mode: None,
        };
        let envelope = server.act_on_app(&request);
        assert_eq!(envelope.status, wire::Status::Ok);
        assert_eq!(record.status(), AppStatus::Killed);
        std::fs::remove_dir_all(&server.config.work_area_root).ok();
    }

    #[test]
    fn kill_on_terminal_app_reports_already_completed() {
        let server = test_server();
        let record = Rc::new(AppRecord::new(1, "CN=alice".into(), "alice".into(), "sync".into(), vec![], true, "/tmp".into()));
        record.set_status(AppStatus::Succeeded);
        server.apps.borrow_mut().push(record);

        let request = AppRequest {
            service: "ddm".into(),
            command: "kill".into(),
            appid: Some(1),
            title: None,
            args: None,
            write_request: None,
            exec: None,
            exec_path: None,
            path: None,
            mode: None,
        };
        let envelope = server.act_on_app(&request);
        assert_eq!(envelope.status, wire::Status::Ok);
        assert_eq!(envelope.message.as_str().unwrap(), "Task already completed with status succeeded (exit code None).");
        std::fs::remove_dir_all(&server.config.work_area_root).ok();
    }

    /// spec.md §8 S4: a length-prefixed `poll` command with no `appid`
    /// decodes fine over the wire but is rejected by the application layer.
    #[tokio::test]
    async fn framed_poll_without_appid_is_rejected_end_to_end() {
        let mut framed = Vec::new();
        wire::send(&mut framed, &serde_json::json!({"service": "ddm", "command": "poll"})).await.unwrap();

        let mut cursor = std::io::Cursor::new(framed);
        let request: AppRequest = wire::recv(&mut cursor).await.unwrap().unwrap();
        assert_eq!(request.command, "poll");
        assert!(request.appid.is_none());

        let server = test_server();
        let envelope = server.act_on_app(&request);
        assert_eq!(envelope.status, wire::Status::Failed);
        std::fs::remove_dir_all(&server.config.work_area_root).ok();
    }
}
