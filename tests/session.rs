/*
 * SPDX-License-Identifier: Apache-2.0
 */

//! End-to-end session tests against scripted loopback servers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use ftpkit::{
    FtpConnectError, FtpDataChannelMode, FtpEncryptionMode, FtpFeatureSet, FtpHashAlgorithm,
    FtpReplyError, FtpSession, FtpSessionConfig, FtpTextEncoding, FtpTransferType,
};

#[derive(Clone)]
enum Step {
    Send(String),
    Recv,
}

fn send(line: &str) -> Step {
    Step::Send(line.to_string())
}

fn recv() -> Step {
    Step::Recv
}

struct ScriptServer {
    addr: SocketAddr,
    transcript: Arc<Mutex<Vec<(usize, String)>>>,
}

impl ScriptServer {
    /// One script per expected connection; connections run concurrently.
    async fn spawn(scripts: Vec<Vec<Step>>) -> ScriptServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let transcript = Arc::new(Mutex::new(Vec::new()));
        let shared = transcript.clone();
        tokio::spawn(async move {
            for (idx, script) in scripts.into_iter().enumerate() {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let transcript = shared.clone();
                tokio::spawn(run_script(stream, script, idx, transcript));
            }
        });
        ScriptServer { addr, transcript }
    }

    async fn lines_for(&self, conn: usize) -> Vec<String> {
        self.transcript
            .lock()
            .await
            .iter()
            .filter(|(idx, _)| *idx == conn)
            .map(|(_, line)| line.clone())
            .collect()
    }

    async fn all_lines(&self) -> Vec<String> {
        self.transcript
            .lock()
            .await
            .iter()
            .map(|(_, line)| line.clone())
            .collect()
    }
}

async fn run_script(
    stream: TcpStream,
    script: Vec<Step>,
    idx: usize,
    transcript: Arc<Mutex<Vec<(usize, String)>>>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    for step in script {
        match step {
            Step::Send(line) => {
                if write_half
                    .write_all(format!("{line}\r\n").as_bytes())
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Step::Recv => match read_recorded_line(&mut reader, idx, &transcript).await {
                Some(_) => {}
                None => return,
            },
        }
    }
    // keep recording whatever else arrives until the client hangs up
    while read_recorded_line(&mut reader, idx, &transcript).await.is_some() {}
}

async fn read_recorded_line(
    reader: &mut BufReader<OwnedReadHalf>,
    idx: usize,
    transcript: &Arc<Mutex<Vec<(usize, String)>>>,
) -> Option<String> {
    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) | Err(_) => None,
        Ok(_) => {
            let line = line.trim_end().to_string();
            transcript.lock().await.push((idx, line.clone()));
            Some(line)
        }
    }
}

enum Feat {
    Missing,
    Utf8Size,
    HashList,
}

fn connect_steps(feat: Feat) -> Vec<Step> {
    let mut steps = vec![
        send("220 Service ready"),
        recv(), // USER
        send("331 Please specify the password."),
        recv(), // PASS
        send("230 Login successful."),
        recv(), // FEAT
    ];
    match feat {
        Feat::Missing => steps.push(send("502 FEAT not implemented")),
        Feat::Utf8Size => {
            steps.extend([
                send("211-Features:"),
                send(" UTF8"),
                send(" SIZE"),
                send("211 End"),
                recv(), // OPTS UTF8 ON
                send("200 Always in UTF8 mode."),
            ]);
        }
        Feat::HashList => {
            steps.extend([
                send("211-Features:"),
                send(" HASH SHA-256*;SHA-1;MD5"),
                send(" SIZE"),
                send("211 End"),
            ]);
        }
    }
    steps.push(recv()); // SYST
    steps.push(send("215 UNIX Type: L8"));
    steps
}

fn config_for(addr: SocketAddr) -> FtpSessionConfig {
    let mut config = FtpSessionConfig::new("127.0.0.1");
    config.port = addr.port();
    config.control.read_timeout = Duration::from_secs(5);
    config.control.connect_timeout = Duration::from_secs(5);
    config.data.connect_timeout = Duration::from_secs(5);
    config
}

fn pasv_reply_for(port: u16) -> String {
    format!(
        "227 Entering Passive Mode (127,0,0,1,{},{})",
        port >> 8,
        port & 0xff
    )
}

#[tokio::test]
async fn cleartext_connect_with_anonymous_auth() {
    let server = ScriptServer::spawn(vec![connect_steps(Feat::Utf8Size)]).await;
    let session = FtpSession::new(config_for(server.addr));

    session.connect().await.unwrap();
    assert!(session.is_connected().await);
    assert!(session.has_feature(FtpFeatureSet::UTF8).await);
    assert!(session.has_feature(FtpFeatureSet::SIZE).await);
    assert!(!session.has_feature(FtpFeatureSet::MLST).await);
    assert_eq!(session.encoding().await, FtpTextEncoding::Utf8);
    let welcome = session.welcome_reply().await.unwrap();
    assert_eq!(welcome.code(), 220);
    assert_eq!(session.system_type().await.as_deref(), Some("UNIX Type: L8"));

    let lines = server.lines_for(0).await;
    assert_eq!(
        lines,
        vec![
            "USER anonymous",
            "PASS anonymous",
            "FEAT",
            "OPTS UTF8 ON",
            "SYST"
        ]
    );
}

#[tokio::test]
async fn user_completion_skips_password() {
    let script = vec![
        send("220 Service ready"),
        recv(), // USER
        send("230 Login successful."),
        recv(), // FEAT
        send("502 FEAT not implemented"),
        recv(), // SYST
        send("215 UNIX Type: L8"),
    ];
    let server = ScriptServer::spawn(vec![script]).await;
    let session = FtpSession::new(config_for(server.addr));
    session.connect().await.unwrap();

    let lines = server.lines_for(0).await;
    assert_eq!(lines, vec!["USER anonymous", "FEAT", "SYST"]);
}

#[tokio::test]
async fn login_rejection_fails_connect() {
    let script = vec![
        send("220 Service ready"),
        recv(), // USER
        send("530 This FTP server is anonymous only."),
    ];
    let server = ScriptServer::spawn(vec![script]).await;
    let mut config = config_for(server.addr);
    config.username = "root".to_string();
    let session = FtpSession::new(config);

    match session.connect().await {
        Err(FtpConnectError::LoginFailed(reply)) => assert_eq!(reply.code(), 530),
        other => panic!("unexpected connect result: {other:?}"),
    }
    assert!(!session.is_connected().await);
}

#[tokio::test]
async fn refused_auth_tls_fails_connect() {
    let script = vec![
        send("220 Service ready"),
        recv(), // AUTH TLS
        send("502 Command not implemented"),
    ];
    let server = ScriptServer::spawn(vec![script]).await;
    let mut config = config_for(server.addr);
    config.encryption = FtpEncryptionMode::Explicit;
    let session = FtpSession::new(config);

    match session.connect().await {
        Err(FtpConnectError::TlsNotAvailable(reply)) => assert_eq!(reply.code(), 502),
        other => panic!("unexpected connect result: {other:?}"),
    }
    assert_eq!(server.lines_for(0).await, vec!["AUTH TLS"]);
}

#[tokio::test]
async fn greeting_timeout_is_reported() {
    // a server that accepts and stays silent
    let server = ScriptServer::spawn(vec![vec![recv()]]).await;
    let mut config = config_for(server.addr);
    config.control.read_timeout = Duration::from_millis(200);
    let session = FtpSession::new(config);

    match session.connect().await {
        Err(FtpConnectError::GreetingFailed(FtpReplyError::ReadTimedOut(stage))) => {
            assert_eq!(stage, "greeting");
        }
        other => panic!("unexpected connect result: {other:?}"),
    }
}

#[tokio::test]
async fn command_replies_are_returned_verbatim() {
    let mut script = connect_steps(Feat::Missing);
    script.extend([recv(), send("550 Permission denied.")]);
    let server = ScriptServer::spawn(vec![script]).await;
    let session = FtpSession::new(config_for(server.addr));
    session.connect().await.unwrap();

    let reply = session.execute("MKD restricted").await.unwrap();
    assert_eq!(reply.code(), 550);
    assert!(!reply.success());
    assert!(server.lines_for(0).await.contains(&"MKD restricted".to_string()));
}

#[tokio::test]
async fn execute_on_disconnected_session_connects_once() {
    let mut script = connect_steps(Feat::Missing);
    script.extend([recv(), send("200 Zzz.")]);
    let server = ScriptServer::spawn(vec![script]).await;
    let session = FtpSession::new(config_for(server.addr));

    let reply = session.execute("NOOP").await.unwrap();
    assert_eq!(reply.code(), 200);

    let lines = server.lines_for(0).await;
    let users = lines.iter().filter(|l| l.starts_with("USER")).count();
    assert_eq!(users, 1);
    assert_eq!(lines.last().unwrap(), "NOOP");
}

#[tokio::test]
async fn second_connect_disconnects_first() {
    let mut first = connect_steps(Feat::Missing);
    first.extend([recv(), send("221 Goodbye.")]);
    let second = connect_steps(Feat::Missing);
    let server = ScriptServer::spawn(vec![first, second]).await;
    let session = FtpSession::new(config_for(server.addr));

    session.connect().await.unwrap();
    session.connect().await.unwrap();
    assert!(session.is_connected().await);

    let first_lines = server.lines_for(0).await;
    assert_eq!(first_lines.last().unwrap(), "QUIT");
    let second_lines = server.lines_for(1).await;
    assert_eq!(second_lines.first().unwrap(), "USER anonymous");
}

#[tokio::test]
async fn graceful_disconnect_sends_quit() {
    let mut script = connect_steps(Feat::Missing);
    script.extend([recv(), send("221 Goodbye.")]);
    let server = ScriptServer::spawn(vec![script]).await;
    let session = FtpSession::new(config_for(server.addr));
    session.connect().await.unwrap();

    session.disconnect().await;
    assert!(!session.is_connected().await);
    assert_eq!(server.lines_for(0).await.last().unwrap(), "QUIT");
}

#[tokio::test]
async fn ungraceful_disconnect_skips_quit() {
    let server = ScriptServer::spawn(vec![connect_steps(Feat::Missing)]).await;
    let mut config = config_for(server.addr);
    config.ungraceful_disconnect = true;
    let session = FtpSession::new(config);
    session.connect().await.unwrap();

    session.disconnect().await;
    assert!(!session.is_connected().await);
    // give the server a moment to observe EOF
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!server.all_lines().await.contains(&"QUIT".to_string()));
}

#[tokio::test]
async fn stale_data_forces_reconnect_before_command() {
    let mut first = connect_steps(Feat::Missing);
    // an unsolicited reply the client never reads
    first.push(send("226 Transfer complete."));
    let mut second = connect_steps(Feat::Missing);
    second.extend([recv(), send("257 \"/\" is the current directory")]);
    let server = ScriptServer::spawn(vec![first, second]).await;
    let session = FtpSession::new(config_for(server.addr));

    session.connect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let reply = session.execute("PWD").await.unwrap();
    assert_eq!(reply.code(), 257);

    // PWD went over the fresh connection, not the poisoned one
    let first_lines = server.lines_for(0).await;
    assert!(!first_lines.contains(&"PWD".to_string()));
    let second_lines = server.lines_for(1).await;
    assert_eq!(second_lines.last().unwrap(), "PWD");
}

#[tokio::test]
async fn hash_algorithms_are_recorded() {
    let server = ScriptServer::spawn(vec![connect_steps(Feat::HashList)]).await;
    let session = FtpSession::new(config_for(server.addr));
    session.connect().await.unwrap();

    assert!(session.has_feature(FtpFeatureSet::HASH).await);
    assert_eq!(
        session.hash_algorithms().await,
        vec![
            FtpHashAlgorithm::Sha256,
            FtpHashAlgorithm::Sha1,
            FtpHashAlgorithm::Md5
        ]
    );
}

#[tokio::test]
async fn get_reply_reads_pending_reply() {
    let mut script = connect_steps(Feat::Missing);
    script.push(send("200 Out of band."));
    let server = ScriptServer::spawn(vec![script]).await;
    let mut config = config_for(server.addr);
    config.stale_data_check = false;
    let session = FtpSession::new(config);
    session.connect().await.unwrap();

    let reply = session.get_reply().await.unwrap();
    assert_eq!(reply.code(), 200);
    assert_eq!(reply.message(), "Out of band.");
}

#[tokio::test]
async fn raw_write_pairs_with_get_reply() {
    let mut script = connect_steps(Feat::Missing);
    script.extend([recv(), send("200 NOOP ok.")]);
    let server = ScriptServer::spawn(vec![script]).await;
    let session = FtpSession::new(config_for(server.addr));
    session.connect().await.unwrap();

    session.write_raw(b"NOOP\r\n").await.unwrap();
    let reply = session.get_reply().await.unwrap();
    assert_eq!(reply.code(), 200);
    assert_eq!(server.lines_for(0).await.last().unwrap(), "NOOP");
}

#[tokio::test]
async fn epsv_refusal_falls_back_to_pasv_and_sticks() {
    let data_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let data_port = data_listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        // accept the two passive data connections and drop them
        for _ in 0..2 {
            if data_listener.accept().await.is_err() {
                return;
            }
        }
    });

    let mut script = connect_steps(Feat::Missing);
    script.extend([
        recv(), // TYPE I
        send("200 Switching to Binary mode."),
        recv(), // EPSV
        send("500 Not understood"),
        recv(), // PASV
        send(&pasv_reply_for(data_port)),
        recv(), // PASV again on the second open
        send(&pasv_reply_for(data_port)),
    ]);
    let server = ScriptServer::spawn(vec![script]).await;
    let session = FtpSession::new(config_for(server.addr));
    session.connect().await.unwrap();

    let channel = session
        .open_passive_data_channel(FtpTransferType::Image)
        .await
        .unwrap();
    assert!(!channel.is_listening());
    let stream = channel.establish().await.unwrap();
    drop(stream);

    let channel = session
        .open_passive_data_channel(FtpTransferType::Image)
        .await
        .unwrap();
    drop(channel);

    let lines = server.lines_for(0).await;
    let epsv = lines.iter().filter(|l| l.as_str() == "EPSV").count();
    let pasv = lines.iter().filter(|l| l.as_str() == "PASV").count();
    assert_eq!(epsv, 1, "EPSV must not be probed again after fallback");
    assert_eq!(pasv, 2);
    // TYPE negotiated once, state cached afterwards
    let types = lines.iter().filter(|l| l.starts_with("TYPE")).count();
    assert_eq!(types, 1);
}

#[tokio::test]
async fn active_channel_announces_and_accepts() {
    let mut script = connect_steps(Feat::Missing);
    script.extend([
        recv(), // EPRT
        send("200 EPRT command successful."),
    ]);
    let server = ScriptServer::spawn(vec![script]).await;
    let mut config = config_for(server.addr);
    config.data_channel_mode = FtpDataChannelMode::AutoActive;
    let session = FtpSession::new(config);
    session.connect().await.unwrap();

    let channel = session
        .open_active_data_channel(FtpTransferType::Ascii)
        .await
        .unwrap();
    assert!(channel.is_listening());

    let lines = server.lines_for(0).await;
    let eprt = lines.iter().find(|l| l.starts_with("EPRT")).unwrap();
    // EPRT |1|127.0.0.1|port|
    let mut parts = eprt.split('|');
    assert_eq!(parts.next(), Some("EPRT "));
    assert_eq!(parts.next(), Some("1"));
    assert_eq!(parts.next(), Some("127.0.0.1"));
    let port: u16 = parts.next().unwrap().parse().unwrap();

    let (established, connected) = tokio::join!(
        channel.establish(),
        TcpStream::connect(("127.0.0.1", port))
    );
    let mut data_stream = established.unwrap();
    let mut peer = connected.unwrap();

    peer.write_all(b"listing line\r\n").await.unwrap();
    drop(peer);
    let mut buf = Vec::new();
    data_stream.read_to_end(&mut buf).await.unwrap();
    assert_eq!(buf, b"listing line\r\n");
}

#[tokio::test]
async fn clone_skips_feature_discovery_and_is_independent() {
    let original_script = connect_steps(Feat::Utf8Size);
    let clone_script = vec![
        send("220 Service ready"),
        recv(), // USER
        send("331 Please specify the password."),
        recv(), // PASS
        send("230 Login successful."),
        recv(), // OPTS UTF8 ON (UTF8 inherited, encoding re-promoted)
        send("200 Always in UTF8 mode."),
        recv(), // SYST
        send("215 UNIX Type: L8"),
        recv(), // QUIT
        send("221 Goodbye."),
    ];
    let server = ScriptServer::spawn(vec![original_script, clone_script]).await;
    let session = FtpSession::new(config_for(server.addr));
    session.connect().await.unwrap();

    let sibling = session.clone_session().await;
    assert!(sibling.is_clone().await);
    assert!(sibling.has_feature(FtpFeatureSet::SIZE).await, "clone inherits capabilities");

    sibling.connect().await.unwrap();
    let clone_lines = server.lines_for(1).await;
    assert!(!clone_lines.contains(&"FEAT".to_string()));

    sibling.close().await;
    assert!(sibling.is_closed().await);
    assert!(session.is_connected().await, "closing the clone leaves the original connected");
}
