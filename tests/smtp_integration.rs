//! Integration tests for the SMTP endpoint.
//!
//! Each test binds the listener on a random port and talks SMTP to it over
//! real TCP. Failed analyses are relayed through lettre to a throwaway SMTP
//! sink, also on a random port.

use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::write::GzEncoder;
use lettre::SmtpTransport;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::oneshot;
use tokio::time::timeout;

use dmarc_analyzer::config::ListenerConfig;
use dmarc_analyzer::forward::SmtpRelay;
use dmarc_analyzer::observation::{MemorySink, Outcome};
use dmarc_analyzer::server::Server;
use dmarc_analyzer::server::data::DataReader;
use dmarc_analyzer::session::{Backend, Fallback};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const REPORT: &str = r#"<?xml version="1.0" encoding="UTF-8" ?>
<feedback>
  <report_metadata>
    <org_name>Fastmail Pty Ltd</org_name>
    <email>dmarc-reports@fastmail.com</email>
    <report_id>261425809</report_id>
    <date_range><begin>1573603200</begin><end>1573689599</end></date_range>
  </report_metadata>
  <policy_published><domain>example.com</domain><p>none</p></policy_published>
  <record>
    <row>
      <source_ip>64.147.123.24</source_ip>
      <count>1</count>
      <policy_evaluated><disposition>none</disposition><dkim>pass</dkim><spf>pass</spf></policy_evaluated>
    </row>
    <identifiers><header_from>example.com</header_from></identifiers>
  </record>
</feedback>
"#;

// ── Fixtures ────────────────────────────────────────────────────────

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn report_message(disposition: &str, filename: &str, content: &[u8]) -> Vec<u8> {
    let encoded = STANDARD.encode(content);
    let body: String = encoded
        .as_bytes()
        .chunks(76)
        .map(|line| format!("{}\r\n", String::from_utf8_lossy(line)))
        .collect();
    format!(
        "From: dmarc-reports@fastmail.com\r\n\
         Subject: Report Domain: example.com\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: application/gzip; name=\"{filename}\"\r\n\
         Content-Disposition: {disposition}; filename=\"{filename}\"\r\n\
         Content-Transfer-Encoding: base64\r\n\
         \r\n\
         {body}"
    )
    .into_bytes()
}

/// Dot-stuff a message for the DATA section.
fn stuffed(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    for line in message.split_inclusive(|b| *b == b'\n') {
        if line.starts_with(b".") {
            out.push(b'.');
        }
        out.extend_from_slice(line);
    }
    out
}

// ── Fallback sink ───────────────────────────────────────────────────

type Received = Arc<Mutex<Vec<Vec<u8>>>>;

/// A bare SMTP server that records every DATA section it receives.
async fn start_fallback_sink() -> (u16, Received) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let received: Received = Arc::default();

    let store = Arc::clone(&received);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let (reader, mut writer) = stream.into_split();
                let mut reader = BufReader::new(reader);
                writer.write_all(b"220 sink ESMTP\r\n").await.unwrap();

                let mut line = String::new();
                loop {
                    line.clear();
                    if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                        return;
                    }
                    let verb = line.trim().to_ascii_uppercase();
                    if verb.starts_with("EHLO") || verb.starts_with("HELO") {
                        writer.write_all(b"250 sink\r\n").await.unwrap();
                    } else if verb == "DATA" {
                        writer.write_all(b"354 go ahead\r\n").await.unwrap();
                        let mut data = DataReader::new(&mut reader, usize::MAX);
                        let mut message = Vec::new();
                        data.read_to_end(&mut message).await.unwrap();
                        store.lock().unwrap().push(message);
                        writer.write_all(b"250 queued\r\n").await.unwrap();
                    } else if verb == "QUIT" {
                        writer.write_all(b"221 bye\r\n").await.unwrap();
                        return;
                    } else {
                        writer.write_all(b"250 ok\r\n").await.unwrap();
                    }
                }
            });
        }
    });

    (port, received)
}

// ── Endpoint ────────────────────────────────────────────────────────

struct Endpoint {
    addr: SocketAddr,
    observer: Arc<MemorySink>,
    received: Received,
    shutdown: Option<oneshot::Sender<()>>,
}

async fn start_endpoint() -> Endpoint {
    let (sink_port, received) = start_fallback_sink().await;
    let relay = SmtpRelay::from_transport(
        SmtpTransport::builder_dangerous("127.0.0.1")
            .port(sink_port)
            .timeout(Some(Duration::from_secs(5)))
            .build(),
    );

    let observer = Arc::new(MemorySink::new());
    let backend = Arc::new(Backend::new(observer.clone()).with_fallback(Fallback {
        from: "dmarc@example.com".into(),
        to: vec!["postmaster@example.com".into()],
        sink: Arc::new(relay),
    }));

    let mut config = ListenerConfig::new("dmarc.example.com");
    config.addr = "127.0.0.1:0".into();
    let server = Server::bind(config, backend).await.unwrap();
    let addr = server.local_addr().unwrap();

    let (tx, rx) = oneshot::channel();
    tokio::spawn(server.run_until(async {
        let _ = rx.await;
    }));

    Endpoint {
        addr,
        observer,
        received,
        shutdown: Some(tx),
    }
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> (Self, String) {
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
        };
        let greeting = client.reply().await;
        (client, greeting)
    }

    /// Last line of the next (possibly multi-line) reply.
    async fn reply(&mut self) -> String {
        loop {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap();
            if line.as_bytes().get(3) != Some(&b'-') {
                return line.trim_end().to_string();
            }
        }
    }

    async fn send(&mut self, command: &str) -> String {
        self.writer
            .write_all(format!("{command}\r\n").as_bytes())
            .await
            .unwrap();
        self.reply().await
    }

    async fn deliver(&mut self, message: &[u8]) -> String {
        assert!(self.send("EHLO client.example.net").await.starts_with("250"));
        assert!(
            self.send("MAIL FROM:<dmarc-reports@fastmail.com>")
                .await
                .starts_with("250")
        );
        assert!(self.send("RCPT TO:<dmarc@example.com>").await.starts_with("250"));
        assert!(self.send("DATA").await.starts_with("354"));

        self.writer.write_all(&stuffed(message)).await.unwrap();
        self.writer.write_all(b".\r\n").await.unwrap();
        self.reply().await
    }
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn report_is_analyzed_and_not_forwarded() {
    timeout(TEST_TIMEOUT, async {
        let endpoint = start_endpoint().await;
        let (mut client, greeting) = Client::connect(endpoint.addr).await;
        assert_eq!(greeting, "220 dmarc.example.com ESMTP Service Ready");

        let message = report_message(
            "inline",
            "fastmail.com!example.com!1573603200!1573689599!261425809.xml.gz",
            &gzip(REPORT.as_bytes()),
        );
        assert!(client.deliver(&message).await.starts_with("250"));
        assert!(client.send("QUIT").await.starts_with("221"));

        let observations = endpoint.observer.observations();
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].org, "Fastmail Pty Ltd");
        assert_eq!(observations[0].source_ip, Some("64.147.123.24".parse().unwrap()));
        assert_eq!(observations[0].count, 1);
        assert_eq!(observations[0].outcome, Outcome::Success);
        assert!(endpoint.received.lock().unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn corrupt_report_is_relayed_byte_for_byte() {
    timeout(TEST_TIMEOUT, async {
        let endpoint = start_endpoint().await;
        let (mut client, _) = Client::connect(endpoint.addr).await;

        let mut message = report_message(
            "attachment",
            "google.com!example.com!1585958400!1586044799.zip",
            b"PK\x03\x04 corrupted archive",
        );
        message.extend_from_slice(b".a line that needs dot-stuffing\r\n");

        // Accepted even though analysis failed.
        assert!(client.deliver(&message).await.starts_with("250"));
        assert!(client.send("QUIT").await.starts_with("221"));

        let received = endpoint.received.clone();
        wait_for(|| !received.lock().unwrap().is_empty()).await;
        let relayed = received.lock().unwrap()[0].clone();
        assert_eq!(relayed, message);
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn several_messages_on_one_connection() {
    timeout(TEST_TIMEOUT, async {
        let endpoint = start_endpoint().await;
        let (mut client, _) = Client::connect(endpoint.addr).await;

        let report = report_message("inline", "r.xml.gz", &gzip(REPORT.as_bytes()));
        assert!(client.deliver(&report).await.starts_with("250"));
        assert!(client.send("RSET").await.starts_with("250"));
        assert!(
            client
                .deliver(b"Subject: not a report\r\n\r\nhello\r\n")
                .await
                .starts_with("250")
        );
        assert!(client.deliver(&report).await.starts_with("250"));
        assert!(client.send("QUIT").await.starts_with("221"));

        assert_eq!(endpoint.observer.observations().len(), 2);
        let received = endpoint.received.clone();
        wait_for(|| received.lock().unwrap().len() == 1).await;
        assert_eq!(
            received.lock().unwrap()[0],
            b"Subject: not a report\r\n\r\nhello\r\n"
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn dot_lines_and_final_line_break_survive_the_relay() {
    timeout(TEST_TIMEOUT, async {
        let endpoint = start_endpoint().await;
        let (mut client, _) = Client::connect(endpoint.addr).await;

        // Both the lone dot line and the closing CRLF must come back unchanged.
        let message = b"Subject: not a report\r\n\r\n.\r\nlast line\r\n";
        assert!(client.deliver(message).await.starts_with("250"));
        assert!(client.send("QUIT").await.starts_with("221"));

        let received = endpoint.received.clone();
        wait_for(|| !received.lock().unwrap().is_empty()).await;
        assert_eq!(received.lock().unwrap()[0], message);
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_message_is_relayed_as_a_single_line_break() {
    timeout(TEST_TIMEOUT, async {
        let endpoint = start_endpoint().await;
        let (mut client, _) = Client::connect(endpoint.addr).await;

        assert!(client.deliver(b"").await.starts_with("250"));
        assert!(client.send("QUIT").await.starts_with("221"));

        // DATA always closes with CRLF . CRLF, so an empty body cannot be
        // relayed as zero bytes.
        let received = endpoint.received.clone();
        wait_for(|| !received.lock().unwrap().is_empty()).await;
        assert_eq!(received.lock().unwrap()[0], b"\r\n");
        assert_eq!(endpoint.observer.failures().len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_connections_are_independent() {
    timeout(TEST_TIMEOUT, async {
        let endpoint = start_endpoint().await;
        let report = report_message("inline", "r.xml.gz", &gzip(REPORT.as_bytes()));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let addr = endpoint.addr;
            let report = report.clone();
            handles.push(tokio::spawn(async move {
                let (mut client, _) = Client::connect(addr).await;
                let reply = client.deliver(&report).await;
                client.send("QUIT").await;
                reply
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().starts_with("250"));
        }
        assert_eq!(endpoint.observer.observations().len(), 4);
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_stops_accepting() {
    timeout(TEST_TIMEOUT, async {
        let mut endpoint = start_endpoint().await;
        let (mut client, _) = Client::connect(endpoint.addr).await;

        endpoint.shutdown.take().unwrap().send(()).unwrap();
        // The established connection keeps working.
        assert!(client.send("NOOP").await.starts_with("250"));

        wait_for_refused(endpoint.addr).await;
    })
    .await
    .expect("test timed out");
}

async fn wait_for_refused(addr: SocketAddr) {
    loop {
        match tokio::net::TcpStream::connect(addr).await {
            Err(_) => return,
            Ok(mut stream) => {
                // Still listening; give the accept loop a moment to stop.
                let mut buf = [0u8; 1];
                let _ = timeout(Duration::from_millis(20), stream.read(&mut buf)).await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}
