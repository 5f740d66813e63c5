use std::time::Duration;

use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
    message::{Mailbox, Message},
    transport::smtp::{
        PoolConfig,
        authentication::Credentials,
        client::{Tls, TlsParameters},
    },
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use mergemail_core::{MergeError, Result};

/// Outbound relay. `connect` is the handshake performed once before the first
/// row; `send` delivers a single message.
#[async_trait]
pub trait Relay: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn send(&self, message: Message) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayTls {
    /// Implicit TLS on port 465, STARTTLS on every other port.
    #[default]
    Auto,
    Implicit,
    Starttls,
    /// No encryption. Only for a relay on the local host.
    Plain,
}

impl RelayTls {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "implicit" | "ssl" | "tls" => Some(Self::Implicit),
            "starttls" => Some(Self::Starttls),
            "plain" | "none" => Some(Self::Plain),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    pub skip_tls_verify: bool,
    pub tls: RelayTls,
    pub timeout_secs: u64,
}

impl SmtpConfig {
    pub fn from_mailbox(&self) -> Result<Mailbox> {
        parse_mailbox(&self.from)
    }
}

pub struct SmtpRelay {
    host: String,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpRelay {
    pub fn new(smtp: &SmtpConfig) -> Result<Self> {
        if smtp.host.trim().is_empty() {
            return Err(MergeError::Config("relay host is not set".into()));
        }
        let tls_parameters = || {
            let mut tls_builder = TlsParameters::builder(smtp.host.clone());
            if smtp.skip_tls_verify {
                tls_builder = tls_builder
                    .dangerous_accept_invalid_certs(true)
                    .dangerous_accept_invalid_hostnames(true);
            }
            tls_builder
                .build()
                .map_err(|e| MergeError::Config(format!("tls parameters: {}", e)))
        };
        let tls = match smtp.tls {
            RelayTls::Plain => Tls::None,
            RelayTls::Implicit => Tls::Wrapper(tls_parameters()?),
            RelayTls::Starttls => Tls::Required(tls_parameters()?),
            RelayTls::Auto if smtp.port == 465 => Tls::Wrapper(tls_parameters()?),
            RelayTls::Auto => Tls::Required(tls_parameters()?),
        };
        // One pooled connection: the handshake session is reused for every send.
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host)
            .port(smtp.port)
            .tls(tls)
            .timeout(Some(Duration::from_secs(smtp.timeout_secs.max(1))))
            .pool_config(PoolConfig::new().max_size(1));
        if !smtp.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                smtp.username.clone(),
                smtp.password.clone(),
            ));
        }
        let transport = builder.build();
        Ok(Self {
            host: smtp.host.clone(),
            transport,
        })
    }
}

#[async_trait]
impl Relay for SmtpRelay {
    async fn connect(&self) -> Result<()> {
        let accepted = self
            .transport
            .test_connection()
            .await
            .map_err(|e| MergeError::Connection(e.to_string()))?;
        if !accepted {
            return Err(MergeError::Connection(format!(
                "{} did not accept the connection",
                self.host
            )));
        }
        info!(host = %self.host, "relay handshake ok");
        Ok(())
    }

    async fn send(&self, message: Message) -> Result<()> {
        let response = self
            .transport
            .send(message)
            .await
            .map_err(|e| MergeError::Delivery(e.to_string()))?;
        debug!(code = %response.code(), "relay accepted message");
        Ok(())
    }
}

/// Accepts `addr@host` or `Display Name <addr@host>`.
pub fn parse_mailbox(input: &str) -> Result<Mailbox> {
    let trimmed = input.trim();
    let invalid = |e: lettre::address::AddressError| {
        MergeError::Config(format!("invalid sender address {:?}: {}", trimmed, e))
    };
    if let (Some(start), Some(end)) = (trimmed.find('<'), trimmed.rfind('>')) {
        if start < end {
            let name = trimmed[..start].trim().trim_matches('"');
            let addr = trimmed[start + 1..end].trim();
            let name = (!name.is_empty()).then(|| name.to_string());
            return Ok(Mailbox::new(name, addr.parse().map_err(invalid)?));
        }
    }
    Ok(Mailbox::new(None, trimmed.parse().map_err(invalid)?))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use lettre::message::Message;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    use mergemail_core::MergeError;

    use super::{Relay, RelayTls, SmtpConfig, SmtpRelay, parse_mailbox};

    fn config(port: u16) -> SmtpConfig {
        SmtpConfig {
            host: "smtp.example.com".into(),
            port,
            username: "user".into(),
            password: "secret".into(),
            from: "Studio <studio@example.com>".into(),
            skip_tls_verify: false,
            tls: RelayTls::Auto,
            timeout_secs: 5,
        }
    }

    /// Minimal plaintext SMTP listener counting connections and accepted messages.
    #[derive(Default)]
    struct LocalRelay {
        connections: AtomicUsize,
        messages: AtomicUsize,
    }

    impl LocalRelay {
        async fn start() -> anyhow::Result<(Arc<Self>, u16)> {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let port = listener.local_addr()?.port();
            let relay = Arc::new(Self::default());
            let server = relay.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    server.connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(server.clone().serve(stream));
                }
            });
            Ok((relay, port))
        }

        async fn serve(self: Arc<Self>, stream: TcpStream) -> std::io::Result<()> {
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read);
            write.write_all(b"220 localhost ready\r\n").await?;
            let mut line = String::new();
            loop {
                line.clear();
                if lines.read_line(&mut line).await? == 0 {
                    return Ok(());
                }
                let verb = line.trim_end().to_ascii_uppercase();
                if verb.starts_with("EHLO") || verb.starts_with("HELO") {
                    write.write_all(b"250 localhost\r\n").await?;
                } else if verb == "DATA" {
                    write.write_all(b"354 end with <CRLF>.<CRLF>\r\n").await?;
                    loop {
                        line.clear();
                        if lines.read_line(&mut line).await? == 0 {
                            return Ok(());
                        }
                        if line.trim_end_matches(['\r', '\n']) == "." {
                            break;
                        }
                    }
                    self.messages.fetch_add(1, Ordering::SeqCst);
                    write.write_all(b"250 queued\r\n").await?;
                } else if verb == "QUIT" {
                    write.write_all(b"221 bye\r\n").await?;
                    return Ok(());
                } else {
                    write.write_all(b"250 ok\r\n").await?;
                }
            }
        }
    }

    fn letter(to: &str) -> anyhow::Result<Message> {
        Ok(Message::builder()
            .from("studio@example.com".parse()?)
            .to(to.parse()?)
            .subject("Hi")
            .body(String::from("Hello"))?)
    }

    #[test]
    fn mailbox_with_display_name() -> anyhow::Result<()> {
        let mailbox = parse_mailbox("\"Studio Team\" <studio@example.com>")?;
        assert_eq!(mailbox.name.as_deref(), Some("Studio Team"));
        assert_eq!(mailbox.email.to_string(), "studio@example.com");

        let bare = parse_mailbox("  studio@example.com ")?;
        assert!(bare.name.is_none());
        Ok(())
    }

    #[test]
    fn bad_sender_is_config_error() {
        let err = parse_mailbox("not an address").unwrap_err();
        assert!(matches!(err, MergeError::Config(_)));
    }

    #[tokio::test]
    async fn relay_builds_for_every_tls_mode() {
        assert!(SmtpRelay::new(&config(465)).is_ok());
        assert!(SmtpRelay::new(&config(587)).is_ok());
        for tls in [RelayTls::Implicit, RelayTls::Starttls, RelayTls::Plain] {
            let mut cfg = config(2525);
            cfg.tls = tls;
            assert!(SmtpRelay::new(&cfg).is_ok());
        }
        assert!(config(587).from_mailbox().is_ok());
    }

    #[test]
    fn tls_mode_names() {
        assert_eq!(RelayTls::parse(" STARTTLS "), Some(RelayTls::Starttls));
        assert_eq!(RelayTls::parse("ssl"), Some(RelayTls::Implicit));
        assert_eq!(RelayTls::parse("none"), Some(RelayTls::Plain));
        assert_eq!(RelayTls::parse("sometimes"), None);
    }

    #[test]
    fn empty_host_is_rejected() {
        let mut cfg = config(587);
        cfg.host = " ".into();
        assert!(matches!(SmtpRelay::new(&cfg), Err(MergeError::Config(_))));
    }

    #[tokio::test]
    async fn sends_reuse_the_handshake_connection() -> anyhow::Result<()> {
        let (server, port) = LocalRelay::start().await?;
        let relay = SmtpRelay::new(&SmtpConfig {
            host: "127.0.0.1".into(),
            port,
            username: String::new(),
            password: String::new(),
            from: "studio@example.com".into(),
            skip_tls_verify: false,
            tls: RelayTls::Plain,
            timeout_secs: 5,
        })?;

        relay.connect().await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after_handshake = server.connections.load(Ordering::SeqCst);
        assert_eq!(after_handshake, 1);

        for to in ["ann@x.com", "bob@x.com", "cy@x.com", "dee@x.com"] {
            relay.send(letter(to)?).await?;
            // Pooled connections are handed back on a background task.
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(server.messages.load(Ordering::SeqCst), 4);
        assert!(server.connections.load(Ordering::SeqCst) <= after_handshake + 1);
        Ok(())
    }
}
