//! A single NNTP connection.
//!
//! Sessions implement the small slice of [RFC 3977](https://datatracker.ietf.org/doc/html/rfc3977)
//! a binary downloader needs: greeting, AUTHINFO USER/PASS
//! ([RFC 4643 §2.3](https://datatracker.ietf.org/doc/html/rfc4643#section-2.3)),
//! GROUP, BODY with dot-unstuffing
//! ([RFC 3977 §3.1.1](https://datatracker.ietf.org/doc/html/rfc3977#section-3.1.1)),
//! best-effort COMPRESS DEFLATE, and QUIT.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_rustls::rustls::ClientConfig;

use gleaner_core::{ArticleSink, GrabError};

use crate::conn::{DeflateTransport, Dialer, NntpIo};

/// A single connection to a news server.
///
/// One worker task drives each session; the server additionally wraps
/// every session in a mutex so the cached current group survives any
/// accidental cross-task reuse.
pub struct Session {
    stream: Option<BufReader<Box<dyn NntpIo>>>,
    connected: bool,
    authenticated: bool,
    compressed: bool,
    current_group: Option<String>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            stream: None,
            connected: false,
            authenticated: false,
            compressed: false,
            current_group: None,
        }
    }

    /// Whether this session is currently connected, authenticated, and
    /// compressed, respectively.
    pub fn status(&self) -> (bool, bool, bool) {
        (self.connected, self.authenticated, self.compressed)
    }

    /// Dial and consume the server greeting.
    pub async fn connect(
        &mut self,
        dialer: &dyn Dialer,
        host: &str,
        port: u16,
        tls: Option<Arc<ClientConfig>>,
    ) -> Result<(), GrabError> {
        if self.connected {
            return Err(GrabError::Transport("session is already connected".into()));
        }
        let io = dialer.dial(host, port, tls).await?;
        self.stream = Some(BufReader::new(io));

        let (code, message) = self.read_response().await?;
        if code != 200 && code != 201 {
            return Err(GrabError::Transport(format!(
                "unexpected greeting {code}: {message}"
            )));
        }
        self.connected = true;
        Ok(())
    }

    /// Authenticate the session. Does nothing when `username` is empty.
    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<(), GrabError> {
        if username.is_empty() {
            return Ok(());
        }

        self.send_command(&format!("AUTHINFO USER {username}")).await?;
        let (code, message) = self.read_response().await?;
        match code {
            281 => {}
            381 => {
                self.send_command(&format!("AUTHINFO PASS {password}")).await?;
                let (code, message) = self.read_response().await?;
                if code != 281 {
                    return Err(GrabError::AuthFailed(format!("{code} {message}")));
                }
            }
            _ => return Err(GrabError::AuthFailed(format!("{code} {message}"))),
        }
        self.authenticated = true;
        Ok(())
    }

    /// Attempt to enable DEFLATE compression. A refusal is silently
    /// ignored; only transport failures surface.
    pub async fn compress(&mut self) -> Result<(), GrabError> {
        self.send_command("COMPRESS DEFLATE").await?;
        let (code, _) = self.read_response().await?;
        if code != 206 {
            return Ok(());
        }

        // Anything still buffered was received after the 206 and is
        // already part of the compressed stream.
        let reader = self
            .stream
            .take()
            .ok_or_else(|| GrabError::Transport("session is not connected".into()))?;
        let carried = reader.buffer().to_vec();
        let inner = reader.into_inner();
        let deflate: Box<dyn NntpIo> = Box::new(DeflateTransport::new(inner, &carried));
        self.stream = Some(BufReader::new(deflate));
        self.compressed = true;
        Ok(())
    }

    /// Stream the body of article `id` (without angle brackets; they are
    /// added here, never by callers) into `sink`, selecting `group` first
    /// when one is given. Returns the raw body byte count.
    pub async fn write_article_body(
        &mut self,
        group: &str,
        id: &str,
        sink: &mut (dyn ArticleSink + '_),
    ) -> Result<u64, GrabError> {
        self.select_group(group).await?;

        self.send_command(&format!("BODY <{id}>")).await?;
        let (code, message) = self.read_response().await?;
        match code {
            222 => {}
            430 => return Err(GrabError::NoSuchArticle(id.to_string())),
            _ => return Err(GrabError::UnexpectedResponse { code, message }),
        }

        self.copy_body(sink).await
    }

    /// Terminate the session. The connection state is reset even when the
    /// QUIT exchange fails.
    pub async fn quit(&mut self) -> Result<(), GrabError> {
        let result = match self.stream.is_some() {
            true => {
                let sent = self.send_command("QUIT").await;
                match sent {
                    Ok(()) => self.read_response().await.map(|_| ()),
                    Err(e) => Err(e),
                }
            }
            false => Ok(()),
        };

        self.stream = None;
        self.connected = false;
        self.authenticated = false;
        self.compressed = false;
        self.current_group = None;
        result
    }

    /// Switch the session to the requested group. A no-op when `group` is
    /// empty or already selected.
    async fn select_group(&mut self, group: &str) -> Result<(), GrabError> {
        if group.is_empty() || self.current_group.as_deref() == Some(group) {
            return Ok(());
        }

        self.send_command(&format!("GROUP {group}")).await?;
        let (code, message) = self.read_response().await?;
        match code {
            211 => {
                self.current_group = Some(group.to_string());
                Ok(())
            }
            411 => Err(GrabError::NoSuchGroup(group.to_string())),
            _ => Err(GrabError::UnexpectedResponse { code, message }),
        }
    }

    /// Read dot-terminated body lines, unstuff them, and hand them to the
    /// sink. On a sink error the rest of the body is drained first so the
    /// connection stays framed for the next request.
    async fn copy_body(&mut self, sink: &mut (dyn ArticleSink + '_)) -> Result<u64, GrabError> {
        let mut written = 0u64;
        let mut sink_err: Option<GrabError> = None;
        let mut line = Vec::with_capacity(1024);

        loop {
            line.clear();
            let n = {
                let stream = self
                    .stream
                    .as_mut()
                    .ok_or_else(|| GrabError::Transport("session is not connected".into()))?;
                stream
                    .read_until(b'\n', &mut line)
                    .await
                    .map_err(|e| GrabError::Transport(format!("reading body: {e}")))?
            };
            if n == 0 {
                return Err(GrabError::Protocol("unexpected EOF in article body".into()));
            }

            let trimmed = trim_crlf(&line);
            if trimmed == b"." {
                break;
            }

            if sink_err.is_none() {
                let payload = if line.starts_with(b"..") { &line[1..] } else { &line[..] };
                match sink.write(payload).await {
                    Ok(()) => written += payload.len() as u64,
                    Err(e) => sink_err = Some(e),
                }
            }
        }

        match sink_err {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    async fn send_command(&mut self, cmd: &str) -> Result<(), GrabError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| GrabError::Transport("session is not connected".into()))?;
        let line = format!("{cmd}\r\n");
        stream
            .get_mut()
            .write_all(line.as_bytes())
            .await
            .map_err(|e| GrabError::Transport(format!("sending command: {e}")))?;
        stream
            .get_mut()
            .flush()
            .await
            .map_err(|e| GrabError::Transport(format!("flushing command: {e}")))?;
        Ok(())
    }

    async fn read_response(&mut self) -> Result<(u16, String), GrabError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| GrabError::Transport("session is not connected".into()))?;
        let mut line = String::new();
        stream
            .read_line(&mut line)
            .await
            .map_err(|e| GrabError::Transport(format!("reading response: {e}")))?;
        if line.is_empty() {
            return Err(GrabError::Protocol("unexpected EOF".into()));
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        let (code, message) = trimmed.split_at_checked(3).unwrap_or((trimmed, ""));
        let code: u16 = code
            .parse()
            .map_err(|_| GrabError::Protocol(format!("invalid response line: {trimmed:?}")))?;
        Ok((code, message.trim_start().to_string()))
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_crlf(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use gleaner_core::sink::BufferSink;
    use tokio::io::AsyncReadExt;

    struct ScriptedDialer {
        greeting: &'static [u8],
        script: Arc<dyn Fn(String) -> Vec<u8> + Send + Sync>,
    }

    #[async_trait::async_trait]
    impl Dialer for ScriptedDialer {
        async fn dial(
            &self,
            _host: &str,
            _port: u16,
            _tls: Option<Arc<ClientConfig>>,
        ) -> Result<Box<dyn NntpIo>, GrabError> {
            let (client, mut server) = tokio::io::duplex(8192);
            let greeting = self.greeting;
            let script = Arc::clone(&self.script);
            tokio::spawn(async move {
                server.write_all(greeting).await.unwrap();
                let mut buf = vec![0u8; 1024];
                loop {
                    match server.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let cmd = String::from_utf8_lossy(&buf[..n]).into_owned();
                            let reply = script(cmd.clone());
                            if server.write_all(&reply).await.is_err() {
                                break;
                            }
                            if cmd.starts_with("QUIT") {
                                break;
                            }
                        }
                    }
                }
            });
            Ok(Box::new(client))
        }
    }

    fn default_script(cmd: String) -> Vec<u8> {
        if cmd.starts_with("GROUP alt.missing") {
            b"411 no such group\r\n".to_vec()
        } else if cmd.starts_with("GROUP") {
            b"211 10 1 10 group selected\r\n".to_vec()
        } else if cmd.starts_with("BODY <gone@example>") {
            b"430 no such article\r\n".to_vec()
        } else if cmd.starts_with("BODY") {
            b"222 body follows\r\nline one\r\n..stuffed\r\n.\r\n".to_vec()
        } else if cmd.starts_with("AUTHINFO USER") {
            b"381 password required\r\n".to_vec()
        } else if cmd.starts_with("AUTHINFO PASS") {
            b"281 authenticated\r\n".to_vec()
        } else if cmd.starts_with("QUIT") {
            b"205 bye\r\n".to_vec()
        } else {
            b"500 what\r\n".to_vec()
        }
    }

    async fn connected_session(dialer: &ScriptedDialer) -> Session {
        let mut session = Session::new();
        session
            .connect(dialer, "news.example.com", 119, None)
            .await
            .unwrap();
        session
    }

    fn dialer() -> ScriptedDialer {
        ScriptedDialer {
            greeting: b"200 welcome\r\n",
            script: Arc::new(default_script),
        }
    }

    #[tokio::test]
    async fn connect_consumes_greeting() {
        let session = connected_session(&dialer()).await;
        assert_eq!(session.status(), (true, false, false));
    }

    #[tokio::test]
    async fn bad_greeting_is_a_transport_error() {
        let bad = ScriptedDialer {
            greeting: b"502 go away\r\n",
            script: Arc::new(default_script),
        };
        let mut session = Session::new();
        let err = session
            .connect(&bad, "news.example.com", 119, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GrabError::Transport(_)));
    }

    #[tokio::test]
    async fn authenticate_skips_empty_username() {
        let mut session = connected_session(&dialer()).await;
        session.authenticate("", "ignored").await.unwrap();
        assert_eq!(session.status(), (true, false, false));
    }

    #[tokio::test]
    async fn authenticate_exchanges_user_and_pass() {
        let mut session = connected_session(&dialer()).await;
        session.authenticate("user", "secret").await.unwrap();
        assert_eq!(session.status(), (true, true, false));
    }

    #[tokio::test]
    async fn body_is_unstuffed_and_written_to_sink() {
        let mut session = connected_session(&dialer()).await;
        let mut sink = BufferSink::new();
        let bytes = session
            .write_article_body("alt.test", "ok@example", &mut sink)
            .await
            .unwrap();

        assert_eq!(sink.contents(), b"line one\r\n.stuffed\r\n");
        assert_eq!(bytes, sink.contents().len() as u64);
    }

    #[tokio::test]
    async fn group_selection_is_cached() {
        let log: Arc<std::sync::Mutex<Vec<String>>> = Arc::default();
        let log_clone = Arc::clone(&log);
        let counting = ScriptedDialer {
            greeting: b"200 welcome\r\n",
            script: Arc::new(move |cmd: String| {
                log_clone.lock().unwrap().push(cmd.clone());
                if cmd.starts_with("GROUP") {
                    b"211 10 1 10 ok\r\n".to_vec()
                } else {
                    b"222 ok\r\n.\r\n".to_vec()
                }
            }),
        };
        let mut session = connected_session(&counting).await;
        let mut sink = BufferSink::new();
        session
            .write_article_body("alt.test", "a@example", &mut sink)
            .await
            .unwrap();
        session
            .write_article_body("alt.test", "b@example", &mut sink)
            .await
            .unwrap();

        let commands = log.lock().unwrap().clone();
        let groups = commands.iter().filter(|c| c.starts_with("GROUP")).count();
        assert_eq!(groups, 1, "second fetch reused the selected group");
    }

    #[tokio::test]
    async fn empty_group_skips_selection() {
        let mut session = connected_session(&dialer()).await;
        let mut sink = BufferSink::new();
        session
            .write_article_body("", "ok@example", &mut sink)
            .await
            .unwrap();
        assert!(!sink.contents().is_empty());
    }

    #[tokio::test]
    async fn missing_group_maps_to_no_such_group() {
        let mut session = connected_session(&dialer()).await;
        let mut sink = BufferSink::new();
        let err = session
            .write_article_body("alt.missing", "ok@example", &mut sink)
            .await
            .unwrap_err();
        assert_eq!(err, GrabError::NoSuchGroup("alt.missing".into()));
    }

    #[tokio::test]
    async fn missing_article_maps_to_no_such_article() {
        let mut session = connected_session(&dialer()).await;
        let mut sink = BufferSink::new();
        let err = session
            .write_article_body("alt.test", "gone@example", &mut sink)
            .await
            .unwrap_err();
        assert_eq!(err, GrabError::NoSuchArticle("gone@example".into()));
    }

    #[tokio::test]
    async fn article_id_gets_angle_brackets() {
        let bracket_check = ScriptedDialer {
            greeting: b"200 welcome\r\n",
            script: Arc::new(|cmd: String| {
                if cmd.starts_with("BODY") {
                    assert!(cmd.contains("<wrapped@example>"), "got: {cmd}");
                    b"222 ok\r\n.\r\n".to_vec()
                } else {
                    b"211 1 1 1 ok\r\n".to_vec()
                }
            }),
        };
        let mut session = connected_session(&bracket_check).await;
        let mut sink = BufferSink::new();
        session
            .write_article_body("", "wrapped@example", &mut sink)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn garbage_response_is_a_protocol_error() {
        let garbage = ScriptedDialer {
            greeting: b"200 welcome\r\n",
            script: Arc::new(|_| b"not a response line\r\n".to_vec()),
        };
        let mut session = connected_session(&garbage).await;
        let mut sink = BufferSink::new();
        let err = session
            .write_article_body("", "x@example", &mut sink)
            .await
            .unwrap_err();
        assert!(err.is_fatal(), "{err:?}");
    }

    #[tokio::test]
    async fn quit_resets_all_state() {
        let mut session = connected_session(&dialer()).await;
        session.authenticate("user", "secret").await.unwrap();
        session.quit().await.unwrap();
        assert_eq!(session.status(), (false, false, false));
    }
}
