//! Transport layer: dialing, TLS, and the DEFLATE compression wrapper
//! ([RFC 8054](https://datatracker.ietf.org/doc/html/rfc8054)).

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use gleaner_core::GrabError;

pub trait NntpIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> NntpIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Creates the byte stream a [`Session`](crate::Session) talks over.
///
/// The default implementation dials TCP (optionally wrapped in TLS); tests
/// inject in-memory streams here.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        host: &str,
        port: u16,
        tls: Option<Arc<ClientConfig>>,
    ) -> Result<Box<dyn NntpIo>, GrabError>;
}

pub struct TcpDialer;

#[async_trait::async_trait]
impl Dialer for TcpDialer {
    async fn dial(
        &self,
        host: &str,
        port: u16,
        tls: Option<Arc<ClientConfig>>,
    ) -> Result<Box<dyn NntpIo>, GrabError> {
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| GrabError::Transport(format!("dial {host}:{port}: {e}")))?;

        match tls {
            Some(config) => {
                let connector = TlsConnector::from(config);
                let name = ServerName::try_from(host.to_string())
                    .map_err(|_| GrabError::Transport(format!("invalid hostname: {host}")))?;
                let stream = connector
                    .connect(name, tcp)
                    .await
                    .map_err(|e| GrabError::Transport(format!("TLS handshake: {e}")))?;
                Ok(Box::new(stream))
            }
            None => Ok(Box::new(tcp)),
        }
    }
}

/// Build a TLS client config suitable for sharing across a server's
/// sessions. With `verify_certs` false a no-op verifier is installed,
/// which some news servers with self-signed certificates require.
pub fn build_tls_config(verify_certs: bool) -> Arc<ClientConfig> {
    let provider = rustls::crypto::ring::default_provider();
    let _ = provider.clone().install_default();

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = if verify_certs {
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert::new()))
            .with_no_client_auth()
    };

    Arc::new(config)
}

#[derive(Debug)]
struct AcceptAnyCert {
    schemes: Vec<rustls::SignatureScheme>,
}

impl AcceptAnyCert {
    fn new() -> Self {
        Self {
            schemes: rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.schemes.clone()
    }
}

const DEFLATE_CHUNK: usize = 8192;

/// Transparent raw-DEFLATE layer installed after a `206` reply to
/// `COMPRESS DEFLATE`. Both directions of the connection are compressed
/// from that point on.
pub(crate) struct DeflateTransport {
    inner: Box<dyn NntpIo>,
    decompress: Decompress,
    compress: Compress,
    /// Compressed bytes read from the socket, not yet decompressed.
    rd_buf: Vec<u8>,
    rd_pos: usize,
    rd_len: usize,
    /// Compressed bytes produced locally, not yet written to the socket.
    wr_buf: Vec<u8>,
    wr_pos: usize,
    scratch: Vec<u8>,
}

impl DeflateTransport {
    /// `carried` is whatever the session's read buffer held when the 206
    /// arrived; those bytes are compressed stream data, not plaintext.
    pub(crate) fn new(inner: Box<dyn NntpIo>, carried: &[u8]) -> Self {
        let mut rd_buf = vec![0u8; DEFLATE_CHUNK.max(carried.len())];
        rd_buf[..carried.len()].copy_from_slice(carried);
        Self {
            inner,
            decompress: Decompress::new(false),
            compress: Compress::new(Compression::default(), false),
            rd_len: carried.len(),
            rd_buf,
            rd_pos: 0,
            wr_buf: Vec::new(),
            wr_pos: 0,
            scratch: vec![0u8; DEFLATE_CHUNK],
        }
    }

    /// Push queued compressed output toward the socket. Returns true when
    /// the queue is fully drained.
    fn drain_write_queue(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<bool>> {
        while self.wr_pos < self.wr_buf.len() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.wr_buf[self.wr_pos..]) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => self.wr_pos += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Ready(Ok(false)),
            }
        }
        self.wr_buf.clear();
        self.wr_pos = 0;
        Poll::Ready(Ok(true))
    }

    fn queue_compressed(&mut self, input: &[u8], flush: FlushCompress) -> io::Result<usize> {
        let before_in = self.compress.total_in();
        let before_out = self.compress.total_out();

        self.scratch.resize(input.len() + 64, 0);
        self.compress
            .compress(input, &mut self.scratch, flush)
            .map_err(io::Error::other)?;

        let consumed = (self.compress.total_in() - before_in) as usize;
        let produced = (self.compress.total_out() - before_out) as usize;
        self.wr_buf.extend_from_slice(&self.scratch[..produced]);
        Ok(consumed)
    }
}

impl AsyncRead for DeflateTransport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();

        loop {
            while me.rd_pos < me.rd_len {
                let before_in = me.decompress.total_in();
                let before_out = me.decompress.total_out();

                let input = &me.rd_buf[me.rd_pos..me.rd_len];
                let dst = buf.initialize_unfilled();
                let status = me
                    .decompress
                    .decompress(input, dst, FlushDecompress::Sync)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

                me.rd_pos += (me.decompress.total_in() - before_in) as usize;
                let produced = (me.decompress.total_out() - before_out) as usize;

                if produced > 0 {
                    buf.advance(produced);
                    return Poll::Ready(Ok(()));
                }
                if status == Status::StreamEnd {
                    return Poll::Ready(Ok(()));
                }
            }

            me.rd_pos = 0;
            me.rd_len = 0;
            let mut tmp = ReadBuf::new(&mut me.rd_buf);
            match Pin::new(&mut me.inner).poll_read(cx, &mut tmp) {
                Poll::Ready(Ok(())) => {
                    me.rd_len = tmp.filled().len();
                    if me.rd_len == 0 {
                        return Poll::Ready(Ok(()));
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for DeflateTransport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();

        // Finish any previously queued output before compressing more, so
        // a Pending socket never makes us compress the same input twice.
        match me.drain_write_queue(cx) {
            Poll::Ready(Ok(true)) => {}
            Poll::Ready(Ok(false)) => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => unreachable!("drain_write_queue never returns Pending"),
        }

        let consumed = me.queue_compressed(buf, FlushCompress::None)?;
        // Opportunistic drain; leftovers go out on the next write or flush.
        if let Poll::Ready(Err(e)) = me.drain_write_queue(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(consumed))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();

        me.queue_compressed(&[], FlushCompress::Sync)?;
        match me.drain_write_queue(cx) {
            Poll::Ready(Ok(true)) => Pin::new(&mut me.inner).poll_flush(cx),
            Poll::Ready(Ok(false)) => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => unreachable!("drain_write_queue never returns Pending"),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
