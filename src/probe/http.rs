//! One GET over HTTP/1.1, HTTP/2 or HTTP/3. The RTT stops when the response
//! head arrives; status codes are not judged and bodies are never read.
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use http::header::{ACCEPT, ACCEPT_ENCODING, CONNECTION, HOST, REFERER, USER_AGENT};
use http::{Request, StatusCode};
use http_body_util::Empty;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::time::{self, Instant};
use tracing::debug;

use crate::config::{HttpOptions, HttpVersion, ScanConfig};
use crate::error::{ProbeError, TimeoutStage};
use crate::probe::dial::{BoxStream, Dialer};

const COMPRESSION: &str = "gzip, deflate, br";

/// Time from dialing until the response head arrives.
pub async fn probe(
    dialer: &dyn Dialer,
    config: &ScanConfig,
    opts: &HttpOptions,
    target: SocketAddr,
) -> Result<Duration, ProbeError> {
    let server_name = config.server_name(target.ip());
    let authority = uri_authority(&server_name);
    let start = Instant::now();

    let status = if opts.version == HttpVersion::Http3 {
        let conn = dialer.dial_quic(target, &server_name, &[b"h3"]).await?;
        let res = with_response_timeout(config, h3_exchange(conn.clone(), &authority, opts)).await;
        conn.close(quinn::VarInt::from_u32(0), b"");
        res?
    } else {
        let tls = dialer.dial_tls(target, &server_name).await?;
        let h2 = tls.alpn.as_deref() == Some(b"h2".as_slice());
        with_response_timeout(config, exchange(tls.stream, h2, &authority, opts)).await?
    };
    let rtt = start.elapsed();
    debug!("{target} answered {status} in {rtt:?}");
    Ok(rtt)
}

async fn with_response_timeout<T>(
    config: &ScanConfig,
    fut: impl std::future::Future<Output = Result<T, ProbeError>>,
) -> Result<T, ProbeError> {
    time::timeout(config.response_timeout, fut)
        .await
        .map_err(|_| ProbeError::Timeout { stage: TimeoutStage::Response })?
}

/// IPv6 literals need brackets inside a URI authority.
fn uri_authority(server_name: &str) -> String {
    match server_name.parse::<IpAddr>() {
        Ok(IpAddr::V6(ip)) => format!("[{ip}]"),
        _ => server_name.to_owned(),
    }
}

/// GET for `opts.path`: origin-form with a Host header on HTTP/1.1,
/// absolute-form (authority pseudo-header) on HTTP/2 and HTTP/3.
pub fn build_request(
    authority: &str,
    opts: &HttpOptions,
    absolute_form: bool,
) -> Result<Request<()>, ProbeError> {
    let uri = if absolute_form { format!("https://{authority}{}", opts.path) } else { opts.path.clone() };
    let mut builder = Request::get(uri)
        .header(USER_AGENT, &opts.user_agent)
        .header(ACCEPT, "*/*");
    if !absolute_form {
        builder = builder.header(HOST, authority).header(CONNECTION, "close");
    }
    if let Some(referrer) = &opts.referrer {
        builder = builder.header(REFERER, referrer);
    }
    if !opts.disable_compression {
        builder = builder.header(ACCEPT_ENCODING, COMPRESSION);
    }
    Ok(builder.body(())?)
}

/// HTTP/1.1 or HTTP/2 over an established TLS stream.
async fn exchange(
    stream: BoxStream,
    h2: bool,
    authority: &str,
    opts: &HttpOptions,
) -> Result<StatusCode, ProbeError> {
    let io = TokioIo::new(stream);
    let req = build_request(authority, opts, h2)?.map(|()| Empty::<Bytes>::new());

    if h2 {
        let (mut sender, conn) =
            hyper::client::conn::http2::handshake(TokioExecutor::new(), io).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("h2 connection ended: {e}");
            }
        });
        Ok(sender.send_request(req).await?.status())
    } else {
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("h1 connection ended: {e}");
            }
        });
        Ok(sender.send_request(req).await?.status())
    }
}

async fn h3_exchange(
    conn: quinn::Connection,
    authority: &str,
    opts: &HttpOptions,
) -> Result<StatusCode, ProbeError> {
    let (mut driver, mut sender) = h3::client::new(h3_quinn::Connection::new(conn)).await?;
    tokio::spawn(async move {
        if let Err(e) = std::future::poll_fn(|cx| driver.poll_close(cx)).await {
            debug!("h3 connection ended: {e}");
        }
    });

    let mut stream = sender.send_request(build_request(authority, opts, true)?).await?;
    stream.finish().await?;
    Ok(stream.recv_response().await?.status())
}
