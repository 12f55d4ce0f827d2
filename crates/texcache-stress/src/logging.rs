use std::collections::BTreeMap;
use std::future::Future;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::pin::Pin;

use anyhow::{Context, Result};
use axum::handler::HandlerWithoutStateExt;
use texcache::{logging, metrics};

/// Which instrumentation is active during the run.
#[derive(Debug, Default)]
pub struct Config {
    pub sentry: bool,
    pub tracing: bool,
    pub metrics: bool,
}

type Sink = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Keeps the sentry client alive and holds the local sinks that still need to be spawned.
#[derive(Default)]
pub struct Guard {
    _sentry: Option<sentry::ClientInitGuard>,
    pub sinks: Vec<Sink>,
}

/// Enables the selected instrumentation. Sentry events and metrics go to local sinks that
/// discard everything, so that their overhead is part of the measurement.
///
/// # Safety
/// This function uses [`std::env::set_var`] and may only be called in a single-threaded context.
pub unsafe fn init(config: Config, service_config: &texcache::config::Config) -> Result<Guard> {
    let mut guard = Guard::default();

    if config.sentry {
        let (port, sink) = http_sink().context("failed to bind sentry sink")?;
        guard.sinks.push(sink);
        guard._sentry = Some(sentry::init((
            format!("http://some_token@127.0.0.1:{port}/1234"),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                traces_sample_rate: 1.0,
                ..Default::default()
            },
        )));
    }

    if config.tracing {
        logging::init_json_logging("INFO", || NoopWriter);
    } else {
        // SAFETY: As documented, this function may only be called in a single-threaded context.
        unsafe { logging::init_logging(service_config) };
    }

    if config.metrics {
        let (port, sink) = udp_sink().context("failed to bind metrics sink")?;
        guard.sinks.push(sink);

        let tags = BTreeMap::from([
            ("host".to_owned(), "stresstest".to_owned()),
            ("env".to_owned(), "stresstest".to_owned()),
        ]);
        metrics::configure_statsd("texcache", ("127.0.0.1", port), tags)?;
    }

    Ok(guard)
}

fn local_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

/// An HTTP server answering every request with `OK`.
fn http_sink() -> Result<(u16, Sink)> {
    let listener = TcpListener::bind(local_addr())?;
    listener.set_nonblocking(true)?;
    let port = listener.local_addr()?.port();

    let sink = async move {
        async fn ok() -> &'static str {
            "OK"
        }

        if let Ok(listener) = tokio::net::TcpListener::from_std(listener) {
            let _ = axum::serve(listener, ok.into_make_service()).await;
        }
    };
    Ok((port, Box::pin(sink)))
}

/// A UDP socket that drops every datagram.
fn udp_sink() -> Result<(u16, Sink)> {
    let socket = UdpSocket::bind(local_addr())?;
    socket.set_nonblocking(true)?;
    let port = socket.local_addr()?.port();

    let sink = async move {
        let Ok(socket) = tokio::net::UdpSocket::from_std(socket) else {
            return;
        };
        let mut buf = Vec::with_capacity(1024);
        loop {
            buf.clear();
            if socket.recv_buf(&mut buf).await.is_err() {
                break;
            }
        }
    };
    Ok((port, Box::pin(sink)))
}

/// Formats everything, then throws it away.
struct NoopWriter;

impl Write for NoopWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // keeps the formatting from being optimized away
        Ok(std::hint::black_box(buf).len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
