/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::Context;
use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_util::sync::CancellationToken;
use tracing::trace;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const MAX_RESPONSE_BYTES: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub enum ReadinessCheck {
    /// The service is ready as soon as a TCP connection succeeds.
    Connect,
    /// Send `payload` and wait for a response containing `expect`.
    Probe {
        payload: Vec<u8>,
        expect: String,
        read_timeout: Duration,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Readiness {
    /// Time from the caller's epoch until the first successful check.
    Ready(Duration),
    NotReady,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    host: String,
    port: u16,
    check: ReadinessCheck,
    timeout: Duration,
    poll: Duration,
}
impl ReadinessProbe {
    pub fn new(host: &str, port: u16, check: ReadinessCheck) -> Self {
        Self {
            host: host.to_string(),
            port,
            check,
            timeout: Duration::from_secs(15),
            poll: Duration::from_millis(100),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Polls the endpoint until a check succeeds, the timeout elapses or the token is
    /// cancelled. Only a malformed host or port is an error.
    ///
    /// # Arguments
    ///
    /// * `epoch` - the instant the returned latency is measured from
    /// * `token` - cancels the wait
    pub async fn wait_ready(
        &self,
        epoch: Instant,
        token: &CancellationToken,
    ) -> anyhow::Result<Readiness> {
        let addrs = self.resolve().await?;
        let deadline = Instant::now() + self.timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());

            tokio::select! {
                _ = token.cancelled() => return Ok(Readiness::Cancelled),
                ready = self.check_once(&addrs, remaining) => {
                    if ready {
                        return Ok(Readiness::Ready(
                            Instant::now().saturating_duration_since(epoch),
                        ));
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Readiness::NotReady);
            }

            tokio::select! {
                _ = token.cancelled() => return Ok(Readiness::Cancelled),
                _ = tokio::time::sleep(self.poll.min(deadline - now)) => {}
            }
        }
    }

    async fn resolve(&self) -> anyhow::Result<Vec<SocketAddr>> {
        if self.port == 0 {
            return Err(anyhow::anyhow!("Readiness port must not be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow::anyhow!("Readiness host must not be empty"));
        }

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .context(format!("Unable to resolve {}:{}", self.host, self.port))?
            .collect();
        if addrs.is_empty() {
            return Err(anyhow::anyhow!(
                "{}:{} did not resolve to any address",
                self.host,
                self.port
            ));
        }

        Ok(addrs)
    }

    /// A single check. The connection is closed again before returning.
    async fn check_once(&self, addrs: &[SocketAddr], remaining: Duration) -> bool {
        let connect_timeout = CONNECT_TIMEOUT.min(remaining).max(Duration::from_millis(1));
        let mut stream =
            match tokio::time::timeout(connect_timeout, TcpStream::connect(addrs)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    trace!("{}:{} not accepting yet: {}", self.host, self.port, err);
                    return false;
                }
                Err(_) => return false,
            };

        match &self.check {
            ReadinessCheck::Connect => true,
            ReadinessCheck::Probe {
                payload,
                expect,
                read_timeout,
            } => {
                match tokio::time::timeout(*read_timeout, probe(&mut stream, payload, expect))
                    .await
                {
                    Ok(Ok(matched)) => matched,
                    Ok(Err(err)) => {
                        trace!("probe of {}:{} failed: {}", self.host, self.port, err);
                        false
                    }
                    Err(_) => false,
                }
            }
        }
    }
}

async fn probe(stream: &mut TcpStream, payload: &[u8], expect: &str) -> anyhow::Result<bool> {
    stream.write_all(payload).await?;

    let mut response = Vec::new();
    let mut buf = [0u8; 1024];
    while response.len() < MAX_RESPONSE_BYTES {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        response.extend_from_slice(&buf[..n]);
        if String::from_utf8_lossy(&response).contains(expect) {
            return Ok(true);
        }
    }

    Ok(false)
}
